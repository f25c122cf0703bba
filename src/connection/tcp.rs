//! Async TCP connection to a Redis server.
//!
//! Wraps a `tokio::net::TcpStream` with an integrated read buffer and
//! RESP parser for streaming request/response I/O. A connection that hits
//! an I/O error, a timeout or a framing violation is marked broken and must
//! not be reused.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::error::{RespError, Result};
use crate::resp::parser::{frame_len, parse, parse_split, ReadOptions, Split};
use crate::resp::types::{Protocol, RespResult};
use crate::resp::writer::{encode_command, encode_pipeline};

/// Default initial read buffer capacity (64 KB).
const DEFAULT_BUF_CAPACITY: usize = 64 * 1024;

/// Invoked after every successful connect + handshake.
pub type ConnectedHook = Arc<dyn Fn(&RedisConnection) + Send + Sync>;

/// A single async connection to a Redis server.
pub struct RedisConnection {
    stream: TcpStream,
    /// Read buffer (data read from socket but not yet consumed by parser).
    buf: BytesMut,
    addr: String,
    protocol: Protocol,
    read_opts: ReadOptions,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    max_buf_size: usize,
    broken: bool,
    /// Replies owed for requests already written.
    pending: usize,
    /// Timestamp of last successful I/O (for idle checks).
    pub last_used: Instant,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("addr", &self.addr)
            .field("protocol", &self.protocol)
            .field("broken", &self.broken)
            .field("pending", &self.pending)
            .finish()
    }
}

/// Run an I/O future under an optional deadline.
async fn with_deadline<T, F>(limit: Option<Duration>, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res.map_err(RespError::from),
            Err(_) => Err(RespError::Timeout(format!("{what} timed out after {d:?}"))),
        },
        None => fut.await.map_err(RespError::from),
    }
}

impl RedisConnection {
    /// Connect to `addr` and run the handshake (`HELLO 3` / `AUTH`,
    /// then `SELECT`) described by `config`.
    pub async fn connect(addr: &str, config: &ConnectionConfig) -> Result<Self> {
        let mut conn = Self::open(addr, config).await?;
        conn.handshake(config).await?;
        debug!(addr, protocol = ?config.protocol, "connected");
        Ok(conn)
    }

    /// Open the TCP stream without any handshake.
    pub async fn open(addr: &str, config: &ConnectionConfig) -> Result<Self> {
        let stream = with_deadline(
            config.connect_timeout,
            &format!("connection to {addr}"),
            TcpStream::connect(addr),
        )
        .await?;
        stream.set_nodelay(true).ok(); // Disable Nagle for low latency
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            addr: addr.to_string(),
            protocol: Protocol::Resp2,
            read_opts: config.read_options(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_buf_size: config.max_buffer_size,
            broken: false,
            pending: 0,
            last_used: Instant::now(),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Protocol negotiated during the handshake.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Replies the server still owes for requests written so far.
    pub fn pending_replies(&self) -> usize {
        self.pending
    }

    /// Not broken and no reply left unread. A call cancelled between
    /// write and read leaves replies pending.
    pub fn is_reusable(&self) -> bool {
        !self.broken && self.pending == 0
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    /// Record a fatal error against this connection before returning it.
    fn check<T>(&mut self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_fatal() && !self.broken {
                debug!(addr = %self.addr, error = %e, "connection marked broken");
                self.broken = true;
            }
        }
        res
    }

    /// Like [`check`](Self::check), and a successful read settles one
    /// pending reply.
    fn settle<T>(&mut self, res: Result<T>) -> Result<T> {
        let res = self.check(res);
        if res.is_ok() {
            self.pending = self.pending.saturating_sub(1);
        }
        res
    }

    // ── Writing ──

    /// Send raw bytes holding `replies` requests to the server.
    pub async fn send_raw(&mut self, data: &[u8], replies: usize) -> Result<()> {
        // counted before the write so a cancelled write is never reused
        self.pending += replies;
        let res = with_deadline(self.write_timeout, "write", self.stream.write_all(data)).await;
        self.check(res)?;
        self.last_used = Instant::now();
        Ok(())
    }

    pub async fn send(&mut self, cmd: &Command) -> Result<()> {
        self.send_raw(&encode_command(cmd), 1).await
    }

    /// Write every command in one `write_all`.
    pub async fn send_pipeline(&mut self, cmds: &[Command]) -> Result<()> {
        self.send_raw(&encode_pipeline(cmds), cmds.len()).await
    }

    // ── Reading ──

    /// Read more bytes from the socket into the buffer, growing it up to
    /// `max_buf_size`.
    async fn fill(&mut self) -> Result<()> {
        if self.buf.capacity() - self.buf.len() < 4096 {
            let new_cap = (self.buf.capacity() * 2).max(DEFAULT_BUF_CAPACITY);
            if new_cap > self.max_buf_size {
                if self.buf.capacity() >= self.max_buf_size {
                    return Err(RespError::Protocol(format!(
                        "RESP message too large: buffer would exceed {} bytes",
                        self.max_buf_size
                    )));
                }
                self.buf.reserve(self.max_buf_size - self.buf.len());
            } else {
                self.buf.reserve(new_cap - self.buf.len());
            }
        }
        let n = with_deadline(self.read_timeout, "read", self.stream.read_buf(&mut self.buf))
            .await?;
        if n == 0 {
            return Err(RespError::Connection(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )));
        }
        Ok(())
    }

    /// Read and decode one complete reply.
    ///
    /// Error replies come back as an envelope with `is_error()` set; only
    /// transport and framing failures are `Err`.
    pub async fn read_response(&mut self) -> Result<RespResult> {
        let res = self.read_with(parse).await;
        self.settle(res)
    }

    /// Read one reply, splitting a top-level sequence into per-element
    /// envelopes (see [`parse_split`]).
    pub async fn read_split_response(&mut self) -> Result<Split> {
        let res = self.read_with(parse_split).await;
        self.settle(res)
    }

    async fn read_with<T, F>(&mut self, decode: F) -> Result<T>
    where
        F: Fn(&Bytes, ReadOptions) -> Result<(T, usize)>,
    {
        loop {
            if !self.buf.is_empty() {
                // Parse from a frozen view so blob payloads are zero-copy
                // slices; unconsumed bytes are put back.
                let snapshot = self.buf.split().freeze();
                match decode(&snapshot, self.read_opts) {
                    Ok((out, consumed)) => {
                        if consumed < snapshot.len() {
                            self.buf.extend_from_slice(&snapshot[consumed..]);
                        }
                        self.last_used = Instant::now();
                        return Ok(out);
                    }
                    Err(RespError::Incomplete) => {
                        self.buf.extend_from_slice(&snapshot);
                    }
                    Err(e) => return Err(e),
                }
            }
            self.fill().await?;
        }
    }

    /// Read one complete frame as raw `Bytes`, without decoding it.
    pub async fn read_raw_response(&mut self) -> Result<Bytes> {
        let res = self.read_raw_inner().await;
        self.settle(res)
    }

    async fn read_raw_inner(&mut self) -> Result<Bytes> {
        loop {
            if !self.buf.is_empty() {
                match frame_len(&self.buf) {
                    Ok(len) => {
                        self.last_used = Instant::now();
                        return Ok(self.buf.split_to(len).freeze());
                    }
                    Err(RespError::Incomplete) => {}
                    Err(e) => return Err(e),
                }
            }
            self.fill().await?;
        }
    }

    /// Send a command and read its reply.
    pub async fn execute(&mut self, cmd: &Command) -> Result<RespResult> {
        self.send(cmd).await?;
        self.read_response().await
    }

    // ── Blob streaming ──

    /// Read a `$`, `=` or `!` reply straight into `sink`, copying at most
    /// `buffer_size` bytes at a time. Handles both the fixed and the
    /// streamed (`?`) forms. Returns the number of payload bytes written;
    /// a null blob writes nothing.
    pub async fn read_blob_into<W>(&mut self, sink: &mut W, buffer_size: usize) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let res = self.read_blob_inner(sink, buffer_size.max(1)).await;
        self.settle(res)
    }

    async fn read_blob_inner<W>(&mut self, sink: &mut W, buffer_size: usize) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let header = self.take_line().await?;
        let (leader, len) = match header.split_first() {
            Some((&l, rest)) if matches!(l, b'$' | b'=' | b'!') => (l, rest),
            Some((&l, _)) => {
                return Err(RespError::Protocol(format!(
                    "expected a blob reply, got type byte 0x{l:02x}"
                )))
            }
            None => return Err(RespError::Protocol("empty reply header".into())),
        };

        let written = if len == b"?" {
            let mut total = 0u64;
            loop {
                let chunk = self.take_line().await?;
                let clen = match chunk.split_first() {
                    Some((b';', n)) => parse_len(n)?,
                    _ => {
                        return Err(RespError::Protocol(format!(
                            "expected ';' chunk header in streamed {} reply",
                            leader as char
                        )))
                    }
                };
                match clen {
                    None => return Err(RespError::Protocol("negative chunk length".into())),
                    Some(0) => break,
                    Some(n) => total += self.copy_payload(sink, n, buffer_size).await?,
                }
            }
            total
        } else {
            match parse_len(len)? {
                None => 0,
                Some(n) => self.copy_payload(sink, n, buffer_size).await?,
            }
        };
        sink.flush().await?;
        self.last_used = Instant::now();
        Ok(written)
    }

    /// Copy `n` payload bytes plus the trailing CRLF from the connection
    /// into `sink`.
    async fn copy_payload<W>(&mut self, sink: &mut W, n: usize, buffer_size: usize) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut remaining = n;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = remaining.min(self.buf.len()).min(buffer_size);
            sink.write_all(&self.buf[..take]).await?;
            self.buf.advance(take);
            remaining -= take;
        }
        while self.buf.len() < 2 {
            self.fill().await?;
        }
        if &self.buf[..2] != b"\r\n" {
            return Err(RespError::Protocol("blob not terminated by \\r\\n".into()));
        }
        self.buf.advance(2);
        Ok(n as u64)
    }

    /// Take one CRLF-terminated header line (without the CRLF).
    async fn take_line(&mut self) -> Result<BytesMut> {
        loop {
            if let Some(pos) = memchr::memmem::find(&self.buf, b"\r\n") {
                let line = self.buf.split_to(pos);
                self.buf.advance(2);
                return Ok(line);
            }
            self.fill().await?;
        }
    }

    // ── Handshake ──

    async fn handshake(&mut self, config: &ConnectionConfig) -> Result<()> {
        if config.protocol == Protocol::Resp3 {
            let mut hello = Command::new("HELLO").arg(3);
            if let Some(pass) = &config.password {
                let user = config.username.as_deref().unwrap_or("default");
                hello = hello.keyword("AUTH").arg(user).arg(pass);
            }
            self.execute(&hello).await?.into_result()?;
            self.protocol = Protocol::Resp3;
        } else if let Some(pass) = &config.password {
            let auth = match &config.username {
                Some(user) => Command::new("AUTH").arg(user).arg(pass),
                None => Command::new("AUTH").arg(pass),
            };
            expect_ok(self.execute(&auth).await?, "AUTH")?;
        }

        if config.db != 0 {
            let select = Command::new("SELECT").arg(config.db);
            expect_ok(self.execute(&select).await?, "SELECT")?;
        }
        if config.readonly {
            expect_ok(self.execute(&Command::new("READONLY")).await?, "READONLY")?;
        }
        Ok(())
    }

    /// Send PING and verify the reply.
    pub async fn ping(&mut self) -> Result<bool> {
        let reply = self.execute(&Command::new("PING")).await?.into_result()?;
        Ok(reply.value.as_str() == Some("PONG"))
    }
}

fn expect_ok(reply: RespResult, what: &str) -> Result<()> {
    let reply = reply.into_result()?;
    match reply.value.as_str() {
        Some("OK") => Ok(()),
        _ => Err(RespError::Protocol(format!(
            "unexpected {what} response: {}",
            reply.value.type_name()
        ))),
    }
}

/// Blob length field: `None` for negative (null) lengths.
fn parse_len(digits: &[u8]) -> Result<Option<usize>> {
    let s = std::str::from_utf8(digits)
        .map_err(|_| RespError::Protocol("non-ASCII blob length".into()))?;
    let n: i64 = s
        .parse()
        .map_err(|_| RespError::Protocol(format!("invalid blob length: {s:?}")))?;
    Ok(usize::try_from(n).ok())
}

// ── Tests ──────────────────────────────────────────────────────────
