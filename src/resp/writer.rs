//! RESP serializer.
//!
//! Commands are encoded as a top-level array of blob strings:
//! `*<N>\r\n$<len>\r\narg1\r\n$<len>\r\narg2\r\n…`
//!
//! Arbitrary values go through [`RespWriter`] and the [`ToResp`] table. Under
//! RESP2 the RESP3-only types fall back to RESP2 shapes (null becomes an empty
//! blob, booleans become `:1`/`:0`, doubles become blob strings, maps become
//! flat arrays).

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use itoa::Buffer;

use crate::command::{format_double, Arg, Command};
use crate::resp::types::{BigNumber, MessageKind, Protocol, RespResult, RespValue};

/// Encode a command into RESP wire format.
pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut buf = Vec::with_capacity(command_capacity(cmd));
    append_command(&mut buf, cmd);
    buf
}

/// Encode multiple commands into a single buffer for pipelined writes.
///
/// Everything is concatenated into one contiguous `Vec<u8>` that can be
/// sent in a single `write_all`.
pub fn encode_pipeline(cmds: &[Command]) -> Vec<u8> {
    let cap = cmds.iter().map(command_capacity).sum();
    let mut buf = Vec::with_capacity(cap);
    for cmd in cmds {
        append_command(&mut buf, cmd);
    }
    buf
}

fn command_capacity(cmd: &Command) -> usize {
    // '*' + digits + \r\n, then '$' + digits + \r\n + data + \r\n per token
    let mut cap = 1 + 10 + 2 + 1 + 10 + 2 + cmd.name().len() + 2;
    for arg in cmd.args() {
        cap += 1 + 10 + 2 + 24 + 2;
        cap += match arg {
            Arg::Bytes(b) => b.len(),
            Arg::Str(s) | Arg::Keyword(s) => s.len(),
            Arg::Int(_) | Arg::Float(_) => 0,
        };
    }
    cap
}

fn append_command(buf: &mut Vec<u8>, cmd: &Command) {
    let mut itoa_buf = Buffer::new();
    buf.push(b'*');
    buf.extend_from_slice(itoa_buf.format(cmd.token_count()).as_bytes());
    buf.extend_from_slice(b"\r\n");

    append_blob(buf, &mut itoa_buf, b'$', cmd.name().as_bytes());
    for arg in cmd.args() {
        append_blob(buf, &mut itoa_buf, b'$', &arg.to_wire());
    }
}

#[inline]
fn append_blob(buf: &mut Vec<u8>, itoa_buf: &mut Buffer, leader: u8, data: &[u8]) {
    buf.push(leader);
    buf.extend_from_slice(itoa_buf.format(data.len()).as_bytes());
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

// ── Value writer ───────────────────────────────────────────────────

/// A value that knows its own RESP shape.
pub trait ToResp {
    fn write_resp(&self, w: &mut RespWriter);
}

/// Error text, written as `-` (or `!` when it spans lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply(pub String);

/// Status text, written as `+` (or as a blob when it spans lines).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status(pub String);

/// Protocol-aware value serializer writing into an owned buffer.
pub struct RespWriter {
    protocol: Protocol,
    buf: Vec<u8>,
    itoa: Buffer,
}

impl RespWriter {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            buf: Vec::new(),
            itoa: Buffer::new(),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write<T: ToResp + ?Sized>(&mut self, value: &T) -> &mut Self {
        value.write_resp(self);
        self
    }

    fn line(&mut self, leader: u8, body: &[u8]) -> &mut Self {
        self.buf.push(leader);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    fn header(&mut self, leader: u8, n: usize) -> &mut Self {
        self.buf.push(leader);
        self.buf.extend_from_slice(self.itoa.format(n).as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    pub fn write_null(&mut self) -> &mut Self {
        match self.protocol {
            Protocol::Resp3 => self.line(b'_', b""),
            Protocol::Resp2 => self.write_blob(b""),
        }
    }

    pub fn write_blob(&mut self, data: &[u8]) -> &mut Self {
        append_blob(&mut self.buf, &mut self.itoa, b'$', data);
        self
    }

    pub fn write_verbatim(&mut self, data: &[u8]) -> &mut Self {
        match self.protocol {
            Protocol::Resp3 => append_blob(&mut self.buf, &mut self.itoa, b'=', data),
            Protocol::Resp2 => append_blob(&mut self.buf, &mut self.itoa, b'$', data),
        }
        self
    }

    pub fn write_simple_string(&mut self, text: &str) -> &mut Self {
        if text.contains("\r\n") {
            return self.write_blob(text.as_bytes());
        }
        self.line(b'+', text.as_bytes())
    }

    pub fn write_error(&mut self, text: &str) -> &mut Self {
        if !text.contains("\r\n") {
            return self.line(b'-', text.as_bytes());
        }
        match self.protocol {
            Protocol::Resp3 => {
                append_blob(&mut self.buf, &mut self.itoa, b'!', text.as_bytes());
                self
            }
            Protocol::Resp2 => self.write_simple_string(&text.replace("\r\n", " ")),
        }
    }

    pub fn write_integer(&mut self, n: i64) -> &mut Self {
        let mut itoa_buf = Buffer::new();
        self.line(b':', itoa_buf.format(n).as_bytes())
    }

    pub fn write_big_number(&mut self, n: &BigNumber) -> &mut Self {
        self.line(b'(', n.as_str().as_bytes())
    }

    pub fn write_double(&mut self, d: f64) -> &mut Self {
        let text = format_double(d);
        match self.protocol {
            Protocol::Resp3 => self.line(b',', text.as_bytes()),
            Protocol::Resp2 => self.write_blob(text.as_bytes()),
        }
    }

    pub fn write_bool(&mut self, b: bool) -> &mut Self {
        match (self.protocol, b) {
            (Protocol::Resp3, true) => self.line(b'#', b"t"),
            (Protocol::Resp3, false) => self.line(b'#', b"f"),
            (Protocol::Resp2, b) => self.write_integer(b as i64),
        }
    }

    /// Aggregate header for `n` elements of `kind` (array, set or push).
    /// Sets and pushes are written as plain arrays under RESP2.
    pub fn write_array_header(&mut self, kind: MessageKind, n: usize) -> &mut Self {
        let leader = match (self.protocol, kind) {
            (Protocol::Resp3, MessageKind::Set | MessageKind::Push) => kind.leader(),
            _ => b'*',
        };
        self.header(leader, n)
    }

    /// Map header for `n` pairs. Under RESP2 this is an array of `2n`
    /// alternating keys and values.
    pub fn write_map_header(&mut self, n: usize) -> &mut Self {
        match self.protocol {
            Protocol::Resp3 => self.header(b'%', n),
            Protocol::Resp2 => self.header(b'*', n * 2),
        }
    }

    /// Write any iterable as an array. Elements are buffered first so the
    /// header carries the true count.
    pub fn write_seq<I>(&mut self, items: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: ToResp,
    {
        let items: Vec<I::Item> = items.into_iter().collect();
        self.write_array_header(MessageKind::Array, items.len());
        for item in &items {
            item.write_resp(self);
        }
        self
    }

    /// Write key/value pairs as a map.
    pub fn write_pairs<'a, K, V, I>(&mut self, pairs: I) -> &mut Self
    where
        K: ToResp + ?Sized + 'a,
        V: ToResp + ?Sized + 'a,
        I: IntoIterator<Item = (&'a K, &'a V)>,
    {
        let pairs: Vec<_> = pairs.into_iter().collect();
        self.write_map_header(pairs.len());
        for (k, v) in pairs {
            k.write_resp(self);
            v.write_resp(self);
        }
        self
    }

    /// Write a record as a map of field names to values.
    pub fn write_fields(&mut self, fields: &[(&str, &dyn ToResp)]) -> &mut Self {
        self.write_map_header(fields.len());
        for (name, value) in fields {
            self.write_blob(name.as_bytes());
            value.write_resp(self);
        }
        self
    }
}

// ── ToResp table ───────────────────────────────────────────────────

impl ToResp for () {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_null();
    }
}

impl<T: ToResp> ToResp for Option<T> {
    fn write_resp(&self, w: &mut RespWriter) {
        match self {
            Some(v) => v.write_resp(w),
            None => {
                w.write_null();
            }
        }
    }
}

impl<T: ToResp + ?Sized> ToResp for &T {
    fn write_resp(&self, w: &mut RespWriter) {
        (**self).write_resp(w);
    }
}

impl ToResp for bool {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_bool(*self);
    }
}

impl ToResp for f64 {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_double(*self);
    }
}

impl ToResp for f32 {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_double(f64::from(*self));
    }
}

macro_rules! int_to_resp {
    ($($t:ty),*) => {
        $(impl ToResp for $t {
            fn write_resp(&self, w: &mut RespWriter) {
                w.write_integer(i64::from(*self));
            }
        })*
    };
}

int_to_resp!(i8, i16, i32, i64, u8, u16, u32);

impl ToResp for u64 {
    fn write_resp(&self, w: &mut RespWriter) {
        match i64::try_from(*self) {
            Ok(n) => w.write_integer(n),
            Err(_) => w.line(b'(', Buffer::new().format(*self).as_bytes()),
        };
    }
}

impl ToResp for usize {
    fn write_resp(&self, w: &mut RespWriter) {
        (*self as u64).write_resp(w);
    }
}

impl ToResp for BigNumber {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_big_number(self);
    }
}

impl ToResp for str {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_blob(self.as_bytes());
    }
}

impl ToResp for String {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_blob(self.as_bytes());
    }
}

impl ToResp for Bytes {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_blob(self);
    }
}

impl ToResp for ErrorReply {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_error(&self.0);
    }
}

impl ToResp for Status {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_simple_string(&self.0);
    }
}

impl<T: ToResp> ToResp for [T] {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_array_header(MessageKind::Array, self.len());
        for item in self {
            item.write_resp(w);
        }
    }
}

impl<T: ToResp> ToResp for Vec<T> {
    fn write_resp(&self, w: &mut RespWriter) {
        self.as_slice().write_resp(w);
    }
}

impl<K: ToResp, V: ToResp, S> ToResp for HashMap<K, V, S> {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_pairs(self.iter());
    }
}

impl<K: ToResp, V: ToResp> ToResp for BTreeMap<K, V> {
    fn write_resp(&self, w: &mut RespWriter) {
        w.write_pairs(self.iter());
    }
}

impl ToResp for RespValue {
    fn write_resp(&self, w: &mut RespWriter) {
        match self {
            Self::Null => {
                w.write_null();
            }
            Self::Bytes(b) => {
                w.write_blob(b);
            }
            Self::Text(s) => {
                w.write_blob(s.as_bytes());
            }
            Self::Integer(n) => {
                w.write_integer(*n);
            }
            Self::BigNumber(n) => {
                w.write_big_number(n);
            }
            Self::Double(d) => {
                w.write_double(*d);
            }
            Self::Boolean(b) => {
                w.write_bool(*b);
            }
            Self::Array(items) => items.write_resp(w),
            Self::Map(pairs) => {
                w.write_pairs(pairs.iter().map(|(k, v)| (k, v)));
            }
        }
    }
}

/// Writes the envelope back in the shape it arrived as, subject to the
/// writer's protocol fallbacks.
impl ToResp for RespResult {
    fn write_resp(&self, w: &mut RespWriter) {
        let text = || self.value.to_text_lossy().unwrap_or_default();
        match (self.kind, &self.value) {
            (_, RespValue::Null) => {
                w.write_null();
            }
            (MessageKind::SimpleString, _) => {
                w.write_simple_string(&text());
            }
            (MessageKind::SimpleError | MessageKind::BlobError, _) => {
                w.write_error(&text());
            }
            (MessageKind::VerbatimString, v) => {
                w.write_verbatim(v.as_bytes().unwrap_or_default());
            }
            (MessageKind::Set | MessageKind::Push, RespValue::Array(items)) => {
                w.write_array_header(self.kind, items.len());
                for item in items {
                    item.write_resp(w);
                }
            }
            (_, v) => v.write_resp(w),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
