//! Streaming RESP2/RESP3 parser.
//!
//! [`parse`] takes a byte buffer and returns `Ok((RespResult, bytes_consumed))`
//! or `Err(Incomplete)` when more data is needed, or `Err(Protocol(…))` on
//! malformed input.
//!
//! Both fixed-length and streamed (`?`) forms are understood for blob strings
//! and every aggregate type. Blob payloads are extracted with zero-copy
//! `buf.slice()`; only streamed blobs are reassembled into a fresh buffer.

use bytes::{Bytes, BytesMut};
use memchr::memchr;

use crate::error::{RespError, Result};
use crate::resp::types::{BigNumber, MessageKind, RespResult, RespValue};

/// Decoding switches for string payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Decode string kinds as UTF-8 text. Payloads that are not valid UTF-8
    /// stay as raw bytes either way.
    pub decode_text: bool,
}

impl ReadOptions {
    pub const fn text() -> Self {
        Self { decode_text: true }
    }

    pub const fn binary() -> Self {
        Self { decode_text: false }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self::text()
    }
}

/// Parse one RESP unit from the front of `buf`.
///
/// Returns `(result, bytes_consumed)` on success and `Err(Incomplete)` when
/// the buffer is too short; callers should read more data and retry.
/// Leading ASCII spaces are skipped. A bare `.` terminator is only valid
/// inside a streamed aggregate and is rejected here.
pub fn parse(buf: &Bytes, opts: ReadOptions) -> Result<(RespResult, usize)> {
    let (unit, consumed) = read_unit(buf, opts)?;
    if unit.is_end {
        return Err(RespError::Protocol(
            "stream terminator outside of an aggregate".into(),
        ));
    }
    Ok((unit, consumed))
}

/// A top-level reply as returned by [`parse_split`].
#[derive(Debug, Clone, PartialEq)]
pub enum Split {
    /// Each element of an array, set or push reply as its own envelope.
    Elements(Vec<RespResult>),
    /// Any other reply, including a null aggregate.
    Whole(RespResult),
}

/// Like [`parse`], but a top-level array/set/push keeps one envelope per
/// element so nested error replies stay distinguishable from strings.
pub fn parse_split(buf: &Bytes, opts: ReadOptions) -> Result<(Split, usize)> {
    let skip = buf.iter().take_while(|&&b| b == b' ').count();
    if skip == buf.len() {
        return Err(RespError::Incomplete);
    }
    let kind = match MessageKind::from_leader(buf[skip]) {
        Some(k @ (MessageKind::Array | MessageKind::Set | MessageKind::Push)) => k,
        _ => {
            let (unit, consumed) = parse(buf, opts)?;
            return Ok((Split::Whole(unit), consumed));
        }
    };

    let body = buf.slice(skip..);
    let (line, mut next) = read_line(&body, 1)?;
    let mut items = Vec::new();
    if line == b"?" {
        loop {
            let (unit, consumed) = read_unit(&body.slice(next..), opts)?;
            next += consumed;
            if unit.is_end {
                break;
            }
            items.push(unit);
        }
    } else {
        let count = parse_int_from_bytes(line)?;
        if count < 0 {
            return Ok((Split::Whole(RespResult::new(RespValue::Null, kind)), skip + next));
        }
        for _ in 0..count {
            let (unit, consumed) = read_unit(&body.slice(next..), opts)?;
            if unit.is_end {
                return Err(unexpected_terminator());
            }
            items.push(unit);
            next += consumed;
        }
    }
    Ok((Split::Elements(items), skip + next))
}

/// Convenience wrapper: parse from a byte slice (copies into `Bytes` first).
pub fn parse_slice(buf: &[u8], opts: ReadOptions) -> Result<(RespResult, usize)> {
    parse(&Bytes::copy_from_slice(buf), opts)
}

/// Compute the byte length of one complete RESP unit at the front of `buf`
/// **without allocating** or building a value tree.
pub fn frame_len(buf: &[u8]) -> Result<usize> {
    let (len, is_end) = unit_len(buf)?;
    if is_end {
        return Err(RespError::Protocol(
            "stream terminator outside of an aggregate".into(),
        ));
    }
    Ok(len)
}

fn unit_len(buf: &[u8]) -> Result<(usize, bool)> {
    let skip = buf.iter().take_while(|&&b| b == b' ').count();
    if skip == buf.len() {
        return Err(RespError::Incomplete);
    }
    let buf = &buf[skip..];
    let len = match buf[0] {
        b'.' => {
            let (_, next) = read_line(buf, 1)?;
            return Ok((skip + next, true));
        }
        b'+' | b'-' | b':' | b',' | b'(' | b'_' | b'#' => read_line(buf, 1)?.1,
        b'$' | b'!' | b'=' => {
            let (line, next) = read_line(buf, 1)?;
            if line == b"?" {
                streamed_blob_len(buf, next)?
            } else {
                let len = parse_int_from_bytes(line)?;
                if len < 0 {
                    next
                } else {
                    let total = next + len as usize + 2;
                    if buf.len() < total {
                        return Err(RespError::Incomplete);
                    }
                    total
                }
            }
        }
        b'*' | b'~' | b'>' | b'%' | b'|' => {
            let per_entry = if matches!(buf[0], b'%' | b'|') { 2 } else { 1 };
            let (line, mut next) = read_line(buf, 1)?;
            if line == b"?" {
                loop {
                    let (child, is_end) = unit_len(&buf[next..])?;
                    next += child;
                    if is_end {
                        break;
                    }
                }
            } else {
                let count = parse_int_from_bytes(line)?;
                let units = count.max(0).checked_mul(per_entry).ok_or_else(|| {
                    RespError::Protocol(format!("aggregate count {count} out of range"))
                })?;
                for _ in 0..units {
                    let (child, is_end) = unit_len(&buf[next..])?;
                    if is_end {
                        return Err(unexpected_terminator());
                    }
                    next += child;
                }
            }
            next
        }
        other => return Err(unknown_leader(other)),
    };
    Ok((skip + len, false))
}

fn streamed_blob_len(buf: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let (clen, next) = chunk_header(buf, pos)?;
        if clen == 0 {
            return Ok(next);
        }
        pos = next + clen + 2;
        if buf.len() < pos {
            return Err(RespError::Incomplete);
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Find the next `\r\n` in `buf` starting at `offset`.
/// Returns the index of `\r`. A `\r` that is not followed by `\n` belongs
/// to the line and scanning continues past it.
#[inline]
fn find_crlf(buf: &[u8], offset: usize) -> Result<usize> {
    let mut from = offset;
    loop {
        if from >= buf.len() {
            return Err(RespError::Incomplete);
        }
        let abs = match memchr(b'\r', &buf[from..]) {
            Some(pos) => from + pos,
            None => return Err(RespError::Incomplete),
        };
        match buf.get(abs + 1) {
            Some(b'\n') => return Ok(abs),
            Some(_) => from = abs + 1,
            None => return Err(RespError::Incomplete),
        }
    }
}

/// Read the line starting at `buf[offset]` up to `\r\n`.
/// Returns `(line_bytes, index_after_crlf)`.
#[inline]
fn read_line(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let cr = find_crlf(buf, offset)?;
    Ok((&buf[offset..cr], cr + 2))
}

/// Parse an integer from a byte slice (no allocations).
fn parse_int_from_bytes(bytes: &[u8]) -> Result<i64> {
    let (negative, digits) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        Some(b'+') => (false, &bytes[1..]),
        Some(_) => (false, bytes),
        None => return Err(RespError::Protocol("empty integer".into())),
    };
    if digits.is_empty() {
        return Err(RespError::Protocol("integer has no digits".into()));
    }

    // Accumulated as a negative value so that i64::MIN fits.
    let mut n: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(RespError::Protocol(format!(
                "invalid byte in integer: 0x{b:02x}"
            )));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_sub((b - b'0') as i64))
            .ok_or_else(|| RespError::Protocol("integer overflow".into()))?;
    }

    if negative {
        Ok(n)
    } else {
        n.checked_neg()
            .ok_or_else(|| RespError::Protocol("integer overflow".into()))
    }
}

/// `;<len>\r\n` header of one streamed blob chunk.
fn chunk_header(buf: &[u8], pos: usize) -> Result<(usize, usize)> {
    match buf.get(pos) {
        None => return Err(RespError::Incomplete),
        Some(b';') => {}
        Some(&other) => {
            return Err(RespError::Protocol(format!(
                "expected ';' in streamed string, got 0x{other:02x}"
            )))
        }
    }
    let (line, next) = read_line(buf, pos + 1)?;
    let clen = parse_int_from_bytes(line)?;
    if clen < 0 {
        return Err(RespError::Protocol(format!(
            "negative streamed chunk length: {clen}"
        )));
    }
    Ok((clen as usize, next))
}

fn string_value(data: Bytes, opts: ReadOptions) -> RespValue {
    if !opts.decode_text {
        return RespValue::Bytes(data);
    }
    match std::str::from_utf8(&data) {
        Ok(s) => RespValue::Text(s.to_owned()),
        Err(_) => RespValue::Bytes(data),
    }
}

fn line_str<'a>(line: &'a [u8], what: &str) -> Result<&'a str> {
    std::str::from_utf8(line)
        .map_err(|e| RespError::Protocol(format!("invalid UTF-8 in {what}: {e}")))
}

fn unknown_leader(b: u8) -> RespError {
    RespError::Protocol(format!("unknown RESP type byte: 0x{b:02x}"))
}

fn unexpected_terminator() -> RespError {
    RespError::Protocol("stream terminator inside a fixed-length aggregate".into())
}

// ── Unit reader ───────────────────────────────────────────────────

/// Read one unit, including the `.` terminator, skipping leading spaces.
fn read_unit(buf: &Bytes, opts: ReadOptions) -> Result<(RespResult, usize)> {
    let skip = buf.iter().take_while(|&&b| b == b' ').count();
    if skip == buf.len() {
        return Err(RespError::Incomplete);
    }
    if skip > 0 {
        let (unit, consumed) = read_unit(&buf.slice(skip..), opts)?;
        return Ok((unit, skip + consumed));
    }

    let leader = buf[0];
    if leader == b'.' {
        let (_, next) = read_line(buf, 1)?;
        return Ok((RespResult::terminator(), next));
    }
    let kind = MessageKind::from_leader(leader).ok_or_else(|| unknown_leader(leader))?;

    match kind {
        MessageKind::BlobString | MessageKind::BlobError | MessageKind::VerbatimString => {
            parse_blob(buf, kind, opts)
        }
        MessageKind::SimpleString | MessageKind::SimpleError => parse_simple(buf, kind, opts),
        MessageKind::Number => parse_integer(buf),
        MessageKind::BigNumber => parse_big_number(buf),
        MessageKind::Null => parse_null(buf),
        MessageKind::Double => parse_double(buf),
        MessageKind::Boolean => parse_boolean(buf),
        MessageKind::Array | MessageKind::Set | MessageKind::Push => {
            parse_sequence(buf, kind, opts)
        }
        MessageKind::Map | MessageKind::Attribute => parse_map(buf, kind, opts),
    }
}

// ── Type parsers ──────────────────────────────────────────────────

/// `+<string>\r\n` / `-<error>\r\n`
fn parse_simple(buf: &Bytes, kind: MessageKind, opts: ReadOptions) -> Result<(RespResult, usize)> {
    let cr = find_crlf(buf, 1)?;
    let value = string_value(buf.slice(1..cr), opts);
    Ok((RespResult::new(value, kind), cr + 2))
}

/// `$<length>\r\n<data>\r\n`, `$-1\r\n`, or `$?\r\n;<len>\r\n<data>\r\n…;0\r\n`
///
/// Also used for `!` blob errors and `=` verbatim strings; a verbatim payload
/// keeps its `xxx:` format prefix.
fn parse_blob(buf: &Bytes, kind: MessageKind, opts: ReadOptions) -> Result<(RespResult, usize)> {
    let (line, next) = read_line(buf, 1)?;
    if line == b"?" {
        return parse_streamed_blob(buf, next, kind, opts);
    }
    let len = parse_int_from_bytes(line)?;

    if len < 0 {
        // RESP2 null bulk string
        return Ok((RespResult::new(RespValue::Null, kind), next));
    }

    let data_end = next + len as usize;
    if buf.len() < data_end + 2 {
        return Err(RespError::Incomplete);
    }
    if buf[data_end] != b'\r' || buf[data_end + 1] != b'\n' {
        return Err(RespError::Protocol(
            "blob string not terminated by \\r\\n".into(),
        ));
    }

    let value = string_value(buf.slice(next..data_end), opts);
    Ok((RespResult::new(value, kind), data_end + 2))
}

fn parse_streamed_blob(
    buf: &Bytes,
    mut pos: usize,
    kind: MessageKind,
    opts: ReadOptions,
) -> Result<(RespResult, usize)> {
    let mut data = BytesMut::new();
    loop {
        let (clen, next) = chunk_header(buf, pos)?;
        if clen == 0 {
            pos = next;
            break;
        }
        let chunk_end = next + clen;
        if buf.len() < chunk_end + 2 {
            return Err(RespError::Incomplete);
        }
        if buf[chunk_end] != b'\r' || buf[chunk_end + 1] != b'\n' {
            return Err(RespError::Protocol(
                "streamed chunk not terminated by \\r\\n".into(),
            ));
        }
        data.extend_from_slice(&buf[next..chunk_end]);
        pos = chunk_end + 2;
    }
    let value = string_value(data.freeze(), opts);
    Ok((RespResult::new(value, kind), pos))
}

/// `:<integer>\r\n`
fn parse_integer(buf: &Bytes) -> Result<(RespResult, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let i = parse_int_from_bytes(line)?;
    Ok((RespResult::new(RespValue::Integer(i), MessageKind::Number), next))
}

/// `(<big-number>\r\n`
fn parse_big_number(buf: &Bytes) -> Result<(RespResult, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let s = line_str(line, "big number")?;
    let n: BigNumber = s
        .parse()
        .map_err(|_| RespError::Protocol(format!("invalid big number: {s}")))?;
    Ok((
        RespResult::new(RespValue::BigNumber(n), MessageKind::BigNumber),
        next,
    ))
}

/// `_\r\n` (the rest of the line is ignored)
fn parse_null(buf: &Bytes) -> Result<(RespResult, usize)> {
    let (_, next) = read_line(buf, 1)?;
    Ok((RespResult::new(RespValue::Null, MessageKind::Null), next))
}

/// `,<floating-point>\r\n`
fn parse_double(buf: &Bytes) -> Result<(RespResult, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let s = line_str(line, "double")?;
    let d = match s {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        "nan" | "-nan" => f64::NAN,
        _ => s
            .parse::<f64>()
            .map_err(|e| RespError::Protocol(format!("invalid double {s:?}: {e}")))?,
    };
    Ok((RespResult::new(RespValue::Double(d), MessageKind::Double), next))
}

/// `#t\r\n` or `#f\r\n`
fn parse_boolean(buf: &Bytes) -> Result<(RespResult, usize)> {
    let (line, next) = read_line(buf, 1)?;
    let val = match line {
        b"t" => true,
        b"f" => false,
        other => {
            return Err(RespError::Protocol(format!(
                "invalid boolean value: {:?}",
                String::from_utf8_lossy(other)
            )));
        }
    };
    Ok((RespResult::new(RespValue::Boolean(val), MessageKind::Boolean), next))
}

/// `*<count>\r\n<elements>`, `*-1\r\n`, or `*?\r\n<elements>.\r\n`
///
/// Shared by arrays, sets and pushes.
fn parse_sequence(
    buf: &Bytes,
    kind: MessageKind,
    opts: ReadOptions,
) -> Result<(RespResult, usize)> {
    let (line, mut next) = read_line(buf, 1)?;

    if line == b"?" {
        let mut elements = Vec::new();
        loop {
            let (unit, consumed) = read_unit(&buf.slice(next..), opts)?;
            next += consumed;
            if unit.is_end {
                break;
            }
            elements.push(unit.value);
        }
        return Ok((RespResult::new(RespValue::Array(elements), kind), next));
    }

    let count = parse_int_from_bytes(line)?;
    if count < 0 {
        return Ok((RespResult::new(RespValue::Null, kind), next));
    }

    let count = count as usize;
    let mut elements = Vec::with_capacity(count.min(buf.len()));
    for _ in 0..count {
        let (unit, consumed) = read_unit(&buf.slice(next..), opts)?;
        if unit.is_end {
            return Err(unexpected_terminator());
        }
        elements.push(unit.value);
        next += consumed;
    }
    Ok((RespResult::new(RespValue::Array(elements), kind), next))
}

/// `%<count>\r\n<key><value>…`, `%-1\r\n`, or `%?\r\n<key><value>….\r\n`
///
/// Shared by maps and attributes. In the streamed form a terminator in the
/// value position ends the map and the dangling key is dropped.
fn parse_map(buf: &Bytes, kind: MessageKind, opts: ReadOptions) -> Result<(RespResult, usize)> {
    let (line, mut next) = read_line(buf, 1)?;

    if line == b"?" {
        let mut pairs = Vec::new();
        loop {
            let (key, consumed_k) = read_unit(&buf.slice(next..), opts)?;
            next += consumed_k;
            if key.is_end {
                break;
            }
            let (val, consumed_v) = read_unit(&buf.slice(next..), opts)?;
            next += consumed_v;
            if val.is_end {
                break;
            }
            pairs.push((key.value, val.value));
        }
        return Ok((RespResult::new(RespValue::Map(pairs), kind), next));
    }

    let count = parse_int_from_bytes(line)?;
    if count < 0 {
        return Ok((RespResult::new(RespValue::Null, kind), next));
    }

    let count = count as usize;
    let mut pairs = Vec::with_capacity(count.min(buf.len()));
    for _ in 0..count {
        let (key, consumed_k) = read_unit(&buf.slice(next..), opts)?;
        next += consumed_k;
        let (val, consumed_v) = read_unit(&buf.slice(next..), opts)?;
        next += consumed_v;
        if key.is_end || val.is_end {
            return Err(unexpected_terminator());
        }
        pairs.push((key.value, val.value));
    }
    Ok((RespResult::new(RespValue::Map(pairs), kind), next))
}

// ── Tests ──────────────────────────────────────────────────────────
