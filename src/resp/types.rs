use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::{RespError, Result};
use crate::resp::convert::FromResp;

// ── Message kind ───────────────────────────────────────────────────

/// The RESP message type announced by a frame's leader byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `$`
    BlobString,
    /// `+`
    SimpleString,
    /// `=`
    VerbatimString,
    /// `-`
    SimpleError,
    /// `!`
    BlobError,
    /// `:`
    Number,
    /// `(`
    BigNumber,
    /// `_`
    Null,
    /// `,`
    Double,
    /// `#`
    Boolean,
    /// `*`
    Array,
    /// `~`
    Set,
    /// `>`
    Push,
    /// `%`
    Map,
    /// `|`
    Attribute,
}

impl MessageKind {
    /// Map a leader byte to its kind. Unknown bytes yield `None`.
    pub fn from_leader(b: u8) -> Option<Self> {
        Some(match b {
            b'$' => Self::BlobString,
            b'+' => Self::SimpleString,
            b'=' => Self::VerbatimString,
            b'-' => Self::SimpleError,
            b'!' => Self::BlobError,
            b':' => Self::Number,
            b'(' => Self::BigNumber,
            b'_' => Self::Null,
            b',' => Self::Double,
            b'#' => Self::Boolean,
            b'*' => Self::Array,
            b'~' => Self::Set,
            b'>' => Self::Push,
            b'%' => Self::Map,
            b'|' => Self::Attribute,
            _ => return None,
        })
    }

    /// The leader byte written for this kind.
    pub fn leader(self) -> u8 {
        match self {
            Self::BlobString => b'$',
            Self::SimpleString => b'+',
            Self::VerbatimString => b'=',
            Self::SimpleError => b'-',
            Self::BlobError => b'!',
            Self::Number => b':',
            Self::BigNumber => b'(',
            Self::Null => b'_',
            Self::Double => b',',
            Self::Boolean => b'#',
            Self::Array => b'*',
            Self::Set => b'~',
            Self::Push => b'>',
            Self::Map => b'%',
            Self::Attribute => b'|',
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::SimpleError | Self::BlobError)
    }

    pub fn is_aggregate(self) -> bool {
        matches!(
            self,
            Self::Array | Self::Set | Self::Push | Self::Map | Self::Attribute
        )
    }
}

// ── Protocol ───────────────────────────────────────────────────────

/// Wire protocol version negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Resp2,
    Resp3,
}

// ── BigNumber ──────────────────────────────────────────────────────

/// An arbitrary-precision integer, kept as its validated decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigNumber(String);

impl BigNumber {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.starts_with('-')
    }

    /// Narrow to `i64` when the value fits.
    pub fn to_i64(&self) -> Option<i64> {
        self.0.parse().ok()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl FromStr for BigNumber {
    type Err = RespError;

    /// Accepts an optional `+`/`-` sign followed by one or more ASCII digits.
    /// A leading `+` is dropped from the stored form.
    fn from_str(s: &str) -> Result<Self> {
        let (sign, digits) = match s.as_bytes().first() {
            Some(b'-') => ("-", &s[1..]),
            Some(b'+') => ("", &s[1..]),
            _ => ("", s),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RespError::Conversion(format!("invalid big number: {s:?}")));
        }
        Ok(Self(format!("{sign}{digits}")))
    }
}

impl fmt::Display for BigNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for BigNumber {
    fn from(n: i64) -> Self {
        Self(n.to_string())
    }
}

// ── RespValue ──────────────────────────────────────────────────────

/// Untyped decoded payload. The wire-level type lives on [`RespResult::kind`].
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `_`, `$-1`, `*-1`, `%-1`
    Null,
    /// String payloads kept as raw bytes
    Bytes(Bytes),
    /// String payloads decoded as UTF-8
    Text(String),
    /// `:`
    Integer(i64),
    /// `(`
    BigNumber(BigNumber),
    /// `,`
    Double(f64),
    /// `#`
    Boolean(bool),
    /// Array, set and push payloads
    Array(Vec<RespValue>),
    /// Map and attribute payloads, in wire order
    Map(Vec<(RespValue, RespValue)>),
}

impl RespValue {
    /// Try to interpret this value as a UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Try to interpret this value as bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Double(d) => Some(*d),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn into_map(self) -> Option<Vec<(RespValue, RespValue)>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Lossy text rendering of string-like payloads.
    pub fn to_text_lossy(&self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s.clone()),
            Self::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            _ => None,
        }
    }

    /// Returns the type name as a static string (useful for error messages).
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Integer(_) => "integer",
            Self::BigNumber(_) => "big_number",
            Self::Double(_) => "double",
            Self::Boolean(_) => "boolean",
            Self::Array(_) => "array",
            Self::Map(_) => "map",
        }
    }
}

// ── RespResult ─────────────────────────────────────────────────────

/// One decoded unit: payload, the kind it arrived as, and whether it was
/// the `.` terminator of a streamed aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct RespResult {
    pub value: RespValue,
    pub kind: MessageKind,
    pub is_end: bool,
}

impl RespResult {
    pub fn new(value: RespValue, kind: MessageKind) -> Self {
        Self {
            value,
            kind,
            is_end: false,
        }
    }

    pub(crate) fn terminator() -> Self {
        Self {
            value: RespValue::Null,
            kind: MessageKind::Null,
            is_end: true,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind.is_error()
    }

    /// The error text when this is a simple or blob error.
    pub fn error_message(&self) -> Option<String> {
        if !self.is_error() {
            return None;
        }
        Some(self.value.to_text_lossy().unwrap_or_default())
    }

    /// Raise an error reply as [`RespError::Redis`], otherwise pass through.
    pub fn into_result(self) -> Result<Self> {
        match self.error_message() {
            Some(msg) => Err(RespError::redis(msg)),
            None => Ok(self),
        }
    }

    /// Raise an error reply, then convert the payload to `T`.
    pub fn project<T: FromResp>(self) -> Result<T> {
        let ok = self.into_result()?;
        T::from_resp(ok.value)
    }

    /// Split a verbatim string into its 3-byte format and the content.
    pub fn verbatim_format(&self) -> Option<(&str, &[u8])> {
        if self.kind != MessageKind::VerbatimString {
            return None;
        }
        let raw = self.value.as_bytes()?;
        if raw.len() < 4 || raw[3] != b':' {
            return None;
        }
        let format = std::str::from_utf8(&raw[..3]).ok()?;
        Some((format, &raw[4..]))
    }
}

// ── Tests ──────────────────────────────────────────────────────────
