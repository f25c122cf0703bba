//! Command construction.
//!
//! A [`Command`] is a name plus an ordered list of [`Arg`]s. Every argument
//! goes on the wire as a blob string; numbers are formatted without locale
//! and keyword arguments are upper-cased.

use std::borrow::Cow;

use bytes::Bytes;

/// One command argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Bytes(Bytes),
    Str(String),
    Int(i64),
    Float(f64),
    /// An enumerant token such as `ex` or `withscores`; written upper-cased.
    Keyword(String),
}

impl Arg {
    /// The exact bytes written for this argument.
    pub fn to_wire(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Bytes(b) => Cow::Borrowed(b.as_ref()),
            Self::Str(s) => Cow::Borrowed(s.as_bytes()),
            Self::Int(n) => Cow::Owned(itoa::Buffer::new().format(*n).as_bytes().to_vec()),
            Self::Float(f) => Cow::Owned(format_double(*f).into_bytes()),
            Self::Keyword(k) => Cow::Owned(k.to_ascii_uppercase().into_bytes()),
        }
    }

    fn eq_ignore_case(&self, other: &str) -> bool {
        match self {
            Self::Str(s) | Self::Keyword(s) => s.eq_ignore_ascii_case(other),
            Self::Bytes(b) => b.eq_ignore_ascii_case(other.as_bytes()),
            _ => false,
        }
    }

    fn as_count(&self) -> Option<usize> {
        match self {
            Self::Int(n) => usize::try_from(*n).ok(),
            Self::Str(s) => s.parse().ok(),
            Self::Bytes(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            _ => None,
        }
    }
}

/// Locale-independent double formatting: shortest round-trip digits,
/// `inf` / `-inf` for the infinities.
pub fn format_double(f: f64) -> String {
    if f == f64::INFINITY {
        "inf".to_string()
    } else if f == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if f.is_nan() {
        "nan".to_string()
    } else {
        f.to_string()
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<&String> for Arg {
    fn from(s: &String) -> Self {
        Self::Str(s.clone())
    }
}

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<&[u8]> for Arg {
    fn from(b: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<f64> for Arg {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

macro_rules! int_arg {
    ($($t:ty),*) => {
        $(impl From<$t> for Arg {
            fn from(n: $t) -> Self {
                Self::Int(n as i64)
            }
        })*
    };
}

int_arg!(i8, i16, i32, i64, u8, u16, u32);

// ── Command ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Arg>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn keyword(mut self, token: impl Into<String>) -> Self {
        self.args.push(Arg::Keyword(token.into()));
        self
    }

    pub fn args_from<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    /// Number of wire tokens, name included.
    pub fn token_count(&self) -> usize {
        self.args.len() + 1
    }

    /// Case-insensitive name comparison.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Index into [`args`](Self::args) of the first key, or `None` for
    /// commands that carry no key.
    pub fn key_index(&self) -> Option<usize> {
        let name = self.name.to_ascii_uppercase();
        match name.as_str() {
            "PING" | "ECHO" | "INFO" | "DBSIZE" | "CLUSTER" | "CONFIG" | "CLIENT" | "COMMAND"
            | "TIME" | "RANDOMKEY" | "WAIT" | "SAVE" | "BGSAVE" | "BGREWRITEAOF" | "FLUSHALL"
            | "FLUSHDB" | "LASTSAVE" | "SLOWLOG" | "DEBUG" | "MULTI" | "EXEC" | "DISCARD"
            | "UNWATCH" | "ASKING" | "READONLY" | "READWRITE" | "SCRIPT" | "SUBSCRIBE"
            | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE" | "PUBLISH" | "QUIT" | "HELLO"
            | "AUTH" | "SELECT" | "SENTINEL" | "ROLE" | "SCAN" | "KEYS" => None,
            // EVAL script numkeys key...
            "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
                match self.args.get(1)?.as_count()? {
                    0 => None,
                    _ if self.args.len() > 2 => Some(2),
                    _ => None,
                }
            }
            // XREAD [COUNT n] [BLOCK ms] STREAMS key...
            "XREAD" | "XREADGROUP" => self
                .args
                .iter()
                .position(|a| a.eq_ignore_case("STREAMS"))
                .map(|i| i + 1)
                .filter(|&i| i < self.args.len()),
            _ if self.args.is_empty() => None,
            _ => Some(0),
        }
    }

    /// Wire bytes of the first key.
    pub fn key(&self) -> Option<Cow<'_, [u8]>> {
        self.key_index().map(|i| self.args[i].to_wire())
    }

    /// Commands that may be served by a replica.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self.name.to_ascii_uppercase().as_str(),
            "GET"
                | "MGET"
                | "EXISTS"
                | "TYPE"
                | "TTL"
                | "PTTL"
                | "STRLEN"
                | "GETRANGE"
                | "HGET"
                | "HMGET"
                | "HGETALL"
                | "HKEYS"
                | "HVALS"
                | "HLEN"
                | "HEXISTS"
                | "HSCAN"
                | "LRANGE"
                | "LLEN"
                | "LINDEX"
                | "LPOS"
                | "SMEMBERS"
                | "SCARD"
                | "SISMEMBER"
                | "SMISMEMBER"
                | "SRANDMEMBER"
                | "SSCAN"
                | "ZRANGE"
                | "ZRANGEBYSCORE"
                | "ZREVRANGE"
                | "ZCARD"
                | "ZSCORE"
                | "ZMSCORE"
                | "ZCOUNT"
                | "ZRANK"
                | "ZREVRANK"
                | "ZSCAN"
                | "XRANGE"
                | "XREVRANGE"
                | "XLEN"
                | "XREAD"
                | "BITCOUNT"
                | "GETBIT"
                | "PFCOUNT"
                | "GEODIST"
                | "GEOPOS"
                | "GEOSEARCH"
                | "EVAL_RO"
                | "EVALSHA_RO"
                | "FCALL_RO"
        )
    }
}

/// Build a [`Command`] from a name and any number of arguments.
///
/// ```ignore
/// let c = cmd!("SET", "key", 42);
/// ```
#[macro_export]
macro_rules! cmd {
    ($name:expr $(, $arg:expr)* $(,)?) => {
        $crate::command::Command::new($name)$(.arg($arg))*
    };
}

// ── Tests ──────────────────────────────────────────────────────────
