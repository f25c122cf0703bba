use std::io;

// ── Error taxonomy ─────────────────────────────────────────────────
//
//  RespError
//  ├── Connection   (I/O, poisons the connection)
//  ├── Protocol     (malformed framing, poisons the connection)
//  ├── Timeout      (connect / read / write deadline, poisons the connection)
//  ├── Redis        (server error reply, recoverable per call)
//  ├── Conversion   (reply shape mismatch, recoverable per call)
//  ├── Cluster / Sentinel (topology failures)
//  └── Config

/// A parsed `MOVED` / `ASK` cluster redirection.
///
/// At most one of `moved` / `ask` is set. Error text that is not a
/// redirection does not produce a `Redirect` at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub moved: bool,
    pub ask: bool,
    pub slot: u16,
    pub endpoint: String,
}

impl Redirect {
    /// Parse a simple-error payload such as `MOVED 3999 127.0.0.1:7001`.
    ///
    /// Only the first line is considered. The payload must split into
    /// exactly three space-separated tokens (the endpoint keeps any further
    /// spaces) and the slot must fit in a `u16`.
    pub fn parse(msg: &str) -> Option<Self> {
        let moved = msg.starts_with("MOVED ");
        let ask = msg.starts_with("ASK ");
        if !moved && !ask {
            return None;
        }
        let line = msg.split("\r\n").next().unwrap_or(msg);
        let mut parts = line.splitn(3, ' ');
        parts.next()?;
        let slot = parts.next()?.parse::<u16>().ok()?;
        let endpoint = parts.next()?;
        if endpoint.is_empty() {
            return None;
        }
        Some(Self {
            moved,
            ask,
            slot,
            endpoint: endpoint.to_string(),
        })
    }
}

/// Structured Redis error kinds for programmatic matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisErrorKind {
    /// Generic ERR
    Err,
    /// WRONGTYPE Operation against a key holding the wrong kind of value
    WrongType,
    /// MOVED slot host:port  (cluster)
    Moved { slot: u16, addr: String },
    /// ASK slot host:port  (cluster)
    Ask { slot: u16, addr: String },
    /// CLUSTERDOWN
    ClusterDown,
    /// LOADING Redis is loading the dataset in memory
    Loading,
    /// READONLY You can't write against a read only replica
    ReadOnly,
    /// NOSCRIPT No matching script
    NoScript,
    /// BUSY Redis is busy running a script
    Busy,
    /// TRYAGAIN
    TryAgain,
    /// Any other Redis error prefix
    Other(String),
}

impl RedisErrorKind {
    /// Classify a Redis error message by its leading word.
    pub fn from_error_msg(msg: &str) -> Self {
        if let Some(redirect) = Redirect::parse(msg) {
            return if redirect.moved {
                Self::Moved {
                    slot: redirect.slot,
                    addr: redirect.endpoint,
                }
            } else {
                Self::Ask {
                    slot: redirect.slot,
                    addr: redirect.endpoint,
                }
            };
        }

        let prefix = msg.split_whitespace().next().unwrap_or("UNKNOWN");
        match prefix {
            "ERR" => Self::Err,
            "WRONGTYPE" => Self::WrongType,
            "CLUSTERDOWN" => Self::ClusterDown,
            "LOADING" => Self::Loading,
            "READONLY" => Self::ReadOnly,
            "NOSCRIPT" => Self::NoScript,
            "BUSY" => Self::Busy,
            "TRYAGAIN" => Self::TryAgain,
            other => Self::Other(other.to_string()),
        }
    }
}

/// All error variants for respkit.
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    /// TCP / IO level errors
    #[error("connection error: {0}")]
    Connection(#[from] io::Error),
    /// Malformed RESP framing
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The buffer parser needs more bytes; never surfaced by a connection.
    #[error("incomplete RESP message")]
    Incomplete,
    /// The server replied with an error
    #[error("redis error: {message}")]
    Redis {
        kind: RedisErrorKind,
        message: String,
    },
    /// Connect, read or write deadline exceeded
    #[error("timeout: {0}")]
    Timeout(String),
    /// The reply could not be converted to the requested shape
    #[error("conversion error: {0}")]
    Conversion(String),
    /// Cluster topology errors (no node for slot, redirect loop, ...)
    #[error("cluster error: {0}")]
    Cluster(String),
    /// Sentinel errors (master not found, ...)
    #[error("sentinel error: {0}")]
    Sentinel(String),
    /// Invalid configuration or URL
    #[error("config error: {0}")]
    Config(String),
}

impl RespError {
    /// Create a Redis error from a raw error message, classifying the kind.
    pub fn redis(msg: impl Into<String>) -> Self {
        let message = msg.into();
        let kind = RedisErrorKind::from_error_msg(&message);
        Self::Redis { kind, message }
    }

    /// True when the connection that produced this error can no longer be
    /// trusted and must be discarded instead of reused.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Protocol(_) | Self::Timeout(_) | Self::Incomplete
        )
    }

    /// The server-side error kind, if this is a Redis error reply.
    pub fn redis_kind(&self) -> Option<&RedisErrorKind> {
        match self {
            Self::Redis { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RespError>;

// ── Tests ──────────────────────────────────────────────────────────
