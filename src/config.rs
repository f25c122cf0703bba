//! Connection configuration and URL parsing.
//!
//! Supported URL schemes:
//! - `redis://[user:pass@]host[:port][/db][?opts]`                    standalone
//! - `redis+sentinel://[user:pass@]master@host[:port][,host…][/db][?opts]`
//! - `redis+cluster://[user:pass@]host[:port][,host…][?opts]`
//!
//! Query options: `protocol=2|3`, `pool_size`, `connect_timeout`,
//! `read_timeout`, `write_timeout` (milliseconds, `0` disables),
//! `decode_responses`, `max_redirects`, `read_from_replicas`, `rng_seed`.

use std::time::Duration;

use crate::error::{RespError, Result};
use crate::resp::{Protocol, ReadOptions};

/// Default Redis port.
pub const DEFAULT_PORT: u16 = 6379;
/// Default Redis Sentinel port.
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;
/// Default per-connection read buffer cap (64 MB).
pub const DEFAULT_MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Deployment shape the client adapts to.
#[derive(Debug, Clone, PartialEq)]
pub enum Topology {
    /// One server, one pool.
    Standalone,
    /// Sentinel-managed master; `sentinels` are `host:port` endpoints.
    Sentinel {
        master_name: String,
        sentinels: Vec<String>,
    },
    /// Cluster seed endpoints as `host:port`.
    Cluster { nodes: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Redis 6+ ACL user.
    pub username: Option<String>,
    pub password: Option<String>,
    pub db: u16,
    /// `Resp3` sends `HELLO 3` during the handshake.
    pub protocol: Protocol,
    pub topology: Topology,
    /// Maximum connections per endpoint pool.
    pub pool_size: usize,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    /// Pooled connections idle longer than this are closed on checkout.
    pub idle_timeout: Duration,
    /// Upper bound on a single connection's read buffer.
    pub max_buffer_size: usize,
    /// Decode string replies as UTF-8 text instead of raw bytes.
    pub decode_responses: bool,
    /// Cluster redirect chase limit per command.
    pub max_redirects: usize,
    /// Route read-only cluster commands to replicas.
    pub read_from_replicas: bool,
    /// Send `READONLY` during the handshake. Set on cluster replica pools.
    pub readonly: bool,
    /// Per-node cluster pools unused this long are torn down.
    pub cluster_idle_timeout: Duration,
    /// Seed for the adapters' random source; entropy when unset.
    pub rng_seed: Option<u64>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: None,
            password: None,
            db: 0,
            protocol: Protocol::Resp2,
            topology: Topology::Standalone,
            pool_size: 8,
            connect_timeout: Some(Duration::from_secs(5)),
            read_timeout: Some(Duration::from_secs(30)),
            write_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Duration::from_secs(300),
            max_buffer_size: DEFAULT_MAX_BUF_SIZE,
            decode_responses: true,
            max_redirects: 16,
            read_from_replicas: false,
            readonly: false,
            cluster_idle_timeout: Duration::from_secs(600),
            rng_seed: None,
        }
    }
}

impl ConnectionConfig {
    /// Parse a Redis URL into a `ConnectionConfig`.
    pub fn from_url(url: &str) -> Result<Self> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| RespError::Config(format!("invalid URL, missing ://: {url}")))?;

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };

        let mut config = Self::default();
        match scheme {
            "redis" => parse_standalone(&mut config, rest)?,
            "redis+sentinel" => parse_sentinel(&mut config, rest)?,
            "redis+cluster" => parse_cluster(&mut config, rest)?,
            "rediss" | "rediss+cluster" | "redis+sentinels" => {
                return Err(RespError::Config(format!(
                    "TLS scheme {scheme}:// is not supported"
                )));
            }
            _ => {
                return Err(RespError::Config(format!("unknown URL scheme: {scheme}")));
            }
        }

        if let Some(query) = query {
            apply_query(&mut config, query)?;
        }
        Ok(config)
    }

    /// The primary endpoint as `host:port`.
    pub fn primary_addr(&self) -> String {
        format_addr(&self.host, self.port)
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions {
            decode_text: self.decode_responses,
        }
    }
}

/// `host:port`, with IPv6 hosts bracketed.
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

// ── URL parsing helpers ────────────────────────────────────────────

/// `[user:pass@]host[:port][/db]`
fn parse_standalone(config: &mut ConnectionConfig, rest: &str) -> Result<()> {
    let hosts = take_db_and_auth(config, rest, false)?;
    let (host, port) = parse_host_port(hosts, DEFAULT_PORT)?;
    config.host = host;
    config.port = port;
    Ok(())
}

/// `[user:pass@]master@host[:port][,host[:port]…][/db]`
fn parse_sentinel(config: &mut ConnectionConfig, rest: &str) -> Result<()> {
    let after_auth = take_db_and_auth(config, rest, true)?;
    let (master_name, hosts) = after_auth.split_once('@').ok_or_else(|| {
        RespError::Config(
            "sentinel URL must include master name: redis+sentinel://master@host:port".into(),
        )
    })?;
    if master_name.is_empty() {
        return Err(RespError::Config("empty sentinel master name".into()));
    }

    let sentinels = parse_host_list(hosts, DEFAULT_SENTINEL_PORT)?;
    if sentinels.is_empty() {
        return Err(RespError::Config(
            "sentinel URL must include at least one sentinel host".into(),
        ));
    }
    config.topology = Topology::Sentinel {
        master_name: master_name.to_string(),
        sentinels,
    };
    Ok(())
}

/// `[user:pass@]host1[:port][,host2[:port]…]`
fn parse_cluster(config: &mut ConnectionConfig, rest: &str) -> Result<()> {
    let hosts = take_db_and_auth(config, rest, false)?;
    let nodes = parse_host_list(hosts, DEFAULT_PORT)?;
    if nodes.is_empty() {
        return Err(RespError::Config(
            "cluster URL must include at least one node".into(),
        ));
    }
    if config.db != 0 {
        return Err(RespError::Config("cluster mode only supports db 0".into()));
    }
    config.topology = Topology::Cluster { nodes };
    Ok(())
}

/// Strip `/db` and the credentials prefix, returning what is left.
///
/// Sentinel URLs carry a second `@` (`user:pass@master@hosts`), so there the
/// credentials are only present when two `@` appear.
fn take_db_and_auth<'a>(
    config: &mut ConnectionConfig,
    rest: &'a str,
    sentinel: bool,
) -> Result<&'a str> {
    let (authority, db) = match rest.split_once('/') {
        Some((a, d)) if !d.is_empty() => (a, Some(d)),
        Some((a, _)) => (a, None),
        None => (rest, None),
    };
    if let Some(db) = db {
        config.db = db
            .parse()
            .map_err(|_| RespError::Config(format!("invalid db number: {db}")))?;
    }

    let has_auth = if sentinel {
        authority.matches('@').count() >= 2
    } else {
        authority.contains('@')
    };
    if !has_auth {
        return Ok(authority);
    }
    let split = if sentinel {
        authority.split_once('@')
    } else {
        authority.rsplit_once('@')
    };
    match split {
        Some((userinfo, remainder)) => {
            apply_userinfo(config, userinfo);
            Ok(remainder)
        }
        None => Ok(authority),
    }
}

/// `user:pass`, `:pass` or a bare password.
fn apply_userinfo(config: &mut ConnectionConfig, userinfo: &str) {
    let (user, pass) = userinfo.split_once(':').unwrap_or(("", userinfo));
    if !user.is_empty() {
        config.username = Some(user.to_string());
    }
    if !pass.is_empty() {
        config.password = Some(pass.to_string());
    }
}

fn parse_host_list(hosts: &str, default_port: u16) -> Result<Vec<String>> {
    hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| parse_host_port(h, default_port).map(|(host, port)| format_addr(&host, port)))
        .collect()
}

/// `host[:port]`, `[ipv6][:port]` or a bare IPv6 address.
fn parse_host_port(s: &str, default_port: u16) -> Result<(String, u16)> {
    let (host, port) = if let Some(inner) = s.strip_prefix('[') {
        let (host, after) = inner
            .split_once(']')
            .ok_or_else(|| RespError::Config(format!("unclosed IPv6 bracket: {s}")))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None => default_port,
        };
        (host.to_string(), port)
    } else {
        match s.rsplit_once(':') {
            Some((h, _)) if h.contains(':') => (s.to_string(), default_port),
            Some((h, p)) => (h.to_string(), parse_port(p)?),
            None => (s.to_string(), default_port),
        }
    };

    if host.is_empty() {
        return Ok(("127.0.0.1".to_string(), port));
    }
    Ok((host, port))
}

fn parse_port(p: &str) -> Result<u16> {
    p.parse()
        .map_err(|_| RespError::Config(format!("invalid port: {p}")))
}

fn apply_query(config: &mut ConnectionConfig, query: &str) -> Result<()> {
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let bad = || RespError::Config(format!("invalid value for {key}: {value:?}"));
        match key {
            "protocol" => {
                config.protocol = match value {
                    "2" | "resp2" => Protocol::Resp2,
                    "3" | "resp3" => Protocol::Resp3,
                    _ => return Err(bad()),
                }
            }
            "pool_size" => config.pool_size = value.parse().map_err(|_| bad())?,
            "connect_timeout" => config.connect_timeout = parse_millis(value).ok_or_else(bad)?,
            "read_timeout" => config.read_timeout = parse_millis(value).ok_or_else(bad)?,
            "write_timeout" => config.write_timeout = parse_millis(value).ok_or_else(bad)?,
            "decode_responses" => config.decode_responses = parse_flag(value).ok_or_else(bad)?,
            "max_redirects" => config.max_redirects = value.parse().map_err(|_| bad())?,
            "read_from_replicas" => {
                config.read_from_replicas = parse_flag(value).ok_or_else(bad)?
            }
            "rng_seed" => config.rng_seed = Some(value.parse().map_err(|_| bad())?),
            _ => return Err(RespError::Config(format!("unknown URL option: {key}"))),
        }
    }
    if config.pool_size == 0 {
        return Err(RespError::Config("pool_size must be at least 1".into()));
    }
    Ok(())
}

/// Milliseconds; `0` means no deadline.
fn parse_millis(value: &str) -> Option<Option<Duration>> {
    let ms: u64 = value.parse().ok()?;
    Some((ms > 0).then(|| Duration::from_millis(ms)))
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" | "true" | "yes" | "" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

// ── Tests ──────────────────────────────────────────────────────────
