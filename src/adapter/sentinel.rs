//! Redis Sentinel adapter.
//!
//! Resolves the current master via Sentinel, keeps a connection pool to it,
//! and fails over when the master changes. A command is resent to the
//! re-resolved master only when it provably did not run on the old one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, Lease, UseType};
use crate::command::Command;
use crate::config::{format_addr, ConnectionConfig};
use crate::connection::pool::ConnectionPool;
use crate::connection::tcp::RedisConnection;
use crate::error::{RedisErrorKind, RespError, Result};
use crate::resp::types::{Protocol, RespResult};

/// Number of retries after a failover is detected.
const DEFAULT_RETRY_COUNT: usize = 3;

/// Backoff between retries.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

struct Master {
    addr: String,
    pool: Arc<ConnectionPool>,
}

/// Adapter for Sentinel-managed deployments.
pub struct SentinelAdapter {
    master: RwLock<Master>,
    sentinels: Vec<String>,
    master_name: String,
    config: ConnectionConfig,
    retry_count: usize,
    retry_backoff: Duration,
}

impl SentinelAdapter {
    /// Resolve `master_name` from the first sentinel that knows it.
    pub async fn connect(
        master_name: impl Into<String>,
        sentinels: Vec<String>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        if sentinels.is_empty() {
            return Err(RespError::Sentinel(
                "at least one sentinel is required".into(),
            ));
        }
        let master_name = master_name.into();
        let addr = resolve_master(&sentinels, &master_name, &config).await?;
        info!(master = %master_name, addr = %addr, "sentinel resolved master");
        let pool = Arc::new(ConnectionPool::new(addr.clone(), config.clone()));

        Ok(Self {
            master: RwLock::new(Master { addr, pool }),
            sentinels,
            master_name,
            config,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        })
    }

    /// Override the failover retry policy.
    pub fn with_retry(mut self, count: usize, backoff: Duration) -> Self {
        self.retry_count = count;
        self.retry_backoff = backoff;
        self
    }

    pub fn master_name(&self) -> &str {
        &self.master_name
    }

    /// Address of the master currently in use.
    pub fn master_addr(&self) -> String {
        self.master.read().addr.clone()
    }

    fn current_pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.master.read().pool)
    }

    /// Re-resolve the master from sentinels and swap the pool if it moved.
    pub async fn failover(&self) -> Result<()> {
        let new_addr = resolve_master(&self.sentinels, &self.master_name, &self.config).await?;

        let old = {
            let mut master = self.master.write();
            if master.addr == new_addr {
                return Ok(());
            }
            let pool = Arc::new(ConnectionPool::new(new_addr.clone(), self.config.clone()));
            let old_addr = std::mem::replace(&mut master.addr, new_addr.clone());
            let old_pool = std::mem::replace(&mut master.pool, pool);
            (old_addr, old_pool)
        };
        old.1.close();
        info!(master = %self.master_name, from = %old.0, to = %new_addr, "sentinel failover");
        Ok(())
    }

    /// One attempt on the current master.
    async fn attempt(&self, cmd: &Command) -> Result<Attempt> {
        let pool = self.current_pool();
        let mut conn = match pool.get().await {
            Ok(conn) => conn,
            Err(e @ (RespError::Connection(_) | RespError::Timeout(_))) => {
                return Ok(Attempt::Unsent(e));
            }
            Err(e) => return Err(e),
        };
        match conn.send(cmd).await {
            Ok(()) => {}
            // write_all failed, so the frame never fully reached the server
            Err(e @ RespError::Connection(_)) => return Ok(Attempt::Unsent(e)),
            Err(e) => return Err(e),
        }
        let reply = conn.read_response().await?;
        if let Some(msg) = reply.error_message() {
            if RedisErrorKind::from_error_msg(&msg) == RedisErrorKind::ReadOnly {
                debug!(addr = %conn.addr(), "READONLY reply from master");
                return Ok(Attempt::ReadOnly);
            }
        }
        Ok(Attempt::Reply(reply))
    }
}

/// Result of one attempt against the current master.
enum Attempt {
    Reply(RespResult),
    /// The master is now a replica.
    ReadOnly,
    /// The command never reached the master and is safe to resend.
    Unsent(RespError),
}

impl Adapter for SentinelAdapter {
    fn use_type(&self) -> UseType {
        UseType::Sentinel
    }

    async fn get_connection(&self, _cmd: &Command) -> Result<Lease> {
        Ok(Lease::Pooled(self.current_pool().get().await?))
    }

    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        let mut last_err = None;

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                tokio::time::sleep(self.retry_backoff).await;
                if let Err(e) = self.failover().await {
                    warn!(error = %e, "sentinel re-resolve failed");
                    last_err = Some(e);
                    continue;
                }
            }

            // Anything that failed after the write may already have run
            match self.attempt(cmd).await? {
                Attempt::Reply(reply) => return project(reply),
                Attempt::ReadOnly => {
                    last_err = Some(RespError::redis(format!(
                        "READONLY master {} is a replica",
                        self.master_addr()
                    )));
                }
                Attempt::Unsent(e) => {
                    debug!(error = %e, "master unreachable");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            RespError::Sentinel("all failover retries exhausted".into())
        }))
    }

    async fn dispose(&self) {
        self.current_pool().close();
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Resolve the master address by querying sentinel nodes in order.
async fn resolve_master(
    sentinels: &[String],
    master_name: &str,
    config: &ConnectionConfig,
) -> Result<String> {
    // Sentinels speak RESP2 and have no databases.
    let sentinel_config = ConnectionConfig {
        db: 0,
        protocol: Protocol::Resp2,
        username: None,
        password: None,
        ..config.clone()
    };
    let mut last_err = None;

    for addr in sentinels {
        let mut conn = match RedisConnection::connect(addr, &sentinel_config).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(sentinel = %addr, error = %e, "sentinel unreachable");
                last_err = Some(e);
                continue;
            }
        };

        // Sentinels may require auth too
        if let Some(pass) = &config.password {
            let auth = match &config.username {
                Some(user) => Command::new("AUTH").arg(user).arg(pass),
                None => Command::new("AUTH").arg(pass),
            };
            if let Err(e) = conn.execute(&auth).await {
                last_err = Some(e);
                continue;
            }
        }

        let query = Command::new("SENTINEL")
            .arg("get-master-addr-by-name")
            .arg(master_name);
        let reply = match conn.execute(&query).await {
            Ok(reply) => reply,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };
        match reply.project::<Option<Vec<String>>>() {
            Ok(Some(parts)) if parts.len() >= 2 => {
                match parts[1].parse::<u16>() {
                    Ok(port) => return Ok(format_addr(&parts[0], port)),
                    Err(_) => {
                        warn!(sentinel = %addr, port = %parts[1], "sentinel reported an invalid port");
                        last_err = Some(RespError::Sentinel(format!(
                            "invalid master port {:?} from sentinel at {addr}",
                            parts[1]
                        )));
                    }
                }
            }
            Ok(_) => {
                last_err = Some(RespError::Sentinel(format!(
                    "master '{master_name}' not found by sentinel at {addr}"
                )));
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        RespError::Sentinel("could not contact any sentinel".into())
    }))
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resp::types::RespValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Sentinel mock: answers every connection's first command with the
    /// address held in `master`.
    async fn mock_sentinel(master: Arc<parking_lot::Mutex<String>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let master = Arc::clone(&master);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        let current = master.lock().clone();
                        let reply = match current.rsplit_once(':') {
                            Some((host, port)) => format!(
                                "*2\r\n${}\r\n{host}\r\n${}\r\n{port}\r\n",
                                host.len(),
                                port.len()
                            ),
                            None => "*-1\r\n".to_string(),
                        };
                        if socket.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Redis mock replying `reply` to every command; counts commands.
    async fn mock_node(reply: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    while let Ok(n) = socket.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        if socket.write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, hits)
    }

    #[tokio::test]
    async fn resolves_and_executes_on_master() {
        let (node, hits) = mock_node("+PONG\r\n").await;
        let sentinel = mock_sentinel(Arc::new(parking_lot::Mutex::new(node.clone()))).await;

        let adapter = SentinelAdapter::connect("mymaster", vec![sentinel], ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(adapter.use_type(), UseType::Sentinel);
        assert_eq!(adapter.master_addr(), node);

        let v = adapter.execute_value(&Command::new("PING")).await.unwrap();
        assert_eq!(v, RespValue::Text("PONG".into()));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn readonly_triggers_failover() {
        let (old, _) = mock_node("-READONLY You can't write against a read only replica.\r\n").await;
        let (new, new_hits) = mock_node("+OK\r\n").await;
        let current = Arc::new(parking_lot::Mutex::new(old.clone()));
        let sentinel = mock_sentinel(Arc::clone(&current)).await;

        let adapter = SentinelAdapter::connect("mymaster", vec![sentinel], ConnectionConfig::default())
            .await
            .unwrap()
            .with_retry(2, Duration::from_millis(5));
        assert_eq!(adapter.master_addr(), old);

        // the sentinel now reports the promoted replica
        *current.lock() = new.clone();
        let v = adapter
            .execute_value(&Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap();
        assert_eq!(v, RespValue::Text("OK".into()));
        assert_eq!(adapter.master_addr(), new);
        assert_eq!(new_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_exhausted_surface_last_error() {
        let (old, _) = mock_node("-READONLY replica\r\n").await;
        let sentinel = mock_sentinel(Arc::new(parking_lot::Mutex::new(old))).await;
        let adapter = SentinelAdapter::connect("mymaster", vec![sentinel], ConnectionConfig::default())
            .await
            .unwrap()
            .with_retry(1, Duration::from_millis(1));
        let err = adapter
            .execute_value(&Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap_err();
        assert!(matches!(err.redis_kind(), Some(RedisErrorKind::ReadOnly)));
    }

    #[tokio::test]
    async fn unknown_master_is_an_error() {
        let sentinel = mock_sentinel(Arc::new(parking_lot::Mutex::new(String::new()))).await;
        let err = SentinelAdapter::connect("nope", vec![sentinel], ConnectionConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RespError::Sentinel(_)));
    }

    #[tokio::test]
    async fn invalid_port_falls_through_to_next_sentinel() {
        let (node, _) = mock_node("+PONG\r\n").await;
        let bad = mock_sentinel(Arc::new(parking_lot::Mutex::new(
            "127.0.0.1:notaport".to_string(),
        )))
        .await;
        let good = mock_sentinel(Arc::new(parking_lot::Mutex::new(node.clone()))).await;

        let addr = resolve_master(&[bad.clone(), good], "mymaster", &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(addr, node);

        let err = resolve_master(&[bad], "mymaster", &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RespError::Sentinel(ref m) if m.contains("invalid master port")));
    }

    #[tokio::test]
    async fn unreachable_master_fails_over() {
        let (new, new_hits) = mock_node("+OK\r\n").await;
        // nothing listens on the first reported master
        let current = Arc::new(parking_lot::Mutex::new(new.clone()));
        let sentinel = mock_sentinel(Arc::clone(&current)).await;
        let config = ConnectionConfig {
            connect_timeout: Some(Duration::from_millis(200)),
            ..ConnectionConfig::default()
        };
        let adapter = SentinelAdapter::connect("mymaster", vec![sentinel], config)
            .await
            .unwrap()
            .with_retry(2, Duration::from_millis(5));
        {
            let mut master = adapter.master.write();
            master.addr = "127.0.0.1:1".to_string();
            master.pool = Arc::new(ConnectionPool::new("127.0.0.1:1", adapter.config.clone()));
        }

        let v = adapter
            .execute_value(&Command::new("SET").arg("k").arg("v"))
            .await
            .unwrap();
        assert_eq!(v, RespValue::Text("OK".into()));
        assert_eq!(adapter.master_addr(), new);
        assert_eq!(new_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_master_no_sentinels() {
        let result = resolve_master(&[], "mymaster", &ConnectionConfig::default()).await;
        assert!(result.is_err());
        let result = SentinelAdapter::connect("m", Vec::new(), ConnectionConfig::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn resolve_master_unreachable() {
        let config = ConnectionConfig {
            connect_timeout: Some(Duration::from_millis(100)),
            ..ConnectionConfig::default()
        };
        let result = resolve_master(&["127.0.0.1:1".to_string()], "mymaster", &config).await;
        assert!(result.is_err());
    }
}
