//! Async connection pool for one Redis endpoint.
//!
//! Uses a semaphore for max size control and a deque for idle connection reuse.
//! The idle queue uses `parking_lot::Mutex` (sync, held very briefly) so
//! connections can be returned in `Drop` without needing async.

use std::collections::VecDeque;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::ConnectionConfig;
use crate::connection::tcp::{ConnectedHook, RedisConnection};
use crate::error::{RespError, Result};

/// A bounded pool of connections to a single address.
pub struct ConnectionPool {
    addr: String,
    /// Idle connections ready for reuse (sync mutex, held very briefly).
    idle: SyncMutex<VecDeque<RedisConnection>>,
    /// Semaphore limiting total checked-out connections.
    semaphore: Arc<Semaphore>,
    config: ConnectionConfig,
    max_size: usize,
    /// How long a connection can be idle before being dropped.
    idle_timeout: Duration,
    on_connected: Option<ConnectedHook>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("addr", &self.addr)
            .field("max_size", &self.max_size)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool for `addr`. No connection is opened until the first
    /// [`get`](Self::get).
    pub fn new(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self::with_hook(addr, config, None)
    }

    pub fn with_hook(
        addr: impl Into<String>,
        config: ConnectionConfig,
        on_connected: Option<ConnectedHook>,
    ) -> Self {
        let max_size = config.pool_size.max(1);
        Self {
            addr: addr.into(),
            idle: SyncMutex::new(VecDeque::with_capacity(max_size)),
            semaphore: Arc::new(Semaphore::new(max_size)),
            idle_timeout: config.idle_timeout,
            config,
            max_size,
            on_connected,
            closed: AtomicBool::new(false),
        }
    }

    /// Get a connection from the pool.
    ///
    /// Waits while all `max_size` connections are checked out. The returned
    /// [`PoolGuard`] gives the connection back on drop unless it was marked
    /// broken.
    pub async fn get(self: &Arc<Self>) -> Result<PoolGuard> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| closed_error(&self.addr))?;

        // Try to get an idle connection (sync lock, very brief)
        let conn = self.take_healthy_connection();

        let conn = match conn {
            Some(c) => c,
            None => self.create_connection().await?,
        };

        Ok(PoolGuard {
            conn: Some(conn),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Return the number of currently idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Return the number of available permits (roughly = max_size - checked_out).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop idle connections and refuse new checkouts. Guards already handed
    /// out keep working; their connections are dropped on release.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        let dropped = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        debug!(addr = %self.addr, dropped, "pool closed");
    }

    async fn create_connection(&self) -> Result<RedisConnection> {
        let conn = RedisConnection::connect(&self.addr, &self.config).await?;
        if let Some(hook) = &self.on_connected {
            hook(&conn);
        }
        Ok(conn)
    }

    /// Take a healthy connection from the idle queue (LIFO for cache warmth).
    fn take_healthy_connection(&self) -> Option<RedisConnection> {
        let mut idle = self.idle.lock();
        while let Some(conn) = idle.pop_back() {
            if !conn.is_reusable() || conn.last_used.elapsed() > self.idle_timeout {
                continue; // Drop stale connection
            }
            return Some(conn);
        }
        None
    }

    /// Return a connection to the pool (sync, safe for Drop).
    fn return_connection(&self, conn: RedisConnection) {
        if conn.is_broken() {
            debug!(addr = %self.addr, "discarding broken connection");
            return;
        }
        if conn.pending_replies() > 0 {
            debug!(
                addr = %self.addr,
                pending = conn.pending_replies(),
                "discarding connection with unread replies"
            );
            return;
        }
        if self.is_closed() || conn.last_used.elapsed() > self.idle_timeout {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push_back(conn);
        }
    }
}

fn closed_error(addr: &str) -> RespError {
    RespError::Connection(io::Error::new(
        io::ErrorKind::NotConnected,
        format!("connection pool for {addr} is closed"),
    ))
}

/// RAII guard that returns the connection to the pool on drop.
pub struct PoolGuard {
    conn: Option<RedisConnection>,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

impl Deref for PoolGuard {
    type Target = RedisConnection;

    fn deref(&self) -> &RedisConnection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("pool guard holds its connection until drop"),
        }
    }
}

impl DerefMut for PoolGuard {
    fn deref_mut(&mut self) -> &mut RedisConnection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("pool guard holds its connection until drop"),
        }
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::resp::types::RespValue;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Start a mock Redis server that responds to any command with +OK\r\n.
    async fn mock_redis_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                if socket.write_all(b"+OK\r\n").await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });

        addr
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            pool_size: 3,
            connect_timeout: Some(Duration::from_secs(1)),
            idle_timeout: Duration::from_secs(60),
            ..ConnectionConfig::default()
        }
    }

    #[tokio::test]
    async fn pool_create_and_get() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(ConnectionPool::new(addr, test_config()));

        assert_eq!(pool.max_size(), 3);
        assert_eq!(pool.available(), 3);

        let mut guard = pool.get().await.unwrap();
        assert_eq!(pool.available(), 2);

        let result = guard.execute(&Command::new("PING")).await.unwrap();
        assert_eq!(result.value, RespValue::Text("OK".into()));

        drop(guard);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn pool_reuses_connections() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(ConnectionPool::new(addr, test_config()));

        {
            let mut guard = pool.get().await.unwrap();
            guard.execute(&Command::new("PING")).await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        {
            let _guard = pool.get().await.unwrap();
            assert_eq!(pool.idle_count(), 0);
        }
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn pool_limits_connections() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(ConnectionPool::new(addr, test_config()));

        let g1 = pool.get().await.unwrap();
        let g2 = pool.get().await.unwrap();
        let g3 = pool.get().await.unwrap();
        assert_eq!(pool.available(), 0);

        let result = tokio::time::timeout(Duration::from_millis(50), pool.get()).await;
        assert!(result.is_err());

        drop(g1);
        assert_eq!(pool.available(), 1);
        let _g4 = pool.get().await.unwrap();

        drop(g2);
        drop(g3);
    }

    #[tokio::test]
    async fn broken_connections_are_not_returned() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(ConnectionPool::new(addr, test_config()));

        {
            let mut guard = pool.get().await.unwrap();
            guard.mark_broken();
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available(), 3);
    }

    #[tokio::test]
    async fn pool_idle_timeout() {
        let addr = mock_redis_server().await;
        let config = ConnectionConfig {
            idle_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let pool = Arc::new(ConnectionPool::new(addr, config));

        {
            let _guard = pool.get().await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        // the stale connection is skipped and a fresh one opened
        let mut guard = pool.get().await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        guard.execute(&Command::new("PING")).await.unwrap();
    }

    #[tokio::test]
    async fn closed_pool_refuses_checkout() {
        let addr = mock_redis_server().await;
        let pool = Arc::new(ConnectionPool::new(addr, test_config()));

        let held = pool.get().await.unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.get().await.is_err());

        // an outstanding guard still works and is dropped on release
        let mut held = held;
        held.execute(&Command::new("PING")).await.unwrap();
        drop(held);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn on_connected_fires_per_connection() {
        let addr = mock_redis_server().await;
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let hook: ConnectedHook = Arc::new(move |_conn: &RedisConnection| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let pool = Arc::new(ConnectionPool::with_hook(addr, test_config(), Some(hook)));

        let g1 = pool.get().await.unwrap();
        let g2 = pool.get().await.unwrap();
        drop(g1);
        drop(g2);
        let _g3 = pool.get().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pool_connect_failure() {
        let config = ConnectionConfig {
            pool_size: 1,
            connect_timeout: Some(Duration::from_millis(100)),
            ..ConnectionConfig::default()
        };
        let pool = Arc::new(ConnectionPool::new("127.0.0.1:1", config));
        assert!(pool.get().await.is_err());
        // the permit is released on failure
        assert_eq!(pool.available(), 1);
    }
}
