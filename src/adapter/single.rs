//! Single-connection adapter.
//!
//! Owns one lazily opened connection, serialized behind an async mutex. No
//! retries and no redirects: whatever the server answers is handed back. A
//! connection that breaks is dropped and reopened on the next call.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::adapter::{Adapter, Lease, UseType};
use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::connection::tcp::{ConnectedHook, RedisConnection};
use crate::error::{RespError, Result};
use crate::resp::types::RespResult;

pub struct SingleAdapter {
    addr: String,
    config: ConnectionConfig,
    use_type: UseType,
    conn: Arc<Mutex<Option<RedisConnection>>>,
    on_connected: Option<ConnectedHook>,
    disposed: AtomicBool,
}

impl SingleAdapter {
    /// A long-lived dedicated connection ([`UseType::SingleInside`]).
    pub fn new(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self::build(addr.into(), config, UseType::SingleInside)
    }

    /// A throwaway connection ([`UseType::SingleTemp`]): closed on dispose
    /// and never reopened afterwards.
    pub fn temp(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self::build(addr.into(), config, UseType::SingleTemp)
    }

    fn build(addr: String, config: ConnectionConfig, use_type: UseType) -> Self {
        Self {
            addr,
            config,
            use_type,
            conn: Arc::new(Mutex::new(None)),
            on_connected: None,
            disposed: AtomicBool::new(false),
        }
    }

    /// Run `hook` after every successful connect and handshake.
    pub fn on_connected(mut self, hook: ConnectedHook) -> Self {
        self.on_connected = Some(hook);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn lease(&self) -> Result<Lease> {
        if self.use_type == UseType::SingleTemp && self.disposed.load(Ordering::Acquire) {
            return Err(RespError::Connection(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("temporary connection to {} was disposed", self.addr),
            )));
        }
        let mut guard = Arc::clone(&self.conn).lock_owned().await;
        if guard.as_ref().is_some_and(|c| !c.is_reusable()) {
            debug!(addr = %self.addr, "reopening broken connection");
            *guard = None;
        }
        if guard.is_none() {
            let conn = RedisConnection::connect(&self.addr, &self.config).await?;
            if let Some(hook) = &self.on_connected {
                hook(&conn);
            }
            *guard = Some(conn);
        }
        Ok(Lease::Single(guard))
    }
}

impl Adapter for SingleAdapter {
    fn use_type(&self) -> UseType {
        self.use_type
    }

    async fn get_connection(&self, _cmd: &Command) -> Result<Lease> {
        self.lease().await
    }

    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        let mut conn = self.lease().await?;
        let reply = conn.execute(cmd).await?;
        project(reply)
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
        if self.conn.lock().await.take().is_some() {
            debug!(addr = %self.addr, "connection closed");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
