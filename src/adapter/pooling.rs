//! Pooled adapter for a standalone server.
//!
//! Every command leases a connection from one [`ConnectionPool`] and gives it
//! back when the reply has been projected.

use std::sync::Arc;

use bytes::Bytes;

use crate::adapter::{Adapter, Lease, UseType};
use crate::command::Command;
use crate::config::ConnectionConfig;
use crate::connection::pool::ConnectionPool;
use crate::connection::tcp::ConnectedHook;
use crate::error::Result;
use crate::resp::types::RespResult;

pub struct PoolingAdapter {
    pool: Arc<ConnectionPool>,
}

impl PoolingAdapter {
    pub fn new(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self::with_hook(addr, config, None)
    }

    pub fn with_hook(
        addr: impl Into<String>,
        config: ConnectionConfig,
        on_connected: Option<ConnectedHook>,
    ) -> Self {
        Self {
            pool: Arc::new(ConnectionPool::with_hook(addr, config, on_connected)),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Execute a command and return the raw reply frame.
    pub async fn execute_raw(&self, cmd: &Command) -> Result<Bytes> {
        let mut guard = self.pool.get().await?;
        guard.send(cmd).await?;
        guard.read_raw_response().await
    }
}

impl Adapter for PoolingAdapter {
    fn use_type(&self) -> UseType {
        UseType::Pooling
    }

    async fn get_connection(&self, _cmd: &Command) -> Result<Lease> {
        Ok(Lease::Pooled(self.pool.get().await?))
    }

    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        let mut guard = self.pool.get().await?;
        let reply = guard.execute(cmd).await?;
        drop(guard);
        project(reply)
    }

    async fn dispose(&self) {
        self.pool.close();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
