//! Client facade.
//!
//! [`RedisClient`] picks the adapter for the configured [`Topology`] once, at
//! construction, and dispatches every call to it. [`BlockingClient`] drives
//! the same client on the global runtime for synchronous callers.

use std::sync::Arc;

use tracing::debug;

use crate::adapter::{
    Adapter, ClusterAdapter, Lease, PipelineAdapter, PoolingAdapter, SentinelAdapter,
    SingleAdapter, TransactionAdapter, TxOutcome, UseType,
};
use crate::command::Command;
use crate::config::{ConnectionConfig, Topology};
use crate::error::Result;
use crate::resp::convert::FromResp;
use crate::resp::types::{RespResult, RespValue};
use crate::runtime;

// ── RedisClient ────────────────────────────────────────────────────

/// An async client bound to one deployment shape.
pub enum RedisClient {
    Single(SingleAdapter),
    Pooling(PoolingAdapter),
    Cluster(Arc<ClusterAdapter>),
    Sentinel(SentinelAdapter),
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisClient::Single(a) => write!(f, "RedisClient::Single({})", a.addr()),
            RedisClient::Pooling(a) => write!(f, "RedisClient::Pooling({})", a.pool().addr()),
            RedisClient::Cluster(a) => write!(f, "RedisClient::Cluster({:?})", a.masters()),
            RedisClient::Sentinel(a) => {
                write!(f, "RedisClient::Sentinel({}@{})", a.master_name(), a.master_addr())
            }
        }
    }
}

impl RedisClient {
    /// Build the adapter for `config.topology`.
    ///
    /// Standalone servers get a connection pool (connections open lazily);
    /// cluster and sentinel topologies contact their seeds before returning.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let client = match config.topology.clone() {
            Topology::Standalone => {
                RedisClient::Pooling(PoolingAdapter::new(config.primary_addr(), config))
            }
            Topology::Cluster { nodes } => {
                RedisClient::Cluster(ClusterAdapter::connect(nodes, config).await?)
            }
            Topology::Sentinel {
                master_name,
                sentinels,
            } => RedisClient::Sentinel(
                SentinelAdapter::connect(master_name, sentinels, config).await?,
            ),
        };
        debug!(client = ?client, "client ready");
        Ok(client)
    }

    /// Parse `url` and connect.
    pub async fn from_url(url: &str) -> Result<Self> {
        Self::connect(ConnectionConfig::from_url(url)?).await
    }

    /// A client holding one dedicated connection to the primary endpoint.
    pub fn single(config: ConnectionConfig) -> Self {
        RedisClient::Single(SingleAdapter::new(config.primary_addr(), config))
    }

    /// Start a pipelined batch.
    pub fn pipeline(&self) -> PipelineAdapter<'_, Self> {
        PipelineAdapter::new(self)
    }

    /// Start a MULTI/EXEC transaction.
    pub fn transaction(&self) -> TransactionAdapter<'_, Self> {
        TransactionAdapter::new(self)
    }

    pub async fn ping(&self) -> Result<String> {
        self.query(&Command::new("PING")).await
    }
}

impl Adapter for RedisClient {
    fn use_type(&self) -> UseType {
        match self {
            RedisClient::Single(a) => a.use_type(),
            RedisClient::Pooling(a) => a.use_type(),
            RedisClient::Cluster(a) => a.use_type(),
            RedisClient::Sentinel(a) => a.use_type(),
        }
    }

    async fn get_connection(&self, cmd: &Command) -> Result<Lease> {
        match self {
            RedisClient::Single(a) => a.get_connection(cmd).await,
            RedisClient::Pooling(a) => a.get_connection(cmd).await,
            RedisClient::Cluster(a) => a.get_connection(cmd).await,
            RedisClient::Sentinel(a) => a.get_connection(cmd).await,
        }
    }

    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        match self {
            RedisClient::Single(a) => a.execute(cmd, project).await,
            RedisClient::Pooling(a) => a.execute(cmd, project).await,
            RedisClient::Cluster(a) => a.execute(cmd, project).await,
            RedisClient::Sentinel(a) => a.execute(cmd, project).await,
        }
    }

    async fn dispose(&self) {
        match self {
            RedisClient::Single(a) => a.dispose().await,
            RedisClient::Pooling(a) => a.dispose().await,
            RedisClient::Cluster(a) => a.dispose().await,
            RedisClient::Sentinel(a) => a.dispose().await,
        }
    }
}

// ── BlockingClient ─────────────────────────────────────────────────

/// Synchronous wrapper over [`RedisClient`].
///
/// Every call blocks the current thread on the global runtime, so it must not
/// be used from inside an async context.
#[derive(Debug)]
pub struct BlockingClient {
    inner: RedisClient,
}

impl BlockingClient {
    pub fn connect(config: ConnectionConfig) -> Result<Self> {
        let inner = runtime::block_on(RedisClient::connect(config))??;
        Ok(Self { inner })
    }

    pub fn from_url(url: &str) -> Result<Self> {
        Self::connect(ConnectionConfig::from_url(url)?)
    }

    pub fn inner(&self) -> &RedisClient {
        &self.inner
    }

    pub fn execute_value(&self, cmd: &Command) -> Result<RespValue> {
        runtime::block_on(self.inner.execute_value(cmd))?
    }

    pub fn query<T: FromResp + Send>(&self, cmd: &Command) -> Result<T> {
        runtime::block_on(self.inner.query(cmd))?
    }

    /// Send `cmds` as one pipelined batch.
    pub fn pipeline(&self, cmds: Vec<Command>) -> Result<Vec<RespResult>> {
        runtime::block_on(async {
            let pipe = self.inner.pipeline();
            for cmd in cmds {
                pipe.queue(cmd);
            }
            pipe.execute_all().await
        })?
    }

    /// Run `cmds` inside MULTI/EXEC. A command rejected before sending
    /// discards the transaction before the error is returned.
    pub fn transaction(&self, cmds: Vec<Command>) -> Result<TxOutcome> {
        runtime::block_on(async {
            let tx = self.inner.transaction();
            for cmd in &cmds {
                if let Err(e) = tx.queue(cmd).await {
                    tx.dispose().await;
                    return Err(e);
                }
            }
            tx.exec().await
        })?
    }

    pub fn dispose(&self) -> Result<()> {
        runtime::block_on(self.inner.dispose())
    }
}

// ── Tests ──────────────────────────────────────────────────────────
