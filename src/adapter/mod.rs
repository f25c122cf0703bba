//! Topology adapters.
//!
//! Every deployment shape (one dedicated connection, a pooled server, a
//! cluster, a sentinel-managed master, and the batch modes layered on top)
//! implements [`Adapter`]: pick a connection for a command, run it, and hand
//! the reply envelope to a caller-supplied projection.

pub mod cluster;
pub mod pipeline;
pub mod pooling;
pub mod sentinel;
pub mod single;
pub mod transaction;

pub use cluster::ClusterAdapter;
pub use pipeline::PipelineAdapter;
pub use pooling::PoolingAdapter;
pub use sentinel::SentinelAdapter;
pub use single::SingleAdapter;
pub use transaction::{TransactionAdapter, TxOutcome};

use std::future::Future;
use std::ops::{Deref, DerefMut};

use tokio::sync::OwnedMutexGuard;

use crate::command::Command;
use crate::connection::pool::PoolGuard;
use crate::connection::tcp::RedisConnection;
use crate::crc16::common_slot;
use crate::error::Result;
use crate::resp::convert::FromResp;
use crate::resp::types::{RespResult, RespValue};

/// Which adapter variant is handling commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UseType {
    Pooling,
    Cluster,
    Sentinel,
    SingleInside,
    SingleTemp,
    Pipeline,
    Transaction,
}

/// Common interface for all topology adapters.
pub trait Adapter: Send + Sync {
    fn use_type(&self) -> UseType;

    /// Lease the connection `cmd` should run on.
    fn get_connection(&self, cmd: &Command) -> impl Future<Output = Result<Lease>> + Send;

    /// Run `cmd` and pass its reply envelope to `project`.
    ///
    /// Error replies reach `project` unchanged unless the adapter consumes
    /// them itself (cluster redirects, sentinel failover).
    fn execute<T, F>(&self, cmd: &Command, project: F) -> impl Future<Output = Result<T>> + Send
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send;

    /// Release every connection held by the adapter.
    fn dispose(&self) -> impl Future<Output = ()> + Send;

    /// Run `cmd` and return its value, raising error replies.
    fn execute_value(&self, cmd: &Command) -> impl Future<Output = Result<RespValue>> + Send {
        self.execute(cmd, |reply| reply.into_result().map(|r| r.value))
    }

    /// Run `cmd` and convert the reply to `T`.
    fn query<T>(&self, cmd: &Command) -> impl Future<Output = Result<T>> + Send
    where
        T: FromResp + Send,
    {
        self.execute(cmd, RespResult::project::<T>)
    }
}

// ── Lease ─────────────────────────────────────────────────────────

/// Exclusive use of one connection for the lifetime of the value.
///
/// A pooled lease goes back to its pool on drop; a single-adapter lease
/// unlocks the adapter. Either way a connection that is broken, or still
/// owes a reply to a cancelled call, is dropped instead of being reused.
pub enum Lease {
    Pooled(PoolGuard),
    Single(OwnedMutexGuard<Option<RedisConnection>>),
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lease::Pooled(g) => f.debug_tuple("Pooled").field(&g.addr()).finish(),
            Lease::Single(g) => f
                .debug_tuple("Single")
                .field(&g.as_ref().map(|c| c.addr()))
                .finish(),
        }
    }
}

impl Deref for Lease {
    type Target = RedisConnection;

    fn deref(&self) -> &RedisConnection {
        match self {
            Lease::Pooled(guard) => &**guard,
            Lease::Single(guard) => match guard.as_ref() {
                Some(conn) => conn,
                None => unreachable!("single lease is created with a live connection"),
            },
        }
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut RedisConnection {
        match self {
            Lease::Pooled(guard) => &mut **guard,
            Lease::Single(guard) => match guard.as_mut() {
                Some(conn) => conn,
                None => unreachable!("single lease is created with a live connection"),
            },
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Lease::Single(guard) = self {
            if guard.as_ref().is_some_and(|c| !c.is_reusable()) {
                **guard = None;
            }
        }
    }
}

// ── Batch routing ─────────────────────────────────────────────────

/// Pick the command a batch is routed by.
///
/// Under a cluster every keyed command must hash to one slot; the first
/// keyed command then decides the node.
pub(crate) fn route_command<'c, A: Adapter>(
    parent: &A,
    cmds: &'c [Command],
) -> Result<Option<&'c Command>> {
    if parent.use_type() == UseType::Cluster {
        common_slot(cmds)?;
        if let Some(keyed) = cmds.iter().find(|c| c.key().is_some()) {
            return Ok(Some(keyed));
        }
    }
    Ok(cmds.first())
}
