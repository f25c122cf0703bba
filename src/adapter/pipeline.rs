//! Pipelined batches.
//!
//! Commands are buffered, then written in one go on a single leased
//! connection; replies are read back FIFO and matched by position.

use parking_lot::Mutex;
use tracing::debug;

use crate::adapter::{route_command, Adapter, Lease, UseType};
use crate::command::Command;
use crate::error::{RespError, Result};
use crate::resp::types::RespResult;

/// A batch of commands sent through `parent` in one round trip.
pub struct PipelineAdapter<'a, A: Adapter> {
    parent: &'a A,
    commands: Mutex<Vec<Command>>,
}

impl<'a, A: Adapter> PipelineAdapter<'a, A> {
    pub fn new(parent: &'a A) -> Self {
        Self {
            parent,
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Buffer a command for the next [`execute_all`](Self::execute_all).
    pub fn queue(&self, cmd: Command) -> &Self {
        self.commands.lock().push(cmd);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Send every buffered command and collect the replies in order.
    ///
    /// Error replies stay in their slot as error envelopes. A transport or
    /// framing failure part-way through fails the whole batch and the
    /// connection is not reused.
    pub async fn execute_all(&self) -> Result<Vec<RespResult>> {
        let commands = std::mem::take(&mut *self.commands.lock());
        let Some(route) = route_command(self.parent, &commands)? else {
            return Ok(Vec::new());
        };
        let mut conn = self.parent.get_connection(route).await?;
        run_batch(&mut conn, &commands).await
    }
}

async fn run_batch(conn: &mut Lease, commands: &[Command]) -> Result<Vec<RespResult>> {
    conn.send_pipeline(commands).await?;
    let mut replies = Vec::with_capacity(commands.len());
    for _ in commands {
        match conn.read_response().await {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                debug!(
                    addr = %conn.addr(),
                    read = replies.len(),
                    expected = commands.len(),
                    "pipeline aborted mid-read"
                );
                conn.mark_broken();
                return Err(e);
            }
        }
    }
    Ok(replies)
}

impl<A: Adapter> Adapter for PipelineAdapter<'_, A> {
    fn use_type(&self) -> UseType {
        UseType::Pipeline
    }

    async fn get_connection(&self, cmd: &Command) -> Result<Lease> {
        self.parent.get_connection(cmd).await
    }

    /// Runs `cmd` on its own as a one-command batch; the buffer is untouched.
    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        let mut conn = self.parent.get_connection(cmd).await?;
        let mut replies = run_batch(&mut conn, std::slice::from_ref(cmd)).await?;
        drop(conn);
        let reply = replies
            .pop()
            .ok_or_else(|| RespError::Protocol("pipeline returned no reply".into()))?;
        project(reply)
    }

    /// Drops buffered commands without sending them.
    async fn dispose(&self) {
        self.commands.lock().clear();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
