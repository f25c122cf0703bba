//! MULTI/EXEC transactions.
//!
//! Queued commands are buffered and sent with `MULTI` and `EXEC` as one
//! pipelined batch on a single leased connection. `WATCH` is the exception:
//! it runs immediately and pins the connection the batch later uses.

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adapter::{Adapter, Lease, UseType};
use crate::command::{Arg, Command};
use crate::crc16::command_slot;
use crate::error::{RespError, Result};
use crate::resp::parser::Split;
use crate::resp::types::{MessageKind, RespResult, RespValue};

/// How a transaction ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    /// One reply per queued command, in order. Empty when nothing was queued.
    Committed(Vec<RespResult>),
    /// A watched key changed and the server discarded the transaction.
    Aborted,
}

impl TxOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, TxOutcome::Aborted)
    }

    pub fn into_results(self) -> Option<Vec<RespResult>> {
        match self {
            TxOutcome::Committed(results) => Some(results),
            TxOutcome::Aborted => None,
        }
    }
}

#[derive(Default)]
struct TxState {
    /// Held from the first `WATCH` on.
    lease: Option<Lease>,
    watching: bool,
    slot: Option<u16>,
    commands: Vec<Command>,
}

pub struct TransactionAdapter<'a, A: Adapter> {
    parent: &'a A,
    state: Mutex<TxState>,
}

impl<'a, A: Adapter> TransactionAdapter<'a, A> {
    pub fn new(parent: &'a A) -> Self {
        Self {
            parent,
            state: Mutex::new(TxState::default()),
        }
    }

    /// `WATCH` keys now; must come before [`exec`](Self::exec).
    pub async fn watch<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<Arg>,
    {
        let cmd = Command::new("WATCH").args_from(keys);
        if cmd.args().is_empty() {
            return Ok(());
        }
        let mut st = self.state.lock().await;
        self.check_slot(&mut st, &cmd)?;
        if st.lease.is_none() {
            st.lease = Some(self.parent.get_connection(&cmd).await?);
        }
        let st = &mut *st;
        let Some(lease) = st.lease.as_mut() else {
            return Err(RespError::Protocol("transaction has no connection".into()));
        };
        // marked first: a watch cut short still leaves the connection watching
        st.watching = true;
        let res = lease.execute(&cmd).await;
        if matches!(&res, Err(e) if e.is_fatal()) {
            *st = TxState::default();
        }
        res?.into_result()?;
        Ok(())
    }

    /// Buffer one command for the next [`exec`](Self::exec).
    pub async fn queue(&self, cmd: &Command) -> Result<()> {
        let mut st = self.state.lock().await;
        self.check_slot(&mut st, cmd)?;
        st.commands.push(cmd.clone());
        Ok(())
    }

    /// Number of commands buffered so far.
    pub async fn len(&self) -> usize {
        self.state.lock().await.commands.len()
    }

    /// Send `MULTI`, the buffered commands and `EXEC` in one write.
    ///
    /// A null `EXEC` reply means a watched key changed
    /// ([`TxOutcome::Aborted`]). An `EXECABORT` error (some command failed
    /// to queue) is returned as [`RespError::Redis`].
    pub async fn exec(&self) -> Result<TxOutcome> {
        let st = std::mem::take(&mut *self.state.lock().await);
        if st.commands.is_empty() {
            if let Some(mut lease) = st.lease {
                lease.execute(&Command::new("UNWATCH")).await?.into_result()?;
            }
            return Ok(TxOutcome::Committed(Vec::new()));
        }

        let mut lease = match st.lease {
            Some(lease) => lease,
            None => {
                let route = st
                    .commands
                    .iter()
                    .find(|c| c.key().is_some())
                    .unwrap_or(&st.commands[0]);
                self.parent.get_connection(route).await?
            }
        };

        let mut batch = Vec::with_capacity(st.commands.len() + 2);
        batch.push(Command::new("MULTI"));
        batch.extend(st.commands.iter().cloned());
        batch.push(Command::new("EXEC"));
        lease.send_pipeline(&batch).await?;

        let multi = lease.read_response().await?;
        let mut failed = Vec::new();
        for (position, _) in st.commands.iter().enumerate() {
            let queued = lease.read_response().await?;
            if let Some(msg) = queued.error_message() {
                failed.push((position, msg));
            }
        }
        let exec = lease.read_split_response().await?;

        if let Some(msg) = multi.error_message() {
            return Err(RespError::redis(msg));
        }
        match exec {
            Split::Elements(items) => Ok(TxOutcome::Committed(items)),
            Split::Whole(reply) if reply.is_error() => {
                if !failed.is_empty() {
                    warn!(failed = ?failed, "transaction discarded by server");
                }
                Err(RespError::redis(reply.error_message().unwrap_or_default()))
            }
            Split::Whole(reply) if reply.value.is_null() => {
                debug!(queued = st.commands.len(), "transaction aborted");
                Ok(TxOutcome::Aborted)
            }
            Split::Whole(reply) => {
                lease.mark_broken();
                Err(RespError::Protocol(format!(
                    "unexpected EXEC reply: {}",
                    reply.value.type_name()
                )))
            }
        }
    }

    /// Drop buffered commands, `UNWATCH`ing if keys were watched.
    pub async fn discard(&self) -> Result<()> {
        let st = std::mem::take(&mut *self.state.lock().await);
        if let Some(mut lease) = st.lease {
            lease.execute(&Command::new("UNWATCH")).await?.into_result()?;
        }
        Ok(())
    }

    /// Under a cluster every keyed command must map to one slot.
    fn check_slot(&self, st: &mut TxState, cmd: &Command) -> Result<()> {
        if self.parent.use_type() != UseType::Cluster {
            return Ok(());
        }
        if let Some(slot) = command_slot(cmd) {
            match st.slot {
                Some(bound) if bound != slot => {
                    return Err(RespError::Cluster(format!(
                        "CROSSSLOT transaction is bound to slot {bound}, {} maps to {slot}",
                        cmd.name()
                    )));
                }
                _ => st.slot = Some(slot),
            }
        }
        Ok(())
    }
}

impl<A: Adapter> Drop for TransactionAdapter<'_, A> {
    fn drop(&mut self) {
        // A connection left with watched keys must not be reused.
        let st = self.state.get_mut();
        if st.watching {
            if let Some(lease) = st.lease.as_mut() {
                lease.mark_broken();
            }
        }
    }
}

impl<A: Adapter> Adapter for TransactionAdapter<'_, A> {
    fn use_type(&self) -> UseType {
        UseType::Transaction
    }

    async fn get_connection(&self, cmd: &Command) -> Result<Lease> {
        self.parent.get_connection(cmd).await
    }

    /// Buffers `cmd`; `project` sees a `QUEUED` status, since the real reply
    /// only arrives with [`exec`](TransactionAdapter::exec).
    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        self.queue(cmd).await?;
        project(RespResult::new(
            RespValue::Text("QUEUED".into()),
            MessageKind::SimpleString,
        ))
    }

    async fn dispose(&self) {
        if let Err(e) = self.discard().await {
            debug!(error = %e, "discard on dispose failed");
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::PoolingAdapter;
    use crate::config::ConnectionConfig;
    use crate::resp::parser::{parse_slice, ReadOptions};
    use bytes::BytesMut;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    type Log = Arc<parking_lot::Mutex<Vec<String>>>;

    /// Answers each decoded command with the next scripted reply (none once
    /// the script runs out) and records the command names.
    async fn tx_server(script: Vec<&'static str>) -> (String, Log) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let log: Log = Arc::default();
        let seen = Arc::clone(&log);
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = BytesMut::new();
            let mut replies = script.into_iter();
            loop {
                match parse_slice(&buf, ReadOptions::text()) {
                    Ok((request, used)) => {
                        let _ = buf.split_to(used);
                        let name = request
                            .value
                            .into_array()
                            .and_then(|args| args.first().and_then(RespValue::to_text_lossy))
                            .unwrap_or_default();
                        seen.lock().push(name);
                        if let Some(reply) = replies.next() {
                            socket.write_all(reply.as_bytes()).await.unwrap();
                        }
                    }
                    Err(RespError::Incomplete) => {
                        if socket.read_buf(&mut buf).await.unwrap_or(0) == 0 {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        (addr, log)
    }

    fn client(addr: String) -> PoolingAdapter {
        PoolingAdapter::new(addr, ConnectionConfig::default())
    }

    #[tokio::test]
    async fn commit_sends_one_batch() {
        let (addr, log) = tx_server(vec![
            "+OK\r\n",
            "+QUEUED\r\n",
            "+QUEUED\r\n",
            "*2\r\n+OK\r\n:5\r\n",
        ])
        .await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.queue(&Command::new("SET").arg("a").arg(1)).await.unwrap();
        tx.queue(&Command::new("INCRBY").arg("b").arg(5)).await.unwrap();
        assert_eq!(tx.len().await, 2);
        // nothing is written before exec
        assert!(log.lock().is_empty());

        let results = tx.exec().await.unwrap().into_results().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].value, RespValue::Integer(5));
        assert_eq!(*log.lock(), vec!["MULTI", "SET", "INCRBY", "EXEC"]);
        assert_eq!(client.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn watched_key_change_aborts() {
        let (addr, log) = tx_server(vec!["+OK\r\n", "+OK\r\n", "+QUEUED\r\n", "*-1\r\n"]).await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.watch(["balance"]).await.unwrap();
        tx.queue(&Command::new("DECR").arg("balance")).await.unwrap();
        let outcome = tx.exec().await.unwrap();
        assert!(outcome.is_aborted());
        assert_eq!(*log.lock(), vec!["WATCH", "MULTI", "DECR", "EXEC"]);
    }

    #[tokio::test]
    async fn watch_without_commands_unwatches() {
        let (addr, log) = tx_server(vec!["+OK\r\n", "+OK\r\n"]).await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.watch(["k"]).await.unwrap();
        assert_eq!(tx.exec().await.unwrap(), TxOutcome::Committed(Vec::new()));
        assert_eq!(*log.lock(), vec!["WATCH", "UNWATCH"]);
        assert_eq!(client.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn empty_exec_array_is_committed() {
        let (addr, _) = tx_server(vec!["+OK\r\n", "+QUEUED\r\n", "*0\r\n"]).await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.queue(&Command::new("PING")).await.unwrap();
        assert_eq!(tx.exec().await.unwrap(), TxOutcome::Committed(Vec::new()));
    }

    #[tokio::test]
    async fn nothing_queued_sends_nothing() {
        let client = client("127.0.0.1:1".to_string());
        let tx = TransactionAdapter::new(&client);
        assert_eq!(tx.exec().await.unwrap(), TxOutcome::Committed(Vec::new()));
    }

    #[tokio::test]
    async fn queue_error_then_execabort() {
        let (addr, _) = tx_server(vec![
            "+OK\r\n",
            "-ERR unknown command 'NOPE'\r\n",
            "-EXECABORT Transaction discarded because of previous errors.\r\n",
        ])
        .await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.queue(&Command::new("NOPE")).await.unwrap();
        let err = tx.exec().await.unwrap_err();
        match err {
            RespError::Redis { message, .. } => assert!(message.starts_with("EXECABORT")),
            other => panic!("expected EXECABORT, got {other:?}"),
        }
        // every reply was read, so the connection is still in step
        assert_eq!(client.pool().idle_count(), 1);
    }

    #[tokio::test]
    async fn exec_keeps_per_command_errors() {
        let (addr, _) = tx_server(vec![
            "+OK\r\n",
            "+QUEUED\r\n",
            "+QUEUED\r\n",
            "*2\r\n+OK\r\n-WRONGTYPE Operation against a key\r\n",
        ])
        .await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.queue(&Command::new("SET").arg("s").arg("x")).await.unwrap();
        tx.queue(&Command::new("LPUSH").arg("s").arg("y")).await.unwrap();
        let results = tx.exec().await.unwrap().into_results().unwrap();
        assert!(!results[0].is_error());
        assert!(results[1].is_error());
    }

    #[tokio::test]
    async fn discard_drops_buffer_and_unwatches() {
        let (addr, log) = tx_server(vec!["+OK\r\n", "+OK\r\n"]).await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.watch(["a"]).await.unwrap();
        let queued = tx
            .execute(&Command::new("SET").arg("a").arg(1), |r| Ok(r.value))
            .await
            .unwrap();
        assert_eq!(queued, RespValue::Text("QUEUED".into()));
        tx.discard().await.unwrap();
        assert_eq!(*log.lock(), vec!["WATCH", "UNWATCH"]);
        assert_eq!(tx.len().await, 0);
    }

    #[tokio::test]
    async fn cancelled_exec_is_not_pooled() {
        // only MULTI is answered; EXEC never comes back
        let (addr, _) = tx_server(vec!["+OK\r\n"]).await;
        let client = client(addr);
        let tx = TransactionAdapter::new(&client);
        tx.queue(&Command::new("SET").arg("a").arg(1)).await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(50), tx.exec()).await;
        assert!(res.is_err());
        assert_eq!(client.pool().idle_count(), 0);
    }

    #[tokio::test]
    async fn dropped_while_watching_is_not_pooled() {
        let (addr, _) = tx_server(vec!["+OK\r\n"]).await;
        let client = client(addr);
        {
            let tx = TransactionAdapter::new(&client);
            tx.watch(["a"]).await.unwrap();
        }
        assert_eq!(client.pool().idle_count(), 0);
    }

    /// Reports itself as a cluster so the one-slot rule applies.
    struct AsCluster(PoolingAdapter);

    impl Adapter for AsCluster {
        fn use_type(&self) -> UseType {
            UseType::Cluster
        }

        async fn get_connection(&self, cmd: &Command) -> Result<Lease> {
            self.0.get_connection(cmd).await
        }

        async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
        where
            T: Send,
            F: FnOnce(RespResult) -> Result<T> + Send,
        {
            self.0.execute(cmd, project).await
        }

        async fn dispose(&self) {
            self.0.dispose().await
        }
    }

    #[tokio::test]
    async fn cross_slot_rejected_under_cluster() {
        let cluster = AsCluster(client("127.0.0.1:1".to_string()));
        let tx = TransactionAdapter::new(&cluster);
        tx.queue(&Command::new("SET").arg("{user}:1").arg(1)).await.unwrap();
        let err = tx
            .queue(&Command::new("SET").arg("{other}:1").arg(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RespError::Cluster(ref m) if m.starts_with("CROSSSLOT")));
        assert_eq!(tx.len().await, 1);
        tx.discard().await.unwrap();
    }
}
