//! Redis Cluster adapter.
//!
//! Routes commands to the node owning the key's hash slot. Handles MOVED and
//! ASK redirections, TRYAGAIN backoff, replica reads for read-only commands,
//! and periodic slot map refresh. Per-node pools live in an [`IdleBus`] so
//! nodes that stop receiving traffic are released after the idle window.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{Adapter, Lease, UseType};
use crate::command::Command;
use crate::config::{format_addr, ConnectionConfig};
use crate::connection::idle::{EvictHook, IdleBus};
use crate::connection::pool::ConnectionPool;
use crate::connection::tcp::RedisConnection;
use crate::crc16::command_slot;
use crate::error::{Redirect, RedisErrorKind, RespError, Result};
use crate::resp::types::{RespResult, RespValue};
use crate::resp::writer::encode_command;

/// Background slot refresh interval.
const SLOT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Pause before retrying a TRYAGAIN reply.
const TRYAGAIN_BACKOFF: Duration = Duration::from_millis(50);

// ── Slot map ──────────────────────────────────────────────────────

/// A range of hash slots mapped to a master and zero or more replicas.
#[derive(Debug, Clone, PartialEq)]
struct SlotRange {
    start: u16,
    end: u16,
    master: String,
    replicas: Vec<String>,
}

/// Slot map: sorted list of slot ranges for binary-search lookup.
#[derive(Debug, Clone, Default)]
struct SlotMap {
    ranges: Vec<SlotRange>,
}

impl SlotMap {
    fn range_index(&self, slot: u16) -> Option<usize> {
        self.ranges
            .binary_search_by(|r| {
                if slot < r.start {
                    std::cmp::Ordering::Greater
                } else if slot > r.end {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    fn master_for_slot(&self, slot: u16) -> Option<&str> {
        self.range_index(slot)
            .map(|i| self.ranges[i].master.as_str())
    }

    /// A random replica for the slot, or the master when it has none.
    fn replica_for_slot(&self, slot: u16, rng: &mut StdRng) -> Option<&str> {
        self.range_index(slot).map(|i| {
            let range = &self.ranges[i];
            range
                .replicas
                .choose(rng)
                .unwrap_or(&range.master)
                .as_str()
        })
    }

    /// Serves only as a replica.
    fn is_replica(&self, addr: &str) -> bool {
        let mut replica = false;
        for range in &self.ranges {
            if range.master == addr {
                return false;
            }
            replica |= range.replicas.iter().any(|r| r == addr);
        }
        replica
    }

    /// Point one slot at a new master (after a MOVED redirect), splitting
    /// its range if needed. Slots outside every range get a range of their own.
    fn update_slot_master(&mut self, slot: u16, addr: &str) {
        let Some(i) = self.range_index(slot) else {
            self.ranges.push(SlotRange {
                start: slot,
                end: slot,
                master: addr.to_string(),
                replicas: Vec::new(),
            });
            self.ranges.sort_by_key(|r| r.start);
            return;
        };
        let range = &self.ranges[i];
        if range.master == addr {
            return;
        }
        let mut pieces = Vec::with_capacity(3);
        if range.start < slot {
            pieces.push(SlotRange {
                end: slot - 1,
                ..range.clone()
            });
        }
        pieces.push(SlotRange {
            start: slot,
            end: slot,
            master: addr.to_string(),
            replicas: Vec::new(),
        });
        if slot < range.end {
            pieces.push(SlotRange {
                start: slot + 1,
                ..range.clone()
            });
        }
        self.ranges.splice(i..=i, pieces);
    }

    /// Distinct master addresses.
    fn masters(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.ranges.iter().map(|r| r.master.as_str()).collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Parse the reply of `CLUSTER SLOTS` into a slot map. `queried` is the
    /// node that answered; an empty host in the reply refers to it.
    fn from_cluster_slots(resp: &RespValue, queried: &str) -> Result<Self> {
        let slots = match resp {
            RespValue::Array(arr) => arr,
            _ => {
                return Err(RespError::Cluster(format!(
                    "CLUSTER SLOTS: expected array, got {}",
                    resp.type_name()
                )));
            }
        };

        let mut ranges = Vec::with_capacity(slots.len());
        for entry in slots {
            let items = match entry {
                RespValue::Array(arr) if arr.len() >= 3 => arr,
                _ => continue,
            };

            let start = slot_bound(&items[0], "start")?;
            let end = slot_bound(&items[1], "end")?;

            // items[2] onwards are node arrays: [host, port, node-id, ...]
            let master = parse_node_addr(&items[2], queried)?;
            let replicas = items
                .iter()
                .skip(3)
                .filter_map(|node| parse_node_addr(node, queried).ok())
                .collect();

            ranges.push(SlotRange {
                start,
                end,
                master,
                replicas,
            });
        }

        ranges.sort_by_key(|r| r.start);
        Ok(Self { ranges })
    }
}

fn slot_bound(value: &RespValue, which: &str) -> Result<u16> {
    value
        .as_int()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| RespError::Cluster(format!("CLUSTER SLOTS: invalid slot {which}")))
}

/// Parse a node array `[host, port, ...]` from CLUSTER SLOTS into "host:port".
fn parse_node_addr(val: &RespValue, queried: &str) -> Result<String> {
    let items = match val {
        RespValue::Array(arr) if arr.len() >= 2 => arr,
        _ => {
            return Err(RespError::Cluster(
                "CLUSTER SLOTS: malformed node entry".into(),
            ));
        }
    };
    let host = items[0]
        .to_text_lossy()
        .ok_or_else(|| RespError::Cluster("CLUSTER SLOTS: invalid host".into()))?;
    let port = items[1]
        .as_int()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| RespError::Cluster("CLUSTER SLOTS: invalid port".into()))?;
    if host.is_empty() || host == "?" {
        return Ok(format_addr(host_of(queried), port));
    }
    Ok(format_addr(&host, port))
}

/// Host part of a `host:port` address, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map_or(addr, |(h, _)| h);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Redis 7 may send `MOVED <slot> :<port>` meaning "same host as the node
/// that replied".
fn resolve_endpoint(current: &str, endpoint: &str) -> String {
    match endpoint.strip_prefix(':') {
        Some(port) => format!("{}:{port}", current.rsplit_once(':').map_or(current, |(h, _)| h)),
        None => endpoint.to_string(),
    }
}

// ── ClusterAdapter ────────────────────────────────────────────────

/// Adapter for Redis Cluster topology.
///
/// Keeps one [`ConnectionPool`] per node and a slot map for routing.
pub struct ClusterAdapter {
    seeds: Vec<String>,
    pools: IdleBus<ConnectionPool>,
    slot_map: RwLock<SlotMap>,
    /// Base config used for every node pool (db forced to 0).
    config: ConnectionConfig,
    rng: Mutex<StdRng>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterAdapter {
    /// Bootstrap from the seed nodes: the first seed that answers
    /// `CLUSTER SLOTS` provides the slot map. Starts the background refresh.
    pub async fn connect(seeds: Vec<String>, config: ConnectionConfig) -> Result<Arc<Self>> {
        let adapter = Arc::new(Self::new(seeds, config)?);

        let mut last_err = None;
        for seed in &adapter.seeds {
            match adapter.refresh_slots_from(seed).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    debug!(seed = %seed, error = %e, "seed node unavailable");
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(RespError::Cluster(format!(
                "could not load the slot map from any seed node: {e}"
            )));
        }

        let task = tokio::spawn(refresh_loop(Arc::downgrade(&adapter)));
        *adapter.refresher.lock() = Some(task);
        Ok(adapter)
    }

    /// Build an adapter with an empty slot map and no background task.
    fn new(seeds: Vec<String>, mut config: ConnectionConfig) -> Result<Self> {
        if seeds.is_empty() {
            return Err(RespError::Cluster(
                "at least one seed node is required".into(),
            ));
        }
        config.db = 0;
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let on_evict: EvictHook<ConnectionPool> = Arc::new(|addr: &str, pool: &ConnectionPool| {
            debug!(addr, "releasing idle node pool");
            pool.close();
        });
        Ok(Self {
            seeds,
            pools: IdleBus::new(config.cluster_idle_timeout, Some(on_evict)),
            slot_map: RwLock::new(SlotMap::default()),
            config,
            rng: Mutex::new(rng),
            refresher: Mutex::new(None),
        })
    }

    /// Addresses of every master in the current slot map.
    pub fn masters(&self) -> Vec<String> {
        self.slot_map
            .read()
            .masters()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Master currently serving `slot`.
    pub fn master_for_slot(&self, slot: u16) -> Option<String> {
        self.slot_map.read().master_for_slot(slot).map(str::to_string)
    }

    /// Number of node pools currently held.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Reload the slot map from any known master, then the seeds.
    pub async fn refresh_slots(&self) -> Result<()> {
        let mut candidates = self.masters();
        candidates.extend(self.seeds.iter().cloned());
        let mut last_err = None;
        for addr in candidates {
            match self.refresh_slots_from(&addr).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| RespError::Cluster("no node to refresh from".into())))
    }

    /// Refresh the slot map by querying a specific node.
    async fn refresh_slots_from(&self, addr: &str) -> Result<()> {
        let mut conn = RedisConnection::connect(addr, &self.config).await?;
        let reply = conn
            .execute(&Command::new("CLUSTER").arg("SLOTS"))
            .await?
            .into_result()?;
        let new_map = SlotMap::from_cluster_slots(&reply.value, addr)?;
        if new_map.ranges.is_empty() {
            return Err(RespError::Cluster(format!(
                "CLUSTER SLOTS from {addr} returned no slots"
            )));
        }
        debug!(addr, ranges = new_map.ranges.len(), "slot map loaded");
        *self.slot_map.write() = new_map;
        Ok(())
    }

    /// Pool for `addr`; connections to a replica open with `READONLY`.
    fn pool_for(&self, addr: &str) -> Result<Arc<ConnectionPool>> {
        self.pools.get_or_create(addr, || {
            let readonly = self.slot_map.read().is_replica(addr);
            if readonly {
                debug!(addr, "opening replica pool");
            }
            let config = ConnectionConfig {
                readonly,
                ..self.config.clone()
            };
            Ok(ConnectionPool::new(addr, config))
        })
    }

    /// Node a command should go to.
    fn target_for(&self, cmd: &Command) -> Result<String> {
        let map = self.slot_map.read();
        let mut rng = self.rng.lock();
        let addr = match command_slot(cmd) {
            Some(slot) => {
                let addr = if self.config.read_from_replicas && cmd.is_read_only() {
                    map.replica_for_slot(slot, &mut rng)
                } else {
                    map.master_for_slot(slot)
                };
                addr.ok_or_else(|| RespError::Cluster(format!("no node serves slot {slot}")))?
            }
            // Key-less command: any master
            None => map
                .masters()
                .choose(&mut *rng)
                .copied()
                .ok_or_else(|| RespError::Cluster("slot map is empty".into()))?,
        };
        Ok(addr.to_string())
    }
}

impl Adapter for ClusterAdapter {
    fn use_type(&self) -> UseType {
        UseType::Cluster
    }

    async fn get_connection(&self, cmd: &Command) -> Result<Lease> {
        let addr = self.target_for(cmd)?;
        let pool = self.pool_for(&addr)?;
        Ok(Lease::Pooled(pool.get().await?))
    }

    async fn execute<T, F>(&self, cmd: &Command, project: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(RespResult) -> Result<T> + Send,
    {
        let mut addr = self.target_for(cmd)?;
        let mut asking = false;
        let mut attempts = 0usize;

        loop {
            let pool = self.pool_for(&addr)?;
            let mut conn = pool.get().await?;
            let reply = if asking {
                let mut frames = encode_command(&Command::new("ASKING"));
                frames.extend_from_slice(&encode_command(cmd));
                conn.send_raw(&frames, 2).await?;
                conn.read_response().await?;
                conn.read_response().await?
            } else {
                conn.execute(cmd).await?
            };
            drop(conn);
            asking = false;

            let Some(msg) = reply.error_message() else {
                return project(reply);
            };

            if let Some(redirect) = Redirect::parse(&msg) {
                attempts += 1;
                if attempts > self.config.max_redirects {
                    return Err(RespError::Cluster(format!(
                        "too many redirects ({attempts}), last: {msg}"
                    )));
                }
                let target = resolve_endpoint(&addr, &redirect.endpoint);
                if redirect.moved {
                    debug!(slot = redirect.slot, from = %addr, to = %target, "MOVED");
                    self.slot_map.write().update_slot_master(redirect.slot, &target);
                } else {
                    debug!(slot = redirect.slot, from = %addr, to = %target, "ASK");
                    asking = true;
                }
                addr = target;
                continue;
            }

            match RedisErrorKind::from_error_msg(&msg) {
                RedisErrorKind::TryAgain => {
                    attempts += 1;
                    if attempts > self.config.max_redirects {
                        return Err(RespError::redis(msg));
                    }
                    tokio::time::sleep(TRYAGAIN_BACKOFF).await;
                }
                RedisErrorKind::ClusterDown => return Err(RespError::Cluster(msg)),
                _ => return project(reply),
            }
        }
    }

    async fn dispose(&self) {
        if let Some(task) = self.refresher.lock().take() {
            task.abort();
        }
        self.pools.dispose();
    }
}

impl Drop for ClusterAdapter {
    fn drop(&mut self) {
        if let Some(task) = self.refresher.get_mut().take() {
            task.abort();
        }
    }
}

async fn refresh_loop(adapter: Weak<ClusterAdapter>) {
    loop {
        tokio::time::sleep(SLOT_REFRESH_INTERVAL).await;
        let Some(adapter) = adapter.upgrade() else {
            break; // Adapter dropped, exit
        };
        match adapter.refresh_slots().await {
            Ok(()) => {}
            Err(e) => warn!(error = %e, "slot map refresh failed"),
        }
    }
    info!("slot refresh task stopped");
}

// ── Tests ──────────────────────────────────────────────────────────
