//! Keyed resource pool with idle-timeout eviction.
//!
//! Holds one lazily created resource per key (an endpoint address in
//! practice). A background task holding only a `Weak` handle sweeps entries
//! that have not been touched within the idle window and hands them to the
//! eviction callback. Dropping the bus stops the sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;

/// Idle window used when none is configured.
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(600);

/// Called with the key and resource of every evicted entry.
pub type EvictHook<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

struct Entry<T> {
    value: Arc<T>,
    last_used: Instant,
}

struct Shared<T> {
    entries: Mutex<HashMap<String, Entry<T>>>,
    idle_window: Duration,
    on_evict: Option<EvictHook<T>>,
}

impl<T> Shared<T> {
    fn sweep(&self) -> usize {
        let evicted: Vec<(String, Arc<T>)> = {
            let mut entries = self.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.last_used.elapsed() >= self.idle_window)
                .map(|(k, _)| k.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
                .collect()
        };
        let n = evicted.len();
        for (key, value) in evicted {
            debug!(key = %key, "idle entry evicted");
            self.notify(&key, &value);
        }
        n
    }

    fn notify(&self, key: &str, value: &T) {
        if let Some(hook) = &self.on_evict {
            hook(key, value);
        }
    }
}

pub struct IdleBus<T> {
    shared: Arc<Shared<T>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> IdleBus<T> {
    /// Create a bus. The sweep task is spawned only when called from within
    /// a tokio runtime; otherwise entries are swept on access.
    pub fn new(idle_window: Duration, on_evict: Option<EvictHook<T>>) -> Self {
        let shared = Arc::new(Shared {
            entries: Mutex::new(HashMap::new()),
            idle_window,
            on_evict,
        });
        let every = sweep_interval(idle_window);
        let sweeper = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(sweep_loop(Arc::downgrade(&shared), every)));
        Self {
            shared,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Return the resource for `key`, creating it with `factory` if absent.
    /// Lookup and insertion happen under one lock, so concurrent callers
    /// share a single resource per key.
    pub fn get_or_create<F>(&self, key: &str, factory: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if self.sweeper.lock().is_none() {
            self.shared.sweep();
        }
        let mut entries = self.shared.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.value));
        }
        let value = Arc::new(factory()?);
        entries.insert(
            key.to_string(),
            Entry {
                value: Arc::clone(&value),
                last_used: Instant::now(),
            },
        );
        debug!(key, "idle bus entry created");
        Ok(value)
    }

    /// Look up an existing entry, refreshing its timestamp.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let mut entries = self.shared.entries.lock();
        entries.get_mut(key).map(|entry| {
            entry.last_used = Instant::now();
            Arc::clone(&entry.value)
        })
    }

    /// Remove an entry without invoking the eviction callback.
    pub fn remove(&self, key: &str) -> Option<Arc<T>> {
        self.shared.entries.lock().remove(key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.shared.entries.lock().keys().cloned().collect()
    }

    /// Evict every entry idle for at least the window. Returns how many
    /// were evicted.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Stop the sweeper and evict everything.
    pub fn dispose(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        let drained: Vec<(String, Entry<T>)> = self.shared.entries.lock().drain().collect();
        for (key, entry) in drained {
            self.shared.notify(&key, &entry.value);
        }
    }
}

impl<T> Drop for IdleBus<T> {
    fn drop(&mut self) {
        if let Some(task) = self.sweeper.get_mut().take() {
            task.abort();
        }
    }
}

fn sweep_interval(idle_window: Duration) -> Duration {
    (idle_window / 2).clamp(Duration::from_millis(10), Duration::from_secs(60))
}

async fn sweep_loop<T>(shared: Weak<Shared<T>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared.upgrade() {
            Some(shared) => {
                shared.sweep();
            }
            None => break,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
