//! Global tokio runtime management.
//!
//! Backs [`BlockingClient`](crate::client::BlockingClient): callers without a
//! runtime of their own get a shared multi-threaded one, created on first use
//! and kept for the lifetime of the process.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::Runtime;

use crate::error::{RespError, Result};

/// Environment variable overriding the worker thread count.
pub const THREADS_ENV: &str = "RESPKIT_RUNTIME_THREADS";

/// Global tokio runtime, or the reason it could not be built.
static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

/// Get (or initialize) the global tokio runtime.
///
/// The runtime is multi-threaded with the default number of worker threads
/// (typically equal to the number of CPU cores). Override with the
/// `RESPKIT_RUNTIME_THREADS` environment variable.
pub fn get_runtime() -> Result<&'static Runtime> {
    let built = RUNTIME.get_or_init(|| {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all();

        if let Some(n) = std::env::var(THREADS_ENV)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            builder.worker_threads(n);
        }

        builder
            .thread_name("respkit-rt")
            .build()
            .map_err(|e| e.to_string())
    });
    built
        .as_ref()
        .map_err(|e| RespError::Config(format!("failed to create tokio runtime: {e}")))
}

/// Block on a future using the global runtime.
///
/// Must not be called from within an async context (tokio panics).
pub fn block_on<F: Future>(future: F) -> Result<F::Output> {
    Ok(get_runtime()?.block_on(future))
}

/// Spawn a future on the global runtime.
pub fn spawn<F>(future: F) -> Result<tokio::task::JoinHandle<F::Output>>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Ok(get_runtime()?.spawn(future))
}

// ── Tests ──────────────────────────────────────────────────────────
