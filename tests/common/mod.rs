//! Shared helpers for integration tests.
//!
//! Every test talks to an in-process mock server on `127.0.0.1:0`. Requests
//! are decoded with the crate's own parser and handed to a per-connection
//! [`Session`]; [`kv_session`] is a small in-memory Redis (strings, counters,
//! MULTI/EXEC/WATCH) that most tests build on.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use respkit::resp::{parse_slice, ReadOptions};
use respkit::{ConnectionConfig, RespError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

// ── Replies ────────────────────────────────────────────────────────

/// What a session does with one request.
pub enum Reply {
    Frame(Vec<u8>),
    /// Never answer (the client should time out).
    Silent,
    /// Hang up.
    Close,
    /// Answer after a pause.
    Delayed(Duration, Vec<u8>),
}

impl Reply {
    pub fn raw(frame: impl AsRef<[u8]>) -> Self {
        Reply::Frame(frame.as_ref().to_vec())
    }

    pub fn ok() -> Self {
        Self::simple("OK")
    }

    pub fn simple(s: &str) -> Self {
        Reply::Frame(format!("+{s}\r\n").into_bytes())
    }

    pub fn error(msg: &str) -> Self {
        Reply::Frame(format!("-{msg}\r\n").into_bytes())
    }

    pub fn int(n: i64) -> Self {
        Reply::Frame(format!(":{n}\r\n").into_bytes())
    }

    pub fn bulk(data: &str) -> Self {
        Reply::Frame(bulk(data))
    }

    pub fn nil() -> Self {
        Reply::raw("$-1\r\n")
    }
}

pub fn bulk(data: &str) -> Vec<u8> {
    format!("${}\r\n{data}\r\n", data.len()).into_bytes()
}

/// `CLUSTER SLOTS` reply: one entry per `(start, end, master_addr)`.
pub fn cluster_slots(ranges: &[(u16, u16, &str)]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", ranges.len()).into_bytes();
    for (start, end, addr) in ranges {
        let (host, port) = addr.rsplit_once(':').unwrap_or((addr, "6379"));
        out.extend_from_slice(format!("*3\r\n:{start}\r\n:{end}\r\n*2\r\n").as_bytes());
        out.extend_from_slice(&bulk(host));
        out.extend_from_slice(format!(":{port}\r\n").as_bytes());
    }
    out
}

/// `CLUSTER SLOTS` reply for one range served by `master` and `replica`.
pub fn cluster_slots_replicated(start: u16, end: u16, master: &str, replica: &str) -> Vec<u8> {
    let mut out = format!("*1\r\n*4\r\n:{start}\r\n:{end}\r\n").into_bytes();
    for addr in [master, replica] {
        let (host, port) = addr.rsplit_once(':').unwrap_or((addr, "6379"));
        out.extend_from_slice(b"*2\r\n");
        out.extend_from_slice(&bulk(host));
        out.extend_from_slice(format!(":{port}\r\n").as_bytes());
    }
    out
}

// ── Mock server ────────────────────────────────────────────────────

/// Handles the requests of one client connection.
pub type Session = Box<dyn FnMut(&[String]) -> Reply + Send>;

pub struct MockServer {
    pub addr: String,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    /// Every request received so far, across connections.
    pub fn requests(&self) -> Vec<Vec<String>> {
        self.log.lock().clone()
    }

    /// How many requests named `name` arrived.
    pub fn count(&self, name: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .count()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> ConnectionConfig {
        config_for(&self.addr)
    }
}

pub fn config_for(addr: &str) -> ConnectionConfig {
    let (host, port) = addr.rsplit_once(':').unwrap();
    ConnectionConfig {
        host: host.to_string(),
        port: port.parse().unwrap(),
        ..ConnectionConfig::default()
    }
}

/// Accept connections forever, giving each a fresh session.
pub async fn spawn_mock<F>(new_session: F) -> MockServer
where
    F: Fn() -> Session + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let log: Arc<Mutex<Vec<Vec<String>>>> = Arc::default();
    let connections = Arc::new(AtomicUsize::new(0));
    let new_session = Arc::new(new_session);

    let (server_log, server_conns) = (Arc::clone(&log), Arc::clone(&connections));
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            server_conns.fetch_add(1, Ordering::SeqCst);
            let mut session = new_session();
            let log = Arc::clone(&server_log);
            tokio::spawn(async move {
                let mut buf = BytesMut::with_capacity(4096);
                loop {
                    // drain every complete request already buffered
                    loop {
                        let (request, used) = match parse_slice(&buf, ReadOptions::text()) {
                            Ok(parsed) => parsed,
                            Err(RespError::Incomplete) => break,
                            Err(_) => return,
                        };
                        let _ = buf.split_to(used);
                        let args: Vec<String> = request
                            .value
                            .into_array()
                            .unwrap_or_default()
                            .iter()
                            .map(|a| a.to_text_lossy().unwrap_or_default())
                            .collect();
                        log.lock().push(args.clone());
                        match session(&args) {
                            Reply::Frame(frame) => {
                                if socket.write_all(&frame).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Delayed(pause, frame) => {
                                tokio::time::sleep(pause).await;
                                if socket.write_all(&frame).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Silent => {}
                            Reply::Close => return,
                        }
                    }
                    match socket.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {}
                    }
                }
            });
        }
    });

    MockServer {
        addr,
        log,
        connections,
    }
}

// ── In-memory store ────────────────────────────────────────────────

/// Key → (value, version). Every write bumps the version so WATCH can see it.
pub type Store = Arc<Mutex<HashMap<String, (String, u64)>>>;

/// A mock server backed by a fresh [`Store`].
pub async fn kv_server() -> (MockServer, Store) {
    let store = Store::default();
    let shared = Arc::clone(&store);
    let server = spawn_mock(move || kv_session(Arc::clone(&shared))).await;
    (server, store)
}

/// A session speaking a small subset of Redis against `store`.
pub fn kv_session(store: Store) -> Session {
    let mut queued: Option<Vec<Vec<String>>> = None;
    let mut dirty = false;
    let mut watched: Vec<(String, u64)> = Vec::new();

    Box::new(move |args: &[String]| {
        let name = args.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
        match name.as_str() {
            "MULTI" if queued.is_some() => Reply::error("ERR MULTI calls can not be nested"),
            "MULTI" => {
                queued = Some(Vec::new());
                Reply::ok()
            }
            "EXEC" => {
                let Some(cmds) = queued.take() else {
                    return Reply::error("ERR EXEC without MULTI");
                };
                let watches = std::mem::take(&mut watched);
                if std::mem::take(&mut dirty) {
                    return Reply::error(
                        "EXECABORT Transaction discarded because of previous errors.",
                    );
                }
                let mut db = store.lock();
                let changed = watches
                    .iter()
                    .any(|(k, v)| db.get(k).map(|e| e.1).unwrap_or(0) != *v);
                if changed {
                    return Reply::raw("*-1\r\n");
                }
                let mut out = format!("*{}\r\n", cmds.len()).into_bytes();
                for cmd in &cmds {
                    out.extend_from_slice(&apply(&mut db, cmd));
                }
                Reply::Frame(out)
            }
            "DISCARD" => match queued.take() {
                Some(_) => {
                    dirty = false;
                    watched.clear();
                    Reply::ok()
                }
                None => Reply::error("ERR DISCARD without MULTI"),
            },
            "WATCH" if queued.is_some() => Reply::error("ERR WATCH inside MULTI is not allowed"),
            "WATCH" => {
                let db = store.lock();
                for key in &args[1..] {
                    watched.push((key.clone(), db.get(key).map(|e| e.1).unwrap_or(0)));
                }
                Reply::ok()
            }
            "UNWATCH" => {
                watched.clear();
                Reply::ok()
            }
            // never answers
            "SLEEP" => Reply::Silent,
            // answers `late` after 200ms
            "SLOW" => Reply::Delayed(Duration::from_millis(200), bulk("late")),
            "QUIT" => Reply::Close,
            _ => match queued.as_mut() {
                Some(q) if is_known(&name) => {
                    q.push(args.to_vec());
                    Reply::simple("QUEUED")
                }
                Some(_) => {
                    dirty = true;
                    Reply::error(&format!("ERR unknown command '{}'", args[0]))
                }
                None => Reply::Frame(apply(&mut store.lock(), args)),
            },
        }
    })
}

fn is_known(name: &str) -> bool {
    matches!(
        name,
        "PING" | "ECHO" | "SET" | "GET" | "INCR" | "INCRBY" | "DEL" | "EXISTS" | "STRLEN"
    )
}

fn apply(db: &mut HashMap<String, (String, u64)>, args: &[String]) -> Vec<u8> {
    let name = args.first().map(|n| n.to_ascii_uppercase()).unwrap_or_default();
    let arity_err = || format!("-ERR wrong number of arguments for '{name}' command\r\n").into_bytes();
    match name.as_str() {
        "PING" => b"+PONG\r\n".to_vec(),
        "ECHO" => match args.get(1) {
            Some(msg) => bulk(msg),
            None => arity_err(),
        },
        "SET" => match (args.get(1), args.get(2)) {
            (Some(k), Some(v)) => {
                let version = db.get(k).map(|e| e.1).unwrap_or(0) + 1;
                db.insert(k.clone(), (v.clone(), version));
                b"+OK\r\n".to_vec()
            }
            _ => arity_err(),
        },
        "GET" => match args.get(1) {
            Some(k) => match db.get(k) {
                Some((v, _)) => bulk(v),
                None => b"$-1\r\n".to_vec(),
            },
            None => arity_err(),
        },
        "STRLEN" => match args.get(1) {
            Some(k) => format!(":{}\r\n", db.get(k).map(|e| e.0.len()).unwrap_or(0)).into_bytes(),
            None => arity_err(),
        },
        "INCR" | "INCRBY" => {
            let Some(k) = args.get(1) else {
                return arity_err();
            };
            let by = match args.get(2) {
                Some(n) => match n.parse::<i64>() {
                    Ok(n) => n,
                    Err(_) => return b"-ERR value is not an integer or out of range\r\n".to_vec(),
                },
                None => 1,
            };
            let (current, version) = db.get(k).cloned().unwrap_or(("0".into(), 0));
            let Ok(current) = current.parse::<i64>() else {
                return b"-ERR value is not an integer or out of range\r\n".to_vec();
            };
            let next = current + by;
            db.insert(k.clone(), (next.to_string(), version + 1));
            format!(":{next}\r\n").into_bytes()
        }
        "DEL" | "EXISTS" => {
            let mut n = 0;
            for k in &args[1..] {
                let hit = if name == "DEL" {
                    db.remove(k).is_some()
                } else {
                    db.contains_key(k)
                };
                n += hit as i64;
            }
            format!(":{n}\r\n").into_bytes()
        }
        _ => format!("-ERR unknown command '{}'\r\n", args.first().map(String::as_str).unwrap_or("")).into_bytes(),
    }
}

/// Install a test subscriber once so `RUST_LOG=respkit=debug` shows traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
