//! RESP2/RESP3 wire codec and topology-aware Redis execution.
//!
//! - [`resp`]: byte-exact reader and writer for every RESP message type.
//! - [`connection`]: one TCP connection, endpoint pools, idle-keyed pools.
//! - [`adapter`]: single, pooled, cluster, sentinel, pipeline and
//!   transaction execution behind one [`Adapter`] trait.
//! - [`client`]: picks the adapter from a [`ConnectionConfig`].

pub mod adapter;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod crc16;
pub mod error;
pub mod resp;
pub mod runtime;

pub use adapter::{Adapter, Lease, TxOutcome, UseType};
pub use client::{BlockingClient, RedisClient};
pub use command::{Arg, Command};
pub use config::{ConnectionConfig, Topology};
pub use error::{RedisErrorKind, Redirect, RespError, Result};
pub use resp::{FromResp, MessageKind, Protocol, RespResult, RespValue, ToResp};
