pub mod idle;
pub mod pool;
pub mod tcp;

pub use idle::IdleBus;
pub use pool::{ConnectionPool, PoolGuard};
pub use tcp::{ConnectedHook, RedisConnection};
