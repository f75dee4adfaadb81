//! Shared store plumbing: the Redis client wrapper and the distributed lock.

pub mod client;
pub mod lock;

pub use client::{RedisClient, RedisClientError, RedisConfig};
pub use lock::{LockError, LockSettings, NamedLock};
