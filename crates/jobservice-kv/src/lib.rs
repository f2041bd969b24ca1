//! # Job Service KV
//!
//! Persistent key schema and the Redis-compatible store every job service
//! component talks to.
//!
//! Two backends implement [`KvStore`]:
//!
//! - [`RedisKv`] for a shared Redis server (production, multi-replica)
//! - [`MemoryKv`] for a single process (tests, local runs)

mod error;
mod keys;
mod memory;
mod redis_store;
mod store;

pub use error::{KvError, KvResult};
pub use keys::{KeyBuilder, params_digest};
pub use memory::MemoryKv;
pub use redis_store::RedisKv;
pub use store::{Batch, BatchOp, KvStore, SetOptions, Subscription};
