//! The `KvStore` contract.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::KvResult;

/// Options of a `SET`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Only set when the key does not exist (`NX`).
    pub only_if_absent: bool,
    /// Expiry in seconds (`EX`).
    pub expire_secs: Option<u64>,
}

impl SetOptions {
    /// `SET key value NX EX secs`
    pub fn nx_ex(secs: u64) -> Self {
        Self {
            only_if_absent: true,
            expire_secs: Some(secs),
        }
    }
}

/// One write in an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    Set { key: String, value: String },
    Del { key: String },
    HSet { key: String, fields: Vec<(String, String)> },
    Expire { key: String, secs: i64 },
    LPush { key: String, value: String },
    ZAdd { key: String, member: String, score: i64 },
    ZRem { key: String, member: String },
    ZRemRangeByScore { key: String, min: i64, max: i64 },
    Publish { channel: String, message: String },
}

/// Writes applied as one `MULTI`/`EXEC` transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Del { key: key.into() });
        self
    }

    pub fn hset(mut self, key: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        self.ops.push(BatchOp::HSet {
            key: key.into(),
            fields,
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, secs: i64) -> Self {
        self.ops.push(BatchOp::Expire {
            key: key.into(),
            secs,
        });
        self
    }

    pub fn lpush(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(BatchOp::LPush {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, member: impl Into<String>, score: i64) -> Self {
        self.ops.push(BatchOp::ZAdd {
            key: key.into(),
            member: member.into(),
            score,
        });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(BatchOp::ZRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn zrem_range_by_score(mut self, key: impl Into<String>, min: i64, max: i64) -> Self {
        self.ops.push(BatchOp::ZRemRangeByScore {
            key: key.into(),
            min,
            max,
        });
        self
    }

    pub fn publish(mut self, channel: impl Into<String>, message: impl Into<String>) -> Self {
        self.ops.push(BatchOp::Publish {
            channel: channel.into(),
            message: message.into(),
        });
        self
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Messages received on a subscribed channel.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Redis-compatible key-value store.
///
/// Sorted-set scores are whole seconds, so they are exchanged as `i64`.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn ping(&self) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Returns whether the value was written (`false` when `NX` lost).
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> KvResult<bool>;

    /// Returns whether the key existed.
    async fn del(&self, key: &str) -> KvResult<bool>;

    /// Delete `key` only while it still holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> KvResult<bool>;

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    async fn hget_all(&self, key: &str) -> KvResult<HashMap<String, String>>;

    /// Returns whether the field existed.
    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool>;

    async fn expire(&self, key: &str, secs: i64) -> KvResult<bool>;

    /// Remaining seconds to live; `-1` without expiry, `-2` when missing.
    async fn ttl(&self, key: &str) -> KvResult<i64>;

    async fn lpush(&self, key: &str, value: &str) -> KvResult<()>;

    async fn rpop(&self, key: &str) -> KvResult<Option<String>>;

    /// Pop the tail of `source` and push it onto the head of `destination`
    /// in one step.
    async fn rpoplpush(&self, source: &str, destination: &str) -> KvResult<Option<String>>;

    /// Remove the first occurrence of `value`; returns whether one was found.
    async fn lrem(&self, key: &str, value: &str) -> KvResult<bool>;

    async fn llen(&self, key: &str) -> KvResult<u64>;

    async fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()>;

    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> KvResult<Vec<(String, i64)>>;

    /// Every member with its score, ascending.
    async fn zrange_with_scores(&self, key: &str) -> KvResult<Vec<(String, i64)>>;

    /// Returns whether the member was present.
    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> KvResult<u64>;

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<i64>>;

    async fn zcard(&self, key: &str) -> KvResult<u64>;

    async fn publish(&self, channel: &str, message: &str) -> KvResult<()>;

    async fn subscribe(&self, channel: &str) -> KvResult<Subscription>;

    /// Apply every op of the batch atomically.
    async fn exec(&self, batch: Batch) -> KvResult<()>;
}
