//! In-process KV store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{KvError, KvResult};
use crate::store::{Batch, BatchOp, KvStore, SetOptions, Subscription};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    ZSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn purge(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn get(&mut self, key: &str) -> Option<&Entry> {
        self.purge(key);
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge(key);
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        self.purge(key);
        self.entries.remove(key).is_some()
    }

    fn hash_mut(&mut self, key: &str) -> KvResult<&mut HashMap<String, String>> {
        self.purge(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn list_mut(&mut self, key: &str) -> KvResult<&mut VecDeque<String>> {
        self.purge(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(l) => Ok(l),
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn zset_mut(&mut self, key: &str) -> KvResult<&mut HashMap<String, i64>> {
        self.purge(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::ZSet(HashMap::new())));
        match &mut entry.value {
            Value::ZSet(z) => Ok(z),
            _ => Err(KvError::WrongType(key.to_string())),
        }
    }

    fn zset(&mut self, key: &str) -> KvResult<Option<&HashMap<String, i64>>> {
        match self.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::ZSet(z),
                ..
            }) => Ok(Some(z)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    /// Drop empty containers the way Redis does.
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Hash(h)) => h.is_empty(),
            Some(Value::List(l)) => l.is_empty(),
            Some(Value::ZSet(z)) => z.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    fn set(&mut self, key: &str, value: &str, options: SetOptions) -> bool {
        self.purge(key);
        if options.only_if_absent && self.entries.contains_key(key) {
            return false;
        }
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires_at = options
            .expire_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        self.entries.insert(key.to_string(), entry);
        true
    }

    fn expire(&mut self, key: &str, secs: i64) -> bool {
        if secs <= 0 {
            return self.remove(key);
        }
        match self.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(secs as u64));
                true
            }
            None => false,
        }
    }

    fn zrem_range_by_score(&mut self, key: &str, min: i64, max: i64) -> KvResult<u64> {
        if self.get(key).is_none() {
            return Ok(0);
        }
        let zset = self.zset_mut(key)?;
        let before = zset.len();
        zset.retain(|_, score| *score < min || *score > max);
        let removed = (before - zset.len()) as u64;
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn zrem(&mut self, key: &str, member: &str) -> KvResult<bool> {
        if self.get(key).is_none() {
            return Ok(false);
        }
        let removed = self.zset_mut(key)?.remove(member).is_some();
        self.drop_if_empty(key);
        Ok(removed)
    }

    fn apply(&mut self, op: &BatchOp) -> KvResult<()> {
        match op {
            BatchOp::Set { key, value } => {
                self.set(key, value, SetOptions::default());
            }
            BatchOp::Del { key } => {
                self.remove(key);
            }
            BatchOp::HSet { key, fields } => {
                let hash = self.hash_mut(key)?;
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            BatchOp::Expire { key, secs } => {
                self.expire(key, *secs);
            }
            BatchOp::LPush { key, value } => {
                self.list_mut(key)?.push_front(value.clone());
            }
            BatchOp::ZAdd { key, member, score } => {
                self.zset_mut(key)?.insert(member.clone(), *score);
            }
            BatchOp::ZRem { key, member } => {
                self.zrem(key, member)?;
            }
            BatchOp::ZRemRangeByScore { key, min, max } => {
                self.zrem_range_by_score(key, *min, *max)?;
            }
            // Delivered by the caller after the batch commits.
            BatchOp::Publish { .. } => {}
        }
        Ok(())
    }
}

fn sorted(zset: &HashMap<String, i64>, min: i64, max: i64) -> Vec<(String, i64)> {
    let mut members: Vec<(String, i64)> = zset
        .iter()
        .filter(|(_, score)| **score >= min && **score <= max)
        .map(|(m, s)| (m.clone(), *s))
        .collect();
    members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

struct Inner {
    keyspace: Mutex<Keyspace>,
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<String>>>>,
}

/// In-process implementation of [`KvStore`].
///
/// Clones share the same keyspace and channels, so several service
/// instances built on clones of one `MemoryKv` behave like replicas of a
/// single Redis server. Expired keys are evicted lazily on access.
#[derive(Clone)]
pub struct MemoryKv {
    inner: Arc<Inner>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                keyspace: Mutex::new(Keyspace::default()),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn deliver(&self, channel: &str, message: &str) {
        let mut channels = self.inner.channels.lock();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|tx| tx.send(message.to_string()).is_ok());
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut ks = self.inner.keyspace.lock();
        match ks.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> KvResult<bool> {
        Ok(self.inner.keyspace.lock().set(key, value, options))
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        Ok(self.inner.keyspace.lock().remove(key))
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> KvResult<bool> {
        let mut ks = self.inner.keyspace.lock();
        let matches = matches!(
            ks.get(key),
            Some(Entry { value: Value::Str(s), .. }) if s == expected
        );
        if matches {
            ks.remove(key);
        }
        Ok(matches)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        let mut ks = self.inner.keyspace.lock();
        ks.apply(&BatchOp::HSet {
            key: key.to_string(),
            fields: fields.to_vec(),
        })
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut ks = self.inner.keyspace.lock();
        match ks.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.get(field).cloned()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hget_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut ks = self.inner.keyspace.lock();
        match ks.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(h.clone()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let mut ks = self.inner.keyspace.lock();
        if ks.get(key).is_none() {
            return Ok(false);
        }
        let removed = ks.hash_mut(key)?.remove(field).is_some();
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn expire(&self, key: &str, secs: i64) -> KvResult<bool> {
        Ok(self.inner.keyspace.lock().expire(key, secs))
    }

    async fn ttl(&self, key: &str) -> KvResult<i64> {
        let mut ks = self.inner.keyspace.lock();
        Ok(match ks.get(key) {
            None => -2,
            Some(Entry {
                expires_at: None, ..
            }) => -1,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_secs_f64().round() as i64,
        })
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<()> {
        self.inner
            .keyspace
            .lock()
            .list_mut(key)?
            .push_front(value.to_string());
        Ok(())
    }

    async fn rpop(&self, key: &str) -> KvResult<Option<String>> {
        let mut ks = self.inner.keyspace.lock();
        if ks.get(key).is_none() {
            return Ok(None);
        }
        let popped = ks.list_mut(key)?.pop_back();
        ks.drop_if_empty(key);
        Ok(popped)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> KvResult<Option<String>> {
        let mut ks = self.inner.keyspace.lock();
        if ks.get(source).is_none() {
            return Ok(None);
        }
        // Type-check both lists before anything moves.
        ks.list_mut(source)?;
        ks.list_mut(destination)?;
        let Some(value) = ks.list_mut(source)?.pop_back() else {
            return Ok(None);
        };
        ks.list_mut(destination)?.push_front(value.clone());
        ks.drop_if_empty(source);
        Ok(Some(value))
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<bool> {
        let mut ks = self.inner.keyspace.lock();
        if ks.get(key).is_none() {
            return Ok(false);
        }
        let list = ks.list_mut(key)?;
        let removed = match list.iter().position(|v| v == value) {
            Some(index) => list.remove(index).is_some(),
            None => false,
        };
        ks.drop_if_empty(key);
        Ok(removed)
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        let mut ks = self.inner.keyspace.lock();
        match ks.get(key) {
            None => Ok(0),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(l.len() as u64),
            Some(_) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()> {
        self.inner
            .keyspace
            .lock()
            .zset_mut(key)?
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> KvResult<Vec<(String, i64)>> {
        let mut ks = self.inner.keyspace.lock();
        Ok(ks
            .zset(key)?
            .map(|z| sorted(z, min, max))
            .unwrap_or_default())
    }

    async fn zrange_with_scores(&self, key: &str) -> KvResult<Vec<(String, i64)>> {
        self.zrange_by_score(key, i64::MIN, i64::MAX).await
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        self.inner.keyspace.lock().zrem(key, member)
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> KvResult<u64> {
        self.inner.keyspace.lock().zrem_range_by_score(key, min, max)
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<i64>> {
        let mut ks = self.inner.keyspace.lock();
        Ok(ks.zset(key)?.and_then(|z| z.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let mut ks = self.inner.keyspace.lock();
        Ok(ks.zset(key)?.map(|z| z.len() as u64).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> KvResult<()> {
        self.deliver(channel, message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx))
    }

    async fn exec(&self, batch: Batch) -> KvResult<()> {
        {
            let mut ks = self.inner.keyspace.lock();
            // Apply to a scratch copy so a failing op leaves nothing behind.
            let mut scratch = Keyspace {
                entries: ks.entries.clone(),
            };
            for op in batch.ops() {
                scratch.apply(op)?;
            }
            *ks = scratch;
        }

        for op in batch.ops() {
            if let BatchOp::Publish { channel, message } = op {
                self.deliver(channel, message);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
