//! Redis backend.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::KvResult;
use crate::store::{Batch, BatchOp, KvStore, SetOptions, Subscription};

const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// [`KvStore`] over a Redis server.
///
/// Commands share one auto-reconnecting multiplexed connection; every
/// subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisKv {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisKv {
    /// Connect to `url` (`redis://[:password@]host:port[/db]`).
    pub async fn connect(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        debug!("Connected to redis at {}", url);
        Ok(Self { client, conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, options: SetOptions) -> KvResult<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if options.only_if_absent {
            cmd.arg("NX");
        }
        if let Some(secs) = options.expire_secs {
            cmd.arg("EX").arg(secs);
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::Script::new(DEL_IF_EQ_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.hget(key, field).await?)
    }

    async fn hget_all(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, secs: i64) -> KvResult<bool> {
        let mut conn = self.conn();
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn ttl(&self, key: &str) -> KvResult<i64> {
        let mut conn = self.conn();
        Ok(redis::cmd("TTL").arg(key).query_async(&mut conn).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn rpop(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("RPOP").arg(key).query_async(&mut conn).await?)
    }

    async fn rpoplpush(&self, source: &str, destination: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn();
        Ok(redis::cmd("RPOPLPUSH")
            .arg(source)
            .arg(destination)
            .query_async(&mut conn)
            .await?)
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.lrem(key, 1, value).await?;
        Ok(removed > 0)
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.conn();
        Ok(conn.llen(key).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score(&self, key: &str, min: i64, max: i64) -> KvResult<Vec<(String, i64)>> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = conn.zrangebyscore_withscores(key, min, max).await?;
        Ok(members.into_iter().map(|(m, s)| (m, s as i64)).collect())
    }

    async fn zrange_with_scores(&self, key: &str) -> KvResult<Vec<(String, i64)>> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = conn
            .zrangebyscore_withscores(key, "-inf", "+inf")
            .await?;
        Ok(members.into_iter().map(|(m, s)| (m, s as i64)).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> KvResult<u64> {
        let mut conn = self.conn();
        Ok(conn.zrembyscore(key, min, max).await?)
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<i64>> {
        let mut conn = self.conn();
        let score: Option<f64> = conn.zscore(key, member).await?;
        Ok(score.map(|s| s as i64))
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let mut conn = self.conn();
        Ok(conn.zcard(key).await?)
    }

    async fn publish(&self, channel: &str, message: &str) -> KvResult<()> {
        let mut conn = self.conn();
        let _: i64 = conn.publish(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let name = channel.to_string();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            warn!("Subscription to {} ended by server", name);
                            break;
                        };
                        match msg.get_payload::<String>() {
                            Ok(payload) => {
                                if tx.send(payload).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping undecodable message on {}: {}", name, e),
                        }
                    }
                }
            }
            debug!("Subscription to {} closed", name);
        });

        Ok(Subscription::new(channel, rx))
    }

    async fn exec(&self, batch: Batch) -> KvResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                BatchOp::Set { key, value } => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
                BatchOp::Del { key } => {
                    pipe.cmd("DEL").arg(key).ignore();
                }
                BatchOp::HSet { key, fields } => {
                    if !fields.is_empty() {
                        pipe.hset_multiple(key, fields).ignore();
                    }
                }
                BatchOp::Expire { key, secs } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*secs).ignore();
                }
                BatchOp::LPush { key, value } => {
                    pipe.cmd("LPUSH").arg(key).arg(value).ignore();
                }
                BatchOp::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
                }
                BatchOp::ZRem { key, member } => {
                    pipe.cmd("ZREM").arg(key).arg(member).ignore();
                }
                BatchOp::ZRemRangeByScore { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max).ignore();
                }
                BatchOp::Publish { channel, message } => {
                    pipe.cmd("PUBLISH").arg(channel).arg(message).ignore();
                }
            }
        }

        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}
