use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{StateStore, Subscription, SubscriptionTracker, forward};
use crate::error::Result;

/// [`StateStore`] backed by a Redis server.
///
/// Commands share one multiplexed [`ConnectionManager`]; every subscription
/// gets its own pub/sub connection so concurrent waiters never share one.
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    tracker: SubscriptionTracker,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            tracker: SubscriptionTracker::default(),
        })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let mut conn = self.conn.clone();
        let _: i64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let hash: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(hash)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg("GT")
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn sorted_remove_below(&self, key: &str, score: f64) -> Result<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({score}"))
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn sorted_range(&self, key: &str, min_score: f64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min_score)
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let name = channel.to_string();

        Ok(Subscription::spawn(channel, &self.tracker, move |tx, cancel| async move {
            {
                let mut messages = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = messages.next() => {
                            let Some(msg) = msg else {
                                warn!(channel = %name, "pub/sub connection closed");
                                break;
                            };
                            match msg.get_payload::<String>() {
                                Ok(payload) => {
                                    if !forward(&tx, &cancel, payload).await {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    warn!(channel = %name, error = %err, "dropping non-text payload");
                                }
                            }
                        }
                    }
                }
            }
            if let Err(err) = pubsub.unsubscribe(&name).await {
                debug!(channel = %name, error = %err, "unsubscribe failed; connection dropped instead");
            }
        }))
    }

    fn active_subscriptions(&self) -> usize {
        self.tracker.live()
    }
}
