use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::warn;

use super::{StateStore, Subscription, SubscriptionTracker, forward};
use crate::broker::ChannelBroker;
use crate::error::{HiveError, Result};

enum Value {
    String(String),
    Hash(HashMap<String, String>),
    Sorted(HashMap<String, f64>),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Hash(_) => "hash",
            Value::Sorted(_) => "zset",
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`StateStore`] with Redis semantics for the subset hive uses.
///
/// Expiry is lazy: an expired key is removed the next time it is touched.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    broker: Arc<ChannelBroker>,
    tracker: SubscriptionTracker,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(256)
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            broker: Arc::new(ChannelBroker::new(capacity)),
            tracker: SubscriptionTracker::default(),
        }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| HiveError::Store(format!("lock poisoned: {e}")))?;
        f(&mut entries)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn evict_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
}

/// Look up a live entry, evicting it first if it has expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    evict_expired(entries, key);
    entries.get_mut(key)
}

/// Live entry for `key`, created with `empty` when absent.
fn live_or_insert<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    empty: fn() -> Value,
) -> &'a mut Entry {
    evict_expired(entries, key);
    entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: empty(),
        expires_at: None,
    })
}

fn wrong_type(key: &str, found: &Value, wanted: &str) -> HiveError {
    HiveError::Store(format!(
        "WRONGTYPE key {key} holds a {} value, expected {wanted}",
        found.kind()
    ))
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match live(entries, key) {
            None => Ok(None),
            Some(Entry {
                value: Value::String(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(other) => Err(wrong_type(key, &other.value, "string")),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::String(value.to_string()),
                    expires_at: None,
                },
            );
            Ok(())
        })
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        self.with_entries(|entries| {
            let entry = live_or_insert(entries, key, || Value::Hash(HashMap::new()));
            match &mut entry.value {
                Value::Hash(hash) => {
                    for (field, value) in fields {
                        hash.insert(field.clone(), value.clone());
                    }
                    Ok(())
                }
                other => Err(wrong_type(key, other, "hash")),
            }
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_entries(|entries| match live(entries, key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(other) => Err(wrong_type(key, &other.value, "hash")),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_entries(|entries| {
            if let Some(entry) = live(entries, key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        })
    }

    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.with_entries(|entries| {
            let entry = live_or_insert(entries, key, || Value::Sorted(HashMap::new()));
            match &mut entry.value {
                Value::Sorted(set) => {
                    let current = set.entry(member.to_string()).or_insert(score);
                    if score > *current {
                        *current = score;
                    }
                    Ok(())
                }
                other => Err(wrong_type(key, other, "zset")),
            }
        })
    }

    async fn sorted_remove_below(&self, key: &str, score: f64) -> Result<usize> {
        self.with_entries(|entries| match live(entries, key) {
            None => Ok(0),
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => {
                let before = set.len();
                set.retain(|_, s| *s >= score);
                Ok(before - set.len())
            }
            Some(other) => Err(wrong_type(key, &other.value, "zset")),
        })
    }

    async fn sorted_range(&self, key: &str, min_score: f64) -> Result<Vec<String>> {
        self.with_entries(|entries| match live(entries, key) {
            None => Ok(Vec::new()),
            Some(Entry {
                value: Value::Sorted(set),
                ..
            }) => {
                let mut members: Vec<(&String, &f64)> =
                    set.iter().filter(|(_, s)| **s >= min_score).collect();
                members.sort_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)));
                Ok(members.into_iter().map(|(m, _)| m.clone()).collect())
            }
            Some(other) => Err(wrong_type(key, &other.value, "zset")),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        Ok(self.broker.publish(channel, payload.to_string()).await)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut rx = self.broker.subscribe(channel).await;
        let broker = Arc::clone(&self.broker);
        let name = channel.to_string();

        Ok(Subscription::spawn(channel, &self.tracker, move |tx, cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(payload) => {
                            if !forward(&tx, &cancel, payload).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "subscription lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            drop(rx);
            broker.release(&name).await;
        }))
    }

    fn active_subscriptions(&self) -> usize {
        self.tracker.live()
    }
}
