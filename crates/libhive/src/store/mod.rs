//! Shared state store: the key/value + pub/sub service every other component
//! talks to.
//!
//! Components only ever see [`StateStore`]; production uses Redis, tests and
//! single-process setups use [`MemoryStore`].

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

const SUBSCRIPTION_BUFFER: usize = 64;

/// Narrow interface over the shared key/value + pub/sub service.
///
/// Every mutation is a single-key upsert; there are no multi-key transactions.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for health output.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Returns an empty map when the key is absent or expired.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Insert `member`, or raise its score. A lower score never replaces a
    /// higher one.
    async fn sorted_add(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove members scored strictly below `score`; returns how many went.
    async fn sorted_remove_below(&self, key: &str, score: f64) -> Result<usize>;

    /// Members scored at or above `min_score`, lowest score first.
    async fn sorted_range(&self, key: &str, min_score: f64) -> Result<Vec<String>>;

    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Open a dedicated subscription. The channel is live once this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Subscriptions opened through this store and not yet released.
    fn active_subscriptions(&self) -> usize;
}

/// Build the store selected by configuration: Redis when a URL is given,
/// otherwise the in-process backend.
pub async fn connect(redis_url: Option<&str>) -> Result<Arc<dyn StateStore>> {
    match redis_url {
        Some(url) => {
            let store = RedisStore::connect(url).await?;
            info!(backend = "redis", "state store connected");
            Ok(Arc::new(store))
        }
        None => {
            info!(backend = "memory", "using in-process state store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Counts live subscriptions for a store instance.
#[derive(Clone, Default)]
pub(crate) struct SubscriptionTracker(Arc<AtomicUsize>);

impl SubscriptionTracker {
    pub(crate) fn live(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> LiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        LiveGuard(Arc::clone(&self.0))
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A dedicated pub/sub subscription.
///
/// Released exactly once: either explicitly with [`Subscription::close`],
/// which waits for the backend unsubscribe, or implicitly on drop, which
/// releases in the background.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<String>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Run `pump` as the backend side of a new subscription. The pump forwards
    /// payloads into the sender until the token is cancelled, then performs
    /// its backend teardown and returns.
    pub(crate) fn spawn<F, Fut>(channel: &str, tracker: &SubscriptionTracker, pump: F) -> Self
    where
        F: FnOnce(mpsc::Sender<String>, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let live = tracker.acquire();
        let fut = pump(tx, cancel.clone());
        let task = tokio::spawn(async move {
            fut.await;
            drop(live);
        });

        Self {
            channel: channel.to_string(),
            receiver,
            cancel,
            pump: Some(task),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next payload, or `None` once the backend ended the subscription.
    pub async fn next(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    /// Unsubscribe and wait until the backend side is torn down.
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Forward one payload unless the subscription is being torn down.
/// Returns `false` when the pump should stop.
pub(crate) async fn forward(
    tx: &mpsc::Sender<String>,
    cancel: &CancellationToken,
    payload: String,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(payload) => sent.is_ok(),
    }
}
