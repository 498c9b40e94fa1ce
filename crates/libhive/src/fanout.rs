//! Event fan-out: one upstream subscription on the `events` channel relayed to
//! any number of local subscribers.

use hive_protocol::EVENTS_CHANNEL;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::{StateStore, Subscription};

pub const DEFAULT_EVENT_BUFFER: usize = 256;
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(2);

/// What happens to a subscriber that falls more than a full buffer behind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// End that subscriber's stream.
    #[default]
    DropSubscriber,
    /// Discard the oldest undelivered events for that subscriber and carry on.
    EvictOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "drop_subscriber" | "drop" => Ok(Self::DropSubscriber),
            "evict_oldest" | "evict" => Ok(Self::EvictOldest),
            other => Err(format!(
                "unknown overflow policy {other:?} (expected drop_subscriber or evict_oldest)"
            )),
        }
    }
}

/// Relays every payload published on [`EVENTS_CHANNEL`] to all subscribers.
///
/// No history is kept: a subscriber sees only what is published after it
/// subscribed.
pub struct EventGateway {
    tx: broadcast::Sender<String>,
    policy: OverflowPolicy,
    cancel: CancellationToken,
    relay: Option<JoinHandle<()>>,
}

impl EventGateway {
    /// Subscribe upstream and start relaying. If the first subscribe fails the
    /// relay keeps retrying in the background.
    pub async fn start(store: Arc<dyn StateStore>, capacity: usize, policy: OverflowPolicy) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let upstream = match store.subscribe(EVENTS_CHANNEL).await {
            Ok(sub) => Some(sub),
            Err(err) => {
                warn!(error = %err, "event upstream unavailable; retrying in background");
                None
            }
        };
        let relay = tokio::spawn(relay_loop(store, upstream, tx.clone(), cancel.clone()));
        info!(capacity, ?policy, "event gateway started");

        Self {
            tx,
            policy,
            cancel,
            relay: Some(relay),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
            policy: self.policy,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Stop relaying and release the upstream subscription.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(relay) = self.relay.take() {
            let _ = relay.await;
        }
    }
}

impl Drop for EventGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn relay_loop(
    store: Arc<dyn StateStore>,
    mut upstream: Option<Subscription>,
    tx: broadcast::Sender<String>,
    cancel: CancellationToken,
) {
    loop {
        if let Some(mut sub) = upstream.take() {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        sub.close().await;
                        return;
                    }
                    msg = sub.next() => match msg {
                        Some(payload) => {
                            let delivered = tx.send(payload).unwrap_or(0);
                            debug!(delivered, "event relayed");
                        }
                        None => {
                            warn!("event upstream ended; resubscribing");
                            break;
                        }
                    },
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RESUBSCRIBE_BACKOFF) => {}
        }
        match store.subscribe(EVENTS_CHANNEL).await {
            Ok(sub) => {
                info!("event upstream resubscribed");
                upstream = Some(sub);
            }
            Err(err) => warn!(error = %err, "event upstream subscribe failed"),
        }
    }
}

/// One observer's view of the event stream.
pub struct EventSubscriber {
    rx: broadcast::Receiver<String>,
    policy: OverflowPolicy,
}

impl EventSubscriber {
    /// Next event, or `None` once this stream is over (gateway gone, or the
    /// subscriber was dropped for falling behind).
    pub async fn next(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Some(payload),
                Err(RecvError::Lagged(skipped)) => match self.policy {
                    OverflowPolicy::DropSubscriber => {
                        warn!(skipped, "event subscriber fell behind; dropping it");
                        return None;
                    }
                    OverflowPolicy::EvictOldest => {
                        warn!(skipped, "event subscriber fell behind; oldest events discarded");
                    }
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Publish any serializable event on [`EVENTS_CHANNEL`].
pub async fn publish_event<T: Serialize + ?Sized>(store: &dyn StateStore, event: &T) -> Result<usize> {
    let payload = serde_json::to_string(event)?;
    store.publish(EVENTS_CHANNEL, &payload).await
}
