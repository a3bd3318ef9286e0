//! Publish/subscribe bus used to deliver presence diffs.
//!
//! The tracker only needs three operations from a bus, captured by the
//! [`PubSub`] trait. [`LocalPubSub`] is an in-process implementation: each
//! subscription owns an unbounded queue, so delivery to a subscriber preserves
//! publish order and never blocks the publisher.
//!
//! Every node publishes the diffs it computes itself, so a bus only has to
//! reach subscribers on its own node.
//!
//! # Example
//!
//! ```ignore
//! let pubsub = Arc::new(LocalPubSub::new());
//! let mut sub = pubsub.subscribe("room:lobby");
//!
//! while let Some(msg) = sub.recv().await {
//!     println!("{} joins, {} leaves", msg.payload.joins.len(), msg.payload.leaves.len());
//! }
//! ```

use crate::types::PresenceBroadcast;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identifier of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The bus the tracker publishes diffs on.
pub trait PubSub: Send + Sync + 'static {
    /// Subscribe to a topic.
    fn subscribe(&self, topic: &str) -> Subscription;

    /// Cancel a subscription.
    fn unsubscribe(&self, topic: &str, id: SubscriptionId);

    /// Deliver a message to every current subscriber of `topic`.
    fn publish(&self, topic: &str, message: PresenceBroadcast);
}

/// A live subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: String,
    rx: mpsc::UnboundedReceiver<PresenceBroadcast>,
}

impl Subscription {
    /// Build a subscription around a receiver, for custom [`PubSub`] implementations.
    pub fn new(
        id: SubscriptionId,
        topic: impl Into<String>,
        rx: mpsc::UnboundedReceiver<PresenceBroadcast>,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            rx,
        }
    }

    /// The subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next message. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<PresenceBroadcast> {
        self.rx.recv().await
    }

    /// Take the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<PresenceBroadcast> {
        self.rx.try_recv().ok()
    }
}

/// In-process [`PubSub`].
#[derive(Debug, Default)]
pub struct LocalPubSub {
    /// Topic -> subscriber queues.
    topics: DashMap<String, HashMap<SubscriptionId, mpsc::UnboundedSender<PresenceBroadcast>>>,
    next_id: AtomicU64,
}

impl LocalPubSub {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers of a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |subs| subs.values().filter(|tx| !tx.is_closed()).count())
    }
}

impl PubSub for LocalPubSub {
    fn subscribe(&self, topic: &str) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id, tx);
        Subscription::new(id, topic, rx)
    }

    fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let now_empty = match self.topics.get_mut(topic) {
            Some(mut subs) => {
                subs.remove(&id);
                subs.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(topic, |_, subs| subs.is_empty());
        }
    }

    fn publish(&self, topic: &str, message: PresenceBroadcast) {
        let Some(mut subs) = self.topics.get_mut(topic) else {
            return;
        };
        subs.retain(|id, tx| {
            let delivered = tx.send(message.clone()).is_ok();
            if !delivered {
                tracing::warn!(topic = %topic, subscription = ?id, "Dropping closed presence subscriber");
            }
            delivered
        });
    }
}
