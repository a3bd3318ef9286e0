//! Client API.

use crate::config::PresenceConfig;
use crate::crdt::ReplicaId;
use crate::diff::TopicView;
use crate::error::{PresenceError, Result};
use crate::monitor::Monitor;
use crate::owner::{Owner, OwnerHandle, OwnerId};
use crate::pubsub::PubSub;
use crate::replication::{Envelope, Transport};
use crate::server::{self, ShardCmd, ShardHandle};
use crate::types::{Meta, PresenceRef, PresenceState};
use std::collections::HashMap;
use std::sync::Arc;

/// A running presence tracker.
///
/// Cheap to clone; every clone talks to the same shards.
#[derive(Clone)]
pub struct Presence {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<PresenceConfig>,
    replica: ReplicaId,
    shards: Vec<ShardHandle>,
}

impl std::fmt::Debug for Presence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Presence")
            .field("name", &self.inner.config.name)
            .field("replica", &self.inner.replica)
            .field("pool_size", &self.inner.shards.len())
            .finish()
    }
}

impl Presence {
    /// Start a tracker.
    ///
    /// Diffs are published on `pubsub`; replication traffic leaves through
    /// `transport` and enters through [`handle_message`](Self::handle_message)
    /// or [`deliver`](Self::deliver).
    pub async fn start(
        config: PresenceConfig,
        pubsub: Arc<dyn PubSub>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let replica = ReplicaId::new(config.node.clone());

        let shards = Monitor::spawn(config.pool_size)
            .into_iter()
            .enumerate()
            .map(|(index, monitor)| {
                server::spawn(
                    index,
                    replica.clone(),
                    Arc::clone(&config),
                    Arc::clone(&pubsub),
                    Arc::clone(&transport),
                    monitor,
                )
            })
            .collect();

        tracing::info!(
            presence = %config.name,
            replica = %replica,
            pool_size = config.pool_size,
            "Presence started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                replica,
                shards,
            }),
        })
    }

    /// This node's replica id.
    pub fn replica(&self) -> &ReplicaId {
        &self.inner.replica
    }

    /// The configuration the tracker was started with.
    pub fn config(&self) -> &PresenceConfig {
        &self.inner.config
    }

    /// Create a new owner on this node.
    pub fn owner(&self) -> Owner {
        Owner::new(self.inner.config.node.clone())
    }

    /// Track `owner` under `key` in `topic`.
    ///
    /// The connection lasts until it is untracked or the owner terminates.
    pub async fn track(
        &self,
        owner: &OwnerHandle,
        topic: &str,
        key: &str,
        meta: impl Into<Meta>,
    ) -> Result<PresenceRef> {
        let meta = meta.into();
        self.shard(topic)
            .call(|reply| ShardCmd::Track {
                handle: owner.clone(),
                topic: topic.to_string(),
                key: key.to_string(),
                meta,
                reply,
            })
            .await?
    }

    /// Replace the metadata of a tracked connection with `mutator(old)`.
    pub async fn update<F>(
        &self,
        owner: &OwnerId,
        topic: &str,
        key: &str,
        mutator: F,
    ) -> Result<PresenceRef>
    where
        F: FnOnce(Meta) -> Meta + Send + 'static,
    {
        self.shard(topic)
            .call(|reply| ShardCmd::Update {
                owner: owner.clone(),
                topic: topic.to_string(),
                key: key.to_string(),
                mutator: Box::new(mutator),
                reply,
            })
            .await?
    }

    /// Stop tracking a connection. Untracking an absent connection is a no-op.
    pub async fn untrack(&self, owner: &OwnerId, topic: &str, key: &str) -> Result<()> {
        self.shard(topic)
            .call(|reply| ShardCmd::Untrack {
                owner: owner.clone(),
                topic: topic.to_string(),
                key: key.to_string(),
                reply,
            })
            .await
    }

    /// Stop tracking every connection of `owner` on this node.
    pub async fn untrack_all(&self, owner: &OwnerId) -> Result<()> {
        for shard in &self.inner.shards {
            shard
                .call(|reply| ShardCmd::UntrackAll {
                    owner: owner.clone(),
                    reply,
                })
                .await?;
        }
        Ok(())
    }

    /// Every present key of `topic` with its connections, cluster-wide.
    ///
    /// Served from the shard's read view without waiting on the shard.
    pub fn list(&self, topic: &str) -> HashMap<String, PresenceState> {
        self.shard(topic)
            .view(topic)
            .map(|view| to_states(&view))
            .unwrap_or_default()
    }

    /// The connections of one key of `topic`, if it is present.
    pub fn get(&self, topic: &str, key: &str) -> Option<PresenceState> {
        let view = self.shard(topic).view(topic)?;
        let metas = view.get(key)?.clone();
        Some(PresenceState { metas })
    }

    /// Connections of `topic` owned by this node only.
    pub async fn list_local(&self, topic: &str) -> Result<HashMap<String, PresenceState>> {
        self.shard(topic)
            .call(|reply| ShardCmd::ListLocal {
                topic: topic.to_string(),
                reply,
            })
            .await
    }

    /// Decode and deliver a replication message received from a peer.
    pub async fn handle_message(&self, bytes: &[u8]) -> Result<()> {
        let envelope = Envelope::decode(bytes).inspect_err(|e| {
            tracing::warn!(presence = %self.inner.config.name, error = %e, "Undecodable presence replication message");
        })?;
        self.deliver(envelope).await
    }

    /// Deliver a replication message received from a peer.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        let Some(shard) = self.inner.shards.get(envelope.shard) else {
            tracing::warn!(
                presence = %self.inner.config.name,
                from = %envelope.from,
                shard = envelope.shard,
                "Presence replication message for unknown shard"
            );
            return Err(PresenceError::Decode(format!(
                "no shard {} in a pool of {}",
                envelope.shard,
                self.inner.shards.len()
            )));
        };
        shard.send(ShardCmd::Replicate(envelope)).await
    }

    /// Report that node `name` has left the cluster for good.
    ///
    /// Its connections are removed at once instead of after the down periods.
    pub async fn node_down(&self, name: &str) -> Result<()> {
        tracing::info!(presence = %self.inner.config.name, node = %name, "Presence node down");
        for shard in &self.inner.shards {
            shard
                .call(|reply| ShardCmd::NodeDown {
                    name: name.to_string(),
                    reply,
                })
                .await?;
        }
        Ok(())
    }

    /// Stop every shard. Later calls fail with [`PresenceError::ShardDown`].
    pub async fn shutdown(&self) {
        for shard in &self.inner.shards {
            if let Err(e) = shard.call(|reply| ShardCmd::Shutdown { reply }).await {
                tracing::debug!(presence = %self.inner.config.name, error = %e, "Presence shard already stopped");
            }
        }
        tracing::info!(presence = %self.inner.config.name, "Presence stopped");
    }

    fn shard(&self, topic: &str) -> &ShardHandle {
        &self.inner.shards[shard_index(topic, self.inner.shards.len())]
    }
}

fn to_states(view: &TopicView) -> HashMap<String, PresenceState> {
    view.iter()
        .map(|(key, metas)| {
            (
                key.clone(),
                PresenceState {
                    metas: metas.clone(),
                },
            )
        })
        .collect()
}

/// Stable shard index of a topic: FNV-1a of its bytes, modulo the pool size.
pub(crate) fn shard_index(topic: &str, pool_size: usize) -> usize {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let hash = topic
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME));
    (hash % pool_size as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::LocalPubSub;
    use crate::replication::NoopTransport;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn start(pool_size: usize) -> (Presence, Arc<LocalPubSub>) {
        let pubsub = Arc::new(LocalPubSub::new());
        let presence = Presence::start(
            PresenceConfig::new("node1").pool_size(pool_size),
            pubsub.clone(),
            Arc::new(NoopTransport),
        )
        .await
        .unwrap();
        (presence, pubsub)
    }

    #[test]
    fn test_shard_index_is_stable() {
        assert_eq!(shard_index("room:1", 1), 0);
        assert_eq!(shard_index("room:1", 8), shard_index("room:1", 8));
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(shard_index("", 7), (0xcbf2_9ce4_8422_2325u64 % 7) as usize);
        assert!((0..100).all(|i| shard_index(&format!("room:{i}"), 4) < 4));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let err = Presence::start(
            PresenceConfig::new("node1").max_batch(0),
            Arc::new(LocalPubSub::new()),
            Arc::new(NoopTransport),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PresenceError::Config(_)));
    }

    #[tokio::test]
    async fn test_track_then_list() {
        let (presence, _) = start(1).await;
        let owner = presence.owner();

        presence
            .track(&owner.handle(), "room:1", "u1", [("name", "Alice")])
            .await
            .unwrap();

        let list = presence.list("room:1");
        assert_eq!(list.len(), 1);
        assert_eq!(list["u1"].metas[0].meta.get("name"), Some(&"Alice".into()));
        assert_eq!(list["u1"].metas[0].owner, *owner.id());
        assert!(presence.get("room:1", "u1").is_some());
        assert!(presence.get("room:1", "u2").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_track_is_rejected() {
        let (presence, _) = start(1).await;
        let owner = presence.owner();
        presence
            .track(&owner.handle(), "room:1", "u1", Meta::new())
            .await
            .unwrap();

        let err = presence
            .track(&owner.handle(), "room:1", "u1", Meta::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::AlreadyTracked { .. }));
    }

    #[tokio::test]
    async fn test_update_publishes_leave_and_join() {
        let (presence, pubsub) = start(1).await;
        let owner = presence.owner();
        let first = presence
            .track(&owner.handle(), "room:1", "u1", [("status", "away")])
            .await
            .unwrap();

        let mut sub = pubsub.subscribe("room:1");
        let second = presence
            .update(owner.id(), "room:1", "u1", |meta| meta.with("status", "online"))
            .await
            .unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload.leaves["u1"].metas[0].presence_ref, first);
        let joined = &msg.payload.joins["u1"].metas[0];
        assert_eq!(joined.presence_ref, second);
        assert_eq!(joined.ref_prev.as_ref(), Some(&first));
        assert_eq!(joined.version, 2);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_tracked() {
        let (presence, _) = start(1).await;
        let owner = presence.owner();
        let err = presence
            .update(owner.id(), "room:1", "u1", |meta| meta)
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::NotTracked { .. }));
    }

    #[tokio::test]
    async fn test_untrack_absent_is_ok() {
        let (presence, _) = start(1).await;
        let owner = presence.owner();
        assert!(presence.untrack(owner.id(), "room:1", "u1").await.is_ok());
    }

    #[tokio::test]
    async fn test_owner_termination_removes_every_connection() {
        let (presence, pubsub) = start(4).await;
        let owner = presence.owner();
        let topics: Vec<String> = (0..8).map(|i| format!("room:{i}")).collect();
        let mut subs: Vec<_> = topics.iter().map(|t| pubsub.subscribe(t)).collect();

        for topic in &topics {
            presence
                .track(&owner.handle(), topic, "u1", Meta::new())
                .await
                .unwrap();
        }
        drop(owner);

        for (topic, sub) in topics.iter().zip(subs.iter_mut()) {
            let joined = sub.recv().await.unwrap();
            assert!(joined.payload.joins.contains_key("u1"));
            let left = timeout(Duration::from_secs(1), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(left.payload.leaves.contains_key("u1"), "{topic}");
            assert!(presence.list(topic).is_empty());
        }
    }

    #[tokio::test]
    async fn test_untrack_all_spans_shards() {
        let (presence, _) = start(4).await;
        let owner = presence.owner();
        let other = presence.owner();
        for i in 0..8 {
            presence
                .track(&owner.handle(), &format!("room:{i}"), "u1", Meta::new())
                .await
                .unwrap();
        }
        presence
            .track(&other.handle(), "room:0", "u2", Meta::new())
            .await
            .unwrap();

        presence.untrack_all(owner.id()).await.unwrap();

        for i in 0..8 {
            assert!(!presence.list(&format!("room:{i}")).contains_key("u1"));
        }
        assert!(presence.list("room:0").contains_key("u2"));
    }

    #[tokio::test]
    async fn test_list_local_shows_only_this_node() {
        let (presence, _) = start(1).await;
        let owner = presence.owner();
        presence
            .track(&owner.handle(), "room:1", "u1", Meta::new())
            .await
            .unwrap();

        let local = presence.list_local("room:1").await.unwrap();
        assert_eq!(local["u1"].metas.len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_shard_is_rejected() {
        let (presence, _) = start(2).await;
        let envelope = Envelope {
            from: ReplicaId::with_vsn("node2", 1),
            shard: 9,
            message: crate::replication::ReplicationMessage::TransferReq,
        };
        assert!(matches!(
            presence.deliver(envelope).await,
            Err(PresenceError::Decode(_))
        ));
        assert!(presence.handle_message(b"garbage").await.is_err());
    }

    #[tokio::test]
    async fn test_repeated_shutdown_is_harmless() {
        let (presence, _) = start(2).await;
        presence.shutdown().await;
        presence.shutdown().await;
        assert!(presence.list_local("room:1").await.is_err());
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (presence, _) = start(2).await;
        let owner = presence.owner();
        presence.shutdown().await;

        let err = presence
            .track(&owner.handle(), "room:1", "u1", Meta::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PresenceError::ShardDown(_)));
    }
}
