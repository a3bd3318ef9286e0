//! # Ambitious Presence
//!
//! Distributed presence tracking for real-time applications.
//!
//! Presence tracks which subjects (users, sessions, documents) are present
//! in which topics across every node of a cluster, keeps that view eventually
//! consistent without locks, and publishes minimal join/leave diffs to
//! subscribers of each topic.
//!
//! # Architecture
//!
//! Like Phoenix.Tracker, presence is built on top of PubSub:
//!
//! - **Shards** own the local entry table and the replicated state; each one
//!   is a single task applying commands in order
//! - A **monitor** per shard watches the owners of tracked connections and
//!   removes their connections when they terminate
//! - The replicated state is a last-writer-wins map CRDT merged per
//!   `(topic, key, owner)`, so replicas converge regardless of delivery order
//! - **PubSub** carries the diffs to subscribers on each node
//!
//! # Example
//!
//! ```ignore
//! use ambitious_presence::{LocalPubSub, NoopTransport, Presence, PresenceConfig, PubSub};
//! use std::sync::Arc;
//!
//! let pubsub = Arc::new(LocalPubSub::new());
//! let presence = Presence::start(
//!     PresenceConfig::new("node1"),
//!     pubsub.clone(),
//!     Arc::new(NoopTransport),
//! )
//! .await?;
//!
//! let mut diffs = pubsub.subscribe("room:lobby");
//!
//! // Track a user's connection for as long as `owner` lives
//! let owner = presence.owner();
//! presence
//!     .track(&owner.handle(), "room:lobby", "user:123", [("status", "online")])
//!     .await?;
//!
//! // Update presence metadata
//! presence
//!     .update(owner.id(), "room:lobby", "user:123", |meta| meta.with("typing", true))
//!     .await?;
//!
//! // List all presences in a topic
//! for (key, state) in presence.list("room:lobby") {
//!     println!("{}: {} connection(s)", key, state.metas.len());
//! }
//!
//! // Dropping the owner removes its connections and publishes the leaves
//! drop(owner);
//! let diff = diffs.recv().await;
//! ```
//!
//! # Distributed Behavior
//!
//! When presence changes on one node:
//! 1. The shard applies the change and publishes the local diff
//! 2. The change is broadcast to the same shard on every peer as a delta
//! 3. Peers merge the delta, compute their own diff and publish it locally
//!
//! A peer that misses deltas notices the gap from the next delta or heartbeat
//! and asks for a full transfer. A peer that stays silent is first hidden and
//! later removed.

#![deny(missing_docs)]

pub mod config;
pub mod crdt;
pub mod diff;
pub mod error;
pub mod monitor;
pub mod owner;
pub mod presence;
pub mod pubsub;
pub mod replication;
mod server;
pub mod store;
pub mod types;

pub use config::PresenceConfig;
pub use crdt::{Clock, Delta, MergeResult, PresenceCrdt, Record, ReplicaId, ReplicaStatus, Snapshot, Tag};
pub use error::{PresenceError, Result};
pub use owner::{Owner, OwnerHandle, OwnerId};
pub use presence::Presence;
pub use pubsub::{LocalPubSub, PubSub, Subscription, SubscriptionId};
pub use replication::{
    Envelope, Inbox, LocalCluster, LocalTransport, NoopTransport, ReplicationMessage, Transport,
};
pub use types::{
    Meta, PRESENCE_DIFF, PresenceBroadcast, PresenceDiff, PresenceMeta, PresenceRef, PresenceState,
};
