//! Replication between nodes.
//!
//! Shards exchange [`Envelope`]s: deltas of their own mutations, periodic
//! heartbeats carrying their clock and causal context, and full transfers on
//! request. The [`Transport`] trait is the seam for the actual network; it is
//! fire-and-forget, and nothing it does is ever surfaced to tracker callers.
//!
//! Two transports ship with the crate:
//! - [`NoopTransport`] for single-node deployments, where replication
//!   degenerates to nothing
//! - [`LocalCluster`], an in-memory network for running several nodes in one
//!   process, with partition controls for testing resynchronization

use crate::crdt::{Clock, Delta, ReplicaId, Snapshot};
use crate::error::Result;
use crate::presence::Presence;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Messages exchanged by peer shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationMessage {
    /// The sender's own mutations since its previous delta.
    Delta(Delta),
    /// Periodic liveness and progress announcement.
    Heartbeat {
        /// The sender's clock.
        clock: Clock,
        /// The sender's causal context.
        context: HashMap<ReplicaId, Clock>,
    },
    /// Ask the receiver for a full transfer.
    TransferReq,
    /// Full state, answering a transfer request.
    Transfer(Snapshot),
}

/// A replication message addressed from one shard to its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The sending replica.
    pub from: ReplicaId,
    /// Shard index; only the shard with the same index on the receiver handles it.
    pub shard: usize,
    /// The message.
    pub message: ReplicationMessage,
}

impl Envelope {
    /// Encode for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// Outbound side of the replication network.
pub trait Transport: Send + Sync + 'static {
    /// Send to every other node.
    fn broadcast(&self, envelope: &Envelope);

    /// Send to the node hosting `to`.
    fn send(&self, to: &ReplicaId, envelope: &Envelope);
}

/// Transport for single-node deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransport;

impl Transport for NoopTransport {
    fn broadcast(&self, _envelope: &Envelope) {}

    fn send(&self, _to: &ReplicaId, _envelope: &Envelope) {}
}

/// In-memory network connecting several nodes in one process.
///
/// Messages are encoded with the wire codec on the way through, so the
/// receiving side sees exactly what a real network would deliver.
#[derive(Debug, Clone, Default)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

#[derive(Debug, Default)]
struct ClusterInner {
    nodes: DashMap<String, mpsc::UnboundedSender<Vec<u8>>>,
    isolated: DashSet<String>,
}

impl LocalCluster {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node, returning its transport and inbox.
    ///
    /// Joining again under the same name replaces the previous attachment.
    pub fn join(&self, node: impl Into<String>) -> (LocalTransport, Inbox) {
        let node = node.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.nodes.insert(node.clone(), tx);
        let transport = LocalTransport {
            node,
            cluster: self.clone(),
        };
        (transport, Inbox { rx })
    }

    /// Detach a node. Its inbox pump ends.
    pub fn leave(&self, node: &str) {
        self.inner.nodes.remove(node);
        self.inner.isolated.remove(node);
    }

    /// Drop all traffic to and from `node` until [`heal`](Self::heal).
    pub fn isolate(&self, node: &str) {
        self.inner.isolated.insert(node.to_string());
    }

    /// Restore traffic to and from `node`.
    pub fn heal(&self, node: &str) {
        self.inner.isolated.remove(node);
    }

    fn deliver(&self, from: &str, to: &str, bytes: &[u8]) {
        if self.inner.isolated.contains(from) || self.inner.isolated.contains(to) {
            tracing::trace!(from = %from, to = %to, "Dropping message across partition");
            return;
        }
        if let Some(tx) = self.inner.nodes.get(to)
            && tx.send(bytes.to_vec()).is_err()
        {
            tracing::warn!(from = %from, to = %to, "Replication inbox closed");
        }
    }
}

/// [`Transport`] half of a [`LocalCluster`] attachment.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    node: String,
    cluster: LocalCluster,
}

impl LocalTransport {
    fn encode(&self, envelope: &Envelope) -> Option<Vec<u8>> {
        match envelope.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(node = %self.node, error = %e, "Failed to encode replication message");
                None
            }
        }
    }
}

impl Transport for LocalTransport {
    fn broadcast(&self, envelope: &Envelope) {
        let Some(bytes) = self.encode(envelope) else {
            return;
        };
        let peers: Vec<String> = self
            .cluster
            .inner
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|node| *node != self.node)
            .collect();
        for peer in peers {
            self.cluster.deliver(&self.node, &peer, &bytes);
        }
    }

    fn send(&self, to: &ReplicaId, envelope: &Envelope) {
        if let Some(bytes) = self.encode(envelope) {
            self.cluster.deliver(&self.node, &to.name, &bytes);
        }
    }
}

/// Receiving half of a [`LocalCluster`] attachment.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Inbox {
    /// Feed every received message into `presence` until the node leaves.
    pub fn pump(mut self, presence: Presence) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(bytes) = self.rx.recv().await {
                if let Err(e) = presence.handle_message(&bytes).await {
                    tracing::warn!(error = %e, "Failed to handle replication message");
                }
            }
        })
    }
}
