//! Presence configuration.

use crate::error::{PresenceError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for starting a [`Presence`](crate::Presence) tracker.
///
/// Every node of a cluster must use the same `pool_size`, since topics are
/// routed to shards by index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Name of the tracker, used in logs.
    pub name: String,
    /// Name of this node. Peers address the node's replicas by it.
    pub node: String,
    /// Number of shards.
    pub pool_size: usize,
    /// Capacity of each shard's command queue.
    pub mailbox_capacity: usize,
    /// Maximum number of queued commands handled as one batch.
    pub max_batch: usize,
    /// Interval between heartbeats, in milliseconds.
    pub broadcast_period_ms: u64,
    /// A peer silent this long is marked down, in milliseconds.
    pub down_period_ms: u64,
    /// A peer down this long is removed, in milliseconds.
    pub permdown_period_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            name: "presence".to_string(),
            node: "nonode".to_string(),
            pool_size: 1,
            mailbox_capacity: 1024,
            max_batch: 64,
            broadcast_period_ms: 1_500,
            down_period_ms: 30_000,
            permdown_period_ms: 1_200_000,
        }
    }
}

impl PresenceConfig {
    /// Create a configuration for the given node with default settings.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            ..Self::default()
        }
    }

    /// Set the tracker name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the number of shards.
    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set the shard queue capacity.
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Set the maximum batch size.
    pub fn max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Set the heartbeat interval.
    pub fn broadcast_period(mut self, period: Duration) -> Self {
        self.broadcast_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the silence after which a peer is marked down.
    pub fn down_period(mut self, period: Duration) -> Self {
        self.down_period_ms = period.as_millis() as u64;
        self
    }

    /// Set the time after which a down peer is removed.
    pub fn permdown_period(mut self, period: Duration) -> Self {
        self.permdown_period_ms = period.as_millis() as u64;
        self
    }

    /// Heartbeat interval.
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_period_ms)
    }

    /// Silence after which a peer is marked down.
    pub fn down_timeout(&self) -> Duration {
        Duration::from_millis(self.down_period_ms)
    }

    /// Time after which a down peer is removed.
    pub fn permdown_timeout(&self) -> Duration {
        Duration::from_millis(self.permdown_period_ms)
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node.is_empty() {
            return Err(PresenceError::Config("node name must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(PresenceError::Config("pool_size must be at least 1".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(PresenceError::Config(
                "mailbox_capacity must be at least 1".into(),
            ));
        }
        if self.max_batch == 0 {
            return Err(PresenceError::Config("max_batch must be at least 1".into()));
        }
        if self.broadcast_period_ms == 0 {
            return Err(PresenceError::Config(
                "broadcast_period must be positive".into(),
            ));
        }
        if self.down_period_ms <= self.broadcast_period_ms {
            return Err(PresenceError::Config(format!(
                "down_period ({}ms) must exceed broadcast_period ({}ms)",
                self.down_period_ms, self.broadcast_period_ms
            )));
        }
        if self.permdown_period_ms <= self.down_period_ms {
            return Err(PresenceError::Config(format!(
                "permdown_period ({}ms) must exceed down_period ({}ms)",
                self.permdown_period_ms, self.down_period_ms
            )));
        }
        Ok(())
    }
}
