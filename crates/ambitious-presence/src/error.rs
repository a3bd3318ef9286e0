//! Error types for presence operations.

use crate::owner::OwnerId;
use thiserror::Error;

/// Errors returned by the presence API.
///
/// These reflect caller misuse or a stopped tracker and are never retried
/// internally. Replication failures are not surfaced here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    /// The exact (owner, topic, key) triple is already tracked.
    #[error("{owner} is already tracked on {topic} as {key}")]
    AlreadyTracked {
        /// The topic.
        topic: String,
        /// The key.
        key: String,
        /// The owner.
        owner: OwnerId,
    },

    /// No connection exists for the (owner, topic, key) triple.
    #[error("{owner} is not tracked on {topic} as {key}")]
    NotTracked {
        /// The topic.
        topic: String,
        /// The key.
        key: String,
        /// The owner.
        owner: OwnerId,
    },

    /// The owner has already terminated.
    #[error("owner {0} is gone")]
    OwnerGone(OwnerId),

    /// The shard handling the topic is not running.
    #[error("presence shard {0} is not running")]
    ShardDown(usize),

    /// The configuration was rejected.
    #[error("invalid presence configuration: {0}")]
    Config(String),

    /// A replication payload could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<postcard::Error> for PresenceError {
    fn from(e: postcard::Error) -> Self {
        PresenceError::Decode(e.to_string())
    }
}

/// Convenience alias for presence results.
pub type Result<T, E = PresenceError> = std::result::Result<T, E>;
