//! Presence types.

use crate::crdt::Tag;
use crate::owner::OwnerId;
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Event name under which diffs are published on the bus.
pub const PRESENCE_DIFF: &str = "presence_diff";

/// Application metadata attached to a connection.
///
/// A mapping of string to JSON value. Human-readable formats see a plain map;
/// binary formats (the replication wire codec) carry it as embedded JSON.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta(Map<String, Value>);

impl Meta {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from any value that serializes to a JSON object.
    ///
    /// Returns `None` when `value` does not serialize to an object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Option<Self> {
        match serde_json::to_value(value).ok()? {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Decode the metadata into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(Value::Object(self.0.clone())).ok()
    }

    /// Set a field, returning the metadata for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }
}

impl Deref for Meta {
    type Target = Map<String, Value>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Meta {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Map<String, Value>> for Meta {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Meta {
    fn from(pairs: [(K, V); N]) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl Serialize for Meta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            self.0.serialize(serializer)
        } else {
            let bytes = serde_json::to_vec(&self.0).map_err(ser::Error::custom)?;
            serializer.serialize_bytes(&bytes)
        }
    }
}

impl<'de> Deserialize<'de> for Meta {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            Map::deserialize(deserializer).map(Self)
        } else {
            deserializer.deserialize_byte_buf(JsonBytes)
        }
    }
}

struct JsonBytes;

impl<'de> Visitor<'de> for JsonBytes {
    type Value = Meta;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JSON-encoded metadata bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Meta, E> {
        serde_json::from_slice(v).map(Meta).map_err(E::custom)
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Meta, E> {
        self.visit_bytes(&v)
    }
}

/// A unique reference for one version of a connection.
///
/// Every track and update produces a new ref, derived from the mutation's tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PresenceRef(String);

impl PresenceRef {
    /// Create a PresenceRef from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the ref as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Tag> for PresenceRef {
    fn from(tag: &Tag) -> Self {
        Self(format!("{}:{}:{}", tag.replica.name, tag.replica.vsn, tag.clock))
    }
}

impl fmt::Display for PresenceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One live connection of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
    /// Reference of this version of the connection.
    pub presence_ref: PresenceRef,
    /// Reference of the version this one replaced, for updates.
    pub ref_prev: Option<PresenceRef>,
    /// The owner of the connection.
    pub owner: OwnerId,
    /// Application metadata.
    pub meta: Meta,
    /// Local version, starting at 1 and bumped by each update.
    pub version: u64,
}

/// Presence state for a single key (e.g., a user).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PresenceState {
    /// All connections for this key.
    /// A user can have multiple presences (e.g., multiple tabs/devices).
    pub metas: Vec<PresenceMeta>,
}

/// A diff representing presence changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PresenceDiff {
    /// Connections that joined, by key.
    pub joins: HashMap<String, PresenceState>,
    /// Connections that left, by key.
    pub leaves: HashMap<String, PresenceState>,
}

impl PresenceDiff {
    /// Check if the diff is empty.
    pub fn is_empty(&self) -> bool {
        self.joins.is_empty() && self.leaves.is_empty()
    }
}

/// A message published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceBroadcast {
    /// The topic the diff applies to.
    pub topic: String,
    /// The event name, always [`PRESENCE_DIFF`].
    pub event: String,
    /// The diff.
    pub payload: PresenceDiff,
}

impl PresenceBroadcast {
    /// Wrap a diff for the given topic.
    pub fn diff(topic: impl Into<String>, payload: PresenceDiff) -> Self {
        Self {
            topic: topic.into(),
            event: PRESENCE_DIFF.to_string(),
            payload,
        }
    }
}
