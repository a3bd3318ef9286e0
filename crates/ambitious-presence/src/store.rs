//! Local entry store.
//!
//! The authoritative table of connections owned by this node, keyed by
//! `(topic, key, owner)`. Every mutation advances the replica clock and yields
//! a tagged [`Record`] that the shard feeds into the replicated state.

use crate::crdt::{Clock, Record, RecordState, ReplicaId, Tag};
use crate::error::{PresenceError, Result};
use crate::owner::OwnerId;
use crate::types::{Meta, PresenceMeta, PresenceRef, PresenceState};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
struct LocalEntry {
    meta: Meta,
    version: u64,
    tag: Tag,
    prev: Option<Tag>,
}

type Triple = (String, String, OwnerId);

/// Per-shard table of locally tracked connections.
pub struct EntryStore {
    replica: ReplicaId,
    clock: Clock,
    entries: HashMap<Triple, LocalEntry>,
    /// Reverse lookup: owner -> (topic, key) pairs for fast untrack_all.
    by_owner: HashMap<OwnerId, BTreeSet<(String, String)>>,
}

impl EntryStore {
    /// Create an empty store for the given replica.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            entries: HashMap::new(),
            by_owner: HashMap::new(),
        }
    }

    /// The current clock.
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Register a new connection.
    pub fn track(
        &mut self,
        owner: &OwnerId,
        topic: &str,
        key: &str,
        meta: Meta,
    ) -> Result<(Record, PresenceRef)> {
        let triple = (topic.to_string(), key.to_string(), owner.clone());
        if self.entries.contains_key(&triple) {
            return Err(PresenceError::AlreadyTracked {
                topic: topic.to_string(),
                key: key.to_string(),
                owner: owner.clone(),
            });
        }

        let tag = self.next_tag();
        let entry = LocalEntry {
            meta,
            version: 1,
            tag,
            prev: None,
        };
        let record = self.record(&triple, &entry);
        self.by_owner
            .entry(owner.clone())
            .or_default()
            .insert((triple.0.clone(), triple.1.clone()));
        self.entries.insert(triple, entry);

        let presence_ref = PresenceRef::from(&record.tag);
        Ok((record, presence_ref))
    }

    /// Replace a connection's metadata with `mutator(old)`.
    pub fn update<F>(
        &mut self,
        owner: &OwnerId,
        topic: &str,
        key: &str,
        mutator: F,
    ) -> Result<(Record, PresenceRef)>
    where
        F: FnOnce(Meta) -> Meta,
    {
        let triple = (topic.to_string(), key.to_string(), owner.clone());
        let Some(current) = self.entries.get(&triple) else {
            return Err(PresenceError::NotTracked {
                topic: topic.to_string(),
                key: key.to_string(),
                owner: owner.clone(),
            });
        };

        let meta = mutator(current.meta.clone());
        let version = current.version + 1;
        let prev = Some(current.tag.clone());
        let entry = LocalEntry {
            meta,
            version,
            prev,
            tag: self.next_tag(),
        };
        let record = self.record(&triple, &entry);
        self.entries.insert(triple, entry);

        let presence_ref = PresenceRef::from(&record.tag);
        Ok((record, presence_ref))
    }

    /// Remove a connection. Returns the removal record, or `None` if absent.
    pub fn untrack(&mut self, owner: &OwnerId, topic: &str, key: &str) -> Option<Record> {
        let triple = (topic.to_string(), key.to_string(), owner.clone());
        self.entries.remove(&triple)?;

        if let Some(keys) = self.by_owner.get_mut(owner) {
            keys.remove(&(triple.0.clone(), triple.1.clone()));
            if keys.is_empty() {
                self.by_owner.remove(owner);
            }
        }
        Some(self.removal(triple))
    }

    /// Remove every connection of an owner.
    pub fn untrack_all(&mut self, owner: &OwnerId) -> Vec<Record> {
        let Some(keys) = self.by_owner.remove(owner) else {
            return Vec::new();
        };

        keys.into_iter()
            .filter_map(|(topic, key)| {
                let triple = (topic, key, owner.clone());
                self.entries.remove(&triple)?;
                Some(self.removal(triple))
            })
            .collect()
    }

    /// Local connections for a topic, grouped by key.
    pub fn list(&self, topic: &str) -> HashMap<String, PresenceState> {
        let mut result: HashMap<String, PresenceState> = HashMap::new();
        for ((t, key, owner), entry) in &self.entries {
            if t != topic {
                continue;
            }
            result.entry(key.clone()).or_default().metas.push(PresenceMeta {
                presence_ref: PresenceRef::from(&entry.tag),
                ref_prev: entry.prev.as_ref().map(PresenceRef::from),
                owner: owner.clone(),
                meta: entry.meta.clone(),
                version: entry.version,
            });
        }
        for state in result.values_mut() {
            state.metas.sort_by(|a, b| a.presence_ref.cmp(&b.presence_ref));
        }
        result
    }

    /// Get the number of local connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_tag(&mut self) -> Tag {
        self.clock += 1;
        Tag::new(self.replica.clone(), self.clock)
    }

    fn record(&self, triple: &Triple, entry: &LocalEntry) -> Record {
        Record {
            topic: triple.0.clone(),
            key: triple.1.clone(),
            owner: triple.2.clone(),
            tag: entry.tag.clone(),
            state: RecordState::Present {
                meta: entry.meta.clone(),
                version: entry.version,
                prev: entry.prev.clone(),
            },
        }
    }

    fn removal(&mut self, (topic, key, owner): Triple) -> Record {
        Record {
            topic,
            key,
            owner,
            tag: self.next_tag(),
            state: RecordState::Removed,
        }
    }
}
