//! Last-writer-wins map CRDT for presence replication.
//!
//! Every mutation of a connection is a [`Record`] for one
//! `(topic, key, owner)` triple, tagged with the `(replica, clock)` that
//! produced it. Records for the same triple are reconciled independently of
//! every other triple:
//! - a record with a greater `(clock, removed, replica)` rank replaces the
//!   stored one, so a newer add survives an older remove and vice versa
//! - at equal clocks a removal outranks an add (leave wins)
//! - the replica id is the final, deterministic tiebreaker
//!
//! Ranks are totally ordered, so merging is commutative, associative and
//! idempotent. Removals are kept as tombstones until every known peer has
//! acknowledged them, see [`PresenceCrdt::compact`]. A remote record for a
//! triple we hold nothing for is only accepted when its clock is beyond our
//! causal context for its replica; otherwise it was already seen and its
//! successor compacted away.
//!
//! This module is pure: no I/O, no clocks other than the logical ones.

use crate::owner::OwnerId;
use crate::types::{Meta, PresenceMeta, PresenceRef};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical clock for causal ordering.
pub type Clock = u64;

/// A replica identifier: node name plus incarnation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId {
    /// The node name.
    pub name: String,
    /// Incarnation, fixed when the replica starts.
    pub vsn: u64,
}

impl ReplicaId {
    /// Create a replica id for a fresh incarnation of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        let vsn = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();
        Self::with_vsn(name, vsn)
    }

    /// Create a replica id with an explicit incarnation.
    pub fn with_vsn(name: impl Into<String>, vsn: u64) -> Self {
        Self {
            name: name.into(),
            vsn,
        }
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.vsn)
    }
}

/// Unique tag for each mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    /// The replica that produced this mutation.
    pub replica: ReplicaId,
    /// The replica's logical clock at the mutation.
    pub clock: Clock,
}

impl Tag {
    /// Create a new tag.
    pub fn new(replica: ReplicaId, clock: Clock) -> Self {
        Self { replica, clock }
    }
}

/// State carried by a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordState {
    /// The connection is present with this metadata.
    Present {
        /// Application metadata.
        meta: Meta,
        /// Local version of the connection.
        version: u64,
        /// Tag of the version this one replaced.
        prev: Option<Tag>,
    },
    /// The connection was removed.
    Removed,
}

/// One tagged mutation of a `(topic, key, owner)` triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// The topic.
    pub topic: String,
    /// The key within the topic.
    pub key: String,
    /// The owner of the connection.
    pub owner: OwnerId,
    /// The mutation's tag.
    pub tag: Tag,
    /// What the mutation did.
    pub state: RecordState,
}

impl Record {
    /// Whether this record removes the connection.
    pub fn is_removed(&self) -> bool {
        matches!(self.state, RecordState::Removed)
    }

    fn rank(&self) -> (Clock, bool, &ReplicaId) {
        (self.tag.clock, self.is_removed(), &self.tag.replica)
    }

    /// Whether this record wins over `other` for the same triple.
    pub fn supersedes(&self, other: &Record) -> bool {
        self.rank() > other.rank()
    }

    /// The connection as seen by readers, or `None` for a removal.
    pub fn to_meta(&self) -> Option<PresenceMeta> {
        match &self.state {
            RecordState::Present {
                meta,
                version,
                prev,
            } => Some(PresenceMeta {
                presence_ref: PresenceRef::from(&self.tag),
                ref_prev: prev.as_ref().map(PresenceRef::from),
                owner: self.owner.clone(),
                meta: meta.clone(),
                version: *version,
            }),
            RecordState::Removed => None,
        }
    }
}

/// Incremental replication unit: one replica's own mutations in `(start, end]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Clock the sender had already announced before these records.
    pub start: Clock,
    /// Sender's clock after these records.
    pub end: Clock,
    /// The mutations.
    pub records: Vec<Record>,
}

/// Full replica state, used for resynchronization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every stored record, tombstones included.
    pub records: Vec<Record>,
    /// The sender's causal context.
    pub context: HashMap<ReplicaId, Clock>,
}

/// Replica status for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicaStatus {
    /// Replica is up and its entries should be visible.
    #[default]
    Up,
    /// Replica is unreachable; its entries are hidden.
    Down,
}

/// Result of merging remote state.
#[derive(Debug, Default)]
pub struct MergeResult {
    /// Topics whose visible state may have changed.
    pub topics: BTreeSet<String>,
    /// Records that replaced a record from a different replica.
    pub conflicts: Vec<Conflict>,
    /// The delta skipped clocks we have not seen; a transfer is needed.
    pub gap: bool,
    /// The sender was an outdated incarnation and was ignored.
    pub stale: bool,
}

/// A concurrent update reconciled by the merge rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    /// The topic.
    pub topic: String,
    /// The key.
    pub key: String,
    /// The owner.
    pub owner: OwnerId,
    /// Tag that won.
    pub winner: Tag,
    /// Tag that lost.
    pub loser: Tag,
}

enum Applied {
    Unchanged,
    Changed(Option<Conflict>),
}

/// Replicated presence state for one shard.
pub struct PresenceCrdt {
    /// Our replica.
    replica: ReplicaId,
    /// Causal context: clock up to which each replica's mutations are known.
    context: HashMap<ReplicaId, Clock>,
    /// Records indexed by topic, then by (key, owner).
    values: HashMap<String, HashMap<(String, OwnerId), Record>>,
    /// Replica status for filtering.
    replicas: HashMap<ReplicaId, ReplicaStatus>,
    /// Newest known incarnation per node name.
    incarnations: HashMap<String, u64>,
    /// Context last reported by each peer, for tombstone compaction.
    acks: HashMap<ReplicaId, HashMap<ReplicaId, Clock>>,
}

impl PresenceCrdt {
    /// Create new state for the given replica.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            context: HashMap::from([(replica.clone(), 0)]),
            incarnations: HashMap::from([(replica.name.clone(), replica.vsn)]),
            replica,
            values: HashMap::new(),
            replicas: HashMap::new(),
            acks: HashMap::new(),
        }
    }

    /// Get our replica.
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Get current causal context.
    pub fn context(&self) -> &HashMap<ReplicaId, Clock> {
        &self.context
    }

    /// Clock up to which `replica`'s mutations are known.
    pub fn seen(&self, replica: &ReplicaId) -> Clock {
        self.context.get(replica).copied().unwrap_or(0)
    }

    /// Apply a mutation produced by our own entry store.
    pub fn apply_local(&mut self, record: Record) -> bool {
        let clock = record.tag.clock;
        let changed = matches!(self.apply(record), Applied::Changed(_));
        let seen = self.context.entry(self.replica.clone()).or_insert(0);
        *seen = (*seen).max(clock);
        changed
    }

    /// Merge a delta produced by `from`.
    ///
    /// Records are applied even when the delta does not line up with our
    /// context; only the context advance is withheld, and `gap` is set so the
    /// caller can request a transfer.
    pub fn merge_delta(&mut self, from: &ReplicaId, delta: &Delta) -> MergeResult {
        let mut result = MergeResult::default();
        if !self.observe(from, &mut result) {
            return result;
        }

        for record in &delta.records {
            self.merge_record(record, &mut result);
        }

        let seen = self.seen(from);
        if delta.start <= seen {
            self.context.insert(from.clone(), seen.max(delta.end));
        } else {
            result.gap = true;
        }
        result
    }

    /// Merge a full snapshot produced by `from`.
    pub fn merge_snapshot(&mut self, from: &ReplicaId, snapshot: &Snapshot) -> MergeResult {
        let mut result = MergeResult::default();
        if !self.observe(from, &mut result) {
            return result;
        }

        // The sender is authoritative for its own mutations: records of its
        // that it no longer carries were removed and compacted away.
        let carried: HashSet<(&str, &str, &OwnerId)> = snapshot
            .records
            .iter()
            .map(|r| (r.topic.as_str(), r.key.as_str(), &r.owner))
            .collect();
        let covered = snapshot.context.get(from).copied().unwrap_or(0);
        for (topic, entries) in self.values.iter_mut() {
            entries.retain(|(key, owner), record| {
                let compacted = record.tag.replica == *from
                    && record.tag.clock <= covered
                    && !carried.contains(&(topic.as_str(), key.as_str(), owner));
                if compacted && !record.is_removed() {
                    result.topics.insert(topic.clone());
                }
                !compacted
            });
        }
        self.values.retain(|_, entries| !entries.is_empty());

        for record in &snapshot.records {
            self.merge_record(record, &mut result);
        }

        for (replica, &clock) in &snapshot.context {
            if self.is_stale(replica) {
                continue;
            }
            let seen = self.context.entry(replica.clone()).or_insert(0);
            *seen = (*seen).max(clock);
        }
        self.acks.insert(from.clone(), snapshot.context.clone());
        result
    }

    /// Full state for a transfer.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            records: self
                .values
                .values()
                .flat_map(|entries| entries.values().cloned())
                .collect(),
            context: self.context.clone(),
        }
    }

    /// Register the context a peer reported, for compaction.
    pub fn record_ack(&mut self, peer: &ReplicaId, context: HashMap<ReplicaId, Clock>) {
        if !self.is_stale(peer) {
            self.acks.insert(peer.clone(), context);
        }
    }

    /// Handle a heartbeat from `from` announcing its clock and context.
    ///
    /// The sender is marked up and its context recorded for compaction.
    /// `gap` is set when the sender has mutations we have not seen.
    pub fn heartbeat(
        &mut self,
        from: &ReplicaId,
        clock: Clock,
        context: HashMap<ReplicaId, Clock>,
    ) -> MergeResult {
        let mut result = MergeResult::default();
        if !self.observe(from, &mut result) {
            return result;
        }
        result.gap = clock > self.seen(from);
        self.acks.insert(from.clone(), context);
        result
    }

    /// Visible connections for a topic, grouped by key.
    ///
    /// Keys without visible connections are omitted. Connections are ordered
    /// by tag for a stable presentation.
    pub fn list(&self, topic: &str) -> HashMap<String, Vec<PresenceMeta>> {
        let mut result: HashMap<String, Vec<&Record>> = HashMap::new();

        if let Some(entries) = self.values.get(topic) {
            for ((key, _), record) in entries {
                if record.is_removed() || !self.is_replica_up(&record.tag.replica) {
                    continue;
                }
                result.entry(key.clone()).or_default().push(record);
            }
        }

        result
            .into_iter()
            .map(|(key, mut records)| {
                records.sort_by(|a, b| a.tag.cmp(&b.tag));
                let metas = records.into_iter().filter_map(Record::to_meta).collect();
                (key, metas)
            })
            .collect()
    }

    /// The stored record for a triple, tombstones included.
    pub fn get(&self, topic: &str, key: &str, owner: &OwnerId) -> Option<&Record> {
        self.values
            .get(topic)
            .and_then(|entries| entries.get(&(key.to_string(), owner.clone())))
    }

    /// Mark replica as up. Returns topics whose visible state changed.
    pub fn replica_up(&mut self, replica: &ReplicaId) -> BTreeSet<String> {
        match self.replicas.insert(replica.clone(), ReplicaStatus::Up) {
            Some(ReplicaStatus::Down) => self.topics_of(replica),
            _ => BTreeSet::new(),
        }
    }

    /// Mark replica as down. Returns topics whose visible state changed.
    pub fn replica_down(&mut self, replica: &ReplicaId) -> BTreeSet<String> {
        match self.replicas.insert(replica.clone(), ReplicaStatus::Down) {
            Some(ReplicaStatus::Down) => BTreeSet::new(),
            _ => self.topics_of(replica),
        }
    }

    /// Remove all records and bookkeeping of a replica.
    ///
    /// When no other incarnation of its node remains known, the node's
    /// incarnation is forgotten too, so a later restart is accepted whatever
    /// its `vsn`. Returns topics whose visible state changed.
    pub fn remove_replica(&mut self, replica: &ReplicaId) -> BTreeSet<String> {
        let topics = self.purge_replica(replica);
        let known = self
            .context
            .keys()
            .chain(self.replicas.keys())
            .any(|r| r.name == replica.name);
        if !known && replica.name != self.replica.name {
            self.incarnations.remove(&replica.name);
        }
        topics
    }

    fn purge_replica(&mut self, replica: &ReplicaId) -> BTreeSet<String> {
        let was_visible = self.is_replica_up(replica);
        let mut topics = BTreeSet::new();

        for (topic, entries) in self.values.iter_mut() {
            entries.retain(|_, record| {
                if record.tag.replica != *replica {
                    return true;
                }
                if was_visible && !record.is_removed() {
                    topics.insert(topic.clone());
                }
                false
            });
        }
        self.values.retain(|_, entries| !entries.is_empty());

        self.replicas.remove(replica);
        self.context.remove(replica);
        self.acks.remove(replica);
        for context in self.acks.values_mut() {
            context.remove(replica);
        }
        topics
    }

    /// Check if a replica is considered up.
    pub fn is_replica_up(&self, replica: &ReplicaId) -> bool {
        // If we don't know about the replica, assume it's up
        !matches!(self.replicas.get(replica), Some(ReplicaStatus::Down))
    }

    /// Replicas other than ourselves that we have heard from.
    pub fn peers(&self) -> impl Iterator<Item = (&ReplicaId, ReplicaStatus)> {
        self.replicas
            .iter()
            .filter(|(replica, _)| **replica != self.replica)
            .map(|(replica, status)| (replica, *status))
    }

    /// Drop tombstones every known peer has acknowledged.
    ///
    /// A tombstone tagged `(r, c)` is dropped once our own context and the
    /// context each peer reported reach at least `c` for `r`. Returns the
    /// number dropped.
    pub fn compact(&mut self) -> usize {
        let mut peers = Vec::new();
        for replica in self.replicas.keys().filter(|r| **r != self.replica) {
            match self.acks.get(replica) {
                Some(context) => peers.push(context),
                None => return 0,
            }
        }

        let context = &self.context;
        let mut dropped = 0;
        for entries in self.values.values_mut() {
            entries.retain(|_, record| {
                let acked = record.is_removed()
                    && std::iter::once(context).chain(peers.iter().copied()).all(|ctx| {
                        ctx.get(&record.tag.replica).copied().unwrap_or(0) >= record.tag.clock
                    });
                if acked {
                    dropped += 1;
                }
                !acked
            });
        }
        self.values.retain(|_, entries| !entries.is_empty());
        dropped
    }

    /// Get the number of visible connections.
    pub fn len(&self) -> usize {
        self.values
            .values()
            .flat_map(|entries| entries.values())
            .filter(|r| !r.is_removed() && self.is_replica_up(&r.tag.replica))
            .count()
    }

    /// Check if there are no visible connections.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored tombstones.
    pub fn tombstones(&self) -> usize {
        self.values
            .values()
            .flat_map(|entries| entries.values())
            .filter(|r| r.is_removed())
            .count()
    }

    /// Note that `from` is alive, handling incarnation changes.
    ///
    /// Returns `false` when `from` is an outdated incarnation.
    fn observe(&mut self, from: &ReplicaId, result: &mut MergeResult) -> bool {
        if self.is_stale(from) {
            result.stale = true;
            return false;
        }
        if *from != self.replica {
            result.topics.extend(self.adopt_incarnation(from));
            result.topics.extend(self.replica_up(from));
        }
        true
    }

    fn merge_record(&mut self, record: &Record, result: &mut MergeResult) {
        if self.is_stale(&record.tag.replica) {
            return;
        }
        if record.tag.replica != self.replica {
            result.topics.extend(self.adopt_incarnation(&record.tag.replica));
            self.replicas
                .entry(record.tag.replica.clone())
                .or_default();
        }
        let topic = record.topic.clone();
        // Dominated by our context with nothing stored: a compacted removal
        // already superseded it.
        let dominated = record.tag.clock <= self.seen(&record.tag.replica);
        if dominated && self.get(&record.topic, &record.key, &record.owner).is_none() {
            return;
        }
        if let Applied::Changed(conflict) = self.apply(record.clone()) {
            result.topics.insert(topic);
            result.conflicts.extend(conflict);
        }
    }

    fn apply(&mut self, record: Record) -> Applied {
        let entries = self.values.entry(record.topic.clone()).or_default();
        let slot = (record.key.clone(), record.owner.clone());

        let conflict = match entries.get(&slot) {
            Some(existing) if !record.supersedes(existing) => return Applied::Unchanged,
            Some(existing) if existing.tag.replica != record.tag.replica => Some(Conflict {
                topic: record.topic.clone(),
                key: record.key.clone(),
                owner: record.owner.clone(),
                winner: record.tag.clone(),
                loser: existing.tag.clone(),
            }),
            _ => None,
        };

        entries.insert(slot, record);
        Applied::Changed(conflict)
    }

    fn is_stale(&self, replica: &ReplicaId) -> bool {
        self.incarnations
            .get(&replica.name)
            .is_some_and(|&vsn| replica.vsn < vsn)
    }

    /// Record `replica` as the newest incarnation of its name, purging older ones.
    fn adopt_incarnation(&mut self, replica: &ReplicaId) -> BTreeSet<String> {
        let known = self.incarnations.get(&replica.name).copied();
        if known.is_some_and(|vsn| vsn >= replica.vsn) {
            return BTreeSet::new();
        }
        self.incarnations.insert(replica.name.clone(), replica.vsn);

        let outdated: Vec<ReplicaId> = self
            .context
            .keys()
            .chain(self.replicas.keys())
            .filter(|r| r.name == replica.name && r.vsn < replica.vsn)
            .cloned()
            .collect();
        let mut topics = BTreeSet::new();
        for old in outdated {
            topics.extend(self.purge_replica(&old));
        }
        topics
    }

    fn topics_of(&self, replica: &ReplicaId) -> BTreeSet<String> {
        self.values
            .iter()
            .filter(|(_, entries)| {
                entries
                    .values()
                    .any(|r| r.tag.replica == *replica && !r.is_removed())
            })
            .map(|(topic, _)| topic.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn replica(name: &str) -> ReplicaId {
        ReplicaId::with_vsn(name, 1)
    }

    fn owner(node: &str, id: u64) -> OwnerId {
        OwnerId::from_parts(node, id)
    }

    fn present(topic: &str, key: &str, owner: OwnerId, tag: Tag) -> Record {
        Record {
            topic: topic.into(),
            key: key.into(),
            owner,
            tag,
            state: RecordState::Present {
                meta: Meta::new(),
                version: 1,
                prev: None,
            },
        }
    }

    fn removed(topic: &str, key: &str, owner: OwnerId, tag: Tag) -> Record {
        Record {
            topic: topic.into(),
            key: key.into(),
            owner,
            tag,
            state: RecordState::Removed,
        }
    }

    /// A replica that produces its own tagged records, like an entry store.
    struct Source {
        crdt: PresenceCrdt,
        clock: Clock,
        node: String,
        live: HashSet<(String, String, u64)>,
    }

    impl Source {
        fn new(name: &str) -> Self {
            Self {
                crdt: PresenceCrdt::new(replica(name)),
                clock: 0,
                node: name.to_string(),
                live: HashSet::new(),
            }
        }

        fn next_tag(&mut self) -> Tag {
            self.clock += 1;
            Tag::new(self.crdt.replica().clone(), self.clock)
        }

        fn apply(&mut self, op: &CrdtOp) {
            match op {
                CrdtOp::Track { topic, key, owner_id } => {
                    if self.live.insert((topic.clone(), key.clone(), *owner_id)) {
                        let tag = self.next_tag();
                        let owner = owner(&self.node, *owner_id);
                        self.crdt.apply_local(present(topic, key, owner, tag));
                    }
                }
                CrdtOp::Untrack { topic, key, owner_id } => {
                    if self.live.remove(&(topic.clone(), key.clone(), *owner_id)) {
                        let tag = self.next_tag();
                        let owner = owner(&self.node, *owner_id);
                        self.crdt.apply_local(removed(topic, key, owner, tag));
                    }
                }
            }
        }
    }

    // =========================================================================
    // Strategies for property-based tests
    // =========================================================================

    #[derive(Debug, Clone)]
    enum CrdtOp {
        Track {
            topic: String,
            key: String,
            owner_id: u64,
        },
        Untrack {
            topic: String,
            key: String,
            owner_id: u64,
        },
    }

    fn arb_topic() -> impl Strategy<Value = String> {
        "room:[a-c]"
    }

    fn arb_key() -> impl Strategy<Value = String> {
        "user:[0-3]"
    }

    fn arb_crdt_op() -> impl Strategy<Value = CrdtOp> {
        prop_oneof![
            3 => (arb_topic(), arb_key(), 0u64..4)
                .prop_map(|(topic, key, owner_id)| CrdtOp::Track { topic, key, owner_id }),
            2 => (arb_topic(), arb_key(), 0u64..4)
                .prop_map(|(topic, key, owner_id)| CrdtOp::Untrack { topic, key, owner_id }),
        ]
    }

    fn arb_ops(max_len: usize) -> impl Strategy<Value = Vec<CrdtOp>> {
        prop::collection::vec(arb_crdt_op(), 0..max_len)
    }

    /// Every stored record, as a comparable set.
    fn records(crdt: &PresenceCrdt) -> HashSet<(String, String, OwnerId, Tag, bool)> {
        crdt.values
            .values()
            .flat_map(|entries| entries.values())
            .map(|r| {
                (
                    r.topic.clone(),
                    r.key.clone(),
                    r.owner.clone(),
                    r.tag.clone(),
                    r.is_removed(),
                )
            })
            .collect()
    }

    /// Apply `ops` on node1, keeping the delta and the snapshot after each mutation.
    fn history(ops: &[CrdtOp]) -> (Source, Vec<Delta>, Vec<Snapshot>) {
        let mut src = Source::new("node1");
        let mut deltas = Vec::new();
        let mut snapshots = Vec::new();
        for op in ops {
            let before = src.clock;
            src.apply(op);
            if src.clock > before {
                let records: Vec<Record> = src.crdt.values.values()
                    .flat_map(|e| e.values())
                    .filter(|r| r.tag.clock == src.clock)
                    .cloned()
                    .collect();
                deltas.push(Delta { start: before, end: src.clock, records });
                snapshots.push(src.crdt.snapshot());
            }
        }
        (src, deltas, snapshots)
    }

    fn visible(crdt: &PresenceCrdt) -> Vec<HashMap<String, Vec<PresenceMeta>>> {
        ["room:a", "room:b", "room:c"].iter().map(|t| crdt.list(t)).collect()
    }

    proptest! {
        /// Property: Merge is commutative - order of merging snapshots doesn't matter
        #[test]
        fn prop_merge_is_commutative(ops1 in arb_ops(12), ops2 in arb_ops(12)) {
            let mut src1 = Source::new("node1");
            let mut src2 = Source::new("node2");
            ops1.iter().for_each(|op| src1.apply(op));
            ops2.iter().for_each(|op| src2.apply(op));

            let (s1, s2) = (src1.crdt.snapshot(), src2.crdt.snapshot());
            let (r1, r2) = (replica("node1"), replica("node2"));

            let mut target_a = PresenceCrdt::new(replica("node_a"));
            let mut target_b = PresenceCrdt::new(replica("node_b"));
            target_a.merge_snapshot(&r1, &s1);
            target_a.merge_snapshot(&r2, &s2);
            target_b.merge_snapshot(&r2, &s2);
            target_b.merge_snapshot(&r1, &s1);

            prop_assert_eq!(records(&target_a), records(&target_b));
        }

        /// Property: Merge is idempotent - merging the same snapshot N times equals once
        #[test]
        fn prop_merge_is_idempotent(ops in arb_ops(12), times in 2usize..5) {
            let mut src = Source::new("node1");
            ops.iter().for_each(|op| src.apply(op));
            let snapshot = src.crdt.snapshot();
            let from = replica("node1");

            let mut once = PresenceCrdt::new(replica("node2"));
            once.merge_snapshot(&from, &snapshot);

            let mut many = PresenceCrdt::new(replica("node2"));
            for _ in 0..times {
                many.merge_snapshot(&from, &snapshot);
            }

            prop_assert_eq!(records(&once), records(&many));
            prop_assert_eq!(once.context(), many.context());
        }

        /// Property: Out-of-order delivery of single-record deltas converges
        #[test]
        fn prop_delta_order_does_not_matter(ops in arb_ops(12), seed in any::<u64>()) {
            let mut src = Source::new("node1");
            let mut deltas = Vec::new();
            for op in &ops {
                let before = src.clock;
                src.apply(op);
                if src.clock > before {
                    let records: Vec<Record> = src.crdt.values.values()
                        .flat_map(|e| e.values())
                        .filter(|r| r.tag.clock == src.clock)
                        .cloned()
                        .collect();
                    deltas.push(Delta { start: before, end: src.clock, records });
                }
            }
            let from = replica("node1");

            let mut in_order = PresenceCrdt::new(replica("node2"));
            for delta in &deltas {
                in_order.merge_delta(&from, delta);
            }

            let mut shuffled = deltas.clone();
            let len = shuffled.len();
            if len > 1 {
                for i in 0..len {
                    let j = (seed.wrapping_mul(i as u64 + 1) % len as u64) as usize;
                    shuffled.swap(i, j);
                }
            }
            let mut out_of_order = PresenceCrdt::new(replica("node3"));
            for delta in &shuffled {
                out_of_order.merge_delta(&from, delta);
            }

            prop_assert_eq!(records(&in_order), records(&out_of_order));
            prop_assert_eq!(records(&in_order), records(&src.crdt));
        }

        /// Property: Any sequence of operations on multiple nodes converges
        #[test]
        fn prop_operations_converge(
            ops1 in arb_ops(10),
            ops2 in arb_ops(10),
            ops3 in arb_ops(10),
        ) {
            let mut nodes = [Source::new("node1"), Source::new("node2"), Source::new("node3")];
            for (node, ops) in nodes.iter_mut().zip([&ops1, &ops2, &ops3]) {
                ops.iter().for_each(|op| node.apply(op));
            }

            let snapshots: Vec<(ReplicaId, Snapshot)> = nodes
                .iter()
                .map(|n| (n.crdt.replica().clone(), n.crdt.snapshot()))
                .collect();
            for node in nodes.iter_mut() {
                for (from, snapshot) in &snapshots {
                    if from != node.crdt.replica() {
                        node.crdt.merge_snapshot(from, snapshot);
                    }
                }
            }

            let lists: Vec<_> = nodes.iter().map(|n| records(&n.crdt)).collect();
            prop_assert_eq!(&lists[0], &lists[1], "node1 and node2 should converge");
            prop_assert_eq!(&lists[1], &lists[2], "node2 and node3 should converge");
        }

        /// Property: Compaction interleaved with reordered, duplicated and stale
        /// deliveries converges, and late traffic never revives a removal
        #[test]
        fn prop_compaction_with_reordered_delivery_converges(
            ops in arb_ops(16),
            events in prop::collection::vec((0u8..3, any::<prop::sample::Index>()), 0..40),
        ) {
            let (mut src, deltas, snapshots) = history(&ops);
            let from = replica("node1");
            let to = replica("node2");
            let mut receiver = PresenceCrdt::new(to.clone());

            for (kind, index) in &events {
                match *kind {
                    0 if !deltas.is_empty() => {
                        receiver.merge_delta(&from, &deltas[index.index(deltas.len())]);
                    }
                    1 if !snapshots.is_empty() => {
                        receiver.merge_snapshot(&from, &snapshots[index.index(snapshots.len())]);
                    }
                    _ => {
                        receiver.heartbeat(&from, src.clock, src.crdt.context().clone());
                        receiver.compact();
                    }
                }
            }

            src.crdt.heartbeat(&to, 0, receiver.context().clone());
            src.crdt.compact();
            receiver.merge_snapshot(&from, &src.crdt.snapshot());
            receiver.heartbeat(&from, src.clock, src.crdt.context().clone());
            receiver.compact();
            prop_assert_eq!(visible(&receiver), visible(&src.crdt));

            for delta in &deltas {
                receiver.merge_delta(&from, delta);
            }
            for snapshot in &snapshots {
                receiver.merge_snapshot(&from, snapshot);
            }
            prop_assert_eq!(visible(&receiver), visible(&src.crdt), "late traffic changed the view");
        }

        /// Property: list never contains a key with an empty connection list
        #[test]
        fn prop_list_omits_empty_keys(ops in arb_ops(20)) {
            let mut src = Source::new("node1");
            ops.iter().for_each(|op| src.apply(op));
            for topic in ["room:a", "room:b", "room:c"] {
                for (_, metas) in src.crdt.list(topic) {
                    prop_assert!(!metas.is_empty());
                }
            }
        }
    }

    // =========================================================================
    // Unit tests
    // =========================================================================

    #[test]
    fn test_newer_add_survives_older_leave() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let o = owner("node1", 1);

        let add = present("room:1", "u1", o.clone(), Tag::new(from.clone(), 3));
        let leave = removed("room:1", "u1", o, Tag::new(from.clone(), 2));

        crdt.merge_delta(&from, &Delta { start: 0, end: 3, records: vec![add] });
        crdt.merge_delta(&from, &Delta { start: 0, end: 2, records: vec![leave] });

        assert_eq!(crdt.list("room:1")["u1"].len(), 1);
    }

    #[test]
    fn test_leave_beats_stale_join() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let o = owner("node1", 1);

        let leave = removed("room:1", "u1", o.clone(), Tag::new(from.clone(), 2));
        let add = present("room:1", "u1", o, Tag::new(from.clone(), 1));

        crdt.merge_delta(&from, &Delta { start: 1, end: 2, records: vec![leave] });
        crdt.merge_delta(&from, &Delta { start: 0, end: 1, records: vec![add] });

        assert!(crdt.list("room:1").is_empty());
        assert_eq!(crdt.tombstones(), 1);
    }

    #[test]
    fn test_concurrent_same_triple_is_last_writer_wins() {
        // Two replicas write the same (topic, key, owner) concurrently.
        let o = owner("node1", 1);
        let a = present("room:1", "u1", o.clone(), Tag::new(replica("node1"), 5));
        let mut b = present("room:1", "u1", o, Tag::new(replica("node2"), 5));
        if let RecordState::Present { meta, .. } = &mut b.state {
            meta.insert("from".into(), "node2".into());
        }

        assert!(b.supersedes(&a), "replica id breaks clock ties");
        assert!(!a.supersedes(&b));

        let mut left = PresenceCrdt::new(replica("node3"));
        let mut result = left.merge_delta(&replica("node1"), &Delta { start: 0, end: 5, records: vec![a.clone()] });
        assert!(result.conflicts.is_empty());
        result = left.merge_delta(&replica("node2"), &Delta { start: 0, end: 5, records: vec![b.clone()] });
        assert_eq!(result.conflicts.len(), 1);

        let mut right = PresenceCrdt::new(replica("node4"));
        right.merge_delta(&replica("node2"), &Delta { start: 0, end: 5, records: vec![b] });
        right.merge_delta(&replica("node1"), &Delta { start: 0, end: 5, records: vec![a] });

        assert_eq!(left.list("room:1"), right.list("room:1"));
        assert_eq!(left.list("room:1")["u1"][0].meta.get("from"), Some(&"node2".into()));
    }

    #[test]
    fn test_removal_wins_clock_tie() {
        let o = owner("node1", 1);
        let add = present("room:1", "u1", o.clone(), Tag::new(replica("node2"), 4));
        let leave = removed("room:1", "u1", o, Tag::new(replica("node1"), 4));
        assert!(leave.supersedes(&add));
    }

    #[test]
    fn test_delta_gap_is_reported() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(from.clone(), 5));

        let result = crdt.merge_delta(&from, &Delta { start: 4, end: 5, records: vec![add] });
        assert!(result.gap);
        assert_eq!(crdt.seen(&from), 0);
        // The record itself is still applied.
        assert_eq!(crdt.len(), 1);
    }

    #[test]
    fn test_contiguous_delta_advances_context() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(from.clone(), 1));

        let result = crdt.merge_delta(&from, &Delta { start: 0, end: 1, records: vec![add] });
        assert!(!result.gap);
        assert_eq!(crdt.seen(&from), 1);
        assert!(result.topics.contains("room:1"));
    }

    #[test]
    fn test_replica_up_down_filtering() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(from.clone(), 1));
        crdt.merge_delta(&from, &Delta { start: 0, end: 1, records: vec![add] });

        let hidden = crdt.replica_down(&from);
        assert!(hidden.contains("room:1"));
        assert!(crdt.list("room:1").is_empty());
        assert!(crdt.replica_down(&from).is_empty(), "already down");

        let shown = crdt.replica_up(&from);
        assert!(shown.contains("room:1"));
        assert_eq!(crdt.list("room:1").len(), 1);
    }

    #[test]
    fn test_remove_replica_drops_records() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(from.clone(), 1));
        crdt.merge_delta(&from, &Delta { start: 0, end: 1, records: vec![add] });

        let topics = crdt.remove_replica(&from);
        assert!(topics.contains("room:1"));
        assert!(crdt.is_empty());
        assert_eq!(crdt.seen(&from), 0);
    }

    #[test]
    fn test_new_incarnation_purges_old() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let old = ReplicaId::with_vsn("node1", 1);
        let new = ReplicaId::with_vsn("node1", 2);
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(old.clone(), 7));
        crdt.merge_delta(&old, &Delta { start: 0, end: 7, records: vec![add.clone()] });
        assert_eq!(crdt.len(), 1);

        let result = crdt.merge_delta(&new, &Delta::default());
        assert!(result.topics.contains("room:1"));
        assert!(crdt.is_empty());

        // Late traffic from the old incarnation is ignored.
        let result = crdt.merge_delta(&old, &Delta { start: 0, end: 7, records: vec![add] });
        assert!(result.stale);
        assert!(crdt.is_empty());
    }

    #[test]
    fn test_compact_waits_for_every_peer() {
        let mut crdt = PresenceCrdt::new(replica("node1"));
        let me = replica("node1");
        let o = owner("node1", 1);
        crdt.apply_local(present("room:1", "u1", o.clone(), Tag::new(me.clone(), 1)));
        crdt.apply_local(removed("room:1", "u1", o, Tag::new(me.clone(), 2)));

        let peer_a = replica("node2");
        let peer_b = replica("node3");
        crdt.merge_delta(&peer_a, &Delta::default());
        crdt.merge_delta(&peer_b, &Delta::default());

        crdt.record_ack(&peer_a, HashMap::from([(me.clone(), 2)]));
        assert_eq!(crdt.compact(), 0, "node3 has not acknowledged yet");

        crdt.record_ack(&peer_b, HashMap::from([(me.clone(), 1)]));
        assert_eq!(crdt.compact(), 0, "node3 is behind the removal");

        crdt.record_ack(&peer_b, HashMap::from([(me, 2)]));
        assert_eq!(crdt.compact(), 1);
        assert_eq!(crdt.tombstones(), 0);
    }

    #[test]
    fn test_heartbeat_reports_unseen_clock_and_revives_replica() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let from = replica("node1");
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(from.clone(), 1));
        crdt.merge_delta(&from, &Delta { start: 0, end: 1, records: vec![add] });

        let result = crdt.heartbeat(&from, 1, HashMap::new());
        assert!(!result.gap);

        crdt.replica_down(&from);
        assert!(crdt.is_empty());
        let result = crdt.heartbeat(&from, 3, HashMap::new());
        assert!(result.gap);
        assert!(result.topics.contains("room:1"));
        assert_eq!(crdt.len(), 1);
    }

    #[test]
    fn test_snapshot_drops_compacted_records_of_sender() {
        let from = replica("node1");
        let o = owner("node1", 1);
        let mut sender = PresenceCrdt::new(from.clone());
        let add = present("room:1", "u1", o.clone(), Tag::new(from.clone(), 1));
        sender.apply_local(add.clone());
        sender.apply_local(removed("room:1", "u1", o, Tag::new(from.clone(), 2)));
        assert_eq!(sender.compact(), 1);

        let mut receiver = PresenceCrdt::new(replica("node2"));
        receiver.merge_delta(&from, &Delta { start: 0, end: 1, records: vec![add] });
        assert_eq!(receiver.len(), 1);

        let result = receiver.merge_snapshot(&from, &sender.snapshot());
        assert!(result.topics.contains("room:1"));
        assert!(receiver.is_empty());
        assert_eq!(receiver.seen(&from), 2);
    }

    #[test]
    fn test_compact_without_peers() {
        let mut crdt = PresenceCrdt::new(replica("node1"));
        let me = replica("node1");
        let o = owner("node1", 1);
        crdt.apply_local(present("room:1", "u1", o.clone(), Tag::new(me.clone(), 1)));
        crdt.apply_local(removed("room:1", "u1", o, Tag::new(me, 2)));
        assert_eq!(crdt.compact(), 1);
    }

    #[test]
    fn test_list_is_sorted_by_tag() {
        let mut crdt = PresenceCrdt::new(replica("node1"));
        let me = replica("node1");
        crdt.apply_local(present("room:1", "u1", owner("node1", 2), Tag::new(me.clone(), 2)));
        crdt.apply_local(present("room:1", "u1", owner("node1", 1), Tag::new(me, 1)));

        let metas = &crdt.list("room:1")["u1"];
        assert_eq!(metas[0].owner, owner("node1", 1));
        assert_eq!(metas[1].owner, owner("node1", 2));
    }

    #[test]
    fn test_late_traffic_after_compaction_does_not_resurrect() {
        let a_id = replica("node1");
        let b_id = replica("node2");
        let o = owner("node1", 1);
        let add = present("room:1", "u1", o.clone(), Tag::new(a_id.clone(), 1));
        let leave = removed("room:1", "u1", o, Tag::new(a_id.clone(), 2));

        let mut a = PresenceCrdt::new(a_id.clone());
        a.apply_local(add.clone());
        a.apply_local(leave.clone());

        let mut b = PresenceCrdt::new(b_id.clone());
        let result = b.merge_delta(&a_id, &Delta { start: 1, end: 2, records: vec![leave] });
        assert!(result.gap);
        b.merge_snapshot(&a_id, &a.snapshot());

        a.heartbeat(&b_id, 0, b.context().clone());
        b.heartbeat(&a_id, 2, a.context().clone());
        assert_eq!(a.compact(), 1);
        assert_eq!(b.compact(), 1);

        b.merge_delta(&a_id, &Delta { start: 0, end: 1, records: vec![add.clone()] });
        assert!(b.list("room:1").is_empty());

        let stale = Snapshot {
            records: vec![add],
            context: HashMap::from([(a_id.clone(), 1)]),
        };
        b.merge_snapshot(&a_id, &stale);
        assert!(b.list("room:1").is_empty());
        assert_eq!(a.list("room:1"), b.list("room:1"));
    }

    #[test]
    fn test_compact_keeps_tombstones_beyond_own_context() {
        let a_id = replica("node1");
        let o = owner("node1", 1);
        let add = present("room:1", "u1", o.clone(), Tag::new(a_id.clone(), 1));
        let leave = removed("room:1", "u1", o, Tag::new(a_id.clone(), 2));

        let mut b = PresenceCrdt::new(replica("node2"));
        b.merge_delta(&a_id, &Delta { start: 1, end: 2, records: vec![leave] });
        b.heartbeat(&a_id, 2, HashMap::from([(a_id.clone(), 2)]));
        assert_eq!(b.compact(), 0, "the add at clock 1 has not been seen yet");

        b.merge_delta(&a_id, &Delta { start: 0, end: 1, records: vec![add] });
        assert!(b.list("room:1").is_empty());
        assert_eq!(b.seen(&a_id), 1);
        assert_eq!(b.compact(), 0);

        b.heartbeat(&a_id, 2, HashMap::from([(a_id.clone(), 2)]));
        b.merge_snapshot(
            &a_id,
            &Snapshot { records: Vec::new(), context: HashMap::from([(a_id.clone(), 2)]) },
        );
        assert_eq!(b.tombstones(), 0, "the sender no longer carries the removal");
        assert!(b.list("room:1").is_empty());
    }

    #[test]
    fn test_removed_node_accepts_any_later_incarnation() {
        let mut crdt = PresenceCrdt::new(replica("node2"));
        let old = ReplicaId::with_vsn("node1", 100);
        let add = present("room:1", "u1", owner("node1", 1), Tag::new(old.clone(), 1));
        crdt.merge_delta(&old, &Delta { start: 0, end: 1, records: vec![add] });

        crdt.remove_replica(&old);
        assert!(crdt.is_empty());

        // Restarted with a clock that stepped backwards.
        let restarted = ReplicaId::with_vsn("node1", 90);
        let add = present("room:1", "u1", owner("node1", 2), Tag::new(restarted.clone(), 1));
        let result = crdt.merge_delta(&restarted, &Delta { start: 0, end: 1, records: vec![add] });
        assert!(!result.stale);
        assert_eq!(crdt.len(), 1);
    }

    #[test]
    fn test_removing_own_node_name_keeps_incarnation() {
        let me = ReplicaId::with_vsn("node1", 5);
        let mut crdt = PresenceCrdt::new(me.clone());
        crdt.remove_replica(&ReplicaId::with_vsn("node1", 4));

        let result = crdt.merge_delta(&ReplicaId::with_vsn("node1", 3), &Delta::default());
        assert!(result.stale);
    }
}
