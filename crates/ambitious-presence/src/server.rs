//! Presence shard server.
//!
//! A shard exclusively owns one [`EntryStore`] and one [`PresenceCrdt`] and
//! applies everything to them from a single loop: local commands, replication
//! traffic, owner terminations and heartbeats. Commands arrive on a bounded
//! queue and are drained in batches; after each batch the shard
//! 1. broadcasts its own mutations to peers as one delta,
//! 2. refreshes the read view of every touched topic and publishes one diff
//!    per topic,
//! 3. answers the callers.
//!
//! Readers never enter the loop. They read the per-topic views, which the
//! loop replaces wholesale.

use crate::config::PresenceConfig;
use crate::crdt::{Clock, Delta, MergeResult, PresenceCrdt, Record, ReplicaId, ReplicaStatus};
use crate::diff::{self, TopicView};
use crate::error::{PresenceError, Result};
use crate::monitor::Monitor;
use crate::owner::{OwnerHandle, OwnerId};
use crate::pubsub::PubSub;
use crate::replication::{Envelope, ReplicationMessage, Transport};
use crate::store::EntryStore;
use crate::types::{Meta, PresenceBroadcast, PresenceRef, PresenceState};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

/// Metadata transformation applied by an update.
pub(crate) type Mutator = Box<dyn FnOnce(Meta) -> Meta + Send>;

/// Read views of a shard, by topic.
pub(crate) type Views = Arc<DashMap<String, Arc<TopicView>>>;

/// Commands handled by a shard.
pub(crate) enum ShardCmd {
    Track {
        handle: OwnerHandle,
        topic: String,
        key: String,
        meta: Meta,
        reply: oneshot::Sender<Result<PresenceRef>>,
    },
    Update {
        owner: OwnerId,
        topic: String,
        key: String,
        mutator: Mutator,
        reply: oneshot::Sender<Result<PresenceRef>>,
    },
    Untrack {
        owner: OwnerId,
        topic: String,
        key: String,
        reply: oneshot::Sender<()>,
    },
    UntrackAll {
        owner: OwnerId,
        reply: oneshot::Sender<()>,
    },
    ListLocal {
        topic: String,
        reply: oneshot::Sender<HashMap<String, PresenceState>>,
    },
    Replicate(Envelope),
    NodeDown {
        name: String,
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Caller side of a running shard.
#[derive(Clone)]
pub(crate) struct ShardHandle {
    index: usize,
    tx: mpsc::Sender<ShardCmd>,
    views: Views,
}

impl ShardHandle {
    /// Send a command and wait for its reply.
    pub(crate) async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ShardCmd,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| PresenceError::ShardDown(self.index))
    }

    /// Send a command without waiting for it to be handled.
    pub(crate) async fn send(&self, cmd: ShardCmd) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| PresenceError::ShardDown(self.index))
    }

    /// The current view of a topic.
    pub(crate) fn view(&self, topic: &str) -> Option<Arc<TopicView>> {
        self.views.get(topic).map(|view| Arc::clone(view.value()))
    }
}

/// Start shard `index` for `replica`.
///
/// `monitor` is the shard's handle to the tracker's liveness monitor and
/// `down_rx` the channel on which it reports this shard's terminated owners.
pub(crate) fn spawn(
    index: usize,
    replica: ReplicaId,
    config: Arc<PresenceConfig>,
    pubsub: Arc<dyn PubSub>,
    transport: Arc<dyn Transport>,
    (monitor, down_rx): (Monitor, mpsc::UnboundedReceiver<OwnerId>),
) -> ShardHandle {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let views = Views::default();

    let shard = Shard {
        index,
        store: EntryStore::new(replica.clone()),
        crdt: PresenceCrdt::new(replica.clone()),
        replica,
        config,
        views: Arc::clone(&views),
        monitor,
        pubsub,
        transport,
        pending: Vec::new(),
        announced: 0,
        last_seen: HashMap::new(),
        down_since: HashMap::new(),
        transfer_requested: HashMap::new(),
    };
    tokio::spawn(shard.run(rx, down_rx));

    ShardHandle { index, tx, views }
}

/// Work accumulated while handling one batch.
#[derive(Default)]
struct Batch {
    topics: BTreeSet<String>,
    replies: Vec<Box<dyn FnOnce() + Send>>,
    stop: bool,
}

impl Batch {
    fn reply<T: Send + 'static>(&mut self, tx: oneshot::Sender<T>, value: T) {
        self.replies.push(Box::new(move || {
            let _ = tx.send(value);
        }));
    }
}

struct Shard {
    index: usize,
    replica: ReplicaId,
    config: Arc<PresenceConfig>,
    store: EntryStore,
    crdt: PresenceCrdt,
    views: Views,
    monitor: Monitor,
    pubsub: Arc<dyn PubSub>,
    transport: Arc<dyn Transport>,
    /// Own mutations not yet broadcast.
    pending: Vec<Record>,
    /// Clock covered by the deltas broadcast so far.
    announced: Clock,
    last_seen: HashMap<ReplicaId, Instant>,
    down_since: HashMap<ReplicaId, Instant>,
    transfer_requested: HashMap<ReplicaId, Instant>,
}

impl Shard {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ShardCmd>,
        mut down_rx: mpsc::UnboundedReceiver<OwnerId>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.broadcast_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let max_batch = self.config.max_batch;
        let mut cmds = Vec::with_capacity(max_batch);

        tracing::debug!(
            presence = %self.config.name,
            shard = self.index,
            replica = %self.replica,
            "Presence shard started"
        );

        loop {
            let mut batch = Batch::default();
            tokio::select! {
                received = rx.recv_many(&mut cmds, max_batch) => {
                    if received == 0 {
                        break;
                    }
                    for cmd in cmds.drain(..) {
                        self.handle(cmd, &mut batch);
                    }
                }
                Some(owner) = down_rx.recv() => {
                    self.owner_down(&owner, &mut batch);
                    while let Ok(owner) = down_rx.try_recv() {
                        self.owner_down(&owner, &mut batch);
                    }
                }
                _ = heartbeat.tick() => self.heartbeat(&mut batch),
            }

            let stop = batch.stop;
            self.finish(batch);
            if stop {
                break;
            }
        }

        self.views.clear();
        tracing::debug!(
            presence = %self.config.name,
            shard = self.index,
            "Presence shard stopped"
        );
    }

    fn handle(&mut self, cmd: ShardCmd, batch: &mut Batch) {
        match cmd {
            ShardCmd::Track {
                handle,
                topic,
                key,
                meta,
                reply,
            } => {
                let result = self.track(&handle, &topic, &key, meta, batch);
                batch.reply(reply, result);
            }
            ShardCmd::Update {
                owner,
                topic,
                key,
                mutator,
                reply,
            } => {
                let result = self.update(&owner, &topic, &key, mutator, batch);
                batch.reply(reply, result);
            }
            ShardCmd::Untrack {
                owner,
                topic,
                key,
                reply,
            } => {
                self.untrack(&owner, &topic, &key, batch);
                batch.reply(reply, ());
            }
            ShardCmd::UntrackAll { owner, reply } => {
                let removed = self.untrack_all(&owner, batch);
                self.monitor.forget(&owner);
                tracing::debug!(shard = self.index, owner = %owner, removed, "Untracked all presences of owner");
                batch.reply(reply, ());
            }
            ShardCmd::ListLocal { topic, reply } => {
                batch.reply(reply, self.store.list(&topic));
            }
            ShardCmd::Replicate(envelope) => self.replicate(envelope, batch),
            ShardCmd::NodeDown { name, reply } => {
                self.node_down(&name, batch);
                batch.reply(reply, ());
            }
            ShardCmd::Shutdown { reply } => {
                batch.stop = true;
                batch.reply(reply, ());
            }
        }
    }

    fn track(
        &mut self,
        handle: &OwnerHandle,
        topic: &str,
        key: &str,
        meta: Meta,
        batch: &mut Batch,
    ) -> Result<PresenceRef> {
        if !handle.is_alive() {
            return Err(PresenceError::OwnerGone(handle.id().clone()));
        }
        let (record, presence_ref) = self.store.track(handle.id(), topic, key, meta)?;
        self.monitor.watch(handle);
        self.commit(record, batch);

        tracing::debug!(
            shard = self.index,
            topic = %topic,
            key = %key,
            owner = %handle.id(),
            presence_ref = %presence_ref,
            "Tracked presence"
        );
        Ok(presence_ref)
    }

    fn update(
        &mut self,
        owner: &OwnerId,
        topic: &str,
        key: &str,
        mutator: Mutator,
        batch: &mut Batch,
    ) -> Result<PresenceRef> {
        let (record, presence_ref) = self.store.update(owner, topic, key, mutator)?;
        self.commit(record, batch);

        tracing::debug!(
            shard = self.index,
            topic = %topic,
            key = %key,
            owner = %owner,
            presence_ref = %presence_ref,
            "Updated presence"
        );
        Ok(presence_ref)
    }

    fn untrack(&mut self, owner: &OwnerId, topic: &str, key: &str, batch: &mut Batch) {
        let Some(record) = self.store.untrack(owner, topic, key) else {
            return;
        };
        self.monitor.release(owner, 1);
        self.commit(record, batch);
        tracing::debug!(shard = self.index, topic = %topic, key = %key, owner = %owner, "Untracked presence");
    }

    fn untrack_all(&mut self, owner: &OwnerId, batch: &mut Batch) -> usize {
        let records = self.store.untrack_all(owner);
        let removed = records.len();
        for record in records {
            self.commit(record, batch);
        }
        removed
    }

    fn owner_down(&mut self, owner: &OwnerId, batch: &mut Batch) {
        let removed = self.untrack_all(owner, batch);
        if removed > 0 {
            tracing::info!(
                shard = self.index,
                owner = %owner,
                removed,
                "Presence owner terminated, removed its connections"
            );
        }
    }

    fn commit(&mut self, record: Record, batch: &mut Batch) {
        batch.topics.insert(record.topic.clone());
        self.crdt.apply_local(record.clone());
        self.pending.push(record);
    }

    fn replicate(&mut self, envelope: Envelope, batch: &mut Batch) {
        let Envelope {
            from,
            shard,
            message,
        } = envelope;
        if shard != self.index || from == self.replica {
            return;
        }

        self.last_seen.insert(from.clone(), Instant::now());
        if self.down_since.remove(&from).is_some() {
            tracing::info!(shard = self.index, replica = %from, "Presence replica back up");
        }

        let result = match message {
            ReplicationMessage::Delta(delta) => {
                tracing::trace!(
                    shard = self.index,
                    from = %from,
                    start = delta.start,
                    end = delta.end,
                    records = delta.records.len(),
                    "Presence received delta"
                );
                self.crdt.merge_delta(&from, &delta)
            }
            ReplicationMessage::Heartbeat { clock, context } => {
                tracing::trace!(shard = self.index, from = %from, clock, "Presence received heartbeat");
                self.crdt.heartbeat(&from, clock, context)
            }
            ReplicationMessage::TransferReq => {
                tracing::debug!(shard = self.index, from = %from, "Presence sending transfer");
                let snapshot = self.crdt.snapshot();
                self.send(&from, ReplicationMessage::Transfer(snapshot));
                return;
            }
            ReplicationMessage::Transfer(snapshot) => {
                tracing::debug!(
                    shard = self.index,
                    from = %from,
                    records = snapshot.records.len(),
                    "Presence received transfer"
                );
                self.transfer_requested.remove(&from);
                self.crdt.merge_snapshot(&from, &snapshot)
            }
        };
        self.absorb(&from, result, batch);
    }

    fn absorb(&mut self, from: &ReplicaId, result: MergeResult, batch: &mut Batch) {
        if result.stale {
            self.last_seen.remove(from);
            tracing::debug!(shard = self.index, from = %from, "Ignoring presence traffic from outdated incarnation");
            return;
        }

        for conflict in &result.conflicts {
            tracing::info!(
                shard = self.index,
                topic = %conflict.topic,
                key = %conflict.key,
                owner = %conflict.owner,
                winner = %PresenceRef::from(&conflict.winner),
                loser = %PresenceRef::from(&conflict.loser),
                "Resolved concurrent presence update"
            );
        }

        if result.gap {
            self.request_transfer(from);
        }
        batch.topics.extend(result.topics);
    }

    fn request_transfer(&mut self, from: &ReplicaId) {
        let now = Instant::now();
        let pending = self
            .transfer_requested
            .get(from)
            .is_some_and(|at| now.duration_since(*at) < self.config.broadcast_interval());
        if pending {
            return;
        }
        tracing::debug!(
            shard = self.index,
            from = %from,
            seen = self.crdt.seen(from),
            "Presence state behind peer, requesting transfer"
        );
        self.transfer_requested.insert(from.clone(), now);
        self.send(from, ReplicationMessage::TransferReq);
    }

    fn node_down(&mut self, name: &str, batch: &mut Batch) {
        let replicas: Vec<ReplicaId> = self
            .crdt
            .peers()
            .filter(|(replica, _)| replica.name == name)
            .map(|(replica, _)| replica.clone())
            .collect();
        for replica in replicas {
            self.remove_replica(&replica, batch);
        }
    }

    fn remove_replica(&mut self, replica: &ReplicaId, batch: &mut Batch) {
        let topics = self.crdt.remove_replica(replica);
        self.last_seen.remove(replica);
        self.down_since.remove(replica);
        self.transfer_requested.remove(replica);
        tracing::info!(
            shard = self.index,
            replica = %replica,
            topics = topics.len(),
            "Removed presence replica"
        );
        batch.topics.extend(topics);
    }

    fn heartbeat(&mut self, batch: &mut Batch) {
        let message = ReplicationMessage::Heartbeat {
            clock: self.store.clock(),
            context: self.crdt.context().clone(),
        };
        self.transport.broadcast(&self.envelope(message));

        let now = Instant::now();
        let peers: Vec<(ReplicaId, ReplicaStatus)> = self
            .crdt
            .peers()
            .map(|(replica, status)| (replica.clone(), status))
            .collect();

        for (replica, status) in peers {
            let last_seen = *self.last_seen.entry(replica.clone()).or_insert(now);
            match status {
                ReplicaStatus::Up => {
                    if now.duration_since(last_seen) >= self.config.down_timeout() {
                        let topics = self.crdt.replica_down(&replica);
                        tracing::info!(
                            shard = self.index,
                            replica = %replica,
                            topics = topics.len(),
                            "Presence replica marked down"
                        );
                        batch.topics.extend(topics);
                        self.down_since.insert(replica, now);
                    }
                }
                ReplicaStatus::Down => {
                    let since = *self.down_since.entry(replica.clone()).or_insert(now);
                    if now.duration_since(since) >= self.config.permdown_timeout() {
                        self.remove_replica(&replica, batch);
                    }
                }
            }
        }

        let dropped = self.crdt.compact();
        if dropped > 0 {
            tracing::debug!(shard = self.index, dropped, "Compacted presence tombstones");
        }
    }

    fn finish(&mut self, batch: Batch) {
        if !self.pending.is_empty() {
            let end = self.store.clock();
            let delta = Delta {
                start: self.announced,
                end,
                records: std::mem::take(&mut self.pending),
            };
            self.announced = end;
            tracing::trace!(
                shard = self.index,
                start = delta.start,
                end = delta.end,
                records = delta.records.len(),
                "Presence broadcasting delta"
            );
            self.transport
                .broadcast(&self.envelope(ReplicationMessage::Delta(delta)));
        }

        for topic in &batch.topics {
            self.refresh(topic);
        }

        for reply in batch.replies {
            reply();
        }
    }

    /// Replace the view of `topic` and publish what changed.
    fn refresh(&self, topic: &str) {
        let view = self.crdt.list(topic);
        let old = self.view(topic);
        let diff = diff::compute(&old, &view);

        if view.is_empty() {
            self.views.remove(topic);
        } else {
            self.views.insert(topic.to_string(), Arc::new(view));
        }

        if !diff.is_empty() {
            tracing::trace!(
                shard = self.index,
                topic = %topic,
                joins = diff.joins.len(),
                leaves = diff.leaves.len(),
                "Publishing presence diff"
            );
            self.pubsub
                .publish(topic, PresenceBroadcast::diff(topic, diff));
        }
    }

    fn view(&self, topic: &str) -> Arc<TopicView> {
        self.views
            .get(topic)
            .map(|view| Arc::clone(view.value()))
            .unwrap_or_default()
    }

    fn envelope(&self, message: ReplicationMessage) -> Envelope {
        Envelope {
            from: self.replica.clone(),
            shard: self.index,
            message,
        }
    }

    fn send(&self, to: &ReplicaId, message: ReplicationMessage) {
        self.transport.send(to, &self.envelope(message));
    }
}
