//! Liveness monitor.
//!
//! One monitor serves every shard of a tracker. It keeps a single link per
//! owner that has at least one connection anywhere in the tracker; every
//! connection of the owner adds a reference to that link, counted per shard,
//! so one termination is reported once to each shard holding connections of
//! the owner, no matter how many connections it had.
//!
//! A link is a small task waiting on the owner's liveness signal. When it
//! fires, the monitor drops the link and reports the owner id on the down
//! channel of each shard that referenced it. Those shards then remove the
//! owner's connections.

use crate::owner::{OwnerHandle, OwnerId};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
enum MonitorCmd {
    Watch(usize, OwnerHandle),
    Release(usize, OwnerId, usize),
    Forget(usize, OwnerId),
}

struct Link {
    /// References by shard index.
    refs: HashMap<usize, usize>,
    generation: u64,
    watcher: JoinHandle<()>,
}

/// A shard's handle to the shared monitor.
///
/// The monitor stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct Monitor {
    shard: usize,
    tx: mpsc::UnboundedSender<MonitorCmd>,
}

impl Monitor {
    /// Start a monitor shared by `shards` shards.
    ///
    /// Returns, per shard index, the shard's handle and the channel on which
    /// terminated owners are reported to that shard, each exactly once per link.
    pub fn spawn(shards: usize) -> Vec<(Self, mpsc::UnboundedReceiver<OwnerId>)> {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let (down_txs, down_rxs): (Vec<_>, Vec<_>) =
            (0..shards).map(|_| mpsc::unbounded_channel()).unzip();
        let state = MonitorLoop {
            links: HashMap::new(),
            next_generation: 0,
            down_txs,
        };
        tokio::spawn(state.run(cmd_rx));

        down_rxs
            .into_iter()
            .enumerate()
            .map(|(shard, down_rx)| {
                let monitor = Self {
                    shard,
                    tx: tx.clone(),
                };
                (monitor, down_rx)
            })
            .collect()
    }

    /// Add a reference to the owner's link, creating it if needed.
    pub fn watch(&self, handle: &OwnerHandle) {
        self.send(MonitorCmd::Watch(self.shard, handle.clone()));
    }

    /// Drop `n` of this shard's references to the owner's link.
    pub fn release(&self, owner: &OwnerId, n: usize) {
        if n > 0 {
            self.send(MonitorCmd::Release(self.shard, owner.clone(), n));
        }
    }

    /// Drop all of this shard's references to the owner's link.
    pub fn forget(&self, owner: &OwnerId) {
        self.send(MonitorCmd::Forget(self.shard, owner.clone()));
    }

    fn send(&self, cmd: MonitorCmd) {
        if self.tx.send(cmd).is_err() {
            tracing::warn!(shard = self.shard, "Presence monitor is not running");
        }
    }
}

struct MonitorLoop {
    links: HashMap<OwnerId, Link>,
    next_generation: u64,
    down_txs: Vec<mpsc::UnboundedSender<OwnerId>>,
}

impl MonitorLoop {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<MonitorCmd>) {
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel::<(OwnerId, u64)>();

        loop {
            tokio::select! {
                biased;
                cmd = cmd_rx.recv() => match cmd {
                    Some(MonitorCmd::Watch(shard, handle)) => self.watch(shard, handle, &fired_tx),
                    Some(MonitorCmd::Release(shard, owner, n)) => self.release(shard, &owner, n),
                    Some(MonitorCmd::Forget(shard, owner)) => self.forget(shard, &owner),
                    None => break,
                },
                Some((owner, generation)) = fired_rx.recv() => self.fired(owner, generation),
            }
        }

        for (_, link) in self.links.drain() {
            link.watcher.abort();
        }
        tracing::debug!("Presence monitor stopped");
    }

    fn watch(
        &mut self,
        shard: usize,
        handle: OwnerHandle,
        fired_tx: &mpsc::UnboundedSender<(OwnerId, u64)>,
    ) {
        if let Some(link) = self.links.get_mut(handle.id()) {
            *link.refs.entry(shard).or_insert(0) += 1;
            return;
        }

        let owner = handle.id().clone();
        let generation = self.next_generation;
        self.next_generation += 1;

        let fired_tx = fired_tx.clone();
        let id = owner.clone();
        let watcher = tokio::spawn(async move {
            handle.terminated().await;
            let _ = fired_tx.send((id, generation));
        });

        tracing::debug!(shard, owner = %owner, "Monitoring presence owner");
        self.links.insert(
            owner,
            Link {
                refs: HashMap::from([(shard, 1)]),
                generation,
                watcher,
            },
        );
    }

    fn release(&mut self, shard: usize, owner: &OwnerId, n: usize) {
        let Some(link) = self.links.get_mut(owner) else {
            return;
        };
        if let Some(refs) = link.refs.get_mut(&shard) {
            *refs = refs.saturating_sub(n);
            if *refs == 0 {
                link.refs.remove(&shard);
            }
        }
        self.drop_unreferenced(owner);
    }

    fn forget(&mut self, shard: usize, owner: &OwnerId) {
        if let Some(link) = self.links.get_mut(owner) {
            link.refs.remove(&shard);
        }
        self.drop_unreferenced(owner);
    }

    fn drop_unreferenced(&mut self, owner: &OwnerId) {
        if self.links.get(owner).is_some_and(|link| link.refs.is_empty())
            && let Some(link) = self.links.remove(owner)
        {
            link.watcher.abort();
            tracing::debug!(owner = %owner, "Released presence owner link");
        }
    }

    fn fired(&mut self, owner: OwnerId, generation: u64) {
        // Links replaced since the watcher fired are not ours to report.
        if !self
            .links
            .get(&owner)
            .is_some_and(|link| link.generation == generation)
        {
            return;
        }
        let Some(link) = self.links.remove(&owner) else {
            return;
        };
        for shard in link.refs.into_keys() {
            let delivered = self
                .down_txs
                .get(shard)
                .is_some_and(|down_tx| down_tx.send(owner.clone()).is_ok());
            if !delivered {
                tracing::debug!(shard, owner = %owner, "Presence shard gone, dropping owner termination");
            }
        }
    }
}
