//! Owner handles.
//!
//! An [`Owner`] is the execution context a presence connection belongs to: a
//! socket session, a channel task, a document editor. The tracker never polls
//! it. Instead the owner carries a liveness signal that fires when the owner
//! terminates, either because [`Owner::terminate`] was called or because the
//! `Owner` value was dropped.
//!
//! ```ignore
//! let owner = presence.owner();
//! presence.track(&owner.handle(), "room:lobby", "user:1", meta).await?;
//!
//! // Later, when the socket closes:
//! drop(owner); // every connection owned by it leaves
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Identity of an owner.
///
/// The node name records where the owner lives; the id is random so that
/// owners from different incarnations of the same node never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId {
    node: String,
    id: u64,
}

impl OwnerId {
    /// Create a fresh, unique owner id on the given node.
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            id: rand::random(),
        }
    }

    /// Create an owner id from its parts.
    pub fn from_parts(node: impl Into<String>, id: u64) -> Self {
        Self {
            node: node.into(),
            id,
        }
    }

    /// The node this owner lives on.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// The numeric part of the id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{:x}>", self.node, self.id)
    }
}

/// A live owner.
///
/// Holding this value keeps the owner alive. Dropping it (or calling
/// [`terminate`](Owner::terminate)) fires the liveness signal observed by every
/// [`OwnerHandle`].
#[derive(Debug)]
pub struct Owner {
    id: OwnerId,
    alive: watch::Sender<bool>,
}

impl Owner {
    /// Create a new owner on the given node.
    pub fn new(node: impl Into<String>) -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            id: OwnerId::new(node),
            alive,
        }
    }

    /// Spawn a task that owns a fresh owner.
    ///
    /// The owner terminates when the future completes, panics or is aborted.
    pub fn spawn<F, Fut>(node: impl Into<String>, f: F) -> (OwnerHandle, JoinHandle<Fut::Output>)
    where
        F: FnOnce(OwnerHandle) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let owner = Owner::new(node);
        let handle = owner.handle();
        let fut = f(handle.clone());
        let task = tokio::spawn(async move {
            let _owner = owner;
            fut.await
        });
        (handle, task)
    }

    /// This owner's id.
    pub fn id(&self) -> &OwnerId {
        &self.id
    }

    /// A cloneable handle that can be passed to the tracker.
    pub fn handle(&self) -> OwnerHandle {
        OwnerHandle {
            id: self.id.clone(),
            alive: self.alive.subscribe(),
        }
    }

    /// Terminate the owner.
    pub fn terminate(self) {
        let _ = self.alive.send(false);
    }
}

/// An addressable, monitorable reference to an [`Owner`].
#[derive(Debug, Clone)]
pub struct OwnerHandle {
    id: OwnerId,
    alive: watch::Receiver<bool>,
}

impl OwnerHandle {
    /// The owner's id.
    pub fn id(&self) -> &OwnerId {
        &self.id
    }

    /// Whether the owner has not yet terminated.
    pub fn is_alive(&self) -> bool {
        self.alive.has_changed().is_ok() && *self.alive.borrow()
    }

    /// Resolve once the owner has terminated.
    pub async fn terminated(mut self) {
        loop {
            if !*self.alive.borrow_and_update() {
                return;
            }
            if self.alive.changed().await.is_err() {
                return;
            }
        }
    }
}
