//! Diff computation between two views of a topic.

use crate::types::{PresenceDiff, PresenceMeta, PresenceRef, PresenceState};
use std::collections::{HashMap, HashSet};

/// Visible connections of one topic, grouped by key.
pub type TopicView = HashMap<String, Vec<PresenceMeta>>;

/// Compute the joins and leaves that turn `old` into `new`.
///
/// Connections are compared by [`PresenceRef`], which changes on every
/// mutation, so an update shows up as a leave of the old version and a join
/// of the new one. Each key appears at most once per side no matter how many
/// of its connections changed.
pub fn compute(old: &TopicView, new: &TopicView) -> PresenceDiff {
    PresenceDiff {
        joins: minus(new, old),
        leaves: minus(old, new),
    }
}

/// Connections in `a` that are not in `b`, grouped by key.
fn minus(a: &TopicView, b: &TopicView) -> HashMap<String, PresenceState> {
    a.iter()
        .filter_map(|(key, metas)| {
            let known: HashSet<&PresenceRef> = b
                .get(key)
                .map(|metas| metas.iter().map(|m| &m.presence_ref).collect())
                .unwrap_or_default();
            let metas: Vec<PresenceMeta> = metas
                .iter()
                .filter(|m| !known.contains(&m.presence_ref))
                .cloned()
                .collect();
            (!metas.is_empty()).then(|| (key.clone(), PresenceState { metas }))
        })
        .collect()
}
