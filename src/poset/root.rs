//! Roots: synthetic anchors standing in for a participant's unknown past.
//!
//! Before any events are gossiped, each participant is represented by a base
//! root whose pseudo self-parent carries index −1, lamport −1 and frame −1.
//! A root also records "others": other-parents of events whose actual parent
//! event is not in the store, keyed by the referencing event's hash string.
//! Roots are plain values; events are never linked by pointer, only by hash.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::event::EventHash;

/// Descriptor of an event that exists outside the store, seen from a root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootEvent {
    pub hash: EventHash,
    pub creator_id: u64,
    pub index: i64,
    pub lamport_timestamp: i64,
    pub frame: i64,
}

/// Deterministic pseudo-hash of a participant's base-root self-parent.
pub fn root_self_parent_hash(creator_id: u64) -> EventHash {
    EventHash(crate::hash_domain(
        "moira.root.self-parent",
        &creator_id.to_be_bytes(),
    ))
}

/// A participant's root: the self-parent descriptor the next event chains
/// from, plus dangling other-parent descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// Frame assigned to the first event chained directly onto this root.
    pub next_frame: i64,
    pub self_parent: RootEvent,
    /// Dangling other-parents, keyed by the hex string of the hash of the
    /// event that references them.
    pub others: BTreeMap<String, RootEvent>,
}

impl Root {
    /// The base root for a participant with no known events.
    pub fn base(creator_id: u64) -> Self {
        Root {
            next_frame: 0,
            self_parent: RootEvent {
                hash: root_self_parent_hash(creator_id),
                creator_id,
                index: -1,
                lamport_timestamp: -1,
                frame: -1,
            },
            others: BTreeMap::new(),
        }
    }

    /// Look up a dangling other-parent recorded for the given event.
    pub fn other_for(&self, event_hash: &EventHash) -> Option<&RootEvent> {
        self.others.get(&event_hash.to_hex())
    }
}
