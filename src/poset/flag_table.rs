//! Flag tables: the root-observation maps propagated up the DAG.
//!
//! A flag table maps a root's event hash to the frame at which that event
//! became a root. Every event carries one; merging the parents' tables is how
//! root observations travel upward until a supermajority of creators is
//! visible and a new root is born.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::event::EventHash;

/// Map from root event hash to the frame it first appeared as a root.
///
/// Backed by a `BTreeMap` so iteration order and the marshaled form are
/// deterministic across replicas.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagTable(pub BTreeMap<EventHash, i64>);

impl FlagTable {
    pub fn new() -> Self {
        FlagTable(BTreeMap::new())
    }

    pub fn insert(&mut self, hash: EventHash, frame: i64) {
        self.0.insert(hash, frame);
    }

    pub fn get(&self, hash: &EventHash) -> Option<i64> {
        self.0.get(hash).copied()
    }

    pub fn contains(&self, hash: &EventHash) -> bool {
        self.0.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventHash, &i64)> {
        self.0.iter()
    }

    /// Union with another table. On conflict the smaller frame wins: a root
    /// keeps the frame at which it was first observed.
    pub fn merge(&self, other: &FlagTable) -> FlagTable {
        let mut merged = self.0.clone();
        for (hash, frame) in &other.0 {
            merged
                .entry(*hash)
                .and_modify(|f| {
                    if *frame < *f {
                        *f = *frame;
                    }
                })
                .or_insert(*frame);
        }
        FlagTable(merged)
    }

    /// Canonical byte encoding, used for persistence and for the ordering
    /// tie-break hash.
    pub fn marshal(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .unwrap_or_default()
    }

    pub fn unmarshal(bytes: &[u8]) -> Option<FlagTable> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(ft, _)| ft)
            .ok()
    }

    /// Hash of the canonical encoding; third key of the consensus ordering.
    pub fn hash(&self) -> crate::Hash {
        crate::hash_domain("moira.flag-table", &self.marshal())
    }
}

impl FromIterator<(EventHash, i64)> for FlagTable {
    fn from_iter<T: IntoIterator<Item = (EventHash, i64)>>(iter: T) -> Self {
        FlagTable(iter.into_iter().collect())
    }
}
