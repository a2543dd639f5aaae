//! Frame-level bookkeeping records.
//!
//! `RoundCreated` tracks the events assigned to a frame and the atropos
//! decisions on its clotho candidates; `RoundReceived` indexes the events
//! whose consensus position landed in a frame; `Frame` is the finalized
//! artifact block emission is built from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::Hash;

use super::event::{EventHash, EventMessage};
use super::root::Root;

/// Per-event flags inside a `RoundCreated` record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundEventInfo {
    /// True for the frame's roots: the candidates the clotho vote runs over.
    pub clotho_candidate: bool,
    /// Atropos decision: `None` undecided, `Some(true)` promoted,
    /// `Some(false)` rejected.
    pub decided: Option<bool>,
    /// Set once the event reached its consensus position.
    pub consensus: bool,
}

/// The events created in one frame, with clotho candidacy and decisions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundCreated {
    pub events: BTreeMap<EventHash, RoundEventInfo>,
    /// True once the frame has been pushed onto the pending-rounds queue.
    pub queued: bool,
}

impl RoundCreated {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event; candidacy is sticky across repeated registration.
    pub fn add_event(&mut self, hash: EventHash, clotho_candidate: bool) {
        let info = self.events.entry(hash).or_default();
        info.clotho_candidate |= clotho_candidate;
    }

    pub fn clothos(&self) -> Vec<EventHash> {
        self.events
            .iter()
            .filter(|(_, info)| info.clotho_candidate)
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn is_decided(&self, hash: &EventHash) -> bool {
        self.events
            .get(hash)
            .map(|info| info.decided.is_some())
            .unwrap_or(false)
    }

    /// Record an atropos decision for a candidate. The first decision wins;
    /// both decision paths converge on the same record.
    pub fn set_decided(&mut self, hash: EventHash, positive: bool) {
        let info = self.events.entry(hash).or_default();
        info.clotho_candidate = true;
        if info.decided.is_none() {
            info.decided = Some(positive);
        }
    }

    pub fn set_consensus_event(&mut self, hash: EventHash) {
        self.events.entry(hash).or_default().consensus = true;
    }

    /// The frame is decided when it has candidates and every candidate has an
    /// atropos decision.
    pub fn clotho_decided(&self) -> bool {
        let mut any = false;
        for info in self.events.values() {
            if info.clotho_candidate {
                any = true;
                if info.decided.is_none() {
                    return false;
                }
            }
        }
        any
    }

    /// Candidates with a positive decision.
    pub fn atropos(&self) -> Vec<EventHash> {
        self.events
            .iter()
            .filter(|(_, info)| info.clotho_candidate && info.decided == Some(true))
            .map(|(hash, _)| *hash)
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

/// Events received into a frame, in assignment order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundReceived {
    pub rounds: Vec<EventHash>,
}

/// A frame whose atropos decisions are in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRound {
    pub index: i64,
    pub decided: bool,
}

/// A finalized frame: ordered consensus events, one root per participant and
/// the resulting state root. The base for block emission and fast-forward.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub frame: i64,
    /// One root per participant, in ascending participant-id order.
    pub roots: Vec<Root>,
    /// Consensus events in final order.
    pub events: Vec<EventMessage>,
    pub state_root: Hash,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> EventHash {
        EventHash([byte; 32])
    }

    #[test]
    fn undecided_candidates_block_finality() {
        let mut round = RoundCreated::new();
        round.add_event(hash(1), true);
        round.add_event(hash(2), true);
        round.add_event(hash(3), false);
        assert!(!round.clotho_decided());

        round.set_decided(hash(1), true);
        assert!(!round.clotho_decided());

        round.set_decided(hash(2), false);
        assert!(round.clotho_decided());
        assert_eq!(round.atropos(), vec![hash(1)]);
    }

    #[test]
    fn empty_round_is_not_decided() {
        assert!(!RoundCreated::new().clotho_decided());
    }

    #[test]
    fn first_decision_wins() {
        let mut round = RoundCreated::new();
        round.add_event(hash(1), true);
        round.set_decided(hash(1), true);
        round.set_decided(hash(1), false);
        assert_eq!(round.atropos(), vec![hash(1)]);
    }

    #[test]
    fn candidacy_is_sticky() {
        let mut round = RoundCreated::new();
        round.add_event(hash(1), true);
        round.add_event(hash(1), false);
        assert_eq!(round.clothos(), vec![hash(1)]);
    }
}
