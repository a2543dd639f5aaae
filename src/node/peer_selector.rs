//! Peer selection policies for the gossip loop.
//!
//! Five named selectors behind one tagged type, constructed from the
//! configuration string; unknown tags are rejected at startup. Each selector
//! implements the same two-call contract: `next` picks a sync target,
//! `update_last` records it so the same peer is not hit twice in a row.

use std::collections::HashMap;
use std::str::FromStr;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::peers::{Peer, Peers};

/// Selection policy tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectorKind {
    /// Uniformly random among eligible peers.
    Random,
    /// Prefers peers missing from an undetermined event's flag table (they
    /// have the most to gain from a sync).
    Smart,
    /// Lowest in-degree relative to height: pulls lazy peers back in.
    Fair,
    /// Opposite of fair: hammers the best-connected peer.
    Unfair,
    /// Least-used peer first; round-robin over the long run.
    Franky,
}

impl FromStr for SelectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(SelectorKind::Random),
            "smart" => Ok(SelectorKind::Smart),
            "fair" => Ok(SelectorKind::Fair),
            "unfair" => Ok(SelectorKind::Unfair),
            "franky" => Ok(SelectorKind::Franky),
            other => Err(format!("unknown peer selector: {other}")),
        }
    }
}

impl std::fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SelectorKind::Random => "random",
            SelectorKind::Smart => "smart",
            SelectorKind::Fair => "fair",
            SelectorKind::Unfair => "unfair",
            SelectorKind::Franky => "franky",
        };
        f.write_str(name)
    }
}

/// A selector bound to the local participant.
pub struct PeerSelector {
    kind: SelectorKind,
    local_id: u64,
    last: Mutex<Option<u64>>,
}

impl PeerSelector {
    pub fn new(kind: SelectorKind, local_id: u64) -> Self {
        PeerSelector {
            kind,
            local_id,
            last: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SelectorKind {
        self.kind
    }

    /// Record the last peer communicated with (avoid double talk).
    pub fn update_last(&self, peer_id: u64) {
        *self.last.lock() = Some(peer_id);
    }

    /// Pick the next sync target. `flag_table_hint` carries the creators
    /// already covering a random undetermined event, consumed by the smart
    /// policy; other policies ignore it.
    pub fn next(
        &self,
        peers: &Peers,
        flag_table_hint: Option<&HashMap<u64, i64>>,
    ) -> Option<Peer> {
        let last = *self.last.lock();
        let mut eligible: Vec<&Peer> = Vec::new();
        let mut last_used: Vec<&Peer> = Vec::new();
        for peer in peers.to_peer_slice() {
            if peer.id == self.local_id {
                continue;
            }
            if Some(peer.id) == last {
                last_used.push(peer);
                continue;
            }
            eligible.push(peer);
        }
        if eligible.is_empty() {
            eligible = last_used;
        }
        if eligible.is_empty() {
            return None;
        }

        let chosen: &Peer = match self.kind {
            SelectorKind::Random => eligible[rand::thread_rng().gen_range(0..eligible.len())],
            SelectorKind::Smart => {
                // Peers absent from the flag table have not seen the event
                // yet; prefer them, falling back to random.
                let fresh: Vec<&Peer> = match flag_table_hint {
                    Some(hint) => eligible
                        .iter()
                        .copied()
                        .filter(|p| !hint.contains_key(&p.id))
                        .collect(),
                    None => Vec::new(),
                };
                let pool = if fresh.is_empty() { &eligible } else { &fresh };
                pool[rand::thread_rng().gen_range(0..pool.len())]
            }
            SelectorKind::Fair => pick_by_cost(&eligible, peers, false)?,
            SelectorKind::Unfair => pick_by_cost(&eligible, peers, true)?,
            SelectorKind::Franky => {
                let min_used = eligible
                    .iter()
                    .map(|p| peers.stats_of(p.id).used)
                    .min()
                    .unwrap_or(0);
                let pool: Vec<&Peer> = eligible
                    .iter()
                    .copied()
                    .filter(|p| peers.stats_of(p.id).used == min_used)
                    .collect();
                *pool.choose(&mut rand::thread_rng())?
            }
        };

        peers.record_use(chosen.id);
        Some(chosen.clone())
    }
}

/// Work-cost selection: in-degree over height, lowest first (highest when
/// inverted). Ties resolve randomly.
fn pick_by_cost<'a>(eligible: &[&'a Peer], peers: &Peers, invert: bool) -> Option<&'a Peer> {
    let cost_of = |peer: &Peer| -> f64 {
        let stats = peers.stats_of(peer.id);
        if stats.height <= 0 {
            return 0.0;
        }
        stats.in_degree as f64 / (2.0 + stats.height as f64)
    };

    let mut best_cost = if invert { f64::NEG_INFINITY } else { f64::INFINITY };
    let mut selected: Vec<&Peer> = Vec::new();
    for peer in eligible {
        let cost = cost_of(peer);
        let better = if invert { cost > best_cost } else { cost < best_cost };
        if better {
            best_cost = cost;
            selected.clear();
            selected.push(peer);
        } else if cost == best_cost {
            selected.push(peer);
        }
    }
    selected.choose(&mut rand::thread_rng()).copied()
}
