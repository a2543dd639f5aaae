//! The store abstraction consumed by the poset.
//!
//! Keyed lookups for events, roots, frames, blocks, clotho checks and
//! time tables. Implementations: [`super::inmem_store::InmemStore`] for
//! tests and non-persistent nodes, [`super::sled_store::SledStore`] for
//! durable operation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use crate::peers::Peers;
use crate::state::StateDb;
use crate::Hash;

use super::block::Block;
use super::event::{Event, EventHash};
use super::flag_table::FlagTable;
use super::root::Root;
use super::round::{Frame, RoundCreated, RoundReceived};

/// Errors from store operations. `KeyNotFound` is expected during first-time
/// lookups; callers branch on it via [`StoreError::is_not_found`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found: {1}")]
    KeyNotFound(&'static str, String),
    #[error("no root for participant {0}")]
    NoRoot(u64),
    #[error("participant {0} not in registry")]
    UnknownParticipant(u64),
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("corrupt record under {0}: {1}")]
    Corrupt(&'static str, String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::KeyNotFound(_, _) | StoreError::NoRoot(_))
    }
}

/// Persistence and caching layer behind the poset. All methods take `&self`;
/// implementations synchronize internally. No lock may be held by a caller
/// across a store call (lock order: poset queues → store → poset caches).
pub trait Store: Send + Sync {
    /// Configured cache capacity, shared with the poset's predicate caches.
    fn cache_size(&self) -> usize;

    fn participants(&self) -> Arc<Peers>;

    // ── Events ──

    fn get_event(&self, hash: &EventHash) -> Result<Event, StoreError>;
    fn set_event(&self, event: Event) -> Result<(), StoreError>;
    /// Hash of a participant's event at a creator-local index.
    fn participant_event(&self, creator_id: u64, index: i64) -> Result<EventHash, StoreError>;
    /// Last known event of a participant; the bool is true when it is the
    /// base-root pseudo-event.
    fn last_event_from(&self, creator_id: u64) -> Result<(EventHash, bool), StoreError>;
    fn last_consensus_event_from(&self, creator_id: u64)
        -> Result<(EventHash, bool), StoreError>;
    /// `{participant id → max creator-local index}` for sync requests.
    fn known_events(&self) -> BTreeMap<u64, i64>;
    fn add_consensus_event(&self, event: &Event) -> Result<(), StoreError>;
    fn consensus_event_count(&self) -> i64;

    // ── Roots ──

    fn get_root(&self, creator_id: u64) -> Result<Root, StoreError>;
    fn root_by_self_parent(&self, hash: &EventHash) -> Option<Root>;
    fn roots_by_participant(&self) -> HashMap<u64, Root>;

    // ── Rounds and frames ──

    fn get_round_created(&self, frame: i64) -> Result<RoundCreated, StoreError>;
    fn set_round_created(&self, frame: i64, round: RoundCreated) -> Result<(), StoreError>;
    fn get_round_received(&self, frame: i64) -> Result<RoundReceived, StoreError>;
    fn set_round_received(&self, frame: i64, round: RoundReceived) -> Result<(), StoreError>;
    fn last_round(&self) -> i64;
    fn round_clothos(&self, frame: i64) -> Vec<EventHash>;
    fn round_events(&self, frame: i64) -> usize;
    fn get_frame(&self, frame: i64) -> Result<Frame, StoreError>;
    fn set_frame(&self, frame: Frame) -> Result<(), StoreError>;

    // ── Blocks ──

    fn get_block(&self, index: i64) -> Result<Block, StoreError>;
    fn set_block(&self, block: Block) -> Result<(), StoreError>;
    fn last_block_index(&self) -> i64;

    // ── Clotho checks and time tables ──

    fn add_clotho_check(
        &self,
        frame: i64,
        creator_id: u64,
        hash: EventHash,
    ) -> Result<(), StoreError>;
    fn get_clotho_check(&self, frame: i64, hash: &EventHash) -> Result<EventHash, StoreError>;
    fn get_clotho_creator_check(
        &self,
        frame: i64,
        creator_id: u64,
    ) -> Result<EventHash, StoreError>;
    /// Record `to`'s lamport-time vote on the clotho `from`.
    fn add_time_table(
        &self,
        to: &EventHash,
        from: &EventHash,
        lamport: i64,
    ) -> Result<(), StoreError>;
    fn get_time_table(&self, hash: &EventHash) -> Result<FlagTable, StoreError>;

    // ── State ──

    fn state(&self) -> &StateDb;
    /// Genesis state root.
    fn state_root(&self) -> Hash;

    // ── Finality and emission ──

    /// True when every clotho candidate of the frame has an atropos decision.
    fn check_frame_finality(&self, frame: i64) -> bool;
    /// The frame's received events in consensus order, for block emission.
    fn process_out_frame(&self, frame: i64) -> Result<Vec<Event>, StoreError>;

    // ── Lifecycle ──

    /// Events in topological-insertion order, for bootstrap replay.
    fn topological_events(&self) -> Result<Vec<Event>, StoreError>;
    /// Drop all derived state and reseed the participant roots.
    fn reset(&self, roots: HashMap<u64, Root>) -> Result<(), StoreError>;
    /// True when the store was opened over an existing database.
    fn need_bootstrap(&self) -> bool;
    fn store_path(&self) -> Option<&Path>;
    fn close(&self) -> Result<(), StoreError>;
}

/// Shared consensus-order sort used by `process_out_frame` implementations.
pub(crate) fn sort_consensus_events(events: &mut [Event]) {
    events.sort_by_cached_key(|e| e.consensus_order_key());
}
