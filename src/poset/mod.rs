//! The poset: DAG ingestion and total ordering.
//!
//! Events enter through [`Poset::insert_event`], which verifies identity,
//! rejects forks, assigns frames by flag-table propagation and feeds the
//! clotho / atropos machinery. The processing pipeline
//! (`divide_rounds → decide_atropos → decide_round_received →
//! process_decided_rounds → process_sig_pool`) turns decided frames into
//! blocks on the commit channel. Every stage persists through the store as it
//! advances and is idempotent on re-entry.
//!
//! Lock-acquisition order, the only admissible one: pending queues → store →
//! predicate caches. Counters and queues each have their own lock so readers
//! never serialize on a global.

mod cache;

pub mod block;
pub mod event;
pub mod flag_table;
pub mod inmem_store;
pub mod root;
pub mod round;
pub mod sled_store;
pub mod store;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::constants::COIN_ROUND_INTERVAL;
use crate::peers::Peers;
use crate::state::StateError;
use crate::Hash;

use cache::BoundedCache;

pub use block::{Block, BlockBody};
pub use event::{
    BlockSignature, Event, EventBody, EventHash, EventMessage, InternalTransaction,
    TransactionType, WireEvent, FRAME_NIL, LAMPORT_NIL,
};
pub use flag_table::FlagTable;
pub use inmem_store::InmemStore;
pub use root::{root_self_parent_hash, Root, RootEvent};
pub use round::{Frame, PendingRound, RoundCreated, RoundReceived};
pub use sled_store::SledStore;
pub use store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PosetError {
    #[error("invalid event signature")]
    InvalidSignature,
    #[error("self-parent is not the creator's last known event")]
    SelfParentMismatch,
    #[error("other-parent not known")]
    OtherParentUnknown,
    #[error("creator not in the participant registry")]
    CreatorUnknown,
    #[error("no anchor block yet")]
    NoAnchorBlock,
    #[error("not enough valid signatures: got {got}, need {need}")]
    NotEnoughSignatures { got: u64, need: u64 },
    #[error("cannot apply state for negative frame {0}")]
    InvalidFrame(i64),
    #[error("commit channel closed")]
    CommitChannelClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
}

type PredicateCache = Mutex<BoundedCache<(EventHash, EventHash), bool>>;

/// Counters and decisions exposed to the stats service.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct PosetStats {
    pub last_consensus_round: Option<i64>,
    pub last_round: i64,
    pub last_block_index: i64,
    pub anchor_block: Option<i64>,
    pub consensus_events: i64,
    pub consensus_transactions: u64,
    pub undetermined_events: usize,
    pub pending_rounds: usize,
    pub pending_loaded_events: i64,
}

/// The consensus engine. Instances are plain values; tests create several per
/// process and nothing here is global.
pub struct Poset {
    participants: Arc<Peers>,
    store: Arc<dyn Store>,

    // Pending queues, one lock each.
    undetermined_events: RwLock<Vec<EventHash>>,
    pending_rounds: RwLock<Vec<PendingRound>>,
    pending_round_received: RwLock<Vec<i64>>,
    sig_pool: RwLock<Vec<BlockSignature>>,

    last_consensus_round: RwLock<Option<i64>>,
    first_consensus_round: RwLock<Option<i64>>,
    anchor_block: RwLock<Option<i64>>,
    pending_loaded_events: RwLock<i64>,
    consensus_transactions: RwLock<u64>,
    topological_index: Mutex<i64>,
    next_final_frame: RwLock<i64>,
    /// Highest frame a block was emitted for (or the reset base); emission
    /// never revisits frames at or below it.
    last_emitted_round: RwLock<Option<i64>>,
    /// Serializes block emission; decisions may arrive from several callers.
    decided: Mutex<()>,
    commit_tx: Option<mpsc::Sender<Block>>,

    dominator_cache: PredicateCache,
    self_dominator_cache: PredicateCache,
    strictly_dominated_cache: PredicateCache,
    round_cache: Mutex<BoundedCache<EventHash, i64>>,
    timestamp_cache: Mutex<BoundedCache<EventHash, i64>>,
}

impl Poset {
    /// Build a poset over a participant set and store. The commit channel is
    /// bounded; a full channel blocks the pipeline rather than drop blocks.
    ///
    /// Panics when the participant set is empty: quorum arithmetic over zero
    /// participants is a configuration error, caught at init.
    pub fn new(
        participants: Arc<Peers>,
        store: Arc<dyn Store>,
        commit_tx: Option<mpsc::Sender<Block>>,
    ) -> Self {
        assert!(
            !participants.is_empty(),
            "participant registry is empty: no quorum is derivable"
        );
        let cache_size = store.cache_size();
        Poset {
            participants,
            store,
            undetermined_events: RwLock::new(Vec::new()),
            pending_rounds: RwLock::new(Vec::new()),
            pending_round_received: RwLock::new(Vec::new()),
            sig_pool: RwLock::new(Vec::new()),
            last_consensus_round: RwLock::new(None),
            first_consensus_round: RwLock::new(None),
            anchor_block: RwLock::new(None),
            pending_loaded_events: RwLock::new(0),
            consensus_transactions: RwLock::new(0),
            topological_index: Mutex::new(0),
            next_final_frame: RwLock::new(0),
            last_emitted_round: RwLock::new(None),
            decided: Mutex::new(()),
            commit_tx,
            dominator_cache: Mutex::new(BoundedCache::new(cache_size)),
            self_dominator_cache: Mutex::new(BoundedCache::new(cache_size)),
            strictly_dominated_cache: Mutex::new(BoundedCache::new(cache_size)),
            round_cache: Mutex::new(BoundedCache::new(cache_size)),
            timestamp_cache: Mutex::new(BoundedCache::new(cache_size)),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn participants(&self) -> &Arc<Peers> {
        &self.participants
    }

    pub fn super_majority(&self) -> u64 {
        self.participants.super_majority()
    }

    pub fn trust_count(&self) -> u64 {
        self.participants.trust_count()
    }

    // ── Ancestry predicates ──────────────────────────────────────────────

    /// True when `y` is reachable from `x` along parent edges.
    pub fn dominator(&self, x: &EventHash, y: &EventHash) -> Result<bool, PosetError> {
        if x.is_zero() || y.is_zero() {
            return Ok(false);
        }
        if let Some(v) = self.dominator_cache.lock().get(&(*x, *y)) {
            return Ok(v);
        }
        let v = self.dominator_impl(x, y)?;
        self.dominator_cache.lock().insert((*x, *y), v);
        Ok(v)
    }

    fn dominator_impl(&self, x: &EventHash, y: &EventHash) -> Result<bool, PosetError> {
        if x == y {
            return Ok(true);
        }
        let ex = match self.store.get_event(x) {
            Ok(ev) => ev,
            Err(e) if e.is_not_found() => {
                // x is not an event we hold. It can still name a dangling
                // other-parent recorded in some root.
                for root in self.store.roots_by_participant().values() {
                    if let Some(other) = root.others.get(&y.to_hex()) {
                        return Ok(*x == other.hash);
                    }
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        // A strictly newer event cannot be an ancestor.
        if self.lamport_diff(x, y)? > 0 {
            return Ok(false);
        }
        match self.store.get_event(y) {
            Ok(ey) => {
                if ex.creator() == ey.creator() {
                    return Ok(ex.index() >= ey.index());
                }
            }
            Err(e) if e.is_not_found() => {
                if let Some(root) = self.store.root_by_self_parent(y) {
                    let peer = self
                        .participants
                        .by_id(root.self_parent.creator_id)
                        .ok_or(PosetError::CreatorUnknown)?;
                    if ex.creator() == &peer.public_key {
                        return Ok(ex.index() >= root.self_parent.index);
                    }
                } else {
                    return Ok(false);
                }
            }
            Err(e) => return Err(e.into()),
        }
        if self.dominator(&ex.self_parent(), y)? {
            return Ok(true);
        }
        self.dominator(&ex.other_parent(), y)
    }

    /// True when `y` is reachable from `x` along self-parent edges only.
    pub fn self_dominator(&self, x: &EventHash, y: &EventHash) -> Result<bool, PosetError> {
        if x.is_zero() || y.is_zero() {
            return Ok(false);
        }
        if let Some(v) = self.self_dominator_cache.lock().get(&(*x, *y)) {
            return Ok(v);
        }
        let v = self.self_dominator_impl(x, y)?;
        self.self_dominator_cache.lock().insert((*x, *y), v);
        Ok(v)
    }

    fn self_dominator_impl(&self, x: &EventHash, y: &EventHash) -> Result<bool, PosetError> {
        if x == y {
            return Ok(true);
        }
        let ex = match self.store.get_event(x) {
            Ok(ev) => ev,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match self.store.get_event(y) {
            Ok(ey) => {
                if ex.creator() == ey.creator() {
                    return Ok(ex.index() >= ey.index());
                }
                Ok(false)
            }
            Err(e) if e.is_not_found() => {
                if let Some(root) = self.store.root_by_self_parent(y) {
                    let peer = self
                        .participants
                        .by_id(root.self_parent.creator_id)
                        .ok_or(PosetError::CreatorUnknown)?;
                    if ex.creator() == &peer.public_key {
                        return Ok(ex.index() >= root.self_parent.index);
                    }
                }
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Alias kept for the voting stage; forks are rejected at insertion so
    /// domination and plain ancestry coincide.
    pub fn dominated(&self, x: &EventHash, y: &EventHash) -> Result<bool, PosetError> {
        self.dominator(x, y)
    }

    /// True when a supermajority of distinct creators appears on the
    /// dominator paths from `x` down to `y`.
    pub fn strictly_dominated(&self, x: &EventHash, y: &EventHash) -> Result<bool, PosetError> {
        if x.is_zero() || y.is_zero() {
            return Ok(false);
        }
        if let Some(v) = self.strictly_dominated_cache.lock().get(&(*x, *y)) {
            return Ok(v);
        }
        let mut sentinels = HashSet::new();
        self.map_sentinels(x, y, &mut sentinels)?;
        let v = sentinels.len() as u64 >= self.super_majority();
        self.strictly_dominated_cache.lock().insert((*x, *y), v);
        Ok(v)
    }

    /// Collect the creators seen while walking the dominator subgraph from
    /// `x` toward `y`.
    fn map_sentinels(
        &self,
        x: &EventHash,
        y: &EventHash,
        sentinels: &mut HashSet<Vec<u8>>,
    ) -> Result<(), PosetError> {
        if x.is_zero() {
            return Ok(());
        }
        if !self.dominated(x, y)? {
            return Ok(());
        }
        let ex = match self.store.get_event(x) {
            Ok(ev) => ev,
            Err(e) if e.is_not_found() => {
                if let Some(root) = self.store.root_by_self_parent(x) {
                    let peer = self
                        .participants
                        .by_id(root.self_parent.creator_id)
                        .ok_or(PosetError::CreatorUnknown)?;
                    sentinels.insert(peer.public_key.as_bytes().to_vec());
                    return Ok(());
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        sentinels.insert(ex.creator().as_bytes().to_vec());
        if x == y {
            return Ok(());
        }
        self.map_sentinels(&ex.other_parent(), y, sentinels)?;
        self.map_sentinels(&ex.self_parent(), y, sentinels)
    }

    // ── Frame and lamport computation ────────────────────────────────────

    /// The frame of an event. Events carry their frame from insertion; the
    /// recursive computation is the fallback for records that predate it.
    pub fn round(&self, x: &EventHash) -> Result<i64, PosetError> {
        if let Some(v) = self.round_cache.lock().get(x) {
            return Ok(v);
        }
        let v = self.round_impl(x)?;
        self.round_cache.lock().insert(*x, v);
        Ok(v)
    }

    fn round_impl(&self, x: &EventHash) -> Result<i64, PosetError> {
        if let Some(root) = self.store.root_by_self_parent(x) {
            return Ok(root.self_parent.frame);
        }
        let ex = self.store.get_event(x)?;
        if ex.frame != FRAME_NIL {
            return Ok(ex.frame);
        }
        let creator = self
            .participants
            .by_pubkey(ex.creator())
            .ok_or(PosetError::CreatorUnknown)?;
        let root = self.store.get_root(creator.id)?;

        // Directly attached to the root: the root is authoritative, unless
        // the other-parent is neither empty nor the recorded dangling one.
        if ex.self_parent() == root.self_parent.hash {
            let op = ex.other_parent();
            let recorded = root.other_for(&ex.hash());
            if op.is_zero() || recorded.map(|o| o.hash) == Some(op) {
                return Ok(root.next_frame);
            }
        }

        let sp_round = self.round(&ex.self_parent())?;
        let mut parent_round = sp_round;
        let op = ex.other_parent();
        if !op.is_zero() {
            let op_round = self.round(&op)?;
            if op_round > parent_round {
                parent_round = op_round;
            }
        }
        if parent_round == FRAME_NIL {
            return Ok(0);
        }
        // The frame advances when the event's flag table spans a
        // supermajority of creators.
        if self.flag_table_quorum(&ex.flag_table)? {
            return Ok(parent_round + 1);
        }
        Ok(parent_round)
    }

    /// A clotho candidate is the first event of its creator in a frame.
    pub fn clotho(&self, x: &EventHash) -> Result<bool, PosetError> {
        let ex = self.store.get_event(x)?;
        let x_round = self.round(x)?;
        let sp_round = self.round(&ex.self_parent())?;
        Ok(x_round > sp_round)
    }

    pub fn lamport_timestamp(&self, x: &EventHash) -> Result<i64, PosetError> {
        if let Some(v) = self.timestamp_cache.lock().get(x) {
            return Ok(v);
        }
        let v = self.lamport_impl(x)?;
        self.timestamp_cache.lock().insert(*x, v);
        Ok(v)
    }

    fn lamport_impl(&self, x: &EventHash) -> Result<i64, PosetError> {
        if let Some(root) = self.store.root_by_self_parent(x) {
            return Ok(root.self_parent.lamport_timestamp);
        }
        let ex = self.store.get_event(x)?;
        if ex.lamport_timestamp != LAMPORT_NIL {
            return Ok(ex.lamport_timestamp);
        }
        let creator = self
            .participants
            .by_pubkey(ex.creator())
            .ok_or(PosetError::CreatorUnknown)?;
        let root = self.store.get_root(creator.id)?;

        let sp = ex.self_parent();
        let mut plt = if sp == root.self_parent.hash {
            root.self_parent.lamport_timestamp
        } else {
            self.lamport_timestamp(&sp)?
        };

        let op = ex.other_parent();
        if !op.is_zero() {
            let op_lt = if self.store.get_event(&op).is_ok() {
                Some(self.lamport_timestamp(&op)?)
            } else {
                root.other_for(&ex.hash())
                    .filter(|other| other.hash == op)
                    .map(|other| other.lamport_timestamp)
            };
            if let Some(op_lt) = op_lt {
                if op_lt > plt {
                    plt = op_lt;
                }
            }
        }
        Ok(plt + 1)
    }

    /// lamport(y) − lamport(x)
    fn lamport_diff(&self, x: &EventHash, y: &EventHash) -> Result<i64, PosetError> {
        Ok(self.lamport_timestamp(y)? - self.lamport_timestamp(x)?)
    }

    /// True when the table's hashes span a supermajority of distinct
    /// creators.
    fn flag_table_quorum(&self, table: &FlagTable) -> Result<bool, PosetError> {
        let mut creators: HashSet<u64> = HashSet::new();
        for (hash, _) in table.iter() {
            match self.store.get_event(hash) {
                Ok(ev) => {
                    if let Some(peer) = self.participants.by_pubkey(ev.creator()) {
                        creators.insert(peer.id);
                    }
                }
                Err(e) if e.is_not_found() => {
                    if let Some(root) = self.store.root_by_self_parent(hash) {
                        creators.insert(root.self_parent.creator_id);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(creators.len() as u64 >= self.super_majority())
    }

    // ── Insertion ────────────────────────────────────────────────────────

    fn check_self_parent(&self, event: &Event, creator_id: u64) -> Result<(), PosetError> {
        let (last, _) = self.store.last_event_from(creator_id)?;
        if event.self_parent() != last {
            return Err(PosetError::SelfParentMismatch);
        }
        Ok(())
    }

    fn check_other_parent(&self, event: &Event, creator_id: u64) -> Result<(), PosetError> {
        let op = event.other_parent();
        if op.is_zero() {
            return Ok(());
        }
        if self.store.get_event(&op).is_ok() {
            return Ok(());
        }
        if self.store.root_by_self_parent(&op).is_some() {
            return Ok(());
        }
        let root = self.store.get_root(creator_id)?;
        if let Some(other) = root.other_for(&event.hash()) {
            if other.hash == op {
                return Ok(());
            }
        }
        Err(PosetError::OtherParentUnknown)
    }

    /// Insert an event into the DAG. Verifies the signature, checks parent
    /// linkage, rejects forks, assigns frame / flag tables / lamport, and
    /// feeds the clotho and atropos machinery when a new root appears.
    /// On error no state changes are made.
    pub fn insert_event(&self, mut event: Event, set_wire_info: bool) -> Result<(), PosetError> {
        let hash = event.hash();
        let creator_id = self
            .participants
            .by_pubkey(event.creator())
            .ok_or(PosetError::CreatorUnknown)?
            .id;

        if !event.verify() {
            tracing::debug!(event = %hash, index = event.index(), "invalid event signature");
            return Err(PosetError::InvalidSignature);
        }

        // Fork and sequencing check. An event whose index is already taken by
        // different content is a fork. An identical event is either gossip
        // duplication (no-op) or a replay of a record that lost its engine
        // state (crash recovery), which runs the normal path again.
        match self.store.participant_event(creator_id, event.index()) {
            Ok(existing) if existing == hash => {
                if let Ok(stored) = self.store.get_event(&hash) {
                    if stored.frame != FRAME_NIL {
                        return Ok(());
                    }
                }
            }
            Ok(_) => return Err(PosetError::SelfParentMismatch),
            Err(e) if e.is_not_found() => self.check_self_parent(&event, creator_id)?,
            Err(e) => return Err(e.into()),
        }
        self.check_other_parent(&event, creator_id)?;

        let sp_event = self.store.get_event(&event.self_parent()).ok();
        let op_hash = event.other_parent();
        let op_event = if op_hash.is_zero() {
            None
        } else {
            self.store.get_event(&op_hash).ok()
        };

        let is_root;
        let frame;
        let mut flag_table;
        let mut root_table = FlagTable::new();

        match (&sp_event, &op_event) {
            (None, _) => {
                // Self-parent is the creator's base-root pseudo-event
                // (guaranteed by the checks above): a leaf root.
                let root = self.store.get_root(creator_id)?;
                is_root = true;
                frame = root.next_frame;
                root_table = op_event
                    .as_ref()
                    .map(|op| op.flag_table.clone())
                    .unwrap_or_default();
                flag_table = FlagTable::new();
            }
            (Some(sp), None) => {
                is_root = false;
                frame = sp.frame;
                flag_table = sp.flag_table.clone();
            }
            (Some(sp), Some(op)) => {
                if sp.frame == op.frame {
                    let merged = sp.flag_table.merge(&op.flag_table);
                    if self.flag_table_quorum(&merged)? {
                        is_root = true;
                        frame = sp.frame + 1;
                        root_table = merged;
                        flag_table = FlagTable::new();
                    } else {
                        is_root = false;
                        frame = sp.frame;
                        flag_table = merged;
                    }
                } else if sp.frame > op.frame {
                    is_root = false;
                    frame = sp.frame;
                    flag_table = sp.flag_table.clone();
                } else {
                    is_root = true;
                    frame = op.frame;
                    // Merge with the root table of the canonical root at
                    // (frame − 1, op creator), when one is recorded.
                    let other_root_table = self
                        .store
                        .get_clotho_creator_check(frame - 1, op.creator_id())
                        .ok()
                        .and_then(|root_hash| self.store.get_event(&root_hash).ok())
                        .map(|root_event| root_event.root_table)
                        .unwrap_or_default();
                    root_table = sp.flag_table.merge(&other_root_table);
                    flag_table = op.flag_table.clone();
                }
            }
        }

        event.is_root = is_root;
        event.frame = frame;
        if is_root {
            flag_table.insert(hash, frame);
        }
        event.flag_table = flag_table;
        event.root_table = root_table;

        if event.lamport_timestamp == LAMPORT_NIL {
            let sp_lamport = match &sp_event {
                Some(sp) => sp.lamport_timestamp,
                None => {
                    self.store.get_root(creator_id)?.self_parent.lamport_timestamp
                }
            };
            let op_lamport = match &op_event {
                Some(op) => Some(op.lamport_timestamp),
                None if !op_hash.is_zero() => self
                    .store
                    .get_root(creator_id)?
                    .other_for(&hash)
                    .filter(|other| other.hash == op_hash)
                    .map(|other| other.lamport_timestamp),
                None => None,
            };
            event.lamport_timestamp = sp_lamport.max(op_lamport.unwrap_or(i64::MIN)) + 1;
        }

        event.message.topological_index = self.next_topological_index();
        event.message.creator_id = creator_id;
        if set_wire_info || event.message.other_parent_index < 0 {
            self.set_wire_info(&mut event)?;
        }

        self.store.set_event(event.clone())?;

        // Register in the frame's round record (merging, never clobbering).
        let mut round_created = match self.store.get_round_created(frame) {
            Ok(rc) => rc,
            Err(e) if e.is_not_found() => RoundCreated::new(),
            Err(e) => return Err(e.into()),
        };
        round_created.add_event(hash, is_root);
        self.store.set_round_created(frame, round_created)?;

        if is_root {
            self.store.add_clotho_check(frame, creator_id, hash)?;
            self.clotho_checking(&event)?;
            self.atropos_time_selection(&event)?;
        }

        self.undetermined_events.write().push(hash);
        if event.is_loaded() {
            *self.pending_loaded_events.write() += 1;
        }
        if !event.block_signatures().is_empty() {
            self.sig_pool
                .write()
                .extend(event.block_signatures().iter().cloned());
        }
        Ok(())
    }

    /// Fill the wire coordinates from the store.
    pub fn set_wire_info(&self, event: &mut Event) -> Result<(), PosetError> {
        let creator = self
            .participants
            .by_pubkey(event.creator())
            .ok_or(PosetError::CreatorUnknown)?;
        let creator_id = creator.id;

        let mut op_creator_id = 0u64;
        let mut op_index = -1i64;
        let op = event.other_parent();
        if !op.is_zero() {
            match self.store.get_event(&op) {
                Ok(op_event) => {
                    let op_peer = self
                        .participants
                        .by_pubkey(op_event.creator())
                        .ok_or(PosetError::CreatorUnknown)?;
                    op_creator_id = op_peer.id;
                    op_index = op_event.index();
                }
                Err(e) if e.is_not_found() => {
                    if let Some(root) = self.store.root_by_self_parent(&op) {
                        op_creator_id = root.self_parent.creator_id;
                        op_index = root.self_parent.index;
                    } else {
                        let root = self.store.get_root(creator_id)?;
                        let other = root
                            .other_for(&event.hash())
                            .ok_or(PosetError::OtherParentUnknown)?;
                        op_creator_id = other.creator_id;
                        op_index = other.index;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        event.set_wire_info(event.index() - 1, op_creator_id, op_index, creator_id);
        Ok(())
    }

    /// Reconstruct an event from its wire form, resolving parent coordinates
    /// through the store and the creator's root.
    pub fn read_wire_info(&self, wire: &WireEvent) -> Result<Event, PosetError> {
        let creator = self
            .participants
            .by_id(wire.creator_id)
            .ok_or(PosetError::CreatorUnknown)?;

        let self_parent = if wire.self_parent_index >= 0 {
            self.store
                .participant_event(wire.creator_id, wire.self_parent_index)?
        } else {
            root_self_parent_hash(wire.creator_id)
        };

        let mut other_parent = EventHash::zero();
        if wire.other_parent_index >= 0 {
            let op_creator = self
                .participants
                .by_id(wire.other_parent_creator_id)
                .ok_or(PosetError::CreatorUnknown)?;
            match self
                .store
                .participant_event(op_creator.id, wire.other_parent_index)
            {
                Ok(hash) => other_parent = hash,
                Err(e) if e.is_not_found() => {
                    let root = self.store.get_root(wire.creator_id)?;
                    let found = root.others.values().find(|other| {
                        other.creator_id == wire.other_parent_creator_id
                            && other.index == wire.other_parent_index
                    });
                    match found {
                        Some(other) => other_parent = other.hash,
                        None => return Err(PosetError::OtherParentUnknown),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        } else if wire.other_parent_creator_id != 0 {
            other_parent = root_self_parent_hash(wire.other_parent_creator_id);
        }

        let body = EventBody {
            transactions: wire.transactions.clone(),
            internal_transactions: wire.internal_transactions.clone(),
            parents: vec![self_parent, other_parent],
            creator: creator.public_key.clone(),
            index: wire.index,
            block_signatures: wire.block_signatures(&creator.public_key),
        };
        let mut event = Event::from_message(EventMessage {
            body,
            signature: wire.signature.clone(),
            self_parent_index: wire.self_parent_index,
            other_parent_creator_id: wire.other_parent_creator_id,
            other_parent_index: wire.other_parent_index,
            creator_id: wire.creator_id,
            topological_index: -1,
        });
        event.lamport_timestamp = LAMPORT_NIL;
        Ok(event)
    }

    // ── Clotho checking ──────────────────────────────────────────────────

    /// Walk a new root's root-table up to the roots-of-roots-of-roots level,
    /// accumulate observation counts per (frame, root) and promote roots that
    /// reach supermajority to clotho. Also records this root's lamport vote
    /// for every promoted clotho in its time table.
    fn clotho_checking(&self, event: &Event) -> Result<(), PosetError> {
        let mut cc_list: BTreeMap<i64, BTreeMap<EventHash, i64>> = BTreeMap::new();

        for (key, val) in event.root_table.iter() {
            let prev_root_hash = match self.store.get_clotho_check(*val, key) {
                Ok(hash) => hash,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let prev_root = self.store.get_event(&prev_root_hash)?;
            let mut cc_temp: BTreeMap<i64, BTreeMap<EventHash, i64>> = BTreeMap::new();

            for (rkey, rval) in prev_root.root_table.iter() {
                let prev_prev_hash = match self.store.get_clotho_check(*rval, rkey) {
                    Ok(hash) => hash,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e.into()),
                };
                let prev_prev = self.store.get_event(&prev_prev_hash)?;
                for (rrkey, rrval) in prev_prev.root_table.iter() {
                    match self.store.get_clotho_check(*rrval, rrkey) {
                        Ok(_) => {
                            *cc_temp
                                .entry(*rrval)
                                .or_default()
                                .entry(*rrkey)
                                .or_insert(0) += 1;
                        }
                        Err(e) if e.is_not_found() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            for (frame, counts) in cc_temp {
                for (hash, count) in counts {
                    let entry = cc_list.entry(frame).or_default().entry(hash).or_insert(0);
                    if count > *entry {
                        *entry = count;
                    }
                }
            }
        }

        let event_hash = event.hash();
        for (frame, counts) in cc_list {
            for (key, count) in counts {
                if count as u64 >= self.super_majority() {
                    let root_hash = self.store.get_clotho_check(frame, &key)?;
                    let mut root = self.store.get_event(&root_hash)?;
                    if !root.is_clotho {
                        root.is_clotho = true;
                        tracing::debug!(
                            frame,
                            clotho = %root_hash,
                            lamport = root.lamport_timestamp,
                            "clotho promoted"
                        );
                        self.store.set_event(root)?;
                    }
                    self.store
                        .add_time_table(&event_hash, &root_hash, event.lamport_timestamp)?;
                }
            }
        }
        Ok(())
    }

    // ── Atropos time selection ───────────────────────────────────────────

    /// Aggregate time-table votes from the new root's parent roots and either
    /// promote clothos whose winning lamport reaches supermajority or record
    /// this root's own vote. Every `COIN_ROUND_INTERVAL` frames the vote is
    /// the minimum lamport seen (a coin round).
    fn atropos_time_selection(&self, event: &Event) -> Result<(), PosetError> {
        let mut count_map: BTreeMap<EventHash, BTreeMap<i64, u64>> = BTreeMap::new();
        for (prev_key, _) in event.root_table.iter() {
            let table = match self.store.get_time_table(prev_key) {
                Ok(table) => table,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            for (key, lamport) in table.iter() {
                *count_map.entry(*key).or_default().entry(*lamport).or_insert(0) += 1;
            }
        }

        let event_hash = event.hash();
        for (key, votes) in count_map {
            let clotho = match self.store.get_event(&key) {
                Ok(ev) => ev,
                Err(_) => {
                    tracing::warn!(clotho = %key, "clotho missing during atropos time selection");
                    continue;
                }
            };
            if clotho.is_atropos {
                continue;
            }
            let gap = event.frame - clotho.frame;
            if gap % COIN_ROUND_INTERVAL == 0 {
                // Coin round: vote the minimum lamport seen so far.
                if let Some(min) = votes.keys().next() {
                    self.store.add_time_table(&event_hash, &key, *min)?;
                }
            } else {
                // Most frequent lamport; ties break toward the lower value.
                let mut win_lamport = i64::MAX;
                let mut win_count = 0u64;
                for (lamport, count) in &votes {
                    if *count > win_count {
                        win_count = *count;
                        win_lamport = *lamport;
                    }
                }
                if win_count >= self.super_majority() {
                    self.promote_atropos(&key, Some(win_lamport))?;
                    let mut round_created = match self.store.get_round_created(clotho.frame) {
                        Ok(rc) => rc,
                        Err(e) if e.is_not_found() => RoundCreated::new(),
                        Err(e) => return Err(e.into()),
                    };
                    round_created.set_decided(key, true);
                    round_created.set_consensus_event(key);
                    self.store.set_round_created(clotho.frame, round_created)?;
                } else if win_count > 0 {
                    self.store.add_time_table(&event_hash, &key, win_lamport)?;
                }
            }
        }
        Ok(())
    }

    /// Mark a clotho as atropos, assign its consensus time, account it, and
    /// propagate frame-received and consensus times into its causal past.
    /// `winning_lamport` carries the vote result when the time-table path
    /// decided; the voting path derives the time from the causal past.
    fn promote_atropos(
        &self,
        clotho_hash: &EventHash,
        winning_lamport: Option<i64>,
    ) -> Result<bool, PosetError> {
        let mut event = self.store.get_event(clotho_hash)?;
        if event.is_atropos {
            return Ok(false);
        }
        event.is_clotho = true;
        event.is_atropos = true;
        let frame = event.frame;
        let newly_received = event.frame_received == FRAME_NIL;
        if newly_received {
            event.frame_received = frame;
            self.account_event(&event);
            self.store.add_consensus_event(&event)?;
        }
        self.store.set_event(event.clone())?;
        if newly_received {
            self.record_round_received(*clotho_hash, frame)?;
        }

        let derived = self.assign_atropos_time(&event, frame)?;
        event.atropos_timestamp = winning_lamport.unwrap_or(derived);
        self.store.set_event(event.clone())?;

        tracing::debug!(
            frame,
            atropos = %clotho_hash,
            timestamp = event.atropos_timestamp,
            "atropos decided"
        );
        Ok(true)
    }

    /// Propagate a promotion into the causal past: ancestors without a
    /// frame-received get this frame, and their consensus time becomes the
    /// lamport of the nearest other-parent-reached event (their own lamport
    /// for leaves). Returns the time derived for the caller's event.
    fn assign_atropos_time(&self, event: &Event, frame: i64) -> Result<i64, PosetError> {
        let mut atropos_time = event.lamport_timestamp;

        if let Ok(mut sp) = self.store.get_event(&event.self_parent()) {
            let mut follow = false;
            let newly = sp.frame_received == FRAME_NIL;
            if newly {
                sp.frame_received = frame;
                follow = true;
            }
            if sp.atropos_timestamp == LAMPORT_NIL {
                let t = self.assign_atropos_time(&sp, frame)?;
                sp.atropos_timestamp = t;
                follow = true;
                self.account_event(&sp);
                self.store.add_consensus_event(&sp)?;
            }
            if follow {
                self.store.set_event(sp.clone())?;
                if newly {
                    self.record_round_received(sp.hash(), frame)?;
                }
            }
        }

        match self.store.get_event(&event.other_parent()) {
            Ok(mut op) => {
                let mut follow = false;
                let newly = op.frame_received == FRAME_NIL;
                if newly {
                    op.frame_received = frame;
                    follow = true;
                }
                if op.atropos_timestamp == LAMPORT_NIL {
                    let t = self.assign_atropos_time(&op, frame)?;
                    op.atropos_timestamp = t;
                    follow = true;
                    self.account_event(&op);
                    self.store.add_consensus_event(&op)?;
                }
                if follow {
                    self.store.set_event(op.clone())?;
                    if newly {
                        self.record_round_received(op.hash(), frame)?;
                    }
                }
                atropos_time = op.lamport_timestamp;
            }
            Err(_) => {
                atropos_time = event.lamport_timestamp;
            }
        }
        Ok(atropos_time)
    }

    /// Bump the consensus counters for an event reaching its position.
    fn account_event(&self, event: &Event) {
        self.set_last_consensus_round(event.frame);
        if event.is_loaded() {
            *self.pending_loaded_events.write() -= 1;
        }
        *self.consensus_transactions.write() += event.transactions().len() as u64;
    }

    /// Index an event under its receiving frame and queue the frame for
    /// emission.
    fn record_round_received(&self, hash: EventHash, frame: i64) -> Result<(), PosetError> {
        let mut received = match self.store.get_round_received(frame) {
            Ok(rr) => rr,
            Err(e) if e.is_not_found() => RoundReceived::default(),
            Err(e) => return Err(e.into()),
        };
        received.rounds.push(hash);
        self.store.set_round_received(frame, received)?;

        let mut pending = self.pending_round_received.write();
        if !pending.contains(&frame) {
            pending.push(frame);
            pending.sort_unstable();
        }
        Ok(())
    }

    // ── Processing pipeline ──────────────────────────────────────────────

    /// Assign frames and lamport timestamps to undetermined events, register
    /// them in their frame's round record and queue undecided frames.
    pub fn divide_rounds(&self) -> Result<(), PosetError> {
        let undetermined = self.undetermined_events.read();
        for hash in undetermined.iter() {
            let mut event = self.store.get_event(hash)?;
            let mut update = false;

            if event.frame == FRAME_NIL {
                event.frame = self.round(hash)?;
                update = true;
            }
            if event.lamport_timestamp == LAMPORT_NIL {
                event.lamport_timestamp = self.lamport_timestamp(hash)?;
                update = true;
            }

            let frame = event.frame;
            let mut round_created = match self.store.get_round_created(frame) {
                Ok(rc) => rc,
                Err(e) if e.is_not_found() => RoundCreated::new(),
                Err(e) => return Err(e.into()),
            };
            // The lower bound matters after a Reset: the base layer of frame
            // events must not be reprocessed.
            if !round_created.queued && frame >= self.last_consensus_round_value() {
                round_created.queued = true;
                let mut pending = self.pending_rounds.write();
                if !pending.iter().any(|p| p.index == frame) {
                    pending.push(PendingRound {
                        index: frame,
                        decided: false,
                    });
                    pending.sort_unstable_by_key(|p| p.index);
                }
            }
            round_created.add_event(*hash, event.is_root);
            self.store.set_round_created(frame, round_created)?;

            if update {
                if event.creator_id() == 0 {
                    self.set_wire_info(&mut event)?;
                }
                self.store.set_event(event)?;
            }
        }
        Ok(())
    }

    /// Run the clotho vote over pending frames. Votes walk later frames'
    /// roots; direct votes at distance one, counted votes beyond, with a coin
    /// round every `COIN_ROUND_INTERVAL` frames falling back to a bit of the
    /// voter's hash.
    pub fn decide_atropos(&self) -> Result<(), PosetError> {
        let mut votes: HashMap<(EventHash, EventHash), bool> = HashMap::new();
        let pending = self.pending_rounds.read().clone();
        let mut decided_rounds = Vec::new();

        for pending_round in &pending {
            let round_index = pending_round.index;
            let mut round_info = match self.store.get_round_created(round_index) {
                Ok(rc) => rc,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };

            for x in round_info.clothos() {
                if round_info.is_decided(&x) {
                    continue;
                }
                'vote_loop: for j in (round_index + 1)..=self.store.last_round() {
                    // A candidate no next-frame root sees can never be
                    // received: a supermajority of direct no-votes decides it
                    // negatively. Two conflicting supermajorities cannot
                    // exist, so later-arriving voters cannot flip this.
                    if j - round_index == 2 {
                        let nays = self
                            .store
                            .round_clothos(j - 1)
                            .iter()
                            .filter(|w| votes.get(&(**w, x)) == Some(&false))
                            .count() as u64;
                        if nays >= self.super_majority() {
                            round_info.set_decided(x, false);
                            break 'vote_loop;
                        }
                    }
                    for y in self.store.round_clothos(j) {
                        let diff = j - round_index;
                        if diff == 1 {
                            let sees = self.dominated(&y, &x)?;
                            votes.insert((y, x), sees);
                            continue;
                        }
                        // Count the votes of frame j−1 clothos this voter
                        // strictly dominates.
                        let mut yays = 0u64;
                        let mut nays = 0u64;
                        for w in self.store.round_clothos(j - 1) {
                            if self.strictly_dominated(&y, &w)? {
                                if votes.get(&(w, x)).copied().unwrap_or(false) {
                                    yays += 1;
                                } else {
                                    nays += 1;
                                }
                            }
                        }
                        let (vote, tally) = if yays >= nays {
                            (true, yays)
                        } else {
                            (false, nays)
                        };

                        if diff % COIN_ROUND_INTERVAL != 0 {
                            // Regular round: a supermajority tally decides.
                            if tally >= self.super_majority() {
                                round_info.set_decided(x, vote);
                                if vote {
                                    round_info.set_consensus_event(x);
                                    self.promote_atropos(&x, None)?;
                                }
                                votes.insert((y, x), vote);
                                break 'vote_loop;
                            }
                            votes.insert((y, x), vote);
                        } else {
                            // Coin round: keep a supermajority vote, else
                            // flip on the middle bit of the voter's hash.
                            if tally >= self.super_majority() {
                                votes.insert((y, x), vote);
                            } else {
                                votes.insert((y, x), coin_flip(&y));
                            }
                        }
                    }
                }
            }

            self.store.set_round_created(round_index, round_info.clone())?;
            if round_info.clotho_decided() {
                decided_rounds.push(round_index);
            }
        }

        let mut pending = self.pending_rounds.write();
        for pending_round in pending.iter_mut() {
            if decided_rounds.contains(&pending_round.index) {
                pending_round.decided = true;
            }
        }
        Ok(())
    }

    /// Assign a receiving frame to undetermined events: the first decided
    /// frame whose every atropos dominates the event.
    pub fn decide_round_received(&self) -> Result<(), PosetError> {
        let mut undetermined = self.undetermined_events.write();
        let mut remaining = Vec::with_capacity(undetermined.len());

        for x in undetermined.iter() {
            let event = self.store.get_event(x)?;
            if event.frame_received != FRAME_NIL {
                // Already placed by atropos propagation.
                continue;
            }
            let r = if event.frame != FRAME_NIL {
                event.frame
            } else {
                self.round(x)?
            };

            let mut received = false;
            for i in (r + 1)..=self.store.last_round() {
                let round_info = match self.store.get_round_created(i) {
                    Ok(rc) => rc,
                    Err(e) if e.is_not_found() => {
                        // Can happen after a reset or fast-forward.
                        if r < self.last_consensus_round_value() {
                            received = true;
                            break;
                        }
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                // Frames are visited in order; an undecided one means this
                // event cannot be received yet.
                if !round_info.clotho_decided() {
                    break;
                }
                let atropos = round_info.atropos();
                if atropos.is_empty() {
                    continue;
                }
                let mut all_dominate = true;
                for w in &atropos {
                    if !self.dominated(w, x)? {
                        all_dominate = false;
                        break;
                    }
                }
                if all_dominate {
                    received = true;
                    let mut ex = self.store.get_event(x)?;
                    if ex.frame_received == FRAME_NIL {
                        ex.frame_received = i;
                        self.store.set_event(ex.clone())?;
                        self.account_event(&ex);
                        self.store.add_consensus_event(&ex)?;
                        self.record_round_received(*x, i)?;
                        let mut round_info = self.store.get_round_created(i)?;
                        round_info.set_consensus_event(*x);
                        self.store.set_round_created(i, round_info)?;
                    }
                    break;
                }
            }
            if !received {
                remaining.push(*x);
            }
        }
        *undetermined = remaining;
        Ok(())
    }

    /// Emit blocks for decided frames, in order, gated by the store's frame
    /// finality. Pushing onto a full commit channel blocks; blocks are never
    /// dropped or reordered.
    pub fn process_decided_rounds(&self) -> Result<(), PosetError> {
        let _guard = self.decided.lock();

        let pending = self.pending_round_received.read().clone();
        let mut processed = 0usize;

        for &r in &pending {
            if !self.store.check_frame_finality(r) {
                break;
            }
            // Frames at or below the emission watermark are already
            // committed (or were the reset base); never revisit them.
            if self.last_emitted_round.read().map_or(false, |e| r <= e) {
                processed += 1;
                continue;
            }

            let frame = self.get_frame(r)?;
            tracing::debug!(
                round_received = r,
                events = frame.events.len(),
                "processing decided round"
            );

            let transactions: Vec<Vec<u8>> = frame
                .events
                .iter()
                .flat_map(|m| m.body.transactions.iter().cloned())
                .collect();
            if !transactions.is_empty() {
                let block = Block::new(
                    self.store.last_block_index() + 1,
                    r,
                    transactions,
                    frame.state_root,
                );
                self.store.set_block(block.clone())?;
                if let Some(commit) = &self.commit_tx {
                    commit
                        .blocking_send(block)
                        .map_err(|_| PosetError::CommitChannelClosed)?;
                }
            }

            processed += 1;
            *self.last_emitted_round.write() = Some(r);
            if self.last_consensus_round_value() < 0 || r > self.last_consensus_round_value() {
                self.set_last_consensus_round(r);
            }
            *self.next_final_frame.write() = r + 1;
        }

        if processed > 0 {
            let mut pending_received = self.pending_round_received.write();
            let last_processed = pending_received[processed - 1];
            pending_received.drain(..processed);
            drop(pending_received);

            let mut pending_rounds = self.pending_rounds.write();
            if let Some(pos) = pending_rounds
                .iter()
                .position(|p| p.index == last_processed)
            {
                pending_rounds.drain(..=pos);
            }
        }
        Ok(())
    }

    /// The frame for a receiving round, built on first use.
    pub fn get_frame(&self, round_received: i64) -> Result<Frame, PosetError> {
        match self.store.get_frame(round_received) {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_not_found() => self.make_frame(round_received),
            Err(e) => Err(e.into()),
        }
    }

    /// Assemble a frame: ordered consensus events, state application, and one
    /// root per participant (from their first event in the frame, or their
    /// last consensus event for absentees).
    fn make_frame(&self, round_received: i64) -> Result<Frame, PosetError> {
        let events = self.store.process_out_frame(round_received)?;
        let state_root = self.apply_internal_transactions(round_received, &events)?;

        let mut roots: HashMap<u64, Root> = HashMap::new();
        for event in &events {
            let creator_id = self
                .participants
                .by_pubkey(event.creator())
                .ok_or(PosetError::CreatorUnknown)?
                .id;
            if let std::collections::hash_map::Entry::Vacant(entry) = roots.entry(creator_id) {
                entry.insert(self.create_root(event)?);
            }
        }
        for peer in self.participants.to_peer_slice() {
            if roots.contains_key(&peer.id) {
                continue;
            }
            let (last_hash, is_root) = self.store.last_consensus_event_from(peer.id)?;
            let root = if is_root {
                self.store.get_root(peer.id)?
            } else {
                self.create_root(&self.store.get_event(&last_hash)?)?
            };
            roots.insert(peer.id, root);
        }

        // Other-parents outside the frame must remain resolvable after a
        // reset, so record them as dangling entries in the creator's root.
        let treated: HashSet<EventHash> = events.iter().map(|e| e.hash()).collect();
        for event in &events {
            let op = event.other_parent();
            if op.is_zero() || treated.contains(&op) {
                continue;
            }
            let creator_id = self
                .participants
                .by_pubkey(event.creator())
                .ok_or(PosetError::CreatorUnknown)?
                .id;
            let own_root_hash = roots
                .get(&creator_id)
                .map(|root| root.self_parent.hash)
                .unwrap_or_default();
            if event.self_parent() != own_root_hash {
                let other = self.create_other_parent_root_event(event)?;
                if let Some(root) = roots.get_mut(&creator_id) {
                    root.others.insert(event.hash().to_hex(), other);
                }
            }
        }

        let mut ordered_roots = Vec::with_capacity(self.participants.len());
        for peer in self.participants.to_peer_slice() {
            let root = roots
                .remove(&peer.id)
                .ok_or(PosetError::Store(StoreError::NoRoot(peer.id)))?;
            ordered_roots.push(root);
        }

        let frame = Frame {
            frame: round_received,
            roots: ordered_roots,
            events: events.into_iter().map(|e| e.message).collect(),
            state_root,
        };
        self.store.set_frame(frame.clone())?;
        Ok(frame)
    }

    /// Apply the frame's internal transactions to the previous frame's state.
    /// Frame 0 applies against the genesis root; later frames chain from the
    /// nearest stored frame below them.
    pub fn apply_internal_transactions(
        &self,
        round: i64,
        ordered_events: &[Event],
    ) -> Result<Hash, PosetError> {
        if round < 0 {
            return Err(PosetError::InvalidFrame(round));
        }
        let mut prev_state = self.store.state_root();
        let mut f = round - 1;
        while f >= 0 {
            match self.store.get_frame(f) {
                Ok(frame) => {
                    prev_state = frame.state_root;
                    break;
                }
                Err(e) if e.is_not_found() => f -= 1,
                Err(e) => return Err(e.into()),
            }
        }

        let mut snapshot = self.store.state().snapshot(&prev_state)?;
        for event in ordered_events {
            let Some(creator) = self.participants.by_pubkey(event.creator()) else {
                tracing::warn!(creator_id = event.creator_id(), "unknown participant");
                continue;
            };
            let sender = creator.public_key.fingerprint();
            for tx in event.internal_transactions() {
                if tx.tx_type != TransactionType::PosTransfer {
                    continue;
                }
                if !snapshot.transfer(&sender, &tx.receiver, tx.amount) {
                    tracing::warn!(
                        amount = tx.amount,
                        sender = %hex::encode(sender),
                        "balance too low, transfer skipped"
                    );
                }
            }
        }
        Ok(snapshot.commit(self.store.state()))
    }

    // ── Signature pool ───────────────────────────────────────────────────

    /// Feed a block signature (locally produced or gossiped out of band).
    pub fn add_block_signature(&self, signature: BlockSignature) {
        self.sig_pool.write().push(signature);
    }

    pub fn sig_pool_len(&self) -> usize {
        self.sig_pool.read().len()
    }

    /// Validate pooled signatures against their blocks, attach the good ones
    /// and advance the anchor block once a block clears the trust count.
    pub fn process_sig_pool(&self) -> Result<(), PosetError> {
        let pool = self.sig_pool.read().clone();
        let mut processed: HashSet<usize> = HashSet::new();

        for (i, bs) in pool.iter().enumerate() {
            if !self.participants.contains(&bs.validator) {
                tracing::warn!(index = bs.index, "block signature from unknown validator");
                processed.insert(i);
                continue;
            }
            let anchor = *self.anchor_block.read();
            if anchor.map_or(true, |a| bs.index > a) {
                let mut block = match self.store.get_block(bs.index) {
                    Ok(block) => block,
                    Err(e) if e.is_not_found() => {
                        // The block may simply not be cut yet; retry later.
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if !block.verify(bs) {
                    tracing::warn!(index = bs.index, "invalid block signature");
                    processed.insert(i);
                    continue;
                }
                block.set_signature(bs);
                self.store.set_block(block.clone())?;

                if block.signature_count() as u64 > self.trust_count()
                    && anchor.map_or(true, |a| block.index() > a)
                {
                    self.set_anchor_block(block.index());
                    tracing::debug!(
                        block_index = block.index(),
                        signatures = block.signature_count(),
                        trust_count = self.trust_count(),
                        "anchor block advanced"
                    );
                }
            }
            processed.insert(i);
        }

        if !processed.is_empty() {
            let mut pool_guard = self.sig_pool.write();
            let mut idx = 0usize;
            pool_guard.retain(|_| {
                let keep = idx >= pool.len() || !processed.contains(&idx);
                idx += 1;
                keep
            });
        }
        Ok(())
    }

    /// Error unless the block carries valid signatures from more than a third
    /// of participants.
    pub fn check_block(&self, block: &Block) -> Result<(), PosetError> {
        let valid = block.valid_signature_count();
        if valid <= self.trust_count() {
            return Err(PosetError::NotEnoughSignatures {
                got: valid,
                need: self.trust_count() + 1,
            });
        }
        Ok(())
    }

    // ── Anchor, reset, bootstrap ─────────────────────────────────────────

    /// The anchor block and its frame, the base for fast-forward.
    pub fn get_anchor_block_with_frame(&self) -> Result<(Block, Frame), PosetError> {
        let anchor = self.anchor_block.read().ok_or(PosetError::NoAnchorBlock)?;
        let block = self.store.get_block(anchor)?;
        let frame = self.get_frame(block.frame())?;
        Ok((block, frame))
    }

    /// Clear the poset and restart from a block/frame base. The frame's state
    /// root must already be installed in the store's state database.
    pub fn reset(&self, block: Block, frame: Frame) -> Result<(), PosetError> {
        *self.last_consensus_round.write() = None;
        *self.first_consensus_round.write() = None;
        *self.anchor_block.write() = None;
        self.undetermined_events.write().clear();
        self.pending_rounds.write().clear();
        self.pending_round_received.write().clear();
        self.sig_pool.write().clear();
        *self.pending_loaded_events.write() = 0;
        *self.topological_index.lock() = 0;
        *self.next_final_frame.write() = block.frame() + 1;
        *self.last_emitted_round.write() = Some(block.frame());

        self.dominator_cache.lock().clear();
        self.self_dominator_cache.lock().clear();
        self.strictly_dominated_cache.lock().clear();
        self.round_cache.lock().clear();
        self.timestamp_cache.lock().clear();

        let roots: HashMap<u64, Root> = frame
            .roots
            .iter()
            .map(|root| (root.self_parent.creator_id, root.clone()))
            .collect();
        self.store.reset(roots)?;
        self.store.set_block(block.clone())?;
        self.set_last_consensus_round(block.frame());

        // Frame events are stored in consensus order, which need not be a
        // valid insertion order. Insert with deferral until every parent
        // chain rebuilds; a full pass without progress means the frame is
        // not self-contained.
        let mut replay: Vec<Event> = frame
            .events
            .iter()
            .map(|message| Event::from_message(message.clone()))
            .collect();
        while !replay.is_empty() {
            let before = replay.len();
            let mut deferred = Vec::new();
            for event in replay {
                match self.insert_event(event.clone(), false) {
                    Ok(()) => {}
                    Err(PosetError::SelfParentMismatch | PosetError::OtherParentUnknown) => {
                        deferred.push(event);
                    }
                    Err(e) => return Err(e),
                }
            }
            if deferred.len() == before {
                return Err(PosetError::OtherParentUnknown);
            }
            replay = deferred;
        }
        Ok(())
    }

    /// Replay the durable store's events so the poset resumes at the graph's
    /// tip. Events that lost their engine state run through the normal
    /// insertion path; fully assigned events only rebuild the in-memory
    /// queues and counters.
    pub fn bootstrap(&self) -> Result<(), PosetError> {
        let events = self.store.topological_events()?;
        for stored in events {
            if stored.frame == FRAME_NIL {
                let event = Event::from_message(stored.message);
                self.insert_event(event, true)?;
                continue;
            }
            let hash = stored.hash();
            let _ = self.next_topological_index();
            if stored.frame_received == FRAME_NIL {
                self.undetermined_events.write().push(hash);
                if stored.is_loaded() {
                    *self.pending_loaded_events.write() += 1;
                }
            } else {
                self.set_last_consensus_round(stored.frame);
            }
        }
        if self.store.last_block_index() >= 0 {
            let block = self.store.get_block(self.store.last_block_index())?;
            *self.last_emitted_round.write() = Some(block.frame());
        }
        self.divide_rounds()?;
        self.decide_atropos()?;
        self.decide_round_received()?;
        self.process_decided_rounds()?;
        self.process_sig_pool()?;
        Ok(())
    }

    // ── Roots for frames ─────────────────────────────────────────────────

    fn create_self_parent_root_event(&self, event: &Event) -> Result<RootEvent, PosetError> {
        let sp = event.self_parent();
        let lamport = self.lamport_timestamp(&sp)?;
        let frame = self.round(&sp)?;
        let peer = self
            .participants
            .by_pubkey(event.creator())
            .ok_or(PosetError::CreatorUnknown)?;
        Ok(RootEvent {
            hash: sp,
            creator_id: peer.id,
            index: event.index() - 1,
            lamport_timestamp: lamport,
            frame,
        })
    }

    fn create_other_parent_root_event(&self, event: &Event) -> Result<RootEvent, PosetError> {
        let op = event.other_parent();
        // It may already be recorded as dangling in the creator's root.
        let creator_id = self
            .participants
            .by_pubkey(event.creator())
            .ok_or(PosetError::CreatorUnknown)?
            .id;
        let root = self.store.get_root(creator_id)?;
        if let Some(other) = root.other_for(&event.hash()) {
            if other.hash == op {
                return Ok(other.clone());
            }
        }
        let op_event = self.store.get_event(&op)?;
        let lamport = self.lamport_timestamp(&op)?;
        let frame = self.round(&op)?;
        let peer = self
            .participants
            .by_pubkey(op_event.creator())
            .ok_or(PosetError::CreatorUnknown)?;
        Ok(RootEvent {
            hash: op,
            creator_id: peer.id,
            index: op_event.index(),
            lamport_timestamp: lamport,
            frame,
        })
    }

    fn create_root(&self, event: &Event) -> Result<Root, PosetError> {
        let frame = self.round(&event.hash())?;
        let self_parent = self.create_self_parent_root_event(event)?;
        let mut others = BTreeMap::new();
        if !event.other_parent().is_zero() {
            let other = self.create_other_parent_root_event(event)?;
            others.insert(event.hash().to_hex(), other);
        }
        Ok(Root {
            next_frame: frame,
            self_parent,
            others,
        })
    }

    // ── Counters and getters ─────────────────────────────────────────────

    fn next_topological_index(&self) -> i64 {
        let mut guard = self.topological_index.lock();
        let index = *guard;
        *guard += 1;
        index
    }

    fn set_last_consensus_round(&self, round: i64) {
        let mut last = self.last_consensus_round.write();
        match *last {
            Some(current) if current >= round => {}
            _ => *last = Some(round),
        }
        let mut first = self.first_consensus_round.write();
        if first.is_none() {
            *first = Some(round);
        }
    }

    fn set_anchor_block(&self, index: i64) {
        *self.anchor_block.write() = Some(index);
    }

    pub fn last_consensus_round(&self) -> Option<i64> {
        *self.last_consensus_round.read()
    }

    /// −2 sorts below every frame including the base-root frame −1.
    fn last_consensus_round_value(&self) -> i64 {
        self.last_consensus_round.read().unwrap_or(-2)
    }

    pub fn anchor_block(&self) -> Option<i64> {
        *self.anchor_block.read()
    }

    pub fn undetermined_events(&self) -> Vec<EventHash> {
        self.undetermined_events.read().clone()
    }

    pub fn pending_loaded_events(&self) -> i64 {
        *self.pending_loaded_events.read()
    }

    pub fn consensus_transaction_count(&self) -> u64 {
        *self.consensus_transactions.read()
    }

    pub fn known_events(&self) -> BTreeMap<u64, i64> {
        self.store.known_events()
    }

    pub fn stats(&self) -> PosetStats {
        PosetStats {
            last_consensus_round: self.last_consensus_round(),
            last_round: self.store.last_round(),
            last_block_index: self.store.last_block_index(),
            anchor_block: self.anchor_block(),
            consensus_events: self.store.consensus_event_count(),
            consensus_transactions: self.consensus_transaction_count(),
            undetermined_events: self.undetermined_events.read().len(),
            pending_rounds: self.pending_rounds.read().len(),
            pending_loaded_events: self.pending_loaded_events(),
        }
    }

    /// The creators behind a random undetermined event's flag table; the
    /// smart peer selector targets peers missing from it.
    pub fn peer_flag_table_of_random_undetermined_event(&self) -> Option<HashMap<u64, i64>> {
        let undetermined = self.undetermined_events.read().clone();
        let mut order: Vec<usize> = (0..undetermined.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        for i in order {
            let Ok(event) = self.store.get_event(&undetermined[i]) else {
                continue;
            };
            if event.flag_table.len() >= self.participants.len() {
                continue;
            }
            let mut table = HashMap::new();
            for (hash, _) in event.flag_table.iter() {
                if let Ok(root) = self.store.get_event(hash) {
                    if let Some(peer) = self.participants.by_pubkey(root.creator()) {
                        table.insert(peer.id, 1);
                    }
                }
            }
            return Some(table);
        }
        None
    }
}

/// Coin-round fallback: the middle byte of the voter's hash decides. A zero
/// hash flips true.
fn coin_flip(hash: &EventHash) -> bool {
    hash.is_zero() || hash.0[hash.0.len() / 2] != 0
}

#[cfg(test)]
mod tests;
