//! In-memory store: the backend for tests and non-persistent nodes.
//!
//! Every collection sits behind its own lock so concurrent readers do not
//! serialize on a global. Events are retained for the lifetime of the store;
//! the poset needs arbitrary ancestry lookups and the in-memory store is the
//! only copy.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::peers::Peers;
use crate::state::{genesis_balances, StateDb};
use crate::{constants, Hash};

use super::block::Block;
use super::event::{Event, EventHash};
use super::flag_table::FlagTable;
use super::root::Root;
use super::round::{Frame, RoundCreated, RoundReceived};
use super::store::{sort_consensus_events, Store, StoreError};

pub struct InmemStore {
    cache_size: usize,
    participants: Arc<Peers>,
    events: RwLock<HashMap<EventHash, Event>>,
    participant_events: RwLock<HashMap<u64, Vec<EventHash>>>,
    roots_by_participant: RwLock<HashMap<u64, Root>>,
    roots_by_self_parent: RwLock<HashMap<EventHash, Root>>,
    round_created: RwLock<BTreeMap<i64, RoundCreated>>,
    round_received: RwLock<BTreeMap<i64, RoundReceived>>,
    blocks: RwLock<BTreeMap<i64, Block>>,
    frames: RwLock<BTreeMap<i64, Frame>>,
    clotho_checks: RwLock<HashMap<(i64, EventHash), EventHash>>,
    clotho_creator_checks: RwLock<HashMap<(i64, u64), EventHash>>,
    time_tables: RwLock<HashMap<EventHash, FlagTable>>,
    consensus_events: RwLock<Vec<EventHash>>,
    last_consensus_events: RwLock<HashMap<u64, EventHash>>,
    topological: RwLock<Vec<EventHash>>,
    last_round: AtomicI64,
    last_block: AtomicI64,
    state: StateDb,
    genesis_root: Hash,
}

impl InmemStore {
    /// Store with the default uniform genesis allocation.
    pub fn new(participants: Arc<Peers>, cache_size: usize) -> Self {
        let balances = genesis_balances(&participants, constants::GENESIS_BALANCE);
        Self::with_genesis(participants, cache_size, balances)
    }

    /// Store with explicit genesis balances (tests drive specific ledgers).
    pub fn with_genesis(
        participants: Arc<Peers>,
        cache_size: usize,
        balances: BTreeMap<Hash, u64>,
    ) -> Self {
        let mut roots_by_participant = HashMap::new();
        let mut roots_by_self_parent = HashMap::new();
        for peer in participants.to_peer_slice() {
            let root = Root::base(peer.id);
            roots_by_self_parent.insert(root.self_parent.hash, root.clone());
            roots_by_participant.insert(peer.id, root);
        }

        let state = StateDb::new();
        let genesis_root = state.genesis(balances);

        InmemStore {
            cache_size,
            participants,
            events: RwLock::new(HashMap::new()),
            participant_events: RwLock::new(HashMap::new()),
            roots_by_participant: RwLock::new(roots_by_participant),
            roots_by_self_parent: RwLock::new(roots_by_self_parent),
            round_created: RwLock::new(BTreeMap::new()),
            round_received: RwLock::new(BTreeMap::new()),
            blocks: RwLock::new(BTreeMap::new()),
            frames: RwLock::new(BTreeMap::new()),
            clotho_checks: RwLock::new(HashMap::new()),
            clotho_creator_checks: RwLock::new(HashMap::new()),
            time_tables: RwLock::new(HashMap::new()),
            consensus_events: RwLock::new(Vec::new()),
            last_consensus_events: RwLock::new(HashMap::new()),
            topological: RwLock::new(Vec::new()),
            last_round: AtomicI64::new(-1),
            last_block: AtomicI64::new(-1),
            state,
            genesis_root,
        }
    }

    fn creator_id_of(&self, event: &Event) -> Result<u64, StoreError> {
        self.participants
            .by_pubkey(event.creator())
            .map(|p| p.id)
            .ok_or(StoreError::UnknownParticipant(event.creator_id()))
    }
}

impl Store for InmemStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn participants(&self) -> Arc<Peers> {
        Arc::clone(&self.participants)
    }

    fn get_event(&self, hash: &EventHash) -> Result<Event, StoreError> {
        self.events
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound("event", hash.to_hex()))
    }

    fn set_event(&self, event: Event) -> Result<(), StoreError> {
        let hash = event.hash();
        let creator_id = self.creator_id_of(&event)?;
        let is_new = !self.events.read().contains_key(&hash);
        if is_new {
            let mut by_participant = self.participant_events.write();
            let list = by_participant.entry(creator_id).or_default();
            let index = event.index();
            if index != list.len() as i64 {
                return Err(StoreError::Backend(format!(
                    "event index {} breaks the gap-free sequence at {} for participant {}",
                    index,
                    list.len(),
                    creator_id
                )));
            }
            list.push(hash);
            self.topological.write().push(hash);
        }
        self.events.write().insert(hash, event);
        Ok(())
    }

    fn participant_event(&self, creator_id: u64, index: i64) -> Result<EventHash, StoreError> {
        if index >= 0 {
            if let Some(hash) = self
                .participant_events
                .read()
                .get(&creator_id)
                .and_then(|list| list.get(index as usize))
            {
                return Ok(*hash);
            }
        }
        let roots = self.roots_by_participant.read();
        let root = roots.get(&creator_id).ok_or(StoreError::NoRoot(creator_id))?;
        if root.self_parent.index == index {
            return Ok(root.self_parent.hash);
        }
        Err(StoreError::KeyNotFound(
            "participant event",
            format!("{creator_id}@{index}"),
        ))
    }

    fn last_event_from(&self, creator_id: u64) -> Result<(EventHash, bool), StoreError> {
        if let Some(hash) = self
            .participant_events
            .read()
            .get(&creator_id)
            .and_then(|list| list.last())
        {
            return Ok((*hash, false));
        }
        let roots = self.roots_by_participant.read();
        let root = roots.get(&creator_id).ok_or(StoreError::NoRoot(creator_id))?;
        Ok((root.self_parent.hash, true))
    }

    fn last_consensus_event_from(
        &self,
        creator_id: u64,
    ) -> Result<(EventHash, bool), StoreError> {
        if let Some(hash) = self.last_consensus_events.read().get(&creator_id) {
            return Ok((*hash, false));
        }
        let roots = self.roots_by_participant.read();
        let root = roots.get(&creator_id).ok_or(StoreError::NoRoot(creator_id))?;
        Ok((root.self_parent.hash, true))
    }

    fn known_events(&self) -> BTreeMap<u64, i64> {
        let by_participant = self.participant_events.read();
        self.participants
            .to_peer_slice()
            .iter()
            .map(|peer| {
                let max = by_participant
                    .get(&peer.id)
                    .map(|list| list.len() as i64 - 1)
                    .unwrap_or(-1);
                (peer.id, max)
            })
            .collect()
    }

    fn add_consensus_event(&self, event: &Event) -> Result<(), StoreError> {
        let creator_id = self.creator_id_of(event)?;
        let hash = event.hash();
        self.consensus_events.write().push(hash);
        self.last_consensus_events.write().insert(creator_id, hash);
        Ok(())
    }

    fn consensus_event_count(&self) -> i64 {
        self.consensus_events.read().len() as i64
    }

    fn get_root(&self, creator_id: u64) -> Result<Root, StoreError> {
        self.roots_by_participant
            .read()
            .get(&creator_id)
            .cloned()
            .ok_or(StoreError::NoRoot(creator_id))
    }

    fn root_by_self_parent(&self, hash: &EventHash) -> Option<Root> {
        self.roots_by_self_parent.read().get(hash).cloned()
    }

    fn roots_by_participant(&self) -> HashMap<u64, Root> {
        self.roots_by_participant.read().clone()
    }

    fn get_round_created(&self, frame: i64) -> Result<RoundCreated, StoreError> {
        self.round_created
            .read()
            .get(&frame)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound("round-created", frame.to_string()))
    }

    fn set_round_created(&self, frame: i64, round: RoundCreated) -> Result<(), StoreError> {
        self.round_created.write().insert(frame, round);
        self.last_round.fetch_max(frame, Ordering::SeqCst);
        Ok(())
    }

    fn get_round_received(&self, frame: i64) -> Result<RoundReceived, StoreError> {
        self.round_received
            .read()
            .get(&frame)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound("round-received", frame.to_string()))
    }

    fn set_round_received(&self, frame: i64, round: RoundReceived) -> Result<(), StoreError> {
        self.round_received.write().insert(frame, round);
        self.last_round.fetch_max(frame, Ordering::SeqCst);
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.last_round.load(Ordering::SeqCst)
    }

    fn round_clothos(&self, frame: i64) -> Vec<EventHash> {
        self.round_created
            .read()
            .get(&frame)
            .map(|round| round.clothos())
            .unwrap_or_default()
    }

    fn round_events(&self, frame: i64) -> usize {
        self.round_created
            .read()
            .get(&frame)
            .map(|round| round.event_count())
            .unwrap_or(0)
    }

    fn get_frame(&self, frame: i64) -> Result<Frame, StoreError> {
        self.frames
            .read()
            .get(&frame)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound("frame", frame.to_string()))
    }

    fn set_frame(&self, frame: Frame) -> Result<(), StoreError> {
        self.frames.write().insert(frame.frame, frame);
        Ok(())
    }

    fn get_block(&self, index: i64) -> Result<Block, StoreError> {
        self.blocks
            .read()
            .get(&index)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound("block", index.to_string()))
    }

    fn set_block(&self, block: Block) -> Result<(), StoreError> {
        let index = block.index();
        self.blocks.write().insert(index, block);
        self.last_block.fetch_max(index, Ordering::SeqCst);
        Ok(())
    }

    fn last_block_index(&self) -> i64 {
        self.last_block.load(Ordering::SeqCst)
    }

    fn add_clotho_check(
        &self,
        frame: i64,
        creator_id: u64,
        hash: EventHash,
    ) -> Result<(), StoreError> {
        self.clotho_checks.write().insert((frame, hash), hash);
        self.clotho_creator_checks
            .write()
            .insert((frame, creator_id), hash);
        Ok(())
    }

    fn get_clotho_check(&self, frame: i64, hash: &EventHash) -> Result<EventHash, StoreError> {
        self.clotho_checks
            .read()
            .get(&(frame, *hash))
            .copied()
            .ok_or_else(|| {
                StoreError::KeyNotFound("clotho-check", format!("{frame}_{hash}"))
            })
    }

    fn get_clotho_creator_check(
        &self,
        frame: i64,
        creator_id: u64,
    ) -> Result<EventHash, StoreError> {
        self.clotho_creator_checks
            .read()
            .get(&(frame, creator_id))
            .copied()
            .ok_or_else(|| {
                StoreError::KeyNotFound("clotho-creator-check", format!("{frame}_{creator_id}"))
            })
    }

    fn add_time_table(
        &self,
        to: &EventHash,
        from: &EventHash,
        lamport: i64,
    ) -> Result<(), StoreError> {
        let mut tables = self.time_tables.write();
        tables.entry(*to).or_default().insert(*from, lamport);
        Ok(())
    }

    fn get_time_table(&self, hash: &EventHash) -> Result<FlagTable, StoreError> {
        self.time_tables
            .read()
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::KeyNotFound("time-table", hash.to_hex()))
    }

    fn state(&self) -> &StateDb {
        &self.state
    }

    fn state_root(&self) -> Hash {
        self.genesis_root
    }

    fn check_frame_finality(&self, frame: i64) -> bool {
        self.round_created
            .read()
            .get(&frame)
            .map(|round| round.clotho_decided())
            .unwrap_or(false)
    }

    fn process_out_frame(&self, frame: i64) -> Result<Vec<Event>, StoreError> {
        let received = self.get_round_received(frame)?;
        let events = self.events.read();
        let mut out = Vec::with_capacity(received.rounds.len());
        for hash in &received.rounds {
            let event = events
                .get(hash)
                .cloned()
                .ok_or_else(|| StoreError::KeyNotFound("event", hash.to_hex()))?;
            out.push(event);
        }
        drop(events);
        sort_consensus_events(&mut out);
        Ok(out)
    }

    fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
        let order = self.topological.read();
        let events = self.events.read();
        order
            .iter()
            .map(|hash| {
                events
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| StoreError::KeyNotFound("event", hash.to_hex()))
            })
            .collect()
    }

    fn reset(&self, roots: HashMap<u64, Root>) -> Result<(), StoreError> {
        let mut by_self_parent = HashMap::new();
        for root in roots.values() {
            by_self_parent.insert(root.self_parent.hash, root.clone());
        }
        *self.roots_by_participant.write() = roots;
        *self.roots_by_self_parent.write() = by_self_parent;
        self.events.write().clear();
        self.participant_events.write().clear();
        self.round_created.write().clear();
        self.round_received.write().clear();
        self.clotho_checks.write().clear();
        self.clotho_creator_checks.write().clear();
        self.time_tables.write().clear();
        self.consensus_events.write().clear();
        self.last_consensus_events.write().clear();
        self.topological.write().clear();
        self.last_round.store(-1, Ordering::SeqCst);
        self.last_block.store(-1, Ordering::SeqCst);
        Ok(())
    }

    fn need_bootstrap(&self) -> bool {
        false
    }

    fn store_path(&self) -> Option<&Path> {
        None
    }

    fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeypair;
    use crate::peers::Peer;
    use crate::poset::root::root_self_parent_hash;

    fn setup(n: usize) -> (Vec<SigningKeypair>, Arc<Peers>, InmemStore) {
        let keypairs: Vec<_> = (0..n).map(|_| SigningKeypair::generate()).collect();
        let peers = Arc::new(Peers::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| Peer::new(kp.public.clone(), format!("127.0.0.1:{}", 12000 + i)))
                .collect(),
        ));
        let store = InmemStore::new(Arc::clone(&peers), 100);
        (keypairs, peers, store)
    }

    fn leaf(kp: &SigningKeypair, creator_id: u64) -> Event {
        let mut event = Event::new(
            vec![],
            vec![],
            root_self_parent_hash(creator_id),
            EventHash::zero(),
            kp.public.clone(),
            0,
            vec![],
        );
        event.sign(kp);
        event
    }

    #[test]
    fn event_roundtrip_and_participant_index() {
        let (keypairs, peers, store) = setup(1);
        let id = peers.to_peer_slice()[0].id;
        let event = leaf(&keypairs[0], id);
        let hash = event.hash();

        store.set_event(event.clone()).unwrap();
        assert_eq!(store.get_event(&hash).unwrap(), event);
        assert_eq!(store.participant_event(id, 0).unwrap(), hash);
        assert_eq!(store.last_event_from(id).unwrap(), (hash, false));
        assert_eq!(store.known_events().get(&id), Some(&0));
    }

    #[test]
    fn base_root_answers_before_any_event() {
        let (_, peers, store) = setup(1);
        let id = peers.to_peer_slice()[0].id;
        let (hash, is_root) = store.last_event_from(id).unwrap();
        assert!(is_root);
        assert_eq!(hash, root_self_parent_hash(id));
        assert_eq!(store.participant_event(id, -1).unwrap(), hash);
        assert_eq!(store.known_events().get(&id), Some(&-1));
    }

    #[test]
    fn index_gaps_are_rejected() {
        let (keypairs, peers, store) = setup(1);
        let id = peers.to_peer_slice()[0].id;
        let mut event = Event::new(
            vec![],
            vec![],
            root_self_parent_hash(id),
            EventHash::zero(),
            keypairs[0].public.clone(),
            2, // first event must be index 0
            vec![],
        );
        event.sign(&keypairs[0]);
        assert!(store.set_event(event).is_err());
    }

    #[test]
    fn unknown_creator_is_rejected() {
        let (_, _, store) = setup(1);
        let stranger = SigningKeypair::generate();
        let event = leaf(&stranger, 9);
        assert!(store.set_event(event).is_err());
    }

    #[test]
    fn clotho_checks_index_both_ways() {
        let (_, _, store) = setup(1);
        let hash = EventHash([4u8; 32]);
        store.add_clotho_check(2, 77, hash).unwrap();
        assert_eq!(store.get_clotho_check(2, &hash).unwrap(), hash);
        assert_eq!(store.get_clotho_creator_check(2, 77).unwrap(), hash);
        assert!(store.get_clotho_check(3, &hash).unwrap_err().is_not_found());
    }

    #[test]
    fn time_table_accumulates_votes() {
        let (_, _, store) = setup(1);
        let voter = EventHash([1u8; 32]);
        let clotho = EventHash([2u8; 32]);
        store.add_time_table(&voter, &clotho, 9).unwrap();
        store.add_time_table(&voter, &EventHash([3u8; 32]), 4).unwrap();
        let table = store.get_time_table(&voter).unwrap();
        assert_eq!(table.get(&clotho), Some(9));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn frame_finality_follows_round_decisions() {
        let (_, _, store) = setup(1);
        assert!(!store.check_frame_finality(0));

        let mut round = RoundCreated::new();
        round.add_event(EventHash([1u8; 32]), true);
        store.set_round_created(0, round.clone()).unwrap();
        assert!(!store.check_frame_finality(0));

        round.set_decided(EventHash([1u8; 32]), true);
        store.set_round_created(0, round).unwrap();
        assert!(store.check_frame_finality(0));
    }

    #[test]
    fn reset_reseeds_roots_and_clears_events() {
        let (keypairs, peers, store) = setup(1);
        let id = peers.to_peer_slice()[0].id;
        store.set_event(leaf(&keypairs[0], id)).unwrap();

        let roots: HashMap<u64, Root> = [(id, Root::base(id))].into_iter().collect();
        store.reset(roots).unwrap();

        assert_eq!(store.known_events().get(&id), Some(&-1));
        assert!(store.last_event_from(id).unwrap().1);
        assert_eq!(store.last_round(), -1);
    }
}
