//! Durable store backed by sled.
//!
//! One tree per keyspace: events, participant-event indices, roots, frames,
//! blocks, round-created, round-received, clotho-checks, time-tables,
//! consensus order. Frame- and index-scoped keys are zero-padded decimal so
//! lexical order equals numeric order and range scans come out sorted.
//!
//! Balance state is not persisted; a restarted node rebuilds it by replaying
//! the stored graph through `Poset::bootstrap`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::peers::Peers;
use crate::state::{genesis_balances, StateDb};
use crate::{constants, Hash};

use super::block::Block;
use super::cache::BoundedCache;
use super::event::{Event, EventHash};
use super::flag_table::FlagTable;
use super::root::Root;
use super::round::{Frame, RoundCreated, RoundReceived};
use super::store::{sort_consensus_events, Store, StoreError};

fn backend(e: sled::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn enc<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::legacy())
        .map_err(|e| StoreError::Backend(e.to_string()))
}

fn dec<T: serde::de::DeserializeOwned>(
    keyspace: &'static str,
    bytes: &[u8],
) -> Result<T, StoreError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
        .map(|(v, _)| v)
        .map_err(|e| StoreError::Corrupt(keyspace, e.to_string()))
}

/// Zero-padded decimal key preserving numeric order under lexical sort.
fn num_key(n: i64) -> Vec<u8> {
    format!("{n:020}").into_bytes()
}

fn pair_key(a: i64, b: u64) -> Vec<u8> {
    format!("{a:020}_{b:020}").into_bytes()
}

fn participant_key(creator_id: u64, index: i64) -> Vec<u8> {
    format!("{creator_id:020}_{index:020}").into_bytes()
}

fn frame_hash_key(frame: i64, hash: &EventHash) -> Vec<u8> {
    format!("{frame:020}_{}", hash.to_hex()).into_bytes()
}

pub struct SledStore {
    cache_size: usize,
    participants: Arc<Peers>,
    #[allow(dead_code)]
    db: sled::Db,
    events: sled::Tree,
    participant_events: sled::Tree,
    roots: sled::Tree,
    round_created: sled::Tree,
    round_received: sled::Tree,
    blocks: sled::Tree,
    frames: sled::Tree,
    clotho_checks: sled::Tree,
    clotho_creator_checks: sled::Tree,
    time_tables: sled::Tree,
    consensus: sled::Tree,
    last_consensus_events: sled::Tree,
    topo: sled::Tree,

    event_cache: Mutex<BoundedCache<EventHash, Event>>,
    /// events per participant, kept in step with the participant_events tree
    participant_counts: RwLock<HashMap<u64, i64>>,
    last_round: AtomicI64,
    last_block: AtomicI64,
    topo_seq: AtomicI64,
    consensus_seq: AtomicI64,
    need_bootstrap: bool,
    path: Option<PathBuf>,
    state: StateDb,
    genesis_root: Hash,
}

impl SledStore {
    /// Open or create a database at the given path.
    pub fn open(
        path: &Path,
        participants: Arc<Peers>,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(backend)?;
        Self::from_db(db, participants, cache_size, Some(path.to_path_buf()))
    }

    /// Open a temporary database (tests).
    pub fn open_temporary(
        participants: Arc<Peers>,
        cache_size: usize,
    ) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(backend)?;
        Self::from_db(db, participants, cache_size, None)
    }

    fn from_db(
        db: sled::Db,
        participants: Arc<Peers>,
        cache_size: usize,
        path: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        let events = db.open_tree("events").map_err(backend)?;
        let participant_events = db.open_tree("participant_events").map_err(backend)?;
        let roots = db.open_tree("roots").map_err(backend)?;
        let round_created = db.open_tree("round_created").map_err(backend)?;
        let round_received = db.open_tree("round_received").map_err(backend)?;
        let blocks = db.open_tree("blocks").map_err(backend)?;
        let frames = db.open_tree("frames").map_err(backend)?;
        let clotho_checks = db.open_tree("clotho_checks").map_err(backend)?;
        let clotho_creator_checks = db.open_tree("clotho_creator_checks").map_err(backend)?;
        let time_tables = db.open_tree("time_tables").map_err(backend)?;
        let consensus = db.open_tree("consensus").map_err(backend)?;
        let last_consensus_events = db.open_tree("last_consensus_events").map_err(backend)?;
        let topo = db.open_tree("topo").map_err(backend)?;

        let need_bootstrap = !events.is_empty();

        // Seed base roots for participants that have none yet.
        for peer in participants.to_peer_slice() {
            let key = peer.id.to_be_bytes();
            if roots.get(key).map_err(backend)?.is_none() {
                roots
                    .insert(key, enc(&Root::base(peer.id))?)
                    .map_err(backend)?;
            }
        }

        let mut participant_counts = HashMap::new();
        for peer in participants.to_peer_slice() {
            let prefix = format!("{:020}_", peer.id);
            let count = participant_events.scan_prefix(prefix.as_bytes()).count() as i64;
            participant_counts.insert(peer.id, count);
        }

        let last_key_of = |tree: &sled::Tree| -> Result<i64, StoreError> {
            match tree.last().map_err(backend)? {
                Some((key, _)) => std::str::from_utf8(&key)
                    .ok()
                    .and_then(|s| s.split('_').next())
                    .and_then(|s| s.parse::<i64>().ok())
                    .ok_or(StoreError::Corrupt("key", "non-numeric".into())),
                None => Ok(-1),
            }
        };

        let last_round = last_key_of(&round_created)?.max(last_key_of(&round_received)?);
        let last_block = last_key_of(&blocks)?;
        let topo_seq = last_key_of(&topo)? + 1;
        let consensus_seq = last_key_of(&consensus)? + 1;

        let state = StateDb::new();
        let genesis_root =
            state.genesis(genesis_balances(&participants, constants::GENESIS_BALANCE));

        Ok(SledStore {
            cache_size,
            participants,
            db,
            events,
            participant_events,
            roots,
            round_created,
            round_received,
            blocks,
            frames,
            clotho_checks,
            clotho_creator_checks,
            time_tables,
            consensus,
            last_consensus_events,
            topo,
            event_cache: Mutex::new(BoundedCache::new(cache_size)),
            participant_counts: RwLock::new(participant_counts),
            last_round: AtomicI64::new(last_round),
            last_block: AtomicI64::new(last_block),
            topo_seq: AtomicI64::new(topo_seq),
            consensus_seq: AtomicI64::new(consensus_seq),
            need_bootstrap,
            path,
            state,
            genesis_root,
        })
    }

    fn creator_id_of(&self, event: &Event) -> Result<u64, StoreError> {
        self.participants
            .by_pubkey(event.creator())
            .map(|p| p.id)
            .ok_or(StoreError::UnknownParticipant(event.creator_id()))
    }
}

impl Store for SledStore {
    fn cache_size(&self) -> usize {
        self.cache_size
    }

    fn participants(&self) -> Arc<Peers> {
        Arc::clone(&self.participants)
    }

    fn get_event(&self, hash: &EventHash) -> Result<Event, StoreError> {
        if let Some(event) = self.event_cache.lock().get(hash) {
            return Ok(event);
        }
        let bytes = self
            .events
            .get(hash.0)
            .map_err(backend)?
            .ok_or_else(|| StoreError::KeyNotFound("event", hash.to_hex()))?;
        let event: Event = dec("events", &bytes)?;
        self.event_cache.lock().insert(*hash, event.clone());
        Ok(event)
    }

    fn set_event(&self, event: Event) -> Result<(), StoreError> {
        let hash = event.hash();
        let creator_id = self.creator_id_of(&event)?;
        let is_new = self.events.get(hash.0).map_err(backend)?.is_none();
        if is_new {
            let mut counts = self.participant_counts.write();
            let count = counts.entry(creator_id).or_insert(0);
            if event.index() != *count {
                return Err(StoreError::Backend(format!(
                    "event index {} breaks the gap-free sequence at {} for participant {}",
                    event.index(),
                    count,
                    creator_id
                )));
            }
            self.participant_events
                .insert(participant_key(creator_id, event.index()), &hash.0)
                .map_err(backend)?;
            *count += 1;

            let seq = self.topo_seq.fetch_add(1, Ordering::SeqCst);
            self.topo.insert(num_key(seq), &hash.0).map_err(backend)?;
        }
        self.events.insert(hash.0, enc(&event)?).map_err(backend)?;
        self.event_cache.lock().insert(hash, event);
        Ok(())
    }

    fn participant_event(&self, creator_id: u64, index: i64) -> Result<EventHash, StoreError> {
        if index >= 0 {
            if let Some(bytes) = self
                .participant_events
                .get(participant_key(creator_id, index))
                .map_err(backend)?
            {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                return Ok(EventHash(hash));
            }
        }
        let root = self.get_root(creator_id)?;
        if root.self_parent.index == index {
            return Ok(root.self_parent.hash);
        }
        Err(StoreError::KeyNotFound(
            "participant event",
            format!("{creator_id}@{index}"),
        ))
    }

    fn last_event_from(&self, creator_id: u64) -> Result<(EventHash, bool), StoreError> {
        let count = self
            .participant_counts
            .read()
            .get(&creator_id)
            .copied()
            .unwrap_or(0);
        if count > 0 {
            return Ok((self.participant_event(creator_id, count - 1)?, false));
        }
        let root = self.get_root(creator_id)?;
        Ok((root.self_parent.hash, true))
    }

    fn last_consensus_event_from(
        &self,
        creator_id: u64,
    ) -> Result<(EventHash, bool), StoreError> {
        if let Some(bytes) = self
            .last_consensus_events
            .get(creator_id.to_be_bytes())
            .map_err(backend)?
        {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            return Ok((EventHash(hash), false));
        }
        let root = self.get_root(creator_id)?;
        Ok((root.self_parent.hash, true))
    }

    fn known_events(&self) -> BTreeMap<u64, i64> {
        let counts = self.participant_counts.read();
        self.participants
            .to_peer_slice()
            .iter()
            .map(|peer| (peer.id, counts.get(&peer.id).copied().unwrap_or(0) - 1))
            .collect()
    }

    fn add_consensus_event(&self, event: &Event) -> Result<(), StoreError> {
        let creator_id = self.creator_id_of(event)?;
        let hash = event.hash();
        let seq = self.consensus_seq.fetch_add(1, Ordering::SeqCst);
        self.consensus.insert(num_key(seq), &hash.0).map_err(backend)?;
        self.last_consensus_events
            .insert(creator_id.to_be_bytes(), &hash.0)
            .map_err(backend)?;
        Ok(())
    }

    fn consensus_event_count(&self) -> i64 {
        self.consensus_seq.load(Ordering::SeqCst)
    }

    fn get_root(&self, creator_id: u64) -> Result<Root, StoreError> {
        let bytes = self
            .roots
            .get(creator_id.to_be_bytes())
            .map_err(backend)?
            .ok_or(StoreError::NoRoot(creator_id))?;
        dec("roots", &bytes)
    }

    fn root_by_self_parent(&self, hash: &EventHash) -> Option<Root> {
        for item in self.roots.iter() {
            let Ok((_, bytes)) = item else { continue };
            let Ok(root) = dec::<Root>("roots", &bytes) else {
                continue;
            };
            if root.self_parent.hash == *hash {
                return Some(root);
            }
        }
        None
    }

    fn roots_by_participant(&self) -> HashMap<u64, Root> {
        let mut out = HashMap::new();
        for item in self.roots.iter() {
            let Ok((_, bytes)) = item else { continue };
            if let Ok(root) = dec::<Root>("roots", &bytes) {
                out.insert(root.self_parent.creator_id, root);
            }
        }
        out
    }

    fn get_round_created(&self, frame: i64) -> Result<RoundCreated, StoreError> {
        let bytes = self
            .round_created
            .get(num_key(frame))
            .map_err(backend)?
            .ok_or_else(|| StoreError::KeyNotFound("round-created", frame.to_string()))?;
        dec("round_created", &bytes)
    }

    fn set_round_created(&self, frame: i64, round: RoundCreated) -> Result<(), StoreError> {
        self.round_created
            .insert(num_key(frame), enc(&round)?)
            .map_err(backend)?;
        self.last_round.fetch_max(frame, Ordering::SeqCst);
        Ok(())
    }

    fn get_round_received(&self, frame: i64) -> Result<RoundReceived, StoreError> {
        let bytes = self
            .round_received
            .get(num_key(frame))
            .map_err(backend)?
            .ok_or_else(|| StoreError::KeyNotFound("round-received", frame.to_string()))?;
        dec("round_received", &bytes)
    }

    fn set_round_received(&self, frame: i64, round: RoundReceived) -> Result<(), StoreError> {
        self.round_received
            .insert(num_key(frame), enc(&round)?)
            .map_err(backend)?;
        self.last_round.fetch_max(frame, Ordering::SeqCst);
        Ok(())
    }

    fn last_round(&self) -> i64 {
        self.last_round.load(Ordering::SeqCst)
    }

    fn round_clothos(&self, frame: i64) -> Vec<EventHash> {
        self.get_round_created(frame)
            .map(|round| round.clothos())
            .unwrap_or_default()
    }

    fn round_events(&self, frame: i64) -> usize {
        self.get_round_created(frame)
            .map(|round| round.event_count())
            .unwrap_or(0)
    }

    fn get_frame(&self, frame: i64) -> Result<Frame, StoreError> {
        let bytes = self
            .frames
            .get(num_key(frame))
            .map_err(backend)?
            .ok_or_else(|| StoreError::KeyNotFound("frame", frame.to_string()))?;
        dec("frames", &bytes)
    }

    fn set_frame(&self, frame: Frame) -> Result<(), StoreError> {
        self.frames
            .insert(num_key(frame.frame), enc(&frame)?)
            .map_err(backend)?;
        Ok(())
    }

    fn get_block(&self, index: i64) -> Result<Block, StoreError> {
        let bytes = self
            .blocks
            .get(num_key(index))
            .map_err(backend)?
            .ok_or_else(|| StoreError::KeyNotFound("block", index.to_string()))?;
        dec("blocks", &bytes)
    }

    fn set_block(&self, block: Block) -> Result<(), StoreError> {
        let index = block.index();
        self.blocks
            .insert(num_key(index), enc(&block)?)
            .map_err(backend)?;
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
        self.clotho_checks
            .insert(frame_hash_key(frame, &hash), &hash.0)
            .map_err(backend)?;
        self.clotho_creator_checks
            .insert(pair_key(frame, creator_id), &hash.0)
            .map_err(backend)?;
        Ok(())
    }

    fn get_clotho_check(&self, frame: i64, hash: &EventHash) -> Result<EventHash, StoreError> {
        let bytes = self
            .clotho_checks
            .get(frame_hash_key(frame, hash))
            .map_err(backend)?
            .ok_or_else(|| {
                StoreError::KeyNotFound("clotho-check", format!("{frame}_{hash}"))
            })?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(EventHash(out))
    }

    fn get_clotho_creator_check(
        &self,
        frame: i64,
        creator_id: u64,
    ) -> Result<EventHash, StoreError> {
        let bytes = self
            .clotho_creator_checks
            .get(pair_key(frame, creator_id))
            .map_err(backend)?
            .ok_or_else(|| {
                StoreError::KeyNotFound("clotho-creator-check", format!("{frame}_{creator_id}"))
            })?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(EventHash(out))
    }

    fn add_time_table(
        &self,
        to: &EventHash,
        from: &EventHash,
        lamport: i64,
    ) -> Result<(), StoreError> {
        let mut table = match self.time_tables.get(to.0).map_err(backend)? {
            Some(bytes) => FlagTable::unmarshal(&bytes)
                .ok_or(StoreError::Corrupt("time_tables", "bad flag table".into()))?,
            None => FlagTable::new(),
        };
        table.insert(*from, lamport);
        self.time_tables
            .insert(to.0, table.marshal())
            .map_err(backend)?;
        Ok(())
    }

    fn get_time_table(&self, hash: &EventHash) -> Result<FlagTable, StoreError> {
        let bytes = self
            .time_tables
            .get(hash.0)
            .map_err(backend)?
            .ok_or_else(|| StoreError::KeyNotFound("time-table", hash.to_hex()))?;
        FlagTable::unmarshal(&bytes)
            .ok_or(StoreError::Corrupt("time_tables", "bad flag table".into()))
    }

    fn state(&self) -> &StateDb {
        &self.state
    }

    fn state_root(&self) -> Hash {
        self.genesis_root
    }

    fn check_frame_finality(&self, frame: i64) -> bool {
        self.get_round_created(frame)
            .map(|round| round.clotho_decided())
            .unwrap_or(false)
    }

    fn process_out_frame(&self, frame: i64) -> Result<Vec<Event>, StoreError> {
        let received = self.get_round_received(frame)?;
        let mut out = Vec::with_capacity(received.rounds.len());
        for hash in &received.rounds {
            out.push(self.get_event(hash)?);
        }
        sort_consensus_events(&mut out);
        Ok(out)
    }

    fn topological_events(&self) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::new();
        for item in self.topo.iter() {
            let (_, bytes) = item.map_err(backend)?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&bytes);
            out.push(self.get_event(&EventHash(hash))?);
        }
        Ok(out)
    }

    fn reset(&self, roots: HashMap<u64, Root>) -> Result<(), StoreError> {
        for tree in [
            &self.events,
            &self.participant_events,
            &self.round_created,
            &self.round_received,
            &self.clotho_checks,
            &self.clotho_creator_checks,
            &self.time_tables,
            &self.consensus,
            &self.last_consensus_events,
            &self.topo,
        ] {
            tree.clear().map_err(backend)?;
        }
        self.roots.clear().map_err(backend)?;
        for (creator_id, root) in &roots {
            self.roots
                .insert(creator_id.to_be_bytes(), enc(root)?)
                .map_err(backend)?;
        }
        self.event_cache.lock().clear();
        let mut counts = self.participant_counts.write();
        for count in counts.values_mut() {
            *count = 0;
        }
        drop(counts);
        self.last_round.store(-1, Ordering::SeqCst);
        self.last_block.store(-1, Ordering::SeqCst);
        self.topo_seq.store(0, Ordering::SeqCst);
        self.consensus_seq.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn need_bootstrap(&self) -> bool {
        self.need_bootstrap
    }

    fn store_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn close(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(backend)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeypair;
    use crate::peers::Peer;
    use crate::poset::root::root_self_parent_hash;

    fn setup(n: usize) -> (Vec<SigningKeypair>, Arc<Peers>, SledStore) {
        let keypairs: Vec<_> = (0..n).map(|_| SigningKeypair::generate()).collect();
        let peers = Arc::new(Peers::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| Peer::new(kp.public.clone(), format!("127.0.0.1:{}", 13000 + i)))
                .collect(),
        ));
        let store = SledStore::open_temporary(Arc::clone(&peers), 100).unwrap();
        (keypairs, peers, store)
    }

    fn leaf(kp: &SigningKeypair, creator_id: u64) -> Event {
        let mut event = Event::new(
            vec![b"payload".to_vec()],
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
    fn event_roundtrip_through_disk() {
        let (keypairs, peers, store) = setup(1);
        let id = peers.to_peer_slice()[0].id;
        let event = leaf(&keypairs[0], id);
        let hash = event.hash();

        store.set_event(event.clone()).unwrap();
        assert_eq!(store.get_event(&hash).unwrap(), event);
        assert_eq!(store.participant_event(id, 0).unwrap(), hash);
        assert_eq!(store.known_events().get(&id), Some(&0));
        assert_eq!(store.topological_events().unwrap(), vec![event]);
    }

    #[test]
    fn base_roots_are_seeded_on_open() {
        let (_, peers, store) = setup(3);
        for peer in peers.to_peer_slice() {
            let root = store.get_root(peer.id).unwrap();
            assert_eq!(root.self_parent.index, -1);
            assert!(store
                .root_by_self_parent(&root_self_parent_hash(peer.id))
                .is_some());
        }
    }

    #[test]
    fn round_and_block_records_persist() {
        let (_, _, store) = setup(1);
        let mut round = RoundCreated::new();
        round.add_event(EventHash([1u8; 32]), true);
        store.set_round_created(2, round.clone()).unwrap();
        assert_eq!(store.get_round_created(2).unwrap(), round);
        assert_eq!(store.last_round(), 2);

        let block = Block::new(0, 2, vec![b"tx".to_vec()], [0u8; 32]);
        store.set_block(block.clone()).unwrap();
        assert_eq!(store.get_block(0).unwrap(), block);
        assert_eq!(store.last_block_index(), 0);
    }

    #[test]
    fn time_tables_merge_on_disk() {
        let (_, _, store) = setup(1);
        let voter = EventHash([1u8; 32]);
        store.add_time_table(&voter, &EventHash([2u8; 32]), 5).unwrap();
        store.add_time_table(&voter, &EventHash([3u8; 32]), 6).unwrap();
        assert_eq!(store.get_time_table(&voter).unwrap().len(), 2);
    }

    #[test]
    fn reopen_detects_existing_graph() {
        let dir = tempfile::tempdir().unwrap();
        let keypairs: Vec<_> = (0..1).map(|_| SigningKeypair::generate()).collect();
        let peers = Arc::new(Peers::new(vec![Peer::new(
            keypairs[0].public.clone(),
            "127.0.0.1:13000".into(),
        )]));
        let id = peers.to_peer_slice()[0].id;

        {
            let store = SledStore::open(dir.path(), Arc::clone(&peers), 100).unwrap();
            assert!(!store.need_bootstrap());
            store.set_event(leaf(&keypairs[0], id)).unwrap();
            store.close().unwrap();
        }

        let store = SledStore::open(dir.path(), peers, 100).unwrap();
        assert!(store.need_bootstrap());
        assert_eq!(store.known_events().get(&id), Some(&0));
        assert_eq!(store.topological_events().unwrap().len(), 1);
    }
}
