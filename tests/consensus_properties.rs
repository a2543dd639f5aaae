//! Consensus property tests: replica-level scenarios over the public API.
//!
//! Each scenario builds explicit DAGs (no networking) and checks the
//! engine-level guarantees: fork rejection, quorum progress with a lazy
//! participant, deterministic total order across replicas, gap-free block
//! sequences, signature-threshold anchoring and state-root reproducibility.

use std::collections::BTreeMap;
use std::sync::Arc;

use moira::crypto::SigningKeypair;
use moira::peers::{peer_id, Peer, Peers};
use moira::poset::{
    Block, Event, EventHash, InmemStore, InternalTransaction, Poset, PosetError, Store,
    TransactionType,
};
use moira::Hash;

// ── Harness ─────────────────────────────────────────────────────────────

/// One replica: a poset over an in-memory store plus a commit channel.
struct Replica {
    poset: Poset,
    commit_rx: tokio::sync::mpsc::Receiver<Block>,
}

impl Replica {
    fn new(keypairs: &[SigningKeypair], genesis: Option<&BTreeMap<Hash, u64>>) -> Self {
        let peers = Arc::new(Peers::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| Peer::new(kp.public.clone(), format!("127.0.0.1:{}", 15000 + i)))
                .collect(),
        ));
        let store = match genesis {
            None => InmemStore::new(Arc::clone(&peers), 500),
            Some(balances) => {
                InmemStore::with_genesis(Arc::clone(&peers), 500, balances.clone())
            }
        };
        let (commit_tx, commit_rx) = tokio::sync::mpsc::channel(4096);
        let poset = Poset::new(Arc::clone(&peers), Arc::new(store), Some(commit_tx));
        Replica { poset, commit_rx }
    }

    fn insert(&self, event: &Event) -> Result<(), PosetError> {
        self.poset.insert_event(event.clone(), true)
    }

    fn run_pipeline(&self) {
        self.poset.divide_rounds().unwrap();
        self.poset.decide_atropos().unwrap();
        self.poset.decide_round_received().unwrap();
        self.poset.process_decided_rounds().unwrap();
        self.poset.process_sig_pool().unwrap();
    }

    fn drain_blocks(&mut self) -> Vec<Block> {
        let mut blocks = Vec::new();
        while let Ok(block) = self.commit_rx.try_recv() {
            blocks.push(block);
        }
        blocks
    }
}

/// Deterministic DAG builder shared by every replica in a scenario.
struct DagBuilder {
    keypairs: Vec<SigningKeypair>,
    heads: Vec<EventHash>,
    indices: Vec<i64>,
    events: Vec<Event>,
}

impl DagBuilder {
    fn new(n: usize) -> Self {
        let mut keypairs: Vec<_> = (0..n).map(|_| SigningKeypair::generate()).collect();
        // Registry order is id order; align participant i with registry i.
        keypairs.sort_by_key(|kp| peer_id(&kp.public));
        let heads = keypairs
            .iter()
            .map(|kp| moira::poset::root_self_parent_hash(peer_id(&kp.public)))
            .collect();
        let indices = vec![0; n];
        DagBuilder {
            keypairs,
            heads,
            indices,
            events: Vec::new(),
        }
    }

    fn event(
        &mut self,
        creator: usize,
        other_parent: EventHash,
        txs: Vec<Vec<u8>>,
        internal: Vec<InternalTransaction>,
    ) -> EventHash {
        let mut event = Event::new(
            txs,
            internal,
            self.heads[creator],
            other_parent,
            self.keypairs[creator].public.clone(),
            self.indices[creator],
            vec![],
        );
        event.sign(&self.keypairs[creator]);
        let hash = event.hash();
        self.heads[creator] = hash;
        self.indices[creator] += 1;
        self.events.push(event);
        hash
    }

    /// A zig-zag gossip layer over the given participants: each references
    /// the next one's head from the previous layer.
    fn layer(&mut self, participants: &[usize], layer: usize) {
        let prev_heads = self.heads.clone();
        for (pos, &i) in participants.iter().enumerate() {
            let other = if layer == 0 {
                EventHash::zero()
            } else {
                prev_heads[participants[(pos + 1) % participants.len()]]
            };
            self.event(i, other, vec![format!("tx-{i}-{layer}").into_bytes()], vec![]);
        }
    }
}

/// Feed every event (already in causal order) into a replica, running the
/// pipeline every few insertions to interleave decision-making with growth.
fn play(replica: &Replica, events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        replica.insert(event).unwrap();
        if i % 5 == 4 {
            replica.run_pipeline();
        }
    }
    replica.run_pipeline();
}

// ── Scenario 1: three-node happy path ───────────────────────────────────

#[test]
fn three_node_happy_path_orders_all_transactions() {
    let mut dag = DagBuilder::new(3);
    for layer in 0..16 {
        dag.layer(&[0, 1, 2], layer);
    }

    let mut replica = Replica::new(&dag.keypairs, None);
    play(&replica, &dag.events);

    let blocks = replica.drain_blocks();
    assert!(blocks.len() >= 3, "expected several blocks, got {}", blocks.len());
    for (k, block) in blocks.iter().enumerate() {
        assert_eq!(block.index(), k as i64, "block index gap");
    }

    // A's first transaction must be ordered strictly before C's last
    // committed transaction.
    let ordered: Vec<Vec<u8>> = blocks
        .iter()
        .flat_map(|b| b.transactions().iter().cloned())
        .collect();
    let a_first = ordered.iter().position(|tx| tx == b"tx-0-0");
    assert!(a_first.is_some(), "A's first transaction never committed");
    let c_last = ordered
        .iter()
        .rposition(|tx| tx.starts_with(b"tx-2-"))
        .expect("no C transaction committed");
    assert!(a_first.unwrap() < c_last);
}

// ── Scenario 2: lazy participant ────────────────────────────────────────

#[test]
fn lazy_participant_does_not_block_quorum() {
    let mut dag = DagBuilder::new(4);
    // D (participant 3) creates a single chain nobody references, and
    // references nobody; A, B, C gossip among themselves. Supermajority for
    // n = 4 is 3, so the three of them decide frames alone.
    for layer in 0..16 {
        dag.layer(&[0, 1, 2], layer);
        if layer % 4 == 0 {
            dag.event(3, EventHash::zero(), vec![format!("lazy-{layer}").into_bytes()], vec![]);
        }
    }

    let mut replica = Replica::new(&dag.keypairs, None);
    play(&replica, &dag.events);

    let blocks = replica.drain_blocks();
    assert!(!blocks.is_empty(), "A-B-C alone should still finalize frames");
    for block in &blocks {
        for tx in block.transactions() {
            assert!(
                !tx.starts_with(b"lazy-"),
                "an unreferenced participant's transaction was committed"
            );
        }
    }

    // D's events linger in the undetermined queue.
    let lazy_id = peer_id(&dag.keypairs[3].public);
    let undetermined = replica.poset.undetermined_events();
    let lazy_pending = undetermined.iter().any(|h| {
        replica
            .poset
            .store()
            .get_event(h)
            .map(|e| e.creator_id() == lazy_id)
            .unwrap_or(false)
    });
    assert!(lazy_pending, "lazy participant's events should stay undetermined");
}

// ── Scenario 3: fork rejection ──────────────────────────────────────────

#[test]
fn fork_is_rejected_and_store_unchanged() {
    let mut dag = DagBuilder::new(3);
    for layer in 0..6 {
        dag.layer(&[0, 1, 2], layer);
    }

    let replica = Replica::new(&dag.keypairs, None);
    play(&replica, &dag.events);

    let honest = dag
        .events
        .iter()
        .find(|e| e.creator() == &dag.keypairs[0].public && e.index() == 5)
        .unwrap();

    // Same creator, same index, different payload: a fork.
    let mut forged = Event::new(
        vec![b"equivocation".to_vec()],
        vec![],
        honest.self_parent(),
        honest.other_parent(),
        dag.keypairs[0].public.clone(),
        5,
        vec![],
    );
    forged.sign(&dag.keypairs[0]);
    assert_ne!(forged.hash(), honest.hash());

    let known_before = replica.poset.known_events();
    let err = replica.insert(&forged).unwrap_err();
    assert!(matches!(err, PosetError::SelfParentMismatch));
    assert_eq!(replica.poset.known_events(), known_before);
    assert!(replica.poset.store().get_event(&forged.hash()).is_err());
}

// ── Scenario 4: coin rounds still converge on a timestamp ───────────────

#[test]
fn coin_interval_votes_settle_on_minimum_lamport() {
    // The zig-zag keeps the voting stage starved (no supermajority paths),
    // so decisions come from the time-table machinery: votes at the
    // coin-interval boundary (gap = 4) record the minimum lamport, which the
    // next frame confirms.
    let mut dag = DagBuilder::new(3);
    for layer in 0..13 {
        dag.layer(&[0, 1, 2], layer);
    }

    let replica = Replica::new(&dag.keypairs, None);
    play(&replica, &dag.events);

    // The frame-0 roots are decided; their timestamps equal the minimum
    // lamport among the recorded votes, which the symmetric topology pins to
    // the frame-3 roots' lamport.
    for kp in &dag.keypairs {
        let id = peer_id(&kp.public);
        let leaf_hash = replica.poset.store().participant_event(id, 0).unwrap();
        let leaf = replica.poset.store().get_event(&leaf_hash).unwrap();
        assert!(leaf.is_atropos, "frame-0 root undecided");
        assert_eq!(leaf.frame_received, leaf.frame);
        assert_eq!(leaf.atropos_timestamp, 6, "expected the minimum vote lamport");
    }
}

// ── Scenario 5: signature threshold and anchor block ────────────────────

#[test]
fn anchor_advances_only_past_trust_count() {
    let keypairs: Vec<_> = {
        let mut kps: Vec<_> = (0..7).map(|_| SigningKeypair::generate()).collect();
        kps.sort_by_key(|kp| peer_id(&kp.public));
        kps
    };
    let replica = Replica::new(&keypairs, None);

    let block = Block::new(42, 3, vec![b"tx".to_vec()], [0u8; 32]);
    replica.poset.store().set_block(block.clone()).unwrap();

    // ⌊7/3⌋ = 2: two signatures are not enough.
    for kp in keypairs.iter().take(2) {
        replica.poset.add_block_signature(block.sign(kp));
    }
    replica.poset.process_sig_pool().unwrap();
    assert_eq!(replica.poset.anchor_block(), None);

    // The third signature crosses the threshold.
    replica.poset.add_block_signature(block.sign(&keypairs[2]));
    replica.poset.process_sig_pool().unwrap();
    assert_eq!(replica.poset.anchor_block(), Some(42));

    // A later block with only two signatures does not advance the anchor.
    let late = Block::new(43, 4, vec![b"tx".to_vec()], [0u8; 32]);
    replica.poset.store().set_block(late.clone()).unwrap();
    for kp in keypairs.iter().take(2) {
        replica.poset.add_block_signature(late.sign(kp));
    }
    replica.poset.process_sig_pool().unwrap();
    assert_eq!(replica.poset.anchor_block(), Some(42));
}

// ── Scenario 6: internal transactions and the state root ────────────────

#[test]
fn internal_transfer_reflects_in_state_root_and_replays_identically() {
    let run = |dag: &DagBuilder, genesis: &BTreeMap<Hash, u64>| -> (Vec<Block>, Hash) {
        let mut replica = Replica::new(&dag.keypairs, Some(genesis));
        play(&replica, &dag.events);
        let blocks = replica.drain_blocks();
        let root = blocks.last().map(|b| b.body.state_root).unwrap_or_default();
        (blocks, root)
    };

    let mut dag = DagBuilder::new(3);
    let receiver = dag.keypairs[1].public.fingerprint();
    let sender = dag.keypairs[0].public.fingerprint();
    let genesis: BTreeMap<Hash, u64> = [
        (sender, 100),
        (receiver, 0),
        (dag.keypairs[2].public.fingerprint(), 0),
    ]
    .into_iter()
    .collect();

    // A transfers 10 units to B in its very first event.
    dag.event(
        0,
        EventHash::zero(),
        vec![b"tx-0-0".to_vec()],
        vec![InternalTransaction {
            tx_type: TransactionType::PosTransfer,
            receiver,
            amount: 10,
        }],
    );
    dag.event(1, EventHash::zero(), vec![b"tx-1-0".to_vec()], vec![]);
    dag.event(2, EventHash::zero(), vec![b"tx-2-0".to_vec()], vec![]);
    for layer in 1..16 {
        dag.layer(&[0, 1, 2], layer);
    }

    let (blocks, _) = run(&dag, &genesis);
    assert!(!blocks.is_empty());

    let replica = Replica::new(&dag.keypairs, Some(&genesis));
    play(&replica, &dag.events);
    let frame0 = replica.poset.store().get_frame(0).unwrap();
    let snapshot = replica
        .poset
        .store()
        .state()
        .snapshot(&frame0.state_root)
        .unwrap();
    assert_eq!(snapshot.balance_of(&sender), 90);
    assert_eq!(snapshot.balance_of(&receiver), 10);

    // Replaying the same event set from genesis yields identical roots.
    let (replay_blocks, replay_root) = run(&dag, &genesis);
    let (first_blocks, first_root) = run(&dag, &genesis);
    assert_eq!(first_root, replay_root);
    assert_eq!(first_blocks.len(), replay_blocks.len());
}

// ── Total order determinism across replicas ─────────────────────────────

#[test]
fn replicas_agree_on_byte_identical_block_bodies() {
    let mut dag = DagBuilder::new(3);
    for layer in 0..16 {
        dag.layer(&[0, 1, 2], layer);
    }

    // Replica one sees the events in creation order; replica two sees each
    // layer in reversed participant order (still causal), with a different
    // pipeline interleaving.
    let mut replica_one = Replica::new(&dag.keypairs, None);
    play(&replica_one, &dag.events);

    let mut reordered: Vec<Event> = Vec::with_capacity(dag.events.len());
    for chunk in dag.events.chunks(3) {
        reordered.extend(chunk.iter().rev().cloned());
    }
    let mut replica_two = Replica::new(&dag.keypairs, None);
    for (i, event) in reordered.iter().enumerate() {
        replica_two.insert(event).unwrap();
        if i % 7 == 6 {
            replica_two.run_pipeline();
        }
    }
    replica_two.run_pipeline();

    let blocks_one = replica_one.drain_blocks();
    let blocks_two = replica_two.drain_blocks();
    assert!(!blocks_one.is_empty());
    assert_eq!(blocks_one.len(), blocks_two.len());
    for (a, b) in blocks_one.iter().zip(blocks_two.iter()) {
        assert_eq!(a.body, b.body, "replicas diverged at block {}", a.index());
        assert_eq!(a.hash(), b.hash());
    }
}

// ── Pipeline idempotence ────────────────────────────────────────────────

#[test]
fn pipeline_reruns_emit_nothing_new() {
    let mut dag = DagBuilder::new(3);
    for layer in 0..16 {
        dag.layer(&[0, 1, 2], layer);
    }
    let mut replica = Replica::new(&dag.keypairs, None);
    play(&replica, &dag.events);
    let blocks = replica.drain_blocks();
    assert!(!blocks.is_empty());

    for _ in 0..5 {
        replica.run_pipeline();
    }
    assert!(replica.drain_blocks().is_empty());
    assert_eq!(
        replica.poset.store().last_block_index(),
        blocks.last().unwrap().index()
    );
}

// ── Wire transport round-trip between replicas ──────────────────────────

#[test]
fn wire_events_rebuild_the_same_graph() {
    let mut dag = DagBuilder::new(3);
    for layer in 0..8 {
        dag.layer(&[0, 1, 2], layer);
    }
    let source = Replica::new(&dag.keypairs, None);
    play(&source, &dag.events);

    let sink = Replica::new(&dag.keypairs, None);
    for event in source.poset.store().topological_events().unwrap() {
        let wire = event.to_wire();
        let rebuilt = sink.poset.read_wire_info(&wire).unwrap();
        assert_eq!(rebuilt.hash(), event.hash());
        sink.poset.insert_event(rebuilt, false).unwrap();
    }
    assert_eq!(sink.poset.known_events(), source.poset.known_events());
}
