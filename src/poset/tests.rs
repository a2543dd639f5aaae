//! Poset unit tests: insertion, frame assignment, fork rejection, the
//! clotho/atropos machinery and block emission on small deterministic DAGs.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::*;
use crate::crypto::SigningKeypair;
use crate::peers::{Peer, Peers};

/// A deterministic test network: keypairs are sorted to match the registry's
/// id order, so participant `i` here is participant `i` everywhere.
struct TestNet {
    keypairs: Vec<SigningKeypair>,
    peers: Arc<Peers>,
    poset: Poset,
    heads: Vec<EventHash>,
    indices: Vec<i64>,
    commit_rx: tokio::sync::mpsc::Receiver<Block>,
}

impl TestNet {
    fn new(n: usize) -> Self {
        Self::with_genesis(n, None)
    }

    fn with_genesis(n: usize, balances: Option<Vec<u64>>) -> Self {
        let mut keypairs: Vec<_> = (0..n).map(|_| SigningKeypair::generate()).collect();
        keypairs.sort_by_key(|kp| crate::peers::peer_id(&kp.public));
        let peers = Arc::new(Peers::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| Peer::new(kp.public.clone(), format!("127.0.0.1:{}", 12000 + i)))
                .collect(),
        ));
        let store: Arc<dyn Store> = match balances {
            None => Arc::new(InmemStore::new(Arc::clone(&peers), 200)),
            Some(amounts) => {
                let map: BTreeMap<crate::Hash, u64> = keypairs
                    .iter()
                    .zip(amounts)
                    .map(|(kp, amount)| (kp.public.fingerprint(), amount))
                    .collect();
                Arc::new(InmemStore::with_genesis(Arc::clone(&peers), 200, map))
            }
        };
        let (commit_tx, commit_rx) = tokio::sync::mpsc::channel(1024);
        let poset = Poset::new(Arc::clone(&peers), store, Some(commit_tx));
        let heads = peers
            .to_peer_slice()
            .iter()
            .map(|p| root_self_parent_hash(p.id))
            .collect();
        TestNet {
            keypairs,
            peers,
            poset,
            heads,
            indices: vec![0; n],
            commit_rx,
        }
    }

    /// Append an event for participant `i` with an optional other-parent
    /// taken from participant `other`'s current head.
    fn add_event(&mut self, i: usize, other: Option<usize>, txs: Vec<Vec<u8>>) -> EventHash {
        self.add_event_internal(i, other, txs, vec![])
    }

    fn add_event_internal(
        &mut self,
        i: usize,
        other: Option<usize>,
        txs: Vec<Vec<u8>>,
        internal: Vec<InternalTransaction>,
    ) -> EventHash {
        let other_parent = other.map(|o| self.heads[o]).unwrap_or_else(EventHash::zero);
        let mut event = Event::new(
            txs,
            internal,
            self.heads[i],
            other_parent,
            self.keypairs[i].public.clone(),
            self.indices[i],
            vec![],
        );
        event.sign(&self.keypairs[i]);
        let hash = event.hash();
        self.poset.insert_event(event, true).unwrap();
        self.heads[i] = hash;
        self.indices[i] += 1;
        hash
    }

    /// One gossip layer: every participant references its right neighbour's
    /// previous head, carrying one payload transaction.
    fn zigzag_layer(&mut self, layer: usize) {
        let n = self.keypairs.len();
        let prev_heads = self.heads.clone();
        for i in 0..n {
            let other = (i + 1) % n;
            let other_parent = if layer == 0 { None } else { Some(other) };
            let mut event = Event::new(
                vec![format!("tx-{i}-{layer}").into_bytes()],
                vec![],
                self.heads[i],
                other_parent
                    .map(|o| prev_heads[o])
                    .unwrap_or_else(EventHash::zero),
                self.keypairs[i].public.clone(),
                self.indices[i],
                vec![],
            );
            event.sign(&self.keypairs[i]);
            let hash = event.hash();
            self.poset.insert_event(event, true).unwrap();
            self.heads[i] = hash;
            self.indices[i] += 1;
        }
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

#[test]
fn leaves_are_frame_zero_roots() {
    let mut net = TestNet::new(3);
    net.zigzag_layer(0);
    for head in &net.heads {
        let event = net.poset.store().get_event(head).unwrap();
        assert!(event.is_root);
        assert_eq!(event.frame, 0);
        assert_eq!(event.lamport_timestamp, 0);
        assert_eq!(event.flag_table.len(), 1);
    }
}

#[test]
fn frames_advance_every_other_layer() {
    let mut net = TestNet::new(3);
    for layer in 0..6 {
        net.zigzag_layer(layer);
    }
    // Layers 0, 2, 4 create the roots of frames 0, 1, 2.
    for (i, head) in net.heads.iter().enumerate() {
        let event = net.poset.store().get_event(head).unwrap();
        assert_eq!(event.frame, 2, "participant {i} head");
        assert_eq!(event.lamport_timestamp, 5);
    }
    assert_eq!(net.poset.store().round_clothos(1).len(), 3);
    assert_eq!(net.poset.store().round_clothos(2).len(), 3);
}

#[test]
fn lamport_and_self_parent_invariants() {
    let mut net = TestNet::new(4);
    for layer in 0..8 {
        net.zigzag_layer(layer);
    }
    let events = net.poset.store().topological_events().unwrap();
    for event in &events {
        // Self-parent linkage
        if let Ok(sp) = net.poset.store().get_event(&event.self_parent()) {
            assert_eq!(sp.creator(), event.creator());
            assert_eq!(sp.index(), event.index() - 1);
            // Lamport recurrence over known parents
            let op_lamport = net
                .poset
                .store()
                .get_event(&event.other_parent())
                .map(|op| op.lamport_timestamp)
                .unwrap_or(i64::MIN);
            assert_eq!(
                event.lamport_timestamp,
                1 + sp.lamport_timestamp.max(op_lamport)
            );
        }
    }
}

#[test]
fn fork_at_same_index_is_rejected() {
    let mut net = TestNet::new(3);
    for layer in 0..3 {
        net.zigzag_layer(layer);
    }
    let known_before = net.poset.known_events();

    // Participant 0's index-2 event exists; craft a conflicting body reusing
    // the same self-parent and index.
    let honest = net.poset.store().get_event(&net.heads[0]).unwrap();
    let mut forged = Event::new(
        vec![b"double spend".to_vec()],
        vec![],
        honest.self_parent(),
        EventHash::zero(),
        net.keypairs[0].public.clone(),
        honest.index(),
        vec![],
    );
    forged.sign(&net.keypairs[0]);

    let err = net.poset.insert_event(forged, true).unwrap_err();
    assert!(matches!(err, PosetError::SelfParentMismatch));
    assert_eq!(net.poset.known_events(), known_before);
}

#[test]
fn stale_self_parent_is_rejected() {
    let mut net = TestNet::new(3);
    for layer in 0..3 {
        net.zigzag_layer(layer);
    }
    // Index beyond the head but chained to an old self-parent.
    let old_head = net.poset.store().participant_event(
        net.peers.to_peer_slice()[0].id,
        0,
    ).unwrap();
    let mut event = Event::new(
        vec![],
        vec![],
        old_head,
        EventHash::zero(),
        net.keypairs[0].public.clone(),
        net.indices[0],
        vec![],
    );
    event.sign(&net.keypairs[0]);
    let err = net.poset.insert_event(event, true).unwrap_err();
    assert!(matches!(err, PosetError::SelfParentMismatch));
}

#[test]
fn bad_signature_is_rejected() {
    let mut net = TestNet::new(3);
    net.zigzag_layer(0);
    let stranger = SigningKeypair::generate();
    let mut event = Event::new(
        vec![],
        vec![],
        net.heads[0],
        EventHash::zero(),
        net.keypairs[0].public.clone(),
        1,
        vec![],
    );
    event.sign(&stranger); // wrong key
    let err = net.poset.insert_event(event, true).unwrap_err();
    assert!(matches!(err, PosetError::InvalidSignature));
}

#[test]
fn unknown_other_parent_is_rejected() {
    let mut net = TestNet::new(3);
    net.zigzag_layer(0);
    let mut event = Event::new(
        vec![],
        vec![],
        net.heads[0],
        EventHash([0xAB; 32]),
        net.keypairs[0].public.clone(),
        1,
        vec![],
    );
    event.sign(&net.keypairs[0]);
    let err = net.poset.insert_event(event, true).unwrap_err();
    assert!(matches!(err, PosetError::OtherParentUnknown));
}

#[test]
fn unknown_creator_is_rejected() {
    let net = TestNet::new(3);
    let stranger = SigningKeypair::generate();
    let mut event = Event::new(
        vec![],
        vec![],
        root_self_parent_hash(7),
        EventHash::zero(),
        stranger.public.clone(),
        0,
        vec![],
    );
    event.sign(&stranger);
    let err = net.poset.insert_event(event, true).unwrap_err();
    assert!(matches!(err, PosetError::CreatorUnknown));
}

#[test]
fn dominator_follows_ancestry() {
    let mut net = TestNet::new(3);
    let a0 = net.add_event(0, None, vec![]);
    let b0 = net.add_event(1, None, vec![]);
    let c0 = net.add_event(2, None, vec![]);
    let a1 = net.add_event(0, Some(1), vec![]); // a1 = (a0, b0)
    let b1 = net.add_event(1, Some(2), vec![]); // b1 = (b0, c0)
    let a2 = net.add_event(0, Some(1), vec![]); // a2 = (a1, b1)

    assert!(net.poset.dominator(&a1, &a0).unwrap());
    assert!(net.poset.dominator(&a1, &b0).unwrap());
    assert!(!net.poset.dominator(&a1, &c0).unwrap());
    assert!(net.poset.dominator(&a2, &c0).unwrap()); // via b1
    assert!(net.poset.dominator(&a2, &a2).unwrap());
    assert!(!net.poset.dominator(&b0, &a1).unwrap()); // direction matters

    assert!(net.poset.self_dominator(&a2, &a0).unwrap());
    assert!(!net.poset.self_dominator(&a2, &b0).unwrap());
    assert!(net.poset.self_dominator(&b1, &b1).unwrap());
}

#[test]
fn strictly_dominated_requires_supermajority_of_creators() {
    let mut net = TestNet::new(3);
    let a0 = net.add_event(0, None, vec![]);
    net.add_event(1, None, vec![]);
    net.add_event(2, None, vec![]);
    // b1 references a0, c1 references b1, a1 references c1: now a1's paths to
    // a0 pass through all three creators.
    let b1 = net.add_event(1, Some(0), vec![]);
    net.add_event(2, Some(1), vec![]);
    let a1 = net.add_event(0, Some(2), vec![]);

    assert!(net.poset.strictly_dominated(&a1, &a0).unwrap());
    assert!(!net.poset.strictly_dominated(&b1, &a0).unwrap());
}

#[test]
fn clothos_promote_after_three_frames() {
    let mut net = TestNet::new(3);
    for layer in 0..7 {
        net.zigzag_layer(layer);
    }
    // Frame-3 roots appear at layer 6 and promote the frame-0 roots.
    for peer in net.peers.to_peer_slice() {
        let leaf_hash = net.poset.store().participant_event(peer.id, 0).unwrap();
        let leaf = net.poset.store().get_event(&leaf_hash).unwrap();
        assert!(leaf.is_clotho, "frame-0 root of {} not promoted", peer.id);
    }
}

#[test]
fn atropos_timestamps_reach_supermajority_votes() {
    let mut net = TestNet::new(3);
    for layer in 0..11 {
        net.zigzag_layer(layer);
    }
    // Frame-5 roots (layer 10) aggregate the coin-round votes recorded by the
    // frame-4 roots and decide the frame-0 clothos.
    for peer in net.peers.to_peer_slice() {
        let leaf_hash = net.poset.store().participant_event(peer.id, 0).unwrap();
        let leaf = net.poset.store().get_event(&leaf_hash).unwrap();
        assert!(leaf.is_atropos);
        assert_eq!(leaf.frame_received, leaf.frame);
        assert!(leaf.atropos_timestamp >= 0);
    }
    assert!(net.poset.store().check_frame_finality(0));
}

#[test]
fn blocks_emit_in_order_without_gaps() {
    let mut net = TestNet::new(3);
    for layer in 0..15 {
        net.zigzag_layer(layer);
        net.run_pipeline();
    }
    let blocks = net.drain_blocks();
    assert!(!blocks.is_empty(), "no blocks emitted after 15 layers");
    for (k, block) in blocks.iter().enumerate() {
        assert_eq!(block.index(), k as i64);
        assert!(!block.transactions().is_empty());
    }
    let frames: Vec<i64> = blocks.iter().map(|b| b.frame()).collect();
    let mut sorted = frames.clone();
    sorted.sort_unstable();
    assert_eq!(frames, sorted, "blocks out of frame order");
}

#[test]
fn pipeline_is_idempotent_without_new_events() {
    let mut net = TestNet::new(3);
    for layer in 0..15 {
        net.zigzag_layer(layer);
        net.run_pipeline();
    }
    let first = net.drain_blocks();
    assert!(!first.is_empty());

    for _ in 0..3 {
        net.run_pipeline();
    }
    assert!(net.drain_blocks().is_empty(), "re-running the pipeline emitted blocks");
    assert_eq!(
        net.poset.store().last_block_index(),
        first.last().unwrap().index()
    );
}

#[test]
fn internal_transfer_updates_state_root() {
    let mut net = TestNet::with_genesis(3, Some(vec![100, 0, 0]));
    let receiver = net.keypairs[1].public.fingerprint();

    // Participant 0 moves 10 units to participant 1 in its first event.
    net.add_event_internal(
        0,
        None,
        vec![],
        vec![InternalTransaction {
            tx_type: TransactionType::PosTransfer,
            receiver,
            amount: 10,
        }],
    );
    net.add_event(1, None, vec![]);
    net.add_event(2, None, vec![]);
    for layer in 1..15 {
        net.zigzag_layer(layer);
        net.run_pipeline();
    }

    let frame0 = net.poset.store().get_frame(0).unwrap();
    let snapshot = net.poset.store().state().snapshot(&frame0.state_root).unwrap();
    assert_eq!(snapshot.balance_of(&net.keypairs[0].public.fingerprint()), 90);
    assert_eq!(snapshot.balance_of(&receiver), 10);
}

#[test]
fn wire_roundtrip_reinserts_on_peer() {
    let mut alice = TestNet::new(3);
    let bob = TestNet::with_same_identity(&alice);
    for layer in 0..4 {
        alice.zigzag_layer(layer);
    }
    // Replay Alice's graph onto Bob's empty poset via the wire form.
    for event in alice.poset.store().topological_events().unwrap() {
        let wire = event.to_wire();
        let rebuilt = bob.poset.read_wire_info(&wire).unwrap();
        assert_eq!(rebuilt.hash(), event.hash());
        bob.poset.insert_event(rebuilt, false).unwrap();
    }
    assert_eq!(bob.poset.known_events(), alice.poset.known_events());
}

impl TestNet {
    /// A second replica sharing the first one's identities, with an empty
    /// store.
    fn with_same_identity(other: &TestNet) -> TestNet {
        let keypairs = other.keypairs.clone();
        let peers = Arc::new(Peers::new(
            keypairs
                .iter()
                .enumerate()
                .map(|(i, kp)| Peer::new(kp.public.clone(), format!("127.0.0.1:{}", 12000 + i)))
                .collect(),
        ));
        let store: Arc<dyn Store> = Arc::new(InmemStore::new(Arc::clone(&peers), 200));
        let (commit_tx, commit_rx) = tokio::sync::mpsc::channel(1024);
        let poset = Poset::new(Arc::clone(&peers), store, Some(commit_tx));
        let heads = peers
            .to_peer_slice()
            .iter()
            .map(|p| root_self_parent_hash(p.id))
            .collect();
        let indices = vec![0; keypairs.len()];
        TestNet {
            keypairs,
            peers,
            poset,
            heads,
            indices,
            commit_rx,
        }
    }
}

#[test]
fn sig_pool_advances_anchor_past_trust_count() {
    let mut net = TestNet::new(7); // trust count 2, threshold 3 signatures
    net.zigzag_layer(0);

    let block = Block::new(42, 1, vec![b"tx".to_vec()], [0u8; 32]);
    net.poset.store().set_block(block.clone()).unwrap();

    for kp in net.keypairs.iter().take(2) {
        net.poset.add_block_signature(block.sign(kp));
    }
    net.poset.process_sig_pool().unwrap();
    assert_eq!(net.poset.anchor_block(), None, "2 signatures must not anchor");

    net.poset.add_block_signature(block.sign(&net.keypairs[2]));
    net.poset.process_sig_pool().unwrap();
    assert_eq!(net.poset.anchor_block(), Some(42));

    // A later block with only trust-count signatures does not advance.
    let late = Block::new(43, 2, vec![b"tx".to_vec()], [0u8; 32]);
    net.poset.store().set_block(late.clone()).unwrap();
    for kp in net.keypairs.iter().take(2) {
        net.poset.add_block_signature(late.sign(kp));
    }
    net.poset.process_sig_pool().unwrap();
    assert_eq!(net.poset.anchor_block(), Some(42));
}

#[test]
fn sig_pool_discards_unknown_validators_and_bad_signatures() {
    let mut net = TestNet::new(4);
    net.zigzag_layer(0);
    let block = Block::new(0, 0, vec![b"tx".to_vec()], [0u8; 32]);
    net.poset.store().set_block(block.clone()).unwrap();

    let stranger = SigningKeypair::generate();
    net.poset.add_block_signature(block.sign(&stranger));

    let mut tampered = block.sign(&net.keypairs[0]);
    tampered.signature = hex::encode([0u8; 64]);
    net.poset.add_block_signature(tampered);

    net.poset.process_sig_pool().unwrap();
    assert_eq!(net.poset.sig_pool_len(), 0);
    assert_eq!(net.poset.store().get_block(0).unwrap().signature_count(), 0);
}

#[test]
fn check_block_requires_more_than_trust_count() {
    let net = TestNet::new(7);
    let mut block = Block::new(0, 0, vec![b"tx".to_vec()], [0u8; 32]);
    for kp in net.keypairs.iter().take(2) {
        let bs = block.sign(kp);
        block.set_signature(&bs);
    }
    assert!(net.poset.check_block(&block).is_err());

    let bs = block.sign(&net.keypairs[2]);
    block.set_signature(&bs);
    net.poset.check_block(&block).unwrap();
}

#[test]
fn undetermined_events_drain_as_frames_decide() {
    let mut net = TestNet::new(3);
    for layer in 0..15 {
        net.zigzag_layer(layer);
        net.run_pipeline();
    }
    let undetermined = net.poset.undetermined_events();
    let total = net.poset.store().topological_events().unwrap().len();
    assert!(
        undetermined.len() < total,
        "no events ever left the undetermined queue"
    );
}
