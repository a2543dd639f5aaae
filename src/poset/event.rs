//! Events: the signed vertices of the DAG.
//!
//! An event's identity is the BLAKE3 hash of its canonically encoded body;
//! the creator signs that hash. Engine-assigned fields (frame, flag tables,
//! clotho/atropos marks, consensus timestamps) live outside the body and
//! never influence identity.

use serde::{Deserialize, Serialize};

use crate::crypto::{Signature, SigningKeypair, SigningPublicKey};
use crate::Hash;

use super::flag_table::FlagTable;

/// Sentinel for an unassigned lamport or atropos timestamp.
pub const LAMPORT_NIL: i64 = -1;
/// Sentinel for an unassigned frame or frame-received.
pub const FRAME_NIL: i64 = -1;

/// Content hash identifying an event.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct EventHash(pub Hash);

impl EventHash {
    pub fn zero() -> Self {
        EventHash([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for EventHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for EventHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Kinds of internal transactions. Only transfers mutate state; the remaining
/// kinds are reserved for a future staking path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    PosTransfer,
    PosDeposit,
    PosWithdraw,
}

/// A state-mutating transaction embedded in an event body. The sender is the
/// event's creator; the receiver is a participant address (key fingerprint).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalTransaction {
    pub tx_type: TransactionType,
    pub receiver: Hash,
    pub amount: u64,
}

/// A validator's signature over a committed block, gossiped inside events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    pub validator: SigningPublicKey,
    pub index: i64,
    /// Hex-encoded Ed25519 signature over the block body hash.
    pub signature: String,
}

/// The signed portion of an event. The content hash is a pure function of
/// this struct's canonical encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    /// Opaque application payload transactions.
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    /// `[self_parent, other_parent]`; the other parent may be zero.
    pub parents: Vec<EventHash>,
    pub creator: SigningPublicKey,
    /// Creator-local monotonic index; gap-free from 0.
    pub index: i64,
    pub block_signatures: Vec<BlockSignature>,
}

impl EventBody {
    /// Canonical encoding of the body. Field order is fixed by the struct;
    /// bincode with fix-int encoding is deterministic.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .unwrap_or_default()
    }

    /// Content hash over the canonical encoding.
    pub fn hash(&self) -> EventHash {
        EventHash(crate::hash_domain("moira.event.body", &self.canonical_bytes()))
    }
}

/// Body plus signature and the wire-level parent coordinates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub body: EventBody,
    /// Detached signature by the creator over the body hash.
    pub signature: Signature,
    pub self_parent_index: i64,
    pub other_parent_creator_id: u64,
    pub other_parent_index: i64,
    pub creator_id: u64,
    /// Per-process insertion sequence; used only for local replay.
    pub topological_index: i64,
}

/// An event with its engine-assigned consensus fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub message: EventMessage,
    pub lamport_timestamp: i64,
    pub frame: i64,
    pub flag_table: FlagTable,
    pub root_table: FlagTable,
    pub is_root: bool,
    pub is_clotho: bool,
    pub is_atropos: bool,
    pub atropos_timestamp: i64,
    pub frame_received: i64,
}

impl Event {
    pub fn new(
        transactions: Vec<Vec<u8>>,
        internal_transactions: Vec<InternalTransaction>,
        self_parent: EventHash,
        other_parent: EventHash,
        creator: SigningPublicKey,
        index: i64,
        block_signatures: Vec<BlockSignature>,
    ) -> Self {
        let body = EventBody {
            transactions,
            internal_transactions,
            parents: vec![self_parent, other_parent],
            creator,
            index,
            block_signatures,
        };
        Event {
            message: EventMessage {
                body,
                signature: Signature::empty(),
                self_parent_index: -1,
                other_parent_creator_id: 0,
                other_parent_index: -1,
                creator_id: 0,
                topological_index: -1,
            },
            lamport_timestamp: LAMPORT_NIL,
            frame: FRAME_NIL,
            flag_table: FlagTable::new(),
            root_table: FlagTable::new(),
            is_root: false,
            is_clotho: false,
            is_atropos: false,
            atropos_timestamp: LAMPORT_NIL,
            frame_received: FRAME_NIL,
        }
    }

    /// Wrap a message with unassigned engine fields; used when events arrive
    /// from the wire or are replayed from a stored frame.
    pub fn from_message(message: EventMessage) -> Self {
        Event {
            message,
            lamport_timestamp: LAMPORT_NIL,
            frame: FRAME_NIL,
            flag_table: FlagTable::new(),
            root_table: FlagTable::new(),
            is_root: false,
            is_clotho: false,
            is_atropos: false,
            atropos_timestamp: LAMPORT_NIL,
            frame_received: FRAME_NIL,
        }
    }

    pub fn hash(&self) -> EventHash {
        self.message.body.hash()
    }

    pub fn self_parent(&self) -> EventHash {
        self.message.body.parents.first().copied().unwrap_or_default()
    }

    pub fn other_parent(&self) -> EventHash {
        self.message.body.parents.get(1).copied().unwrap_or_default()
    }

    pub fn creator(&self) -> &SigningPublicKey {
        &self.message.body.creator
    }

    pub fn creator_id(&self) -> u64 {
        self.message.creator_id
    }

    pub fn index(&self) -> i64 {
        self.message.body.index
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.message.body.transactions
    }

    pub fn internal_transactions(&self) -> &[InternalTransaction] {
        &self.message.body.internal_transactions
    }

    pub fn block_signatures(&self) -> &[BlockSignature] {
        &self.message.body.block_signatures
    }

    /// An event is loaded when it carries anything the application cares
    /// about: payload, internal transactions, or a creator's first index.
    pub fn is_loaded(&self) -> bool {
        self.message.body.index == 0
            || !self.message.body.transactions.is_empty()
            || !self.message.body.internal_transactions.is_empty()
    }

    /// Sign the body hash with the creator's key.
    pub fn sign(&mut self, keypair: &SigningKeypair) {
        let hash = self.hash();
        self.message.signature = keypair.sign(&hash.0);
    }

    /// Recompute the content hash and verify the signature against the
    /// creator's public key.
    pub fn verify(&self) -> bool {
        let hash = self.hash();
        self.message.body.creator.verify(&hash.0, &self.message.signature)
    }

    pub fn set_wire_info(
        &mut self,
        self_parent_index: i64,
        other_parent_creator_id: u64,
        other_parent_index: i64,
        creator_id: u64,
    ) {
        self.message.self_parent_index = self_parent_index;
        self.message.other_parent_creator_id = other_parent_creator_id;
        self.message.other_parent_index = other_parent_index;
        self.message.creator_id = creator_id;
    }

    /// Convert to the compact gossip form: parent hashes drop out in favor of
    /// (creator-id, index) coordinates resolved by the receiver's store.
    pub fn to_wire(&self) -> WireEvent {
        WireEvent {
            transactions: self.message.body.transactions.clone(),
            internal_transactions: self.message.body.internal_transactions.clone(),
            self_parent_index: self.message.self_parent_index,
            other_parent_creator_id: self.message.other_parent_creator_id,
            other_parent_index: self.message.other_parent_index,
            creator_id: self.message.creator_id,
            index: self.message.body.index,
            block_signatures: self
                .message
                .body
                .block_signatures
                .iter()
                .map(|bs| WireBlockSignature {
                    index: bs.index,
                    signature: bs.signature.clone(),
                })
                .collect(),
            signature: self.message.signature.clone(),
        }
    }

    /// Fold the signature bytes into a u64 by XOR-ing big-endian 8-byte
    /// chunks; the final ordering tie-break, lowest first.
    pub fn signature_xor(&self) -> u64 {
        let bytes = self.message.signature.as_bytes();
        let mut acc = 0u64;
        for chunk in bytes.chunks(8) {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            acc ^= u64::from_be_bytes(word);
        }
        acc
    }

    /// Consensus ordering key: (atropos time, lamport, flag-table hash,
    /// signature fold, signature bytes). Events without an assigned atropos
    /// timestamp order by their lamport timestamp.
    pub fn consensus_order_key(&self) -> (i64, i64, Hash, u64, Vec<u8>) {
        let atropos = if self.atropos_timestamp == LAMPORT_NIL {
            self.lamport_timestamp
        } else {
            self.atropos_timestamp
        };
        (
            atropos,
            self.lamport_timestamp,
            self.flag_table.hash(),
            self.signature_xor(),
            self.message.signature.as_bytes().to_vec(),
        )
    }
}

/// A block signature as gossiped on the wire: the validator is implied by the
/// carrying event's creator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBlockSignature {
    pub index: i64,
    pub signature: String,
}

/// The gossip form of an event. Parents are referenced by (creator-id, index)
/// coordinates; the receiving poset resolves them to hashes through its store
/// and the creator's root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub transactions: Vec<Vec<u8>>,
    pub internal_transactions: Vec<InternalTransaction>,
    pub self_parent_index: i64,
    pub other_parent_creator_id: u64,
    pub other_parent_index: i64,
    pub creator_id: u64,
    pub index: i64,
    pub block_signatures: Vec<WireBlockSignature>,
    pub signature: Signature,
}

impl WireEvent {
    /// Expand wire block signatures with the creator's key.
    pub fn block_signatures(&self, validator: &SigningPublicKey) -> Vec<BlockSignature> {
        self.block_signatures
            .iter()
            .map(|ws| BlockSignature {
                validator: validator.clone(),
                index: ws.index,
                signature: ws.signature.clone(),
            })
            .collect()
    }
}
