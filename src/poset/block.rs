//! Blocks: the ordered output of a finalized frame.
//!
//! The block body (index, frame, transactions, state root) is the signed and
//! determinism-relevant content. The creation time and the accumulated
//! validator signatures live outside the body, so identical event sets
//! produce byte-identical bodies on every replica.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::crypto::{Signature, SigningKeypair, SigningPublicKey};
use crate::Hash;

use super::event::BlockSignature;

/// The signed content of a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockBody {
    /// Monotonic block index, gap-free from 0.
    pub index: i64,
    /// The finalized frame this block was cut from.
    pub frame: i64,
    /// Payload transactions in consensus order.
    pub transactions: Vec<Vec<u8>>,
    /// State root after applying the frame's internal transactions.
    pub state_root: Hash,
}

/// A committed block with its out-of-band signature map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub body: BlockBody,
    /// validator key hex → signature hex, populated by the signature pool.
    pub signatures: BTreeMap<String, String>,
    pub created_time: u64,
}

impl Block {
    pub fn new(index: i64, frame: i64, transactions: Vec<Vec<u8>>, state_root: Hash) -> Self {
        let created_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Block {
            body: BlockBody {
                index,
                frame,
                transactions,
                state_root,
            },
            signatures: BTreeMap::new(),
            created_time,
        }
    }

    pub fn index(&self) -> i64 {
        self.body.index
    }

    pub fn frame(&self) -> i64 {
        self.body.frame
    }

    pub fn transactions(&self) -> &[Vec<u8>] {
        &self.body.transactions
    }

    /// Hash of the canonically encoded body; what validators sign.
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serde::encode_to_vec(&self.body, bincode::config::legacy())
            .unwrap_or_default();
        crate::hash_domain("moira.block.body", &bytes)
    }

    /// Produce this validator's signature over the block.
    pub fn sign(&self, keypair: &SigningKeypair) -> BlockSignature {
        let sig = keypair.sign(&self.hash());
        BlockSignature {
            validator: keypair.public.clone(),
            index: self.body.index,
            signature: sig.to_hex(),
        }
    }

    /// Verify a block signature against this block's body hash.
    pub fn verify(&self, bs: &BlockSignature) -> bool {
        if bs.index != self.body.index {
            return false;
        }
        let Ok(bytes) = hex::decode(&bs.signature) else {
            return false;
        };
        let Some(sig) = Signature::from_bytes(&bytes) else {
            return false;
        };
        bs.validator.verify(&self.hash(), &sig)
    }

    /// Attach a verified signature to the block's signature map.
    pub fn set_signature(&mut self, bs: &BlockSignature) {
        self.signatures
            .insert(bs.validator.to_hex(), bs.signature.clone());
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }

    /// Count signatures in the map that verify against the body hash.
    pub fn valid_signature_count(&self) -> u64 {
        let hash = self.hash();
        let mut valid = 0;
        for (key_hex, sig_hex) in &self.signatures {
            let Some(stripped) = key_hex.strip_prefix("0x") else {
                continue;
            };
            let Ok(key_bytes) = hex::decode(stripped) else {
                continue;
            };
            let Some(validator) = SigningPublicKey::from_bytes(&key_bytes) else {
                continue;
            };
            let Ok(sig_bytes) = hex::decode(sig_hex) else {
                continue;
            };
            let Some(sig) = Signature::from_bytes(&sig_bytes) else {
                continue;
            };
            if validator.verify(&hash, &sig) {
                valid += 1;
            }
        }
        valid
    }
}
