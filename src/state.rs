//! Balance state derived from internal transactions.
//!
//! A versioned keyed map: every finalized frame commits one new version,
//! identified by a state root over the canonical encoding of the balances.
//! Replaying the same event set from genesis reproduces the same roots byte
//! for byte.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::peers::Peers;
use crate::Hash;

/// A participant address: the fingerprint of their public key.
pub type Address = Hash;

#[derive(Clone, Debug, thiserror::Error)]
pub enum StateError {
    #[error("unknown state root {0}")]
    UnknownRoot(String),
}

/// Versioned balance store. Each committed version is immutable and
/// addressed by its root.
pub struct StateDb {
    versions: RwLock<HashMap<Hash, BTreeMap<Address, u64>>>,
}

impl Default for StateDb {
    fn default() -> Self {
        Self::new()
    }
}

impl StateDb {
    pub fn new() -> Self {
        StateDb {
            versions: RwLock::new(HashMap::new()),
        }
    }

    /// Store the genesis version and return its root.
    pub fn genesis(&self, balances: BTreeMap<Address, u64>) -> Hash {
        self.install(balances)
    }

    /// Install a complete version (genesis, or a snapshot received over
    /// fast-forward) and return its root.
    pub fn install(&self, balances: BTreeMap<Address, u64>) -> Hash {
        let root = state_root(&balances);
        self.versions.write().insert(root, balances);
        root
    }

    /// Open a mutable snapshot of the version at `root`.
    pub fn snapshot(&self, root: &Hash) -> Result<Snapshot, StateError> {
        let versions = self.versions.read();
        let balances = versions
            .get(root)
            .ok_or_else(|| StateError::UnknownRoot(hex::encode(root)))?;
        Ok(Snapshot {
            balances: balances.clone(),
        })
    }

    pub fn contains(&self, root: &Hash) -> bool {
        self.versions.read().contains_key(root)
    }
}

/// Compute the root of a balance map: BLAKE3 over the canonical encoding.
fn state_root(balances: &BTreeMap<Address, u64>) -> Hash {
    let bytes = bincode::serde::encode_to_vec(balances, bincode::config::legacy())
        .unwrap_or_default();
    crate::hash_domain("moira.state.root", &bytes)
}

/// Uniform genesis allocation: every participant starts with `amount`.
pub fn genesis_balances(peers: &Peers, amount: u64) -> BTreeMap<Address, u64> {
    peers
        .to_peer_slice()
        .iter()
        .map(|p| (p.public_key.fingerprint(), amount))
        .collect()
}

/// A mutable working copy of one state version.
#[derive(Clone, Debug)]
pub struct Snapshot {
    balances: BTreeMap<Address, u64>,
}

impl Snapshot {
    pub fn balance_of(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    pub fn exists(&self, address: &Address) -> bool {
        self.balances.contains_key(address)
    }

    /// The full balance map, for fast-forward snapshots.
    pub fn balances(&self) -> &BTreeMap<Address, u64> {
        &self.balances
    }

    /// Move `amount` from sender to receiver. Returns false (and changes
    /// nothing) when the sender's balance is insufficient; the caller logs
    /// and skips the transaction, as every replica will.
    pub fn transfer(&mut self, sender: &Address, receiver: &Address, amount: u64) -> bool {
        let from = self.balance_of(sender);
        if from < amount {
            return false;
        }
        self.balances.insert(*sender, from - amount);
        let to = self.balance_of(receiver);
        self.balances.insert(*receiver, to + amount);
        true
    }

    /// Commit this snapshot as a new version; returns its root.
    pub fn commit(self, db: &StateDb) -> Hash {
        let root = state_root(&self.balances);
        db.versions.write().entry(root).or_insert(self.balances);
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        [byte; 32]
    }

    #[test]
    fn transfer_moves_balance() {
        let db = StateDb::new();
        let genesis = db.genesis([(addr(1), 100)].into_iter().collect());

        let mut snap = db.snapshot(&genesis).unwrap();
        assert!(snap.transfer(&addr(1), &addr(2), 10));
        let root = snap.commit(&db);

        let after = db.snapshot(&root).unwrap();
        assert_eq!(after.balance_of(&addr(1)), 90);
        assert_eq!(after.balance_of(&addr(2)), 10);
        assert_ne!(root, genesis);
    }

    #[test]
    fn insufficient_balance_is_a_noop() {
        let db = StateDb::new();
        let genesis = db.genesis([(addr(1), 5)].into_iter().collect());
        let mut snap = db.snapshot(&genesis).unwrap();
        assert!(!snap.transfer(&addr(1), &addr(2), 10));
        assert_eq!(snap.commit(&db), genesis);
    }

    #[test]
    fn roots_are_replay_stable() {
        let run = || {
            let db = StateDb::new();
            let genesis = db.genesis([(addr(1), 100), (addr(2), 0)].into_iter().collect());
            let mut snap = db.snapshot(&genesis).unwrap();
            snap.transfer(&addr(1), &addr(2), 10);
            snap.transfer(&addr(2), &addr(1), 3);
            snap.commit(&db)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn unknown_root_is_an_error() {
        let db = StateDb::new();
        assert!(db.snapshot(&[9u8; 32]).is_err());
    }

    #[test]
    fn genesis_is_deterministic() {
        let balances: BTreeMap<Address, u64> =
            [(addr(3), 7), (addr(1), 5)].into_iter().collect();
        let a = StateDb::new().genesis(balances.clone());
        let b = StateDb::new().genesis(balances);
        assert_eq!(a, b);
    }
}
