//! Participant registry: the fixed set of consensus members.
//!
//! Maps public keys to stable numeric participant ids and provides the quorum
//! thresholds used throughout the engine. Participant ids are derived from the
//! key fingerprint, so every replica computes the same id for the same key.
//!
//! The registry also tracks per-peer gossip statistics (height, in-degree,
//! use count) consumed by the peer selectors. Dynamic membership is not
//! implemented: `set_on_new_peer` exists for a future peer-join path but
//! nothing in consensus calls `add_peer`.

use std::collections::{BTreeMap, HashMap};

use parking_lot::{Mutex, RwLock};

use crate::crypto::SigningPublicKey;

/// A consensus participant.
#[derive(Clone, Debug)]
pub struct Peer {
    /// Stable numeric id, derived from the public key fingerprint.
    pub id: u64,
    pub public_key: SigningPublicKey,
    /// Gossip endpoint, `host:port`.
    pub net_addr: String,
}

impl Peer {
    pub fn new(public_key: SigningPublicKey, net_addr: String) -> Self {
        let id = peer_id(&public_key);
        Peer {
            id,
            public_key,
            net_addr,
        }
    }
}

/// Derive the stable participant id from a public key.
pub fn peer_id(public_key: &SigningPublicKey) -> u64 {
    let fp = public_key.fingerprint();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&fp[..8]);
    u64::from_be_bytes(bytes)
}

/// Per-peer gossip statistics for the selectors.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerStats {
    /// Times this peer was chosen as a sync target.
    pub used: u64,
    /// Highest creator-local event index observed from this peer.
    pub height: i64,
    /// Times this peer's events were referenced as an other-parent.
    pub in_degree: u64,
}

type NewPeerHook = Box<dyn Fn(&Peer) + Send + Sync>;

/// The participant set. Membership is fixed for the lifetime of the engine;
/// only the gossip statistics mutate, under their own lock.
pub struct Peers {
    by_id: BTreeMap<u64, Peer>,
    by_pubkey: HashMap<Vec<u8>, u64>,
    stats: RwLock<HashMap<u64, PeerStats>>,
    on_new_peer: Mutex<Option<NewPeerHook>>,
}

impl Peers {
    pub fn new(peers: Vec<Peer>) -> Self {
        let mut by_id = BTreeMap::new();
        let mut by_pubkey = HashMap::new();
        let mut stats = HashMap::new();
        for peer in peers {
            by_pubkey.insert(peer.public_key.as_bytes().to_vec(), peer.id);
            stats.insert(peer.id, PeerStats { height: -1, ..Default::default() });
            by_id.insert(peer.id, peer);
        }
        Peers {
            by_id,
            by_pubkey,
            stats: RwLock::new(stats),
            on_new_peer: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn by_id(&self, id: u64) -> Option<&Peer> {
        self.by_id.get(&id)
    }

    pub fn by_pubkey(&self, key: &SigningPublicKey) -> Option<&Peer> {
        self.by_pubkey
            .get(key.as_bytes())
            .and_then(|id| self.by_id.get(id))
    }

    pub fn contains(&self, key: &SigningPublicKey) -> bool {
        self.by_pubkey.contains_key(key.as_bytes())
    }

    /// All peers in ascending id order (deterministic across replicas).
    pub fn to_peer_slice(&self) -> Vec<&Peer> {
        self.by_id.values().collect()
    }

    /// All participant public keys in ascending id order.
    pub fn pub_keys(&self) -> Vec<&SigningPublicKey> {
        self.by_id.values().map(|p| &p.public_key).collect()
    }

    /// Supermajority threshold: 2⌊n/3⌋ + 1 distinct participants.
    pub fn super_majority(&self) -> u64 {
        let n = self.by_id.len() as u64;
        2 * n / 3 + 1
    }

    /// Trust count: ⌊n/3⌋. An anchor block needs strictly more signatures.
    pub fn trust_count(&self) -> u64 {
        self.by_id.len() as u64 / 3
    }

    // ── Gossip statistics ──

    pub fn stats_of(&self, id: u64) -> PeerStats {
        self.stats.read().get(&id).copied().unwrap_or_default()
    }

    /// Record an observed event from a creator; height is monotonic.
    pub fn record_height(&self, id: u64, index: i64) {
        let mut stats = self.stats.write();
        let entry = stats.entry(id).or_default();
        if index > entry.height {
            entry.height = index;
        }
    }

    /// Record that a creator's event was used as an other-parent.
    pub fn record_in_degree(&self, id: u64) {
        self.stats.write().entry(id).or_default().in_degree += 1;
    }

    /// Record that a peer was chosen as a sync target.
    pub fn record_use(&self, id: u64) {
        self.stats.write().entry(id).or_default().used += 1;
    }

    // ── Dynamic membership (future work, not wired into consensus) ──

    /// Register a hook to run when a peer joins. The consensus core never
    /// mutates membership; this exists for the store to reseed base roots
    /// if a join path is ever added.
    pub fn set_on_new_peer(&self, hook: NewPeerHook) {
        *self.on_new_peer.lock() = Some(hook);
    }

    /// Add a peer and fire the hook. Requires exclusive ownership, which the
    /// running engine never has; usable only before startup.
    pub fn add_peer(&mut self, peer: Peer) {
        self.by_pubkey
            .insert(peer.public_key.as_bytes().to_vec(), peer.id);
        self.stats
            .write()
            .insert(peer.id, PeerStats { height: -1, ..Default::default() });
        self.by_id.insert(peer.id, peer.clone());
        if let Some(hook) = self.on_new_peer.lock().as_ref() {
            hook(&peer);
        }
    }
}

impl std::fmt::Debug for Peers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peers").field("len", &self.by_id.len()).finish()
    }
}
