//! # Moira
//!
//! An asynchronous BFT consensus engine over a DAG of signed events:
//! - **Leaderless ordering** — every participant appends events; consensus is
//!   extracted from the graph structure, not from a rotating proposer
//! - **Frame / root / clotho / atropos machinery** — roots are promoted by
//!   supermajority observation, then time-stamped by supermajority vote
//! - **Deterministic total order** — identical event sets produce
//!   byte-identical block sequences on every replica
//! - **f < n/3 fault tolerance** — quorum arithmetic tolerates ⌊(n−1)/3⌋
//!   Byzantine participants with no timing assumptions

pub mod config;
pub mod crypto;
pub mod network;
pub mod node;
pub mod peers;
pub mod poset;
pub mod proxy;
pub mod service;
pub mod state;

/// Protocol constants
pub mod constants {
    /// Frames between coin rounds in atropos time selection.
    pub const COIN_ROUND_INTERVAL: i64 = 4;
    /// Default capacity of the predicate and store caches.
    pub const DEFAULT_CACHE_SIZE: usize = 500;
    /// Default cap on events returned by a single sync response.
    pub const DEFAULT_SYNC_LIMIT: usize = 1000;
    /// Default gossip heartbeat in milliseconds.
    pub const DEFAULT_HEARTBEAT_MS: u64 = 1000;
    /// Default TCP dial/read timeout in milliseconds.
    pub const DEFAULT_TCP_TIMEOUT_MS: u64 = 1000;
    /// Default connection pool size for the sync transport.
    pub const DEFAULT_MAX_POOL: usize = 2;
    /// Maximum network message size (16 MiB)
    pub const MAX_NETWORK_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
    /// Capacity of the bounded commit channel toward the application proxy.
    /// A full channel blocks the processing pipeline; blocks are never dropped.
    pub const COMMIT_CHANNEL_CAPACITY: usize = 20;
    /// Balance granted to every participant at genesis.
    pub const GENESIS_BALANCE: u64 = 1_000_000_000;
    /// Default P2P listen port
    pub const DEFAULT_LISTEN_PORT: u16 = 12000;
    /// Default HTTP stats service port
    pub const DEFAULT_SERVICE_PORT: u16 = 8000;
    /// Default application proxy listen port
    pub const DEFAULT_PROXY_PORT: u16 = 9000;
}

/// 32-byte hash used throughout the protocol
pub type Hash = [u8; 32];

/// Compute a domain-separated BLAKE3 hash.
///
/// The domain MUST be valid ASCII; all moira domains are string literals.
pub fn hash_domain(domain: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(domain);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Compute BLAKE3 hash of length-prefixed concatenated slices.
///
/// Each part is prefixed with its length as a little-endian u64, preventing
/// ambiguous concatenation (e.g., `["AB","C"]` vs `["A","BC"]`).
pub fn hash_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}
