//! Configuration file support for the moira node.
//!
//! Loads an optional `moira.toml` from the data directory. CLI flags override
//! config file values; missing files fall back to defaults. The participant
//! set lives here too: every peer's gossip address and public key.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::constants;
use crate::crypto::SigningPublicKey;
use crate::peers::Peer;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MoiraConfig {
    pub node: NodeSection,
    /// The fixed participant set, including this node.
    pub peers: Vec<PeerEntry>,
}

/// Node configuration section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: String,
    pub listen_addr: String,
    pub service_addr: String,
    pub proxy_listen_addr: String,
    pub client_connect_addr: String,
    pub max_pool: usize,
    /// Durable sled store when true, in-memory otherwise.
    pub store: bool,
    pub cache_size: usize,
    pub heartbeat_ms: u64,
    pub tcp_timeout_ms: u64,
    pub sync_limit: usize,
    pub log_level: String,
    pub peer_selector: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            data_dir: "./moira-data".into(),
            listen_addr: format!("127.0.0.1:{}", constants::DEFAULT_LISTEN_PORT),
            service_addr: format!("127.0.0.1:{}", constants::DEFAULT_SERVICE_PORT),
            proxy_listen_addr: format!("127.0.0.1:{}", constants::DEFAULT_PROXY_PORT),
            client_connect_addr: format!("127.0.0.1:{}", constants::DEFAULT_PROXY_PORT + 1),
            max_pool: constants::DEFAULT_MAX_POOL,
            store: false,
            cache_size: constants::DEFAULT_CACHE_SIZE,
            heartbeat_ms: constants::DEFAULT_HEARTBEAT_MS,
            tcp_timeout_ms: constants::DEFAULT_TCP_TIMEOUT_MS,
            sync_limit: constants::DEFAULT_SYNC_LIMIT,
            log_level: "info".into(),
            peer_selector: "random".into(),
        }
    }
}

/// One participant: gossip endpoint plus hex-encoded public key.
#[derive(Clone, Debug, Deserialize)]
pub struct PeerEntry {
    pub net_addr: String,
    pub public_key: String,
}

impl MoiraConfig {
    /// Load configuration from `moira.toml` in the given directory.
    /// Returns defaults if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("moira.toml");
        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Resolve the peer entries into registry peers, rejecting malformed
    /// keys and addresses.
    pub fn resolve_peers(&self) -> Result<Vec<Peer>, String> {
        let mut peers = Vec::with_capacity(self.peers.len());
        for entry in &self.peers {
            let hex_key = entry.public_key.strip_prefix("0x").unwrap_or(&entry.public_key);
            let bytes = hex::decode(hex_key)
                .map_err(|e| format!("peer {}: bad public key hex: {e}", entry.net_addr))?;
            let key = SigningPublicKey::from_bytes(&bytes)
                .ok_or_else(|| format!("peer {}: invalid public key", entry.net_addr))?;
            entry
                .net_addr
                .parse::<SocketAddr>()
                .map_err(|e| format!("peer {}: bad address: {e}", entry.net_addr))?;
            peers.push(Peer::new(key, entry.net_addr.clone()));
        }
        Ok(peers)
    }
}
