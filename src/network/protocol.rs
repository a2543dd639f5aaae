//! Wire protocol for pairwise event sync.
//!
//! Three exchanges, all initiated by the puller:
//! - `Sync`: send the known-events map, receive the events the responder has
//!   that the requester lacks (capped by the responder's sync limit).
//! - `ForceSync`: push events at a peer (used after a fast-forward).
//! - `FastForward`: fetch the responder's anchor block, its frame and the
//!   balance snapshot so a lagging node can reset onto it.
//!
//! Messages are bincode-encoded with a fix-int, size-limited config and a
//! u32 little-endian length prefix.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::poset::{Block, Frame, WireEvent};
use crate::Hash;

/// Network errors.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("message serialization failed: {0}")]
    SerializationFailed(String),
    #[error(
        "message exceeds maximum size ({} bytes)",
        crate::constants::MAX_NETWORK_MESSAGE_BYTES
    )]
    MessageTooLarge,
    #[error("malformed message")]
    Malformed,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sync protocol messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    /// Request the events the responder has beyond the requester's known map.
    SyncRequest {
        from_id: u64,
        /// participant id → max creator-local index the requester holds.
        known: BTreeMap<u64, i64>,
    },
    /// Diff of events, in topological order, plus the responder's own map.
    SyncResponse {
        from_id: u64,
        events: Vec<WireEvent>,
        known: BTreeMap<u64, i64>,
    },
    /// Push events at the responder unconditionally.
    ForceSyncRequest { from_id: u64, events: Vec<WireEvent> },
    ForceSyncResponse { from_id: u64, accepted: bool },
    /// Request the responder's anchor block as a reset base.
    FastForwardRequest { from_id: u64 },
    FastForwardResponse {
        from_id: u64,
        block: Block,
        frame: Frame,
        /// Balances backing the frame's state root.
        snapshot: BTreeMap<Hash, u64>,
    },
    /// The responder has no anchor block yet.
    FastForwardUnavailable { from_id: u64 },
}

/// Size-limited bincode config used for both serialization and
/// deserialization. Prevents allocation DoS from crafted length prefixes
/// within payloads.
fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Serialize a message to bytes (length-prefixed).
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, NetworkError> {
    let payload = bincode::serde::encode_to_vec(msg, bincode_config())
        .map_err(|e| NetworkError::SerializationFailed(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Deserialize a message from a length-prefixed buffer.
pub fn decode_message(data: &[u8]) -> Option<Message> {
    if data.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes(data[..4].try_into().ok()?) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return None;
    }
    if data.len() < 4usize.saturating_add(len) {
        return None;
    }
    let (msg, _) = bincode::serde::decode_from_slice(&data[4..4 + len], bincode_config()).ok()?;
    Some(msg)
}

/// Write one framed message to a stream.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), NetworkError> {
    let buf = encode_message(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from a stream, rejecting oversized frames before
/// allocating.
pub async fn read_message<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Message, NetworkError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(NetworkError::MessageTooLarge);
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    bincode::serde::decode_from_slice(&payload, bincode_config())
        .map(|(msg, _)| msg)
        .map_err(|_| NetworkError::Malformed)
}
