//! Application gateway: the boundary between consensus and the application.
//!
//! Inbound, the application submits opaque transaction payloads. Outbound,
//! the gateway streams committed blocks and may issue snapshot queries and
//! restore commands. Every outbound message carries a UUID so the reply can
//! be correlated; replies carry either a data payload or an error string.
//!
//! Framing reuses the length-prefixed bincode convention of the sync
//! transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::node::Node;
use crate::poset::Block;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("frame exceeds maximum size")]
    FrameTooLarge,
}

/// Messages from consensus to the application.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AppRequest {
    /// A committed block, delivered in strict index order.
    CommitBlock { id: Uuid, block: Block },
    /// Ask the application for its state snapshot at a block index.
    GetSnapshot { id: Uuid, block_index: i64 },
    /// Tell the application to restore from a snapshot.
    Restore { id: Uuid, snapshot: Vec<u8> },
}

impl AppRequest {
    pub fn id(&self) -> Uuid {
        match self {
            AppRequest::CommitBlock { id, .. }
            | AppRequest::GetSnapshot { id, .. }
            | AppRequest::Restore { id, .. } => *id,
        }
    }
}

/// Messages from the application to consensus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AppMessage {
    /// Submit an opaque transaction payload.
    SubmitTx(Vec<u8>),
    /// Reply to an [`AppRequest`], correlated by id.
    Reply {
        id: Uuid,
        payload: Result<Vec<u8>, String>,
    },
}

fn bincode_config() -> bincode::config::Configuration<
    bincode::config::LittleEndian,
    bincode::config::Fixint,
    bincode::config::Limit<{ 16 * 1024 * 1024 }>,
> {
    bincode::config::legacy().with_limit::<{ 16 * 1024 * 1024 }>()
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), ProxyError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(value, bincode_config())
        .map_err(|e| ProxyError::Codec(e.to_string()))?;
    if payload.len() > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(ProxyError::FrameTooLarge);
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, ProxyError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > crate::constants::MAX_NETWORK_MESSAGE_BYTES {
        return Err(ProxyError::FrameTooLarge);
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    bincode::serde::decode_from_slice(&payload, bincode_config())
        .map(|(v, _)| v)
        .map_err(|e| ProxyError::Codec(e.to_string()))
}

/// The gateway task: accepts one application client at a time, streams
/// committed blocks to it and feeds submitted transactions into the node.
pub struct AppGateway {
    node: Arc<Node>,
    listen_addr: SocketAddr,
    blocks: mpsc::Receiver<Block>,
    shutdown: CancellationToken,
}

impl AppGateway {
    pub fn new(
        node: Arc<Node>,
        listen_addr: SocketAddr,
        blocks: mpsc::Receiver<Block>,
        shutdown: CancellationToken,
    ) -> Self {
        AppGateway {
            node,
            listen_addr,
            blocks,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<(), ProxyError> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        tracing::info!(addr = %self.listen_addr, "application gateway listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let Ok((stream, remote)) = accepted else { continue };
                    tracing::info!(%remote, "application client connected");
                    if let Err(e) = self.serve_client(stream).await {
                        tracing::warn!(error = %e, "application client dropped");
                    }
                }
            }
        }
    }

    /// Drive one connected client until it drops or shutdown fires. Blocks
    /// queued while no client is connected are retained by the channel; the
    /// channel's bound is what backpressures the pipeline.
    async fn serve_client(&mut self, stream: TcpStream) -> Result<(), ProxyError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut in_flight: HashMap<Uuid, i64> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                block = self.blocks.recv() => {
                    let Some(block) = block else { return Ok(()) };
                    let id = Uuid::new_v4();
                    in_flight.insert(id, block.index());
                    write_frame(&mut writer, &AppRequest::CommitBlock { id, block }).await?;
                }
                message = read_frame::<_, AppMessage>(&mut reader) => {
                    match message? {
                        AppMessage::SubmitTx(tx) => {
                            self.node.submit_transaction(tx);
                        }
                        AppMessage::Reply { id, payload } => {
                            match in_flight.remove(&id) {
                                Some(block_index) => {
                                    if let Err(e) = payload {
                                        tracing::warn!(block_index, error = %e, "application rejected block");
                                    }
                                }
                                None => tracing::debug!(%id, "reply for unknown request"),
                            }
                        }
                    }
                }
            }
        }
    }
}
