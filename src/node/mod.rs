//! Node orchestrator tying together the poset, the sync transport and the
//! application gateway.
//!
//! The node runs three loops under one cancellation token:
//! - the listener answers Sync / ForceSync / FastForward requests,
//! - the heartbeat picks a peer, pulls unknown events, inserts them, appends
//!   its own head event and runs the processing pipeline,
//! - the commit consumer signs emitted blocks and forwards them to the proxy.
//!
//! Pipeline stages run on a blocking thread because block emission may park
//! on the bounded commit channel.

pub mod peer_selector;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::SigningKeypair;
use crate::network::protocol::{read_message, write_message, Message, NetworkError};
use crate::peers::{Peer, Peers};
use crate::poset::{
    Block, BlockSignature, Event, EventHash, InternalTransaction, Poset, PosetError, WireEvent,
};

pub use peer_selector::{PeerSelector, SelectorKind};

/// Consecutive saturated syncs before attempting a fast-forward.
const FAST_FORWARD_AFTER_FULL_SYNCS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Poset(#[from] PosetError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer {0} refused force sync")]
    ForceSyncRefused(u64),
    #[error("fast-forward snapshot does not match the frame state root")]
    SnapshotMismatch,
}

/// Node configuration, resolved from the CLI and config file.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub heartbeat: Duration,
    pub tcp_timeout: Duration,
    pub sync_limit: usize,
    pub selector: SelectorKind,
}

/// The consensus node.
pub struct Node {
    config: NodeConfig,
    keypair: SigningKeypair,
    local_id: u64,
    peers: Arc<Peers>,
    poset: Arc<Poset>,
    selector: PeerSelector,
    /// Payload transactions submitted by the application, awaiting inclusion
    /// in the next self event.
    tx_pool: Mutex<Vec<Vec<u8>>>,
    internal_tx_pool: Mutex<Vec<InternalTransaction>>,
    /// Block signatures produced locally, gossiped in the next self event.
    pending_signatures: Mutex<Vec<BlockSignature>>,
    /// Saturated sync responses in a row; triggers fast-forward.
    full_syncs: Mutex<u32>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        keypair: SigningKeypair,
        peers: Arc<Peers>,
        poset: Arc<Poset>,
        shutdown: CancellationToken,
    ) -> Result<Self, NodeError> {
        let local_id = peers
            .by_pubkey(&keypair.public)
            .ok_or(PosetError::CreatorUnknown)?
            .id;
        let selector = PeerSelector::new(config.selector, local_id);
        Ok(Node {
            config,
            keypair,
            local_id,
            peers,
            poset,
            selector,
            tx_pool: Mutex::new(Vec::new()),
            internal_tx_pool: Mutex::new(Vec::new()),
            pending_signatures: Mutex::new(Vec::new()),
            full_syncs: Mutex::new(0),
            shutdown: shutdown.clone(),
        })
    }

    pub fn local_id(&self) -> u64 {
        self.local_id
    }

    pub fn poset(&self) -> &Arc<Poset> {
        &self.poset
    }

    /// Queue an application payload for the next self event.
    pub fn submit_transaction(&self, tx: Vec<u8>) {
        self.tx_pool.lock().push(tx);
    }

    /// Queue an internal (balance) transaction for the next self event.
    pub fn submit_internal_transaction(&self, tx: InternalTransaction) {
        self.internal_tx_pool.lock().push(tx);
    }

    /// Sign a committed block and queue the signature for gossip.
    pub fn sign_block(&self, block: &Block) {
        let signature = block.sign(&self.keypair);
        self.poset.add_block_signature(signature.clone());
        self.pending_signatures.lock().push(signature);
    }

    /// Run the listener and heartbeat loops until the shutdown token fires.
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(addr = %self.config.listen_addr, id = self.local_id, "node listening");

        // First heartbeat has nothing to reference; start our event chain.
        if self.poset.known_events().get(&self.local_id) == Some(&-1) {
            self.create_self_event(EventHash::zero())?;
        }

        let acceptor = Arc::clone(&self);
        let accept_shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, remote)) = accepted else { continue };
                        let node = Arc::clone(&acceptor);
                        tokio::spawn(async move {
                            if let Err(e) = node.serve_connection(stream).await {
                                tracing::debug!(%remote, error = %e, "connection closed");
                            }
                        });
                    }
                }
            }
        });

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("shutdown signal observed, stopping gossip");
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.gossip_once().await {
                        tracing::debug!(error = %e, "gossip round failed");
                    }
                }
            }
        }
    }

    // ── Server side ──────────────────────────────────────────────────────

    async fn serve_connection(&self, mut stream: TcpStream) -> Result<(), NodeError> {
        let request = read_message(&mut stream).await?;
        if let Some(response) = self.handle_message(request)? {
            write_message(&mut stream, &response).await?;
        }
        Ok(())
    }

    /// Answer one protocol message. Split from the socket for testability.
    pub fn handle_message(&self, message: Message) -> Result<Option<Message>, NodeError> {
        match message {
            Message::SyncRequest { from_id, known } => {
                let events = self.diff_events(&known)?;
                self.selector.update_last(from_id);
                Ok(Some(Message::SyncResponse {
                    from_id: self.local_id,
                    events,
                    known: self.poset.known_events(),
                }))
            }
            Message::ForceSyncRequest { from_id, events } => {
                let accepted = match self.insert_wire_events(&events) {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::warn!(from = from_id, error = %e, "force sync rejected");
                        false
                    }
                };
                Ok(Some(Message::ForceSyncResponse {
                    from_id: self.local_id,
                    accepted,
                }))
            }
            Message::FastForwardRequest { from_id } => {
                match self.poset.get_anchor_block_with_frame() {
                    Ok((block, frame)) => {
                        let snapshot = self
                            .poset
                            .store()
                            .state()
                            .snapshot(&frame.state_root)
                            .map(|s| s.balances().clone())
                            .unwrap_or_default();
                        Ok(Some(Message::FastForwardResponse {
                            from_id: self.local_id,
                            block,
                            frame,
                            snapshot,
                        }))
                    }
                    Err(PosetError::NoAnchorBlock) => {
                        Ok(Some(Message::FastForwardUnavailable {
                            from_id: self.local_id,
                        }))
                    }
                    Err(e) => {
                        tracing::warn!(from = from_id, error = %e, "fast forward failed");
                        Err(e.into())
                    }
                }
            }
            // Responses arriving out of band are ignored.
            _ => Ok(None),
        }
    }

    /// Events the requester lacks, in causal (lamport) order, capped by the
    /// sync limit.
    fn diff_events(&self, known: &BTreeMap<u64, i64>) -> Result<Vec<WireEvent>, NodeError> {
        let ours = self.poset.known_events();
        let mut events: Vec<Event> = Vec::new();
        'outer: for (creator_id, our_max) in &ours {
            let their_max = known.get(creator_id).copied().unwrap_or(-1);
            let mut index = their_max + 1;
            while index <= *our_max {
                let hash = self
                    .poset
                    .store()
                    .participant_event(*creator_id, index)
                    .map_err(PosetError::from)?;
                events.push(self.poset.store().get_event(&hash).map_err(PosetError::from)?);
                if events.len() >= self.config.sync_limit {
                    break 'outer;
                }
                index += 1;
            }
        }
        // Parents have strictly lower lamport times, so this order is safe to
        // insert on the receiving side.
        events.sort_by_key(|e| (e.lamport_timestamp, e.creator_id(), e.index()));
        Ok(events.iter().map(Event::to_wire).collect())
    }

    fn insert_wire_events(&self, events: &[WireEvent]) -> Result<usize, NodeError> {
        let mut inserted = 0;
        for wire in events {
            let event = self.poset.read_wire_info(wire)?;
            let creator_id = wire.creator_id;
            let other_creator = wire.other_parent_creator_id;
            match self.poset.insert_event(event, false) {
                Ok(()) => {
                    inserted += 1;
                    self.peers.record_height(creator_id, wire.index);
                    if other_creator != 0 {
                        self.peers.record_in_degree(other_creator);
                    }
                }
                Err(PosetError::SelfParentMismatch) => {
                    // A fork or duplicate; drop the event, keep the batch.
                    tracing::warn!(creator = creator_id, index = wire.index, "event rejected");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(inserted)
    }

    // ── Client side ──────────────────────────────────────────────────────

    async fn gossip_once(&self) -> Result<(), NodeError> {
        let hint = self.poset.peer_flag_table_of_random_undetermined_event();
        let Some(peer) = self.selector.next(&self.peers, hint.as_ref()) else {
            return Ok(());
        };
        self.selector.update_last(peer.id);

        match self.sync_with(&peer).await {
            Ok(saturated) => {
                let fast_forward = {
                    let mut full = self.full_syncs.lock();
                    if saturated {
                        *full += 1;
                        if *full >= FAST_FORWARD_AFTER_FULL_SYNCS {
                            *full = 0;
                            true
                        } else {
                            false
                        }
                    } else {
                        *full = 0;
                        false
                    }
                };
                if fast_forward {
                    self.fast_forward_from(&peer).await?;
                }
            }
            Err(e) => {
                tracing::debug!(peer = peer.id, error = %e, "sync failed");
            }
        }

        let poset = Arc::clone(&self.poset);
        tokio::task::spawn_blocking(move || run_pipeline(&poset))
            .await
            .map_err(|e| NodeError::Io(std::io::Error::other(e)))??;
        Ok(())
    }

    async fn dial(&self, peer: &Peer) -> Result<TcpStream, NodeError> {
        let stream = tokio::time::timeout(
            self.config.tcp_timeout,
            TcpStream::connect(&peer.net_addr),
        )
        .await
        .map_err(|_| {
            NodeError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timed out",
            ))
        })??;
        Ok(stream)
    }

    /// One pull from a peer. Returns whether the response was saturated
    /// (hit the sync limit), which hints that we are far behind.
    async fn sync_with(&self, peer: &Peer) -> Result<bool, NodeError> {
        let mut stream = self.dial(peer).await?;
        write_message(
            &mut stream,
            &Message::SyncRequest {
                from_id: self.local_id,
                known: self.poset.known_events(),
            },
        )
        .await?;
        let response = tokio::time::timeout(self.config.tcp_timeout, read_message(&mut stream))
            .await
            .map_err(|_| {
                NodeError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "sync response timed out",
                ))
            })??;

        let Message::SyncResponse { events, .. } = response else {
            return Ok(false);
        };
        let count = events.len();
        self.insert_wire_events(&events)?;
        tracing::debug!(peer = peer.id, events = count, "synced");

        // Merge the peer's head into our chain when we learned something new,
        // or when the application has payloads waiting.
        let (peer_head, peer_head_is_root) = self
            .poset
            .store()
            .last_event_from(peer.id)
            .map_err(PosetError::from)?;
        let has_payload =
            !self.tx_pool.lock().is_empty() || !self.internal_tx_pool.lock().is_empty();
        if count > 0 && !peer_head_is_root {
            self.create_self_event(peer_head)?;
        } else if has_payload || !self.pending_signatures.lock().is_empty() {
            self.create_self_event(EventHash::zero())?;
        }

        Ok(count >= self.config.sync_limit)
    }

    /// Reset onto a peer's anchor block when hopelessly behind.
    async fn fast_forward_from(&self, peer: &Peer) -> Result<(), NodeError> {
        let mut stream = self.dial(peer).await?;
        write_message(
            &mut stream,
            &Message::FastForwardRequest {
                from_id: self.local_id,
            },
        )
        .await?;
        let response = read_message(&mut stream).await?;
        let Message::FastForwardResponse {
            block,
            frame,
            snapshot,
            ..
        } = response
        else {
            return Ok(());
        };

        self.poset.check_block(&block)?;
        let installed_root = self.poset.store().state().install(snapshot);
        if installed_root != frame.state_root {
            return Err(NodeError::SnapshotMismatch);
        }
        tracing::info!(
            block = block.index(),
            frame = frame.frame,
            "fast-forwarding onto anchor block"
        );
        self.poset.reset(block, frame)?;
        Ok(())
    }

    /// Append a self event carrying the pooled payloads and signatures.
    fn create_self_event(&self, other_parent: EventHash) -> Result<(), NodeError> {
        let (self_head, _) = self
            .poset
            .store()
            .last_event_from(self.local_id)
            .map_err(PosetError::from)?;
        let index = self
            .poset
            .known_events()
            .get(&self.local_id)
            .copied()
            .unwrap_or(-1)
            + 1;
        let transactions: Vec<Vec<u8>> = std::mem::take(&mut *self.tx_pool.lock());
        let internal: Vec<InternalTransaction> =
            std::mem::take(&mut *self.internal_tx_pool.lock());
        let signatures: Vec<BlockSignature> =
            std::mem::take(&mut *self.pending_signatures.lock());

        let mut event = Event::new(
            transactions,
            internal,
            self_head,
            other_parent,
            self.keypair.public.clone(),
            index,
            signatures,
        );
        event.sign(&self.keypair);
        self.poset.insert_event(event, true)?;
        self.peers.record_height(self.local_id, index);
        Ok(())
    }
}

/// One pass of the processing pipeline. Runs on a blocking thread; pushing a
/// block onto a full commit channel parks here by design.
pub fn run_pipeline(poset: &Poset) -> Result<(), NodeError> {
    poset.divide_rounds()?;
    poset.decide_atropos()?;
    poset.decide_round_received()?;
    poset.process_decided_rounds()?;
    poset.process_sig_pool()?;
    Ok(())
}

/// Consume committed blocks: sign them, feed the signature pool and forward
/// to the application gateway. Forwarding awaits channel capacity, so
/// application backpressure propagates to the pipeline.
pub async fn consume_commits(
    node: Arc<Node>,
    mut commit_rx: mpsc::Receiver<Block>,
    app_tx: mpsc::Sender<Block>,
) {
    while let Some(block) = commit_rx.recv().await {
        node.sign_block(&block);
        tracing::info!(
            index = block.index(),
            frame = block.frame(),
            transactions = block.transactions().len(),
            "block committed"
        );
        if app_tx.send(block).await.is_err() {
            tracing::warn!("application gateway closed, stopping commit consumer");
            return;
        }
    }
}
