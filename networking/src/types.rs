use std::fmt::Display;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use containers::{
    Block, BlockHash, BlockHeader, ChainTip, Height, InvVect, PeerStatus, ReorgInfo, Transaction,
    TxDesc, TxHash,
};
use libp2p_identity::PeerId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A peer whose version handshake has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub status: PeerStatus,
}

impl PeerInfo {
    pub fn new(peer_id: PeerId, status: PeerStatus) -> Self {
        Self { peer_id, status }
    }
}

/// Result of handing a block to the chain validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAcceptance {
    /// The accepted block.
    pub block: ChainTip,
    /// Whether the block is now the tip of the main chain.
    pub is_new_tip: bool,
    /// Present when becoming the tip required switching branches.
    pub reorg: Option<ReorgInfo>,
}

/// Consensus engine owning block and header acceptance.
///
/// Called synchronously from the sync loop, so a slow validator throttles
/// the whole loop.
pub trait ChainValidator: Send + Sync {
    fn submit_block(&self, block: &Block) -> Result<BlockAcceptance, String>;

    fn submit_headers(&self, headers: &[BlockHeader]) -> Result<(), String>;

    /// Tip of the validated main chain.
    fn best_tip(&self) -> ChainTip;

    /// Whether the full block has been accepted (main or side chain).
    fn have_block(&self, hash: &BlockHash) -> bool;

    /// Height of any indexed header, with or without block data.
    fn header_height(&self, hash: &BlockHash) -> Option<Height>;

    /// Locator starting at `from`, or at the main chain tip when `None`.
    fn block_locator(&self, from: Option<&BlockHash>) -> Vec<BlockHash>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    /// Already in the pool or the chain.
    Duplicate,
    /// Spends outputs the pool does not know.
    MissingInputs,
    /// Valid, but refused by local policy (fees, size, standardness).
    Policy,
    Invalid,
    /// Malformed in a way no honest peer would relay.
    ProtocolViolation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRejection {
    pub kind: RejectKind,
    pub reason: String,
}

impl TxRejection {
    pub fn new(kind: RejectKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl Display for TxRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

pub trait TransactionPool: Send + Sync {
    /// Returns the accepted transaction followed by any pool orphans it unlocked.
    fn submit_tx(&self, tx: Transaction) -> Result<Vec<TxDesc>, TxRejection>;

    /// Re-admit transactions from `disconnected` (tip first) and evict those
    /// confirmed or conflicted by `connected` (lowest first).
    fn reconcile_after_reorg(&self, disconnected: &[Block], connected: &[Block]);

    fn have_transaction(&self, hash: &TxHash) -> bool;
}

/// Payload attached to an inventory relay so the notifier can answer
/// follow-up data requests without a lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayData {
    Header(BlockHeader),
}

/// Connection-manager side of the node: fans announcements out to peers.
pub trait PeerNotifier: Send + Sync {
    fn announce_new_transactions(&self, txs: &[TxDesc], source: Option<PeerId>);

    fn update_peer_heights(&self, hash: &BlockHash, height: Height, source: Option<PeerId>);

    fn relay_inventory(&self, inv: InvVect, data: RelayData);

    fn transaction_confirmed(&self, tx: &Transaction);
}

pub trait FeeEstimator: Send + Sync {
    fn register_block(&self, block: &Block) -> Result<(), String>;

    fn rollback(&self, hash: &BlockHash) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Stall score crossed the ban threshold.
    Stalled,
    /// Invalid blocks pushed the stall score over the ban threshold.
    Misbehaving,
    /// Invalid header chain, oversized message or unsolicited duplicate data.
    ProtocolViolation,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Stalled => "stalled",
            DisconnectReason::Misbehaving => "misbehaving",
            DisconnectReason::ProtocolViolation => "protocol_violation",
        }
    }
}

/// Peer-directed requests issued by the sync manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundSyncRequest {
    GetHeaders {
        peer_id: PeerId,
        locator: Vec<BlockHash>,
        /// `Bytes32::ZERO` asks for as many headers as the peer will send.
        stop: BlockHash,
    },
    GetBlocks {
        peer_id: PeerId,
        hashes: Vec<BlockHash>,
    },
    GetTransactions {
        peer_id: PeerId,
        hashes: Vec<TxHash>,
    },
    Disconnect {
        peer_id: PeerId,
        reason: DisconnectReason,
    },
}

impl OutboundSyncRequest {
    pub fn peer_id(&self) -> PeerId {
        match self {
            OutboundSyncRequest::GetHeaders { peer_id, .. }
            | OutboundSyncRequest::GetBlocks { peer_id, .. }
            | OutboundSyncRequest::GetTransactions { peer_id, .. }
            | OutboundSyncRequest::Disconnect { peer_id, .. } => *peer_id,
        }
    }
}

impl Display for OutboundSyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboundSyncRequest::GetHeaders { peer_id, locator, stop } => write!(
                f,
                "GetHeaders(peer={peer_id}, locator_len={}, stop={})",
                locator.len(),
                stop.short()
            ),
            OutboundSyncRequest::GetBlocks { peer_id, hashes } => {
                write!(f, "GetBlocks(peer={peer_id}, count={})", hashes.len())
            }
            OutboundSyncRequest::GetTransactions { peer_id, hashes } => {
                write!(f, "GetTransactions(peer={peer_id}, count={})", hashes.len())
            }
            OutboundSyncRequest::Disconnect { peer_id, reason } => {
                write!(f, "Disconnect(peer={peer_id}, reason={})", reason.as_str())
            }
        }
    }
}

pub trait P2pRequestSink<T>: Send + Sync {
    fn send(&self, request: T) -> Result<()>;
}

impl<T: Send + 'static> P2pRequestSink<T> for mpsc::UnboundedSender<T> {
    fn send(&self, request: T) -> Result<()> {
        mpsc::UnboundedSender::send(self, request)
            .map_err(|err| anyhow!("failed to send request to network: {err}"))
    }
}

#[async_trait]
pub trait P2pRequestSource<T>: Send {
    async fn recv(&mut self) -> Option<T>;
}

#[async_trait]
impl<T: Send + 'static> P2pRequestSource<T> for mpsc::UnboundedReceiver<T> {
    async fn recv(&mut self) -> Option<T> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}
