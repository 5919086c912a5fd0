use containers::BlockHash;
use libp2p_identity::PeerId;
use thiserror::Error;

/// Conditions reported by the sync manager. None of them is fatal: each is
/// handled locally by dropping, penalizing or waiting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("orphan pool has no room for block {}", .hash.short())]
    OrphanPoolFull { hash: BlockHash },

    #[error("{} is already requested from peer {peer}", .hash.short())]
    DuplicateRequest { hash: BlockHash, peer: PeerId },

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("invalid header chain from peer {peer}: {reason}")]
    InvalidHeaderChain { peer: PeerId, reason: String },

    #[error("no peer qualifies as sync source")]
    NoSyncCandidate,

    #[error("block {} rejected: {reason}", .hash.short())]
    BlockRejected { hash: BlockHash, reason: String },

    #[error("peer {peer} disconnected for protocol violation: {reason}")]
    Misbehaving { peer: PeerId, reason: String },

    #[error("sync manager is not running")]
    ManagerStopped,
}
