/// Peer sync state machine and process-wide sync progress.
use std::time::Instant;

use containers::{ChainTip, Checkpoint};
use libp2p_identity::PeerId;

/// Role of a connected peer with respect to chain synchronization.
///
/// `Connected -> Candidate -> (Active | Passive) -> Stalled`, with removal
/// from the peer table as the terminal disconnected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSyncStatus {
    /// Handshake done, but the peer cannot serve as sync source (pruned or behind).
    Connected,

    /// Qualifies as sync source, selection pending.
    Candidate,

    /// The single peer headers are being downloaded from.
    Active,

    /// Qualified sync source that was not selected, or was preempted.
    Passive,

    /// Left requests unanswered past the stall timeout.
    ///
    /// Stalled peers receive no new requests and accrue penalty every tick
    /// until they deliver data again.
    Stalled,
}

impl PeerSyncStatus {
    /// Check if a transition to the target status is valid.
    pub fn can_transition_to(&self, target: PeerSyncStatus) -> bool {
        match self {
            PeerSyncStatus::Connected => {
                matches!(target, PeerSyncStatus::Candidate | PeerSyncStatus::Stalled)
            }
            PeerSyncStatus::Candidate => matches!(
                target,
                PeerSyncStatus::Active | PeerSyncStatus::Passive | PeerSyncStatus::Stalled
            ),
            PeerSyncStatus::Active => {
                matches!(target, PeerSyncStatus::Passive | PeerSyncStatus::Stalled)
            }
            PeerSyncStatus::Passive => {
                matches!(target, PeerSyncStatus::Active | PeerSyncStatus::Stalled)
            }
            PeerSyncStatus::Stalled => matches!(
                target,
                PeerSyncStatus::Connected
                    | PeerSyncStatus::Candidate
                    | PeerSyncStatus::Active
                    | PeerSyncStatus::Passive
            ),
        }
    }

    pub fn is_stalled(&self) -> bool {
        *self == PeerSyncStatus::Stalled
    }
}

impl Default for PeerSyncStatus {
    fn default() -> Self {
        PeerSyncStatus::Connected
    }
}

/// Sync progress owned by one sync manager.
///
/// If `sync_peer` is set, that peer is registered and is a sync candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub sync_peer: Option<PeerId>,

    /// Highest header known to connect to our chain.
    pub best_known_header: ChainTip,

    /// Downloading headers ahead of block bodies.
    pub headers_first_mode: bool,

    /// Next checkpoint above `best_known_header`, unless checkpoints are disabled.
    pub next_checkpoint: Option<Checkpoint>,

    /// When the outstanding GetHeaders was sent to the sync peer.
    pub headers_requested_at: Option<Instant>,
}

impl SyncState {
    pub fn new(best_known_header: ChainTip) -> Self {
        Self {
            sync_peer: None,
            best_known_header,
            headers_first_mode: false,
            next_checkpoint: None,
            headers_requested_at: None,
        }
    }

    pub fn is_sync_peer(&self, peer_id: &PeerId) -> bool {
        self.sync_peer.as_ref() == Some(peer_id)
    }
}
