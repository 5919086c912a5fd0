use containers::{BlockHash, Bytes32, Height, PeerStatus, ServiceFlags, TxHash};
use libp2p_identity::PeerId;
/// Peer records for sync operations.
///
/// Tracks each peer's advertised chain height, role in the sync state machine,
/// outstanding requests and misbehavior score.
use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};
use tracing::warn;

use super::states::PeerSyncStatus;

/// Sync-specific peer state.
///
/// Created when the handshake completes and dropped on disconnect. Only the
/// sync loop mutates it.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub peer_id: PeerId,
    pub status: PeerSyncStatus,
    /// Order of registration; earlier peers win ties.
    pub connection_seq: u64,
    pub services: ServiceFlags,
    pub protocol_height: Height,
    pub is_sync_candidate: bool,
    /// Outstanding block requests and when each was sent.
    pub requested_blocks: HashMap<BlockHash, Instant>,
    pub requested_txs: HashMap<TxHash, Instant>,
    /// Requests taken away from this peer (stall, or another peer answered
    /// first). A late answer for these is not unsolicited.
    pub superseded: HashSet<Bytes32>,
    pub last_block_announced: Option<BlockHash>,
    pub last_announced_time: Option<Instant>,
    pub stall_score: u32,
    /// Consecutive stalled ticks while acting as sync peer.
    pub sync_stalls: u32,
    pub rejected_txs: u32,
    pub last_activity: Instant,
}

impl PeerState {
    pub fn new(peer_id: PeerId, status: &PeerStatus, connection_seq: u64, now: Instant) -> Self {
        Self {
            peer_id,
            status: PeerSyncStatus::Connected,
            connection_seq,
            services: status.services,
            protocol_height: status.height,
            is_sync_candidate: false,
            requested_blocks: HashMap::new(),
            requested_txs: HashMap::new(),
            superseded: HashSet::new(),
            last_block_announced: None,
            last_announced_time: None,
            stall_score: 0,
            sync_stalls: 0,
            rejected_txs: 0,
            last_activity: now,
        }
    }

    /// Pruned peers do not serve historical blocks.
    pub fn serves_blocks(&self) -> bool {
        self.services.has(ServiceFlags::NETWORK)
    }

    /// Check if peer likely has the block at `height`.
    pub fn has_height(&self, height: Height) -> bool {
        self.protocol_height >= height
    }

    /// Whether the peer qualifies as sync source against a local tip at `local_height`.
    pub fn qualifies_for_sync(&self, local_height: Height) -> bool {
        self.serves_blocks() && self.protocol_height >= local_height
    }

    pub fn block_capacity(&self, max_per_peer: usize) -> usize {
        max_per_peer.saturating_sub(self.requested_blocks.len())
    }

    pub fn tx_capacity(&self, max_per_peer: usize) -> usize {
        max_per_peer.saturating_sub(self.requested_txs.len())
    }

    pub fn overdue_blocks(&self, now: Instant, timeout: Duration) -> Vec<BlockHash> {
        overdue(&self.requested_blocks, now, timeout)
    }

    pub fn overdue_txs(&self, now: Instant, timeout: Duration) -> Vec<TxHash> {
        overdue(&self.requested_txs, now, timeout)
    }

    /// Move the status along the state machine, refusing invalid transitions.
    pub fn transition(&mut self, target: PeerSyncStatus) -> bool {
        if self.status == target {
            return true;
        }
        if !self.status.can_transition_to(target) {
            warn!(
                peer = %self.peer_id,
                from = ?self.status,
                to = ?target,
                "Invalid peer status transition attempted"
            );
            return false;
        }
        self.status = target;
        true
    }

    /// Status a peer returns to once it is no longer stalled or syncing.
    pub fn resting_status(&self) -> PeerSyncStatus {
        if self.is_sync_candidate {
            PeerSyncStatus::Passive
        } else {
            PeerSyncStatus::Connected
        }
    }

    pub fn penalize(&mut self, amount: u32) -> u32 {
        self.stall_score = self.stall_score.saturating_add(amount);
        self.stall_score
    }

    pub fn note_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Record a block announcement. Advertised height never decreases.
    pub fn note_announcement(&mut self, hash: BlockHash, height: Option<Height>, now: Instant) {
        self.last_block_announced = Some(hash);
        self.last_announced_time = Some(now);
        if let Some(height) = height {
            if height > self.protocol_height {
                self.protocol_height = height;
            }
        }
    }
}

fn overdue(requests: &HashMap<Bytes32, Instant>, now: Instant, timeout: Duration) -> Vec<Bytes32> {
    let mut hashes: Vec<(Instant, Bytes32)> = requests
        .iter()
        .filter(|(_, sent)| now.saturating_duration_since(**sent) >= timeout)
        .map(|(hash, sent)| (*sent, *hash))
        .collect();
    hashes.sort();
    hashes.into_iter().map(|(_, hash)| hash).collect()
}

/// Peer table for sync operations.
///
/// Tracks peer chain status, picks the sync peer and serves as the request
/// bookkeeping the scheduler consults.
#[derive(Debug, Default, Clone)]
pub struct PeerManager {
    peers: HashMap<PeerId, PeerState>,
    next_seq: u64,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            peers: HashMap::with_capacity(capacity),
            next_seq: 0,
        }
    }

    /// Add a peer to the manager. Re-adding a known peer keeps its state.
    pub fn add_peer(&mut self, peer_id: PeerId, status: &PeerStatus, now: Instant) -> &mut PeerState {
        let seq = &mut self.next_seq;
        self.peers.entry(peer_id).or_insert_with(|| {
            let state = PeerState::new(peer_id, status, *seq, now);
            *seq += 1;
            state
        })
    }

    /// Remove a peer from the manager.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerState> {
        self.peers.remove(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerState> {
        self.peers.get(peer_id)
    }

    /// Get a mutable peer by ID.
    pub fn get_peer_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerState> {
        self.peers.get_mut(peer_id)
    }

    /// Pick the sync source: the highest advertised height among candidates
    /// that are not stalled and not behind `local_height`, earliest connection
    /// breaking ties.
    pub fn select_sync_candidate(&self, local_height: Height, exclude: Option<&PeerId>) -> Option<PeerId> {
        self.peers
            .values()
            .filter(|peer| peer.is_sync_candidate && !peer.status.is_stalled())
            .filter(|peer| peer.protocol_height >= local_height)
            .filter(|peer| Some(&peer.peer_id) != exclude)
            .max_by(|a, b| {
                a.protocol_height
                    .cmp(&b.protocol_height)
                    .then_with(|| b.connection_seq.cmp(&a.connection_seq))
            })
            .map(|peer| peer.peer_id)
    }

    /// Get all tracked peers in connection order.
    pub fn get_all_peers(&self) -> Vec<&PeerState> {
        let mut peers: Vec<&PeerState> = self.peers.values().collect();
        peers.sort_by_key(|peer| peer.connection_seq);
        peers
    }

    /// Peer ids in connection order.
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.get_all_peers().into_iter().map(|peer| peer.peer_id).collect()
    }

    pub fn active_peers(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.status == PeerSyncStatus::Active)
            .count()
    }

    pub fn candidates(&self) -> usize {
        self.peers.values().filter(|peer| peer.is_sync_candidate).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
