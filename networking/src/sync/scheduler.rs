/// Request scheduler: decides what to download next and from whom.
///
/// Blocks known from headers are downloaded in strict ascending height order;
/// a scheduling pass stops at the first block no peer can take, so the chain
/// validator always sees contiguous extensions. Blocks and transactions known
/// only from inventory announcements are requested from the peers that
/// announced them, first seen first served.
///
/// Every hash is in flight from at most one peer. The scheduler keeps the
/// global `hash -> peer` index; the per-peer view lives in `PeerState`.
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    time::Instant,
};

use containers::{BlockHash, Bytes32, Height, TxHash};
use libp2p_identity::PeerId;
use tracing::trace;

use super::{
    config::SyncParams,
    error::SyncError,
    peer_manager::{PeerManager, PeerState},
};
use crate::types::OutboundSyncRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub peer_id: PeerId,
    /// Known when the block came from a header chain.
    pub height: Option<Height>,
}

#[derive(Debug, Clone)]
pub struct RequestScheduler {
    /// Header-known blocks awaiting download, ascending by height.
    block_queue: BTreeSet<(Height, BlockHash)>,
    queued_heights: HashMap<BlockHash, Height>,

    /// Blocks known only from inventory, in announcement order.
    announced_blocks: VecDeque<BlockHash>,

    blocks_in_flight: HashMap<BlockHash, InFlight>,

    tx_queue: VecDeque<TxHash>,
    txs_in_flight: HashMap<TxHash, PeerId>,

    /// Peers that announced a hash, first announcer first.
    sources: HashMap<Bytes32, Vec<PeerId>>,

    /// Peers that answered NotFound for a hash.
    not_found: HashMap<Bytes32, HashSet<PeerId>>,

    max_blocks_in_flight: usize,
    max_blocks_per_peer: usize,
    max_txs_per_peer: usize,
}

impl RequestScheduler {
    pub fn new(params: &SyncParams) -> Self {
        Self {
            block_queue: BTreeSet::new(),
            queued_heights: HashMap::new(),
            announced_blocks: VecDeque::new(),
            blocks_in_flight: HashMap::new(),
            tx_queue: VecDeque::new(),
            txs_in_flight: HashMap::new(),
            sources: HashMap::new(),
            not_found: HashMap::new(),
            max_blocks_in_flight: params.max_blocks_in_flight,
            max_blocks_per_peer: params.max_blocks_in_flight_per_peer,
            max_txs_per_peer: params.max_txs_in_flight_per_peer,
        }
    }

    /// Queue a block learned from a header chain. Returns false if it is
    /// already queued or in flight.
    pub fn queue_block(&mut self, height: Height, hash: BlockHash) -> bool {
        if self.blocks_in_flight.contains_key(&hash) || self.queued_heights.contains_key(&hash) {
            return false;
        }
        self.announced_blocks.retain(|announced| *announced != hash);
        self.block_queue.insert((height, hash));
        self.queued_heights.insert(hash, height);
        true
    }

    /// Record that `peer_id` can serve block `hash`. Returns true if the hash
    /// was not pending before.
    pub fn announce_block(&mut self, hash: BlockHash, peer_id: PeerId) -> bool {
        self.add_source(hash, peer_id);
        if self.is_block_pending(&hash) {
            return false;
        }
        self.announced_blocks.push_back(hash);
        true
    }

    /// Record that `peer_id` can serve transaction `hash`. Returns true if
    /// the hash was not pending before.
    pub fn announce_tx(&mut self, hash: TxHash, peer_id: PeerId) -> bool {
        self.add_source(hash, peer_id);
        if self.is_tx_pending(&hash) {
            return false;
        }
        self.tx_queue.push_back(hash);
        true
    }

    pub fn is_block_pending(&self, hash: &BlockHash) -> bool {
        self.blocks_in_flight.contains_key(hash)
            || self.queued_heights.contains_key(hash)
            || self.announced_blocks.contains(hash)
    }

    pub fn is_tx_pending(&self, hash: &TxHash) -> bool {
        self.txs_in_flight.contains_key(hash) || self.tx_queue.contains(hash)
    }

    pub fn block_in_flight_from(&self, hash: &BlockHash) -> Option<PeerId> {
        self.blocks_in_flight.get(hash).map(|in_flight| in_flight.peer_id)
    }

    pub fn tx_in_flight_from(&self, hash: &TxHash) -> Option<PeerId> {
        self.txs_in_flight.get(hash).copied()
    }

    /// Assign a block to a peer, recording it on both sides.
    pub fn assign_block(
        &mut self,
        peers: &mut PeerManager,
        hash: BlockHash,
        height: Option<Height>,
        peer_id: PeerId,
        now: Instant,
    ) -> Result<(), SyncError> {
        if let Some(in_flight) = self.blocks_in_flight.get(&hash) {
            return Err(SyncError::DuplicateRequest {
                hash,
                peer: in_flight.peer_id,
            });
        }
        let peer = peers
            .get_peer_mut(&peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;

        peer.requested_blocks.insert(hash, now);
        peer.superseded.remove(&hash);
        self.blocks_in_flight.insert(hash, InFlight { peer_id, height });
        if let Some(height) = self.queued_heights.remove(&hash) {
            self.block_queue.remove(&(height, hash));
        }
        self.announced_blocks.retain(|announced| *announced != hash);
        Ok(())
    }

    pub fn assign_tx(
        &mut self,
        peers: &mut PeerManager,
        hash: TxHash,
        peer_id: PeerId,
        now: Instant,
    ) -> Result<(), SyncError> {
        if let Some(holder) = self.txs_in_flight.get(&hash) {
            return Err(SyncError::DuplicateRequest { hash, peer: *holder });
        }
        let peer = peers
            .get_peer_mut(&peer_id)
            .ok_or(SyncError::UnknownPeer(peer_id))?;

        peer.requested_txs.insert(hash, now);
        peer.superseded.remove(&hash);
        self.txs_in_flight.insert(hash, peer_id);
        self.tx_queue.retain(|queued| *queued != hash);
        Ok(())
    }

    /// Forget everything about a delivered (or otherwise resolved) block.
    /// Returns the peer it was in flight from.
    pub fn complete_block(&mut self, hash: &BlockHash) -> Option<PeerId> {
        if let Some(height) = self.queued_heights.remove(hash) {
            self.block_queue.remove(&(height, *hash));
        }
        self.announced_blocks.retain(|announced| announced != hash);
        self.sources.remove(hash);
        self.not_found.remove(hash);
        self.blocks_in_flight.remove(hash).map(|in_flight| in_flight.peer_id)
    }

    pub fn complete_tx(&mut self, hash: &TxHash) -> Option<PeerId> {
        self.tx_queue.retain(|queued| queued != hash);
        self.sources.remove(hash);
        self.not_found.remove(hash);
        self.txs_in_flight.remove(hash)
    }

    /// Take a block back from the peer it is in flight from so the next pass
    /// can place it elsewhere. Header-known blocks always go back to the
    /// queue; announced blocks only while some other announcer remains.
    pub fn release_block(&mut self, hash: &BlockHash, from: &PeerId) -> bool {
        let Some(in_flight) = self.blocks_in_flight.get(hash).copied() else {
            return false;
        };
        if in_flight.peer_id != *from {
            return false;
        }
        self.blocks_in_flight.remove(hash);

        match in_flight.height {
            Some(height) => {
                self.block_queue.insert((height, *hash));
                self.queued_heights.insert(*hash, height);
            }
            None if self.has_other_source(hash, from) => self.announced_blocks.push_front(*hash),
            None => {
                self.sources.remove(hash);
            }
        }
        true
    }

    pub fn release_tx(&mut self, hash: &TxHash, from: &PeerId) -> bool {
        if self.txs_in_flight.get(hash) != Some(from) {
            return false;
        }
        self.txs_in_flight.remove(hash);

        if self.has_other_source(hash, from) {
            self.tx_queue.push_front(*hash);
        } else {
            self.sources.remove(hash);
        }
        true
    }

    /// The peer cannot serve `hash`; never ask it again for this hash.
    pub fn mark_not_found(&mut self, hash: Bytes32, peer_id: PeerId) {
        self.not_found.entry(hash).or_default().insert(peer_id);
        if let Some(sources) = self.sources.get_mut(&hash) {
            sources.retain(|source| *source != peer_id);
        }
    }

    /// Drop a departed peer from every source list. Hashes only that peer
    /// could serve are abandoned.
    pub fn forget_peer(&mut self, peer_id: &PeerId) {
        for sources in self.sources.values_mut() {
            sources.retain(|source| source != peer_id);
        }
        for excluded in self.not_found.values_mut() {
            excluded.remove(peer_id);
        }
        self.not_found.retain(|_, excluded| !excluded.is_empty());

        let orphaned_blocks: Vec<BlockHash> = self
            .announced_blocks
            .iter()
            .filter(|hash| !self.has_any_source(hash))
            .copied()
            .collect();
        for hash in orphaned_blocks {
            self.announced_blocks.retain(|announced| *announced != hash);
            self.sources.remove(&hash);
        }

        let orphaned_txs: Vec<TxHash> = self
            .tx_queue
            .iter()
            .filter(|hash| !self.has_any_source(hash))
            .copied()
            .collect();
        for hash in orphaned_txs {
            self.tx_queue.retain(|queued| *queued != hash);
            self.sources.remove(&hash);
        }
        self.sources.retain(|_, sources| !sources.is_empty());
    }

    /// Run one scheduling pass over queued blocks, announced blocks and
    /// transactions, returning the requests to send.
    pub fn schedule(&mut self, peers: &mut PeerManager, now: Instant) -> Vec<OutboundSyncRequest> {
        let mut blocks: Vec<(PeerId, Vec<BlockHash>)> = Vec::new();
        let mut txs: Vec<(PeerId, Vec<TxHash>)> = Vec::new();

        // Header chain: ascending, no gaps.
        while self.blocks_in_flight.len() < self.max_blocks_in_flight {
            let Some(&(height, hash)) = self.block_queue.first() else {
                break;
            };
            let Some(peer_id) = self.pick_block_peer(peers, &hash, Some(height), None) else {
                trace!(hash = %hash.short(), height = height.0, "No peer can take next block");
                break;
            };
            if self.assign_block(peers, hash, Some(height), peer_id, now).is_err() {
                break;
            }
            push_grouped(&mut blocks, peer_id, hash);
        }

        // Announced blocks: independent of each other.
        let announced: Vec<BlockHash> = self.announced_blocks.iter().copied().collect();
        for hash in announced {
            if self.blocks_in_flight.len() >= self.max_blocks_in_flight {
                break;
            }
            let sources = self.sources.get(&hash).cloned().unwrap_or_default();
            let Some(peer_id) = self.pick_block_peer(peers, &hash, None, Some(&sources)) else {
                continue;
            };
            if self.assign_block(peers, hash, None, peer_id, now).is_ok() {
                push_grouped(&mut blocks, peer_id, hash);
            }
        }

        let queued: Vec<TxHash> = self.tx_queue.iter().copied().collect();
        for hash in queued {
            let Some(peer_id) = self.pick_tx_peer(peers, &hash) else {
                continue;
            };
            if self.assign_tx(peers, hash, peer_id, now).is_ok() {
                push_grouped(&mut txs, peer_id, hash);
            }
        }

        blocks
            .into_iter()
            .map(|(peer_id, hashes)| OutboundSyncRequest::GetBlocks { peer_id, hashes })
            .chain(
                txs.into_iter()
                    .map(|(peer_id, hashes)| OutboundSyncRequest::GetTransactions { peer_id, hashes }),
            )
            .collect()
    }

    /// Least-loaded eligible peer, earlier connection breaking ties.
    fn pick_block_peer(
        &self,
        peers: &PeerManager,
        hash: &BlockHash,
        height: Option<Height>,
        sources: Option<&[PeerId]>,
    ) -> Option<PeerId> {
        let excluded = self.not_found.get(hash);
        peers
            .get_all_peers()
            .into_iter()
            .filter(|peer| !peer.status.is_stalled())
            .filter(|peer| peer.block_capacity(self.max_blocks_per_peer) > 0)
            .filter(|peer| excluded.is_none_or(|excluded| !excluded.contains(&peer.peer_id)))
            .filter(|peer| match (height, sources) {
                (Some(height), _) => peer.serves_blocks() && peer.has_height(height),
                (None, Some(sources)) => sources.contains(&peer.peer_id),
                (None, None) => false,
            })
            .min_by_key(|peer| (peer.requested_blocks.len(), peer.connection_seq))
            .map(|peer| peer.peer_id)
    }

    /// First announcer that is not stalled and has room.
    fn pick_tx_peer(&self, peers: &PeerManager, hash: &TxHash) -> Option<PeerId> {
        let excluded = self.not_found.get(hash);
        self.sources.get(hash)?.iter().copied().find(|peer_id| {
            peers.get_peer(peer_id).is_some_and(|peer: &PeerState| {
                !peer.status.is_stalled()
                    && peer.tx_capacity(self.max_txs_per_peer) > 0
                    && excluded.is_none_or(|excluded| !excluded.contains(peer_id))
            })
        })
    }

    fn add_source(&mut self, hash: Bytes32, peer_id: PeerId) {
        let sources = self.sources.entry(hash).or_default();
        if !sources.contains(&peer_id) {
            sources.push(peer_id);
        }
    }

    fn has_other_source(&self, hash: &Bytes32, from: &PeerId) -> bool {
        self.sources
            .get(hash)
            .is_some_and(|sources| sources.iter().any(|source| source != from))
    }

    fn has_any_source(&self, hash: &Bytes32) -> bool {
        self.sources.get(hash).is_some_and(|sources| !sources.is_empty())
    }

    pub fn blocks_in_flight(&self) -> usize {
        self.blocks_in_flight.len()
    }

    pub fn txs_in_flight(&self) -> usize {
        self.txs_in_flight.len()
    }

    /// Blocks waiting for a peer, header-known and announced.
    pub fn queued_blocks(&self) -> usize {
        self.block_queue.len() + self.announced_blocks.len()
    }

    pub fn queued_txs(&self) -> usize {
        self.tx_queue.len()
    }

    /// Heights of queued header-known blocks, lowest first.
    pub fn queued_heights(&self) -> Vec<Height> {
        self.block_queue.iter().map(|(height, _)| *height).collect()
    }
}

fn push_grouped(groups: &mut Vec<(PeerId, Vec<Bytes32>)>, peer_id: PeerId, hash: Bytes32) {
    match groups.iter_mut().find(|(peer, _)| *peer == peer_id) {
        Some((_, hashes)) => hashes.push(hash),
        None => groups.push((peer_id, vec![hash])),
    }
}
