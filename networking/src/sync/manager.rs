/// Sync manager: the single owner of peer records, orphan pool, scheduler and
/// sync progress.
///
/// Every operation takes `&mut self`, so whoever drives the manager decides
/// the order in which events are applied. `SyncService` drives it from one
/// task fed by a mailbox. Handlers take the current time explicitly.
use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use chain::ChainParams;
use containers::{
    Block, BlockHash, BlockHeader, Bytes32, ChainTip, Checkpoint, Height, InvType, InvVect,
    Transaction, TxHash,
};
use libp2p_identity::PeerId;
use metrics::SharedMetrics;
use tracing::{debug, info, trace, warn};

use super::{
    config::{MAX_HEADERS_PER_REQUEST, SyncConfig, SyncParams},
    error::SyncError,
    orphan_pool::OrphanPool,
    peer_manager::PeerManager,
    scheduler::RequestScheduler,
    states::{PeerSyncStatus, SyncState},
};
use crate::types::{
    BlockAcceptance, ChainValidator, DisconnectReason, FeeEstimator, OutboundSyncRequest,
    P2pRequestSink, PeerInfo, PeerNotifier, RejectKind, RelayData, TransactionPool,
};

pub struct SyncManager {
    chain_params: ChainParams,
    chain: Arc<dyn ChainValidator>,
    tx_pool: Arc<dyn TransactionPool>,
    notifier: Arc<dyn PeerNotifier>,
    network: Arc<dyn P2pRequestSink<OutboundSyncRequest>>,
    fee_estimator: Option<Arc<dyn FeeEstimator>>,
    disable_checkpoints: bool,
    max_peers: usize,
    params: SyncParams,
    metrics: Option<SharedMetrics>,

    state: SyncState,
    peers: PeerManager,
    orphans: OrphanPool,
    scheduler: RequestScheduler,

    /// Recently rejected transactions, oldest first.
    rejected_txs: HashSet<TxHash>,
    rejected_order: VecDeque<TxHash>,
}

impl SyncManager {
    pub fn new(config: SyncConfig) -> Self {
        let tip = config.chain.best_tip();
        let params = config.params;
        let mut manager = Self {
            chain_params: config.chain_params,
            chain: config.chain,
            tx_pool: config.tx_pool,
            notifier: config.notifier,
            network: config.network,
            fee_estimator: config.fee_estimator,
            disable_checkpoints: config.disable_checkpoints,
            max_peers: config.max_peers,
            metrics: config.metrics,
            state: SyncState::new(tip),
            peers: PeerManager::with_capacity(config.max_peers),
            orphans: OrphanPool::new(
                params.max_orphan_blocks,
                params.max_orphans_per_peer,
                params.orphan_expiry(),
            ),
            scheduler: RequestScheduler::new(&params),
            rejected_txs: HashSet::new(),
            rejected_order: VecDeque::new(),
            params,
        };
        manager.state.next_checkpoint = manager.next_checkpoint_above(tip.height);
        manager
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn peers(&self) -> &PeerManager {
        &self.peers
    }

    pub fn orphans(&self) -> &OrphanPool {
        &self.orphans
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn params(&self) -> &SyncParams {
        &self.params
    }

    pub fn sync_peer_id(&self) -> Option<PeerId> {
        self.state.sync_peer
    }

    pub fn best_known_header(&self) -> ChainTip {
        self.state.best_known_header
    }

    /// Whether the local chain has caught up with everything we know of:
    /// headers-first is over and the tip reaches both the best known header
    /// and the sync peer's advertised height.
    pub fn is_current(&self) -> bool {
        if self.state.headers_first_mode {
            return false;
        }
        let tip = self.chain.best_tip();
        let sync_peer_height = self
            .state
            .sync_peer
            .and_then(|peer_id| self.peers.get_peer(&peer_id))
            .map(|peer| peer.protocol_height)
            .unwrap_or_default();
        tip.height >= self.state.best_known_header.height && tip.height >= sync_peer_height
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            peers: self.peers.len(),
            candidates: self.peers.candidates(),
            sync_peer: self.state.sync_peer,
            best_known_header: self.state.best_known_header,
            chain_tip: self.chain.best_tip(),
            headers_first_mode: self.state.headers_first_mode,
            is_current: self.is_current(),
            orphan_blocks: self.orphans.len(),
            blocks_in_flight: self.scheduler.blocks_in_flight(),
            txs_in_flight: self.scheduler.txs_in_flight(),
            queued_blocks: self.scheduler.queued_blocks(),
            queued_txs: self.scheduler.queued_txs(),
            rejected_txs: self.rejected_txs.len(),
        }
    }

    /// Register a peer whose handshake completed. A qualifying peer becomes
    /// the sync peer if there is none, or if it advertises a strictly greater
    /// height than the current one.
    pub fn peer_connected(&mut self, info: PeerInfo, now: Instant) -> Result<(), SyncError> {
        let peer_id = info.peer_id;
        if self.peers.contains(&peer_id) {
            debug!(peer = %peer_id, "Peer already registered with sync manager");
            return Ok(());
        }
        if self.peers.len() >= self.max_peers {
            warn!(peer = %peer_id, max_peers = self.max_peers, "Peer table above configured maximum");
        }

        let local_height = self.chain.best_tip().height;
        let peer = self.peers.add_peer(peer_id, &info.status, now);
        let candidate = peer.qualifies_for_sync(local_height);
        if candidate {
            peer.is_sync_candidate = true;
            peer.transition(PeerSyncStatus::Candidate);
        }

        info!(
            peer = %peer_id,
            height = info.status.height.0,
            candidate,
            "Peer connected to sync manager"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_peer_connection(candidate);
        }

        if candidate {
            let current_height = self
                .state
                .sync_peer
                .and_then(|sync_peer| self.peers.get_peer(&sync_peer))
                .map(|sync_peer| sync_peer.protocol_height);

            match current_height {
                None => self.start_sync(peer_id, now),
                Some(current) if info.status.height > current => {
                    info!(
                        peer = %peer_id,
                        height = info.status.height.0,
                        previous_height = current.0,
                        "Switching sync peer to higher peer"
                    );
                    self.start_sync(peer_id, now);
                }
                Some(_) => {
                    if let Some(peer) = self.peers.get_peer_mut(&peer_id) {
                        peer.transition(PeerSyncStatus::Passive);
                    }
                }
            }
        }

        self.schedule(now);
        self.update_metrics();
        Ok(())
    }

    /// Drop a peer and release its outstanding requests. Replacing a departed
    /// sync peer may fail with `NoSyncCandidate`, which pauses sync.
    pub fn peer_disconnected(&mut self, peer_id: &PeerId, now: Instant) -> Result<(), SyncError> {
        let was_sync_peer = self.state.is_sync_peer(peer_id);
        self.remove_peer(peer_id)
            .ok_or(SyncError::UnknownPeer(*peer_id))?;
        if let Some(metrics) = &self.metrics {
            metrics.inc_peer_disconnection("remote");
        }

        let result = if was_sync_peer {
            self.state.sync_peer = None;
            self.state.headers_requested_at = None;
            self.select_sync_peer(now)
        } else {
            Ok(())
        };

        self.schedule(now);
        self.update_metrics();
        result
    }

    pub fn headers_received(
        &mut self,
        peer_id: &PeerId,
        headers: Vec<BlockHeader>,
        now: Instant,
    ) -> Result<(), SyncError> {
        if !self.peers.contains(peer_id) {
            return Err(SyncError::UnknownPeer(*peer_id));
        }
        self.note_delivery(peer_id, now);

        let is_sync_peer = self.state.is_sync_peer(peer_id);
        if is_sync_peer {
            self.state.headers_requested_at = None;
        }

        let Some(last) = headers.last() else {
            if is_sync_peer && self.state.headers_first_mode {
                self.finish_headers_first();
            }
            return Ok(());
        };
        let last_hash = last.hash();

        if headers.len() > MAX_HEADERS_PER_REQUEST {
            let reason = format!(
                "{} headers exceed the limit of {MAX_HEADERS_PER_REQUEST}",
                headers.len()
            );
            return Err(self.reject_headers(peer_id, reason, now));
        }
        if headers
            .windows(2)
            .any(|pair| pair[1].prev_block != pair[0].hash())
        {
            return Err(self.reject_headers(peer_id, "headers are not contiguous".into(), now));
        }
        let Some(parent_height) = self.chain.header_height(&headers[0].prev_block) else {
            return Err(self.reject_headers(
                peer_id,
                "headers do not connect to a known header".into(),
                now,
            ));
        };
        let first_height = parent_height.next();
        let last_height = Height(parent_height.0 + headers.len() as u64);

        if let Some(checkpoint) = self.state.next_checkpoint {
            if first_height <= checkpoint.height && !is_sync_peer {
                debug!(
                    peer = %peer_id,
                    first_height = first_height.0,
                    checkpoint = checkpoint.height.0,
                    "Ignoring headers below checkpoint from non-sync peer"
                );
                return Err(SyncError::InvalidHeaderChain {
                    peer: *peer_id,
                    reason: "only the sync peer is trusted below the next checkpoint".into(),
                });
            }
            let mut passed = Some(checkpoint);
            while let Some(checkpoint) = passed.filter(|checkpoint| checkpoint.height <= last_height) {
                if checkpoint.height >= first_height {
                    let index = (checkpoint.height.0 - first_height.0) as usize;
                    if headers[index].hash() != checkpoint.hash {
                        let reason = format!("header at height {} does not match checkpoint", checkpoint.height);
                        return Err(self.reject_headers(peer_id, reason, now));
                    }
                }
                passed = self.next_checkpoint_above(checkpoint.height);
            }
        }

        if let Err(reason) = self.chain.submit_headers(&headers) {
            return Err(self.reject_headers(peer_id, reason, now));
        }

        let reached_checkpoint = self
            .state
            .next_checkpoint
            .filter(|checkpoint| checkpoint.height <= last_height);
        if let Some(checkpoint) = reached_checkpoint {
            info!(height = checkpoint.height.0, "Verified downloaded headers against checkpoint");
            self.state.next_checkpoint = self.next_checkpoint_above(last_height);
        }

        let mut queued = 0;
        for (offset, header) in headers.iter().enumerate() {
            let hash = header.hash();
            if self.chain.have_block(&hash) || self.orphans.contains(&hash) {
                continue;
            }
            if self.scheduler.queue_block(Height(first_height.0 + offset as u64), hash) {
                queued += 1;
            }
        }

        if last_height > self.state.best_known_header.height {
            self.state.best_known_header = ChainTip::new(last_hash, last_height);
        }
        if let Some(peer) = self.peers.get_peer_mut(peer_id) {
            peer.note_announcement(last_hash, Some(last_height), now);
        }

        debug!(
            peer = %peer_id,
            count = headers.len(),
            first_height = first_height.0,
            last_height = last_height.0,
            queued,
            "Received headers"
        );

        if is_sync_peer && self.state.headers_first_mode {
            // A batch cut short by the checkpoint stop hash is not the end of the chain.
            if reached_checkpoint.is_some_and(|checkpoint| checkpoint.hash == last_hash) {
                self.request_headers(*peer_id, last_hash, now);
            } else if headers.len() < MAX_HEADERS_PER_REQUEST {
                self.finish_headers_first();
            } else {
                self.request_headers(*peer_id, last_hash, now);
            }
        }

        self.schedule(now);
        self.update_metrics();
        Ok(())
    }

    pub fn block_received(&mut self, peer_id: &PeerId, block: Block, now: Instant) -> Result<(), SyncError> {
        let hash = block.hash();
        let peer = self
            .peers
            .get_peer_mut(peer_id)
            .ok_or(SyncError::UnknownPeer(*peer_id))?;
        let requested = peer.requested_blocks.remove(&hash).is_some();
        let superseded = peer.superseded.remove(&hash);
        self.note_delivery(peer_id, now);
        self.resolve_block_request(&hash, Some(peer_id));

        if self.chain.have_block(&hash) || self.orphans.contains(&hash) {
            if !requested && !superseded {
                return Err(self.misbehaving(peer_id, "unsolicited duplicate block".into(), now));
            }
            trace!(peer = %peer_id, hash = %hash.short(), "Already have block");
            if let Some(metrics) = &self.metrics {
                metrics.inc_blocks_processed("duplicate");
            }
            self.schedule(now);
            return Ok(());
        }

        let result = self.handle_block(block, Some(*peer_id), now).map(|_| ());
        self.schedule(now);
        self.update_metrics();
        result
    }

    /// Submit a block that did not come from a peer, e.g. one mined locally.
    /// Returns whether it was stored as an orphan.
    pub fn process_block(&mut self, block: Block, now: Instant) -> Result<bool, SyncError> {
        let result = self.handle_block(block, None, now);
        self.schedule(now);
        self.update_metrics();
        result
    }

    pub fn transaction_received(
        &mut self,
        peer_id: &PeerId,
        tx: Transaction,
        now: Instant,
    ) -> Result<(), SyncError> {
        let hash = tx.hash();
        let peer = self
            .peers
            .get_peer_mut(peer_id)
            .ok_or(SyncError::UnknownPeer(*peer_id))?;
        peer.requested_txs.remove(&hash);
        peer.superseded.remove(&hash);
        self.note_delivery(peer_id, now);
        if let Some(holder) = self.scheduler.complete_tx(&hash) {
            if holder != *peer_id {
                self.supersede(&holder, hash, InvType::Tx);
            }
        }

        if self.rejected_txs.contains(&hash) || self.tx_pool.have_transaction(&hash) {
            trace!(peer = %peer_id, hash = %hash.short(), "Ignoring known transaction");
            self.schedule(now);
            return Ok(());
        }

        match self.tx_pool.submit_tx(tx) {
            Ok(accepted) => {
                debug!(
                    peer = %peer_id,
                    hash = %hash.short(),
                    accepted = accepted.len(),
                    "Accepted transaction"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.inc_transactions_processed("accepted");
                }
                self.notifier.announce_new_transactions(&accepted, Some(*peer_id));
            }
            Err(rejection) => {
                self.remember_rejected(hash);
                if let Some(peer) = self.peers.get_peer_mut(peer_id) {
                    peer.rejected_txs += 1;
                }
                if let Some(metrics) = &self.metrics {
                    metrics.inc_transactions_processed("rejected");
                }
                if rejection.kind == RejectKind::ProtocolViolation {
                    let err = self.misbehaving(peer_id, rejection.reason, now);
                    self.schedule(now);
                    self.update_metrics();
                    return Err(err);
                }
                debug!(peer = %peer_id, hash = %hash.short(), %rejection, "Rejected transaction");
            }
        }

        self.schedule(now);
        self.update_metrics();
        Ok(())
    }

    pub fn inventory_received(
        &mut self,
        peer_id: &PeerId,
        inventory: Vec<InvVect>,
        now: Instant,
    ) -> Result<(), SyncError> {
        if !self.peers.contains(peer_id) {
            return Err(SyncError::UnknownPeer(*peer_id));
        }
        let is_sync_peer = self.state.is_sync_peer(peer_id);
        let current = self.is_current();

        for inv in inventory {
            match inv.kind {
                InvType::Block => {
                    let height = self.chain.header_height(&inv.hash);
                    if let Some(peer) = self.peers.get_peer_mut(peer_id) {
                        peer.note_announcement(inv.hash, height, now);
                    }
                    if self.chain.have_block(&inv.hash) {
                        continue;
                    }
                    if self.orphans.contains(&inv.hash) {
                        self.request_orphan_ancestors(&inv.hash, Some(*peer_id));
                        continue;
                    }
                    if !is_sync_peer && !current {
                        trace!(peer = %peer_id, hash = %inv.hash.short(), "Ignoring block inventory while syncing");
                        continue;
                    }
                    match height {
                        Some(height) => {
                            self.scheduler.queue_block(height, inv.hash);
                        }
                        None => {
                            self.scheduler.announce_block(inv.hash, *peer_id);
                        }
                    }
                }
                InvType::Tx => {
                    if self.rejected_txs.contains(&inv.hash) || self.tx_pool.have_transaction(&inv.hash) {
                        continue;
                    }
                    self.scheduler.announce_tx(inv.hash, *peer_id);
                }
            }
        }

        self.schedule(now);
        self.update_metrics();
        Ok(())
    }

    /// The peer cannot serve these hashes; hand them to another source.
    pub fn not_found(&mut self, peer_id: &PeerId, inventory: Vec<InvVect>, now: Instant) -> Result<(), SyncError> {
        if !self.peers.contains(peer_id) {
            return Err(SyncError::UnknownPeer(*peer_id));
        }
        self.note_delivery(peer_id, now);

        for inv in inventory {
            let Some(peer) = self.peers.get_peer_mut(peer_id) else {
                break;
            };
            let was_requested = match inv.kind {
                InvType::Block => peer.requested_blocks.remove(&inv.hash).is_some(),
                InvType::Tx => peer.requested_txs.remove(&inv.hash).is_some(),
            };
            if !was_requested {
                continue;
            }
            self.scheduler.mark_not_found(inv.hash, *peer_id);
            match inv.kind {
                InvType::Block => self.scheduler.release_block(&inv.hash, peer_id),
                InvType::Tx => self.scheduler.release_tx(&inv.hash, peer_id),
            };
            debug!(peer = %peer_id, %inv, "Peer could not serve requested data");
        }

        self.schedule(now);
        self.update_metrics();
        Ok(())
    }

    /// A peer announced a new best block. Its advertised height never decreases.
    pub fn peer_height_updated(
        &mut self,
        peer_id: &PeerId,
        hash: BlockHash,
        height: Height,
        now: Instant,
    ) -> Result<(), SyncError> {
        let local_height = self.chain.best_tip().height;
        let peer = self
            .peers
            .get_peer_mut(peer_id)
            .ok_or(SyncError::UnknownPeer(*peer_id))?;
        peer.note_announcement(hash, Some(height), now);

        let became_candidate = !peer.is_sync_candidate && peer.qualifies_for_sync(local_height);
        if became_candidate {
            peer.is_sync_candidate = true;
            peer.transition(PeerSyncStatus::Candidate);
        }
        trace!(peer = %peer_id, height = height.0, "Updated peer height");

        if became_candidate && self.peers.get_peer(peer_id).is_some_and(|peer| peer.status == PeerSyncStatus::Candidate) {
            if self.state.sync_peer.is_none() {
                self.start_sync(*peer_id, now);
            } else if let Some(peer) = self.peers.get_peer_mut(peer_id) {
                peer.transition(PeerSyncStatus::Passive);
            }
        }

        self.schedule(now);
        self.update_metrics();
        Ok(())
    }

    /// Periodic maintenance: expire orphans, detect stalled peers, release
    /// and reassign their requests, replace a repeatedly stalled sync peer.
    pub fn tick(&mut self, now: Instant) {
        let expired = self.orphans.expire(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "Expired orphan blocks");
        }
        for orphan in &expired {
            self.requeue_block(&orphan.hash);
        }

        let timeout = self.params.stall_timeout();
        for peer_id in self.peers.peer_ids() {
            self.check_stall(peer_id, now, timeout);
        }

        if self.state.sync_peer.is_none() {
            let local_height = self.chain.best_tip().height;
            if let Some(peer_id) = self.peers.select_sync_candidate(local_height, None) {
                self.start_sync(peer_id, now);
            }
        }

        self.schedule(now);
        self.update_metrics();
    }

    fn check_stall(&mut self, peer_id: PeerId, now: Instant, timeout: Duration) {
        let is_sync_peer = self.state.is_sync_peer(&peer_id);
        let headers_overdue = is_sync_peer
            && self
                .state
                .headers_requested_at
                .is_some_and(|sent| now.saturating_duration_since(sent) >= timeout);

        let Some(peer) = self.peers.get_peer_mut(&peer_id) else {
            return;
        };
        let overdue_blocks = peer.overdue_blocks(now, timeout);
        let overdue_txs = peer.overdue_txs(now, timeout);
        let already_stalled = peer.status.is_stalled();

        if !already_stalled && overdue_blocks.is_empty() && overdue_txs.is_empty() && !headers_overdue {
            return;
        }

        if !already_stalled {
            peer.transition(PeerSyncStatus::Stalled);
            warn!(
                peer = %peer_id,
                blocks = overdue_blocks.len(),
                txs = overdue_txs.len(),
                headers = headers_overdue,
                "Peer stalled"
            );
        }
        for hash in &overdue_blocks {
            peer.requested_blocks.remove(hash);
            peer.superseded.insert(*hash);
        }
        for hash in &overdue_txs {
            peer.requested_txs.remove(hash);
            peer.superseded.insert(*hash);
        }
        let score = peer.penalize(self.params.stall_penalty);
        if is_sync_peer {
            peer.sync_stalls += 1;
        }
        let sync_stalls = peer.sync_stalls;

        for hash in &overdue_blocks {
            self.scheduler.release_block(hash, &peer_id);
        }
        for hash in &overdue_txs {
            self.scheduler.release_tx(hash, &peer_id);
        }
        if headers_overdue {
            self.state.headers_requested_at = None;
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc_peer_stall(if is_sync_peer { "sync" } else { "other" });
        }
        debug!(
            peer = %peer_id,
            score,
            released_blocks = overdue_blocks.len(),
            released_txs = overdue_txs.len(),
            "Penalized stalled peer"
        );

        if score >= self.params.ban_threshold {
            self.disconnect_peer(&peer_id, DisconnectReason::Stalled, now);
            return;
        }

        if is_sync_peer && sync_stalls >= self.params.max_sync_peer_stalls {
            warn!(peer = %peer_id, stalls = sync_stalls, "Sync peer stalled repeatedly, replacing it");
            self.state.sync_peer = None;
            self.state.headers_requested_at = None;
            if let Some(peer) = self.peers.get_peer_mut(&peer_id) {
                peer.sync_stalls = 0;
            }
            let _ = self.select_sync_peer(now);
        }
    }

    /// Accept, orphan or reject a block. Returns whether it became an orphan.
    fn handle_block(&mut self, block: Block, source: Option<PeerId>, now: Instant) -> Result<bool, SyncError> {
        let hash = block.hash();
        if self.chain.have_block(&hash) {
            return Ok(false);
        }
        if self.orphans.contains(&hash) {
            return Ok(true);
        }

        if !self.chain.have_block(&block.parent_hash()) {
            self.add_orphan(block, source, now)?;
            return Ok(true);
        }

        if let Err(err) = self.accept_block(&block, source, now) {
            self.discard_orphan_descendants(&hash);
            return Err(err);
        }
        self.promote_orphans(hash, now);
        Ok(false)
    }

    fn add_orphan(&mut self, block: Block, source: Option<PeerId>, now: Instant) -> Result<(), SyncError> {
        let hash = block.hash();
        let parent = block.parent_hash();
        match self.orphans.add(block, source, now) {
            Ok(Some(evicted)) => {
                debug!(evicted = %evicted.hash.short(), "Orphan pool at capacity, evicted oldest");
                self.requeue_block(&evicted.hash);
            }
            Ok(None) => {}
            Err(err) => {
                debug!(hash = %hash.short(), peer = ?source, %err, "Dropping orphan block");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_blocks_processed("orphan_dropped");
                }
                self.requeue_block(&hash);
                return Err(err);
            }
        }

        debug!(
            hash = %hash.short(),
            parent = %parent.short(),
            peer = ?source,
            orphans = self.orphans.len(),
            "Stored orphan block"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc_blocks_processed("orphan");
        }

        self.request_orphan_ancestors(&hash, source);
        Ok(())
    }

    /// Put a block that was dropped before reaching the chain back in the
    /// download queue, if its header is known.
    fn requeue_block(&mut self, hash: &BlockHash) {
        if self.chain.have_block(hash) {
            return;
        }
        let Some(height) = self.chain.header_height(hash) else {
            return;
        };
        if self.scheduler.queue_block(height, *hash) {
            debug!(hash = %hash.short(), height = height.0, "Requeued dropped block");
        }
    }

    /// Orphans building on a rejected block can never connect.
    fn discard_orphan_descendants(&mut self, rejected: &BlockHash) {
        let mut worklist = vec![*rejected];
        let mut discarded = 0usize;
        while let Some(parent) = worklist.pop() {
            for orphan in self.orphans.take_children(&parent) {
                discarded += 1;
                worklist.push(orphan.hash);
                if let Some(metrics) = &self.metrics {
                    metrics.inc_blocks_processed("orphan_dropped");
                }
            }
        }

        if discarded > 0 {
            debug!(rejected = %rejected.short(), discarded, "Discarded orphans of rejected block");
        }
    }

    /// Ask for the headers leading to an orphan chain, unless its missing
    /// ancestor is already on the way.
    fn request_orphan_ancestors(&mut self, orphan: &BlockHash, source: Option<PeerId>) {
        let root = self.orphans.orphan_root(orphan);
        let Some(missing) = self.orphans.get(&root).map(|orphan| orphan.parent_hash) else {
            return;
        };
        if self.scheduler.is_block_pending(&missing) {
            return;
        }
        if let Some(height) = self.chain.header_height(&missing) {
            self.scheduler.queue_block(height, missing);
            return;
        }

        let target = match source {
            Some(peer_id) if self.headers_trusted_from(&peer_id) => Some(peer_id),
            _ => self.state.sync_peer,
        };
        let Some(peer_id) = target else {
            debug!(missing = %missing.short(), "No peer to ask for orphan ancestors");
            return;
        };
        self.send(OutboundSyncRequest::GetHeaders {
            peer_id,
            locator: self.chain.block_locator(None),
            stop: root,
        });
    }

    fn accept_block(&mut self, block: &Block, source: Option<PeerId>, now: Instant) -> Result<(), SyncError> {
        let hash = block.hash();
        let started = Instant::now();
        let result = self.chain.submit_block(block);
        if let Some(metrics) = &self.metrics {
            metrics.observe_block_processing_time(started.elapsed().as_secs_f64());
        }
        self.resolve_block_request(&hash, source.as_ref());

        match result {
            Ok(acceptance) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_blocks_processed("accepted");
                }
                self.on_block_accepted(block, acceptance, source);
                Ok(())
            }
            Err(reason) => {
                warn!(hash = %hash.short(), peer = ?source, %reason, "Block rejected");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_blocks_processed("rejected");
                }
                if let Some(peer_id) = source {
                    self.penalize(&peer_id, self.params.invalid_block_penalty, DisconnectReason::Misbehaving, now);
                }
                Err(SyncError::BlockRejected { hash, reason })
            }
        }
    }

    fn on_block_accepted(&mut self, block: &Block, acceptance: BlockAcceptance, source: Option<PeerId>) {
        let hash = acceptance.block.hash;
        let height = acceptance.block.height;
        if let Some(peer) = source.and_then(|peer_id| self.peers.get_peer_mut(&peer_id)) {
            if height > peer.protocol_height {
                peer.protocol_height = height;
            }
        }

        if !acceptance.is_new_tip {
            debug!(hash = %hash.short(), height = height.0, "Accepted side-chain block");
            return;
        }

        match &acceptance.reorg {
            Some(reorg) => {
                info!(
                    new_tip = %acceptance.block,
                    depth = reorg.depth(),
                    connected = reorg.connected.len(),
                    "Chain reorganized"
                );
                self.state.best_known_header = acceptance.block;
                self.tx_pool.reconcile_after_reorg(&reorg.disconnected, &reorg.connected);
                if let Some(fee_estimator) = &self.fee_estimator {
                    for disconnected in &reorg.disconnected {
                        if let Err(err) = fee_estimator.rollback(&disconnected.hash()) {
                            warn!(%err, "Fee estimator rollback failed");
                        }
                    }
                }
                for connected in &reorg.connected {
                    self.register_fees(connected);
                    self.confirm_transactions(connected);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.inc_reorgs();
                    metrics.observe_reorg_depth(reorg.depth() as f64);
                }
            }
            None => {
                if height > self.state.best_known_header.height {
                    self.state.best_known_header = acceptance.block;
                }
                self.tx_pool.reconcile_after_reorg(&[], std::slice::from_ref(block));
                self.register_fees(block);
                self.confirm_transactions(block);
            }
        }

        if self.state.next_checkpoint.is_some_and(|checkpoint| checkpoint.height <= height) {
            self.state.next_checkpoint = self.next_checkpoint_above(height);
        }

        trace!(tip = %acceptance.block, "Extended main chain");
        if self.is_current() {
            self.notifier
                .relay_inventory(InvVect::block(hash), RelayData::Header(block.header.clone()));
            self.notifier.update_peer_heights(&hash, height, source);
        }
    }

    /// Submit every orphan waiting on `accepted`, then on each newly accepted
    /// orphan, until no waiting children remain.
    fn promote_orphans(&mut self, accepted: BlockHash, now: Instant) {
        let mut worklist = vec![accepted];
        let mut promoted = 0usize;

        while let Some(parent) = worklist.pop() {
            for orphan in self.orphans.take_children(&parent) {
                if self.chain.have_block(&orphan.hash) {
                    continue;
                }
                if self.accept_block(&orphan.block, orphan.source, now).is_ok() {
                    promoted += 1;
                    worklist.push(orphan.hash);
                } else {
                    self.discard_orphan_descendants(&orphan.hash);
                }
            }
        }

        if promoted > 0 {
            debug!(promoted, remaining = self.orphans.len(), "Promoted orphan blocks");
        }
    }

    fn register_fees(&self, block: &Block) {
        if let Some(fee_estimator) = &self.fee_estimator {
            if let Err(err) = fee_estimator.register_block(block) {
                warn!(hash = %block.hash().short(), %err, "Fee estimator rejected block");
            }
        }
    }

    fn confirm_transactions(&self, block: &Block) {
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            self.notifier.transaction_confirmed(tx);
        }
    }

    /// Make `peer_id` the sync peer and, if it is ahead of us, start
    /// downloading headers from it.
    fn start_sync(&mut self, peer_id: PeerId, now: Instant) {
        if let Some(previous) = self.state.sync_peer.take() {
            if previous != peer_id {
                if let Some(peer) = self.peers.get_peer_mut(&previous) {
                    if peer.status == PeerSyncStatus::Active {
                        peer.transition(PeerSyncStatus::Passive);
                    }
                }
            }
        }

        let Some(peer) = self.peers.get_peer_mut(&peer_id) else {
            return;
        };
        if !peer.transition(PeerSyncStatus::Active) {
            return;
        }
        peer.sync_stalls = 0;
        let peer_height = peer.protocol_height;

        let best = self.state.best_known_header;
        self.state.sync_peer = Some(peer_id);
        self.state.headers_requested_at = None;
        self.state.next_checkpoint = self.next_checkpoint_above(best.height);
        self.state.headers_first_mode = peer_height > best.height;

        info!(
            peer = %peer_id,
            height = peer_height.0,
            best_known = best.height.0,
            headers_first = self.state.headers_first_mode,
            "Syncing to block height from peer"
        );
        if self.state.headers_first_mode {
            self.request_headers(peer_id, best.hash, now);
        }
    }

    fn select_sync_peer(&mut self, now: Instant) -> Result<(), SyncError> {
        let local_height = self.chain.best_tip().height;
        match self.peers.select_sync_candidate(local_height, None) {
            Some(peer_id) => {
                self.start_sync(peer_id, now);
                Ok(())
            }
            None => {
                self.state.sync_peer = None;
                self.state.headers_first_mode = false;
                warn!("No sync peer candidates available");
                Err(SyncError::NoSyncCandidate)
            }
        }
    }

    fn finish_headers_first(&mut self) {
        self.state.headers_first_mode = false;
        info!(best_known = %self.state.best_known_header, "Headers-first sync complete, switching to block relay");
    }

    fn request_headers(&mut self, peer_id: PeerId, from: BlockHash, now: Instant) {
        let stop = self
            .state
            .next_checkpoint
            .map(|checkpoint| checkpoint.hash)
            .unwrap_or(Bytes32::ZERO);
        self.send(OutboundSyncRequest::GetHeaders {
            peer_id,
            locator: self.chain.block_locator(Some(&from)),
            stop,
        });
        if self.state.is_sync_peer(&peer_id) {
            self.state.headers_requested_at = Some(now);
        }
    }

    /// Below the next checkpoint only the sync peer's headers are accepted.
    fn headers_trusted_from(&self, peer_id: &PeerId) -> bool {
        self.state.next_checkpoint.is_none() || self.state.is_sync_peer(peer_id)
    }

    fn next_checkpoint_above(&self, height: Height) -> Option<Checkpoint> {
        if self.disable_checkpoints {
            return None;
        }
        self.chain_params.next_checkpoint(height)
    }

    /// Any data from a stalled peer brings it back into rotation.
    fn note_delivery(&mut self, peer_id: &PeerId, now: Instant) {
        let is_sync_peer = self.state.is_sync_peer(peer_id);
        let Some(peer) = self.peers.get_peer_mut(peer_id) else {
            return;
        };
        peer.note_activity(now);
        if peer.status.is_stalled() {
            let target = if is_sync_peer {
                PeerSyncStatus::Active
            } else {
                peer.resting_status()
            };
            peer.transition(target);
            peer.sync_stalls = 0;
            info!(peer = %peer_id, status = ?target, score = peer.stall_score, "Stalled peer resumed delivering");
        }
    }

    /// Drop a block from the scheduler; if it was in flight from another
    /// peer, that request is superseded.
    fn resolve_block_request(&mut self, hash: &BlockHash, delivered_by: Option<&PeerId>) {
        if let Some(holder) = self.scheduler.complete_block(hash) {
            if Some(&holder) != delivered_by {
                self.supersede(&holder, *hash, InvType::Block);
            }
        }
    }

    fn supersede(&mut self, holder: &PeerId, hash: Bytes32, kind: InvType) {
        if let Some(peer) = self.peers.get_peer_mut(holder) {
            let removed = match kind {
                InvType::Block => peer.requested_blocks.remove(&hash).is_some(),
                InvType::Tx => peer.requested_txs.remove(&hash).is_some(),
            };
            if removed {
                peer.superseded.insert(hash);
            }
        }
    }

    fn remember_rejected(&mut self, hash: TxHash) {
        if self.params.max_rejected_txs == 0 || !self.rejected_txs.insert(hash) {
            return;
        }
        self.rejected_order.push_back(hash);
        while self.rejected_order.len() > self.params.max_rejected_txs {
            if let Some(oldest) = self.rejected_order.pop_front() {
                self.rejected_txs.remove(&oldest);
            }
        }
    }

    fn penalize(&mut self, peer_id: &PeerId, amount: u32, reason: DisconnectReason, now: Instant) -> bool {
        let Some(peer) = self.peers.get_peer_mut(peer_id) else {
            return false;
        };
        let score = peer.penalize(amount);
        debug!(peer = %peer_id, amount, score, "Penalized peer");
        if score >= self.params.ban_threshold {
            self.disconnect_peer(peer_id, reason, now);
            return true;
        }
        false
    }

    fn reject_headers(&mut self, peer_id: &PeerId, reason: String, now: Instant) -> SyncError {
        warn!(peer = %peer_id, %reason, "Invalid header chain");
        self.disconnect_peer(peer_id, DisconnectReason::ProtocolViolation, now);
        SyncError::InvalidHeaderChain {
            peer: *peer_id,
            reason,
        }
    }

    fn misbehaving(&mut self, peer_id: &PeerId, reason: String, now: Instant) -> SyncError {
        warn!(peer = %peer_id, %reason, "Protocol violation");
        self.disconnect_peer(peer_id, DisconnectReason::ProtocolViolation, now);
        SyncError::Misbehaving {
            peer: *peer_id,
            reason,
        }
    }

    /// Ask the network to drop the peer and forget it right away.
    fn disconnect_peer(&mut self, peer_id: &PeerId, reason: DisconnectReason, now: Instant) {
        warn!(peer = %peer_id, reason = reason.as_str(), "Disconnecting peer");
        self.send(OutboundSyncRequest::Disconnect {
            peer_id: *peer_id,
            reason,
        });
        if let Some(metrics) = &self.metrics {
            metrics.inc_peer_disconnection(reason.as_str());
        }

        let was_sync_peer = self.state.is_sync_peer(peer_id);
        self.remove_peer(peer_id);
        if was_sync_peer {
            self.state.sync_peer = None;
            self.state.headers_requested_at = None;
            let _ = self.select_sync_peer(now);
        }
    }

    fn remove_peer(&mut self, peer_id: &PeerId) -> Option<()> {
        let peer = self.peers.remove_peer(peer_id)?;
        for hash in peer.requested_blocks.keys() {
            self.scheduler.release_block(hash, peer_id);
        }
        for hash in peer.requested_txs.keys() {
            self.scheduler.release_tx(hash, peer_id);
        }
        self.scheduler.forget_peer(peer_id);

        info!(
            peer = %peer_id,
            released_blocks = peer.requested_blocks.len(),
            released_txs = peer.requested_txs.len(),
            stall_score = peer.stall_score,
            "Peer removed from sync manager"
        );
        Some(())
    }

    fn schedule(&mut self, now: Instant) {
        for request in self.scheduler.schedule(&mut self.peers, now) {
            debug!(%request, "Scheduled request");
            self.send(request);
        }
    }

    fn send(&self, request: OutboundSyncRequest) {
        if let Err(err) = self.network.send(request) {
            warn!(%err, "Failed to send sync request");
        }
    }

    fn update_metrics(&self) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.set_peers(self.peers.len() as i64);
        metrics.set_best_known_height(self.state.best_known_header.height.0 as i64);
        metrics.set_chain_tip_height(self.chain.best_tip().height.0 as i64);
        metrics.set_blocks_in_flight(self.scheduler.blocks_in_flight() as i64);
        metrics.set_txs_in_flight(self.scheduler.txs_in_flight() as i64);
        metrics.set_orphan_blocks(self.orphans.len() as i64);
    }
}

/// Snapshot of sync progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub peers: usize,
    pub candidates: usize,
    pub sync_peer: Option<PeerId>,
    pub best_known_header: ChainTip,
    pub chain_tip: ChainTip,
    pub headers_first_mode: bool,
    pub is_current: bool,
    pub orphan_blocks: usize,
    pub blocks_in_flight: usize,
    pub txs_in_flight: usize,
    pub queued_blocks: usize,
    pub queued_txs: usize,
    pub rejected_txs: usize,
}
