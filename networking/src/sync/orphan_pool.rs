/// Orphan pool for blocks that arrive before their parent.
///
/// Blocks can arrive out of order: a relayed block may outrun its parent, or
/// parallel downloads may complete in a different order than requested. Such
/// blocks wait here, indexed by the parent they are missing, until the parent
/// is accepted and they can be promoted.
///
/// The pool is bounded: past capacity the oldest orphan is evicted, a single
/// peer may only occupy a share of it, and orphans expire after a timeout.
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use containers::{Block, BlockHash};
use libp2p_identity::PeerId;
use tracing::debug;

use super::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanBlock {
    pub block: Block,
    pub hash: BlockHash,
    pub parent_hash: BlockHash,
    pub received_at: Instant,
    /// Peer that delivered the block; `None` for locally submitted blocks.
    pub source: Option<PeerId>,
}

#[derive(Debug, Clone)]
pub struct OrphanPool {
    orphans: HashMap<BlockHash, OrphanBlock>,

    /// Missing parent -> orphans waiting for it, in arrival order.
    by_parent: HashMap<BlockHash, Vec<BlockHash>>,

    per_peer: HashMap<PeerId, usize>,

    capacity: usize,
    per_peer_quota: usize,
    expiry: Duration,
}

impl OrphanPool {
    pub fn new(capacity: usize, per_peer_quota: usize, expiry: Duration) -> Self {
        Self {
            orphans: HashMap::new(),
            by_parent: HashMap::new(),
            per_peer: HashMap::new(),
            capacity,
            per_peer_quota,
            expiry,
        }
    }

    /// Add an orphan block.
    ///
    /// Returns the orphan evicted to make room, if any. Fails with
    /// `OrphanPoolFull` when the source peer has used up its quota or the
    /// pool cannot hold any block at all.
    pub fn add(
        &mut self,
        block: Block,
        source: Option<PeerId>,
        now: Instant,
    ) -> Result<Option<OrphanBlock>, SyncError> {
        let hash = block.hash();
        if self.orphans.contains_key(&hash) {
            return Ok(None);
        }

        if self.capacity == 0 {
            return Err(SyncError::OrphanPoolFull { hash });
        }
        if let Some(peer) = &source {
            if self.count_for(peer) >= self.per_peer_quota {
                return Err(SyncError::OrphanPoolFull { hash });
            }
        }

        let mut evicted = None;
        if self.orphans.len() >= self.capacity {
            evicted = self.oldest().and_then(|oldest| self.remove(&oldest));
            if let Some(orphan) = &evicted {
                debug!(hash = %orphan.hash.short(), "Evicted oldest orphan block");
            }
        }

        let parent_hash = block.parent_hash();
        self.by_parent.entry(parent_hash).or_default().push(hash);
        if let Some(peer) = source {
            *self.per_peer.entry(peer).or_default() += 1;
        }
        self.orphans.insert(
            hash,
            OrphanBlock {
                block,
                hash,
                parent_hash,
                received_at: now,
                source,
            },
        );

        Ok(evicted)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.orphans.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&OrphanBlock> {
        self.orphans.get(hash)
    }

    /// Remove an orphan, keeping the parent index and peer counts in step.
    pub fn remove(&mut self, hash: &BlockHash) -> Option<OrphanBlock> {
        let orphan = self.orphans.remove(hash)?;

        if let Some(children) = self.by_parent.get_mut(&orphan.parent_hash) {
            children.retain(|child| child != hash);
            if children.is_empty() {
                self.by_parent.remove(&orphan.parent_hash);
            }
        }

        if let Some(peer) = &orphan.source {
            if let Some(count) = self.per_peer.get_mut(peer) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.per_peer.remove(peer);
                }
            }
        }

        Some(orphan)
    }

    /// Remove and return every orphan waiting on `parent`, in arrival order.
    pub fn take_children(&mut self, parent: &BlockHash) -> Vec<OrphanBlock> {
        let children = self.by_parent.get(parent).cloned().unwrap_or_default();
        children
            .iter()
            .filter_map(|child| self.remove(child))
            .collect()
    }

    /// Walk up the orphan chain from `hash` to the earliest orphan whose
    /// parent is not in the pool.
    pub fn orphan_root(&self, hash: &BlockHash) -> BlockHash {
        let mut root = *hash;
        let mut steps = 0;
        while let Some(orphan) = self.orphans.get(&root) {
            if !self.orphans.contains_key(&orphan.parent_hash) || steps > self.orphans.len() {
                break;
            }
            root = orphan.parent_hash;
            steps += 1;
        }
        root
    }

    /// Drop orphans older than the expiry.
    pub fn expire(&mut self, now: Instant) -> Vec<OrphanBlock> {
        let expired: Vec<BlockHash> = self
            .orphans
            .values()
            .filter(|orphan| now.saturating_duration_since(orphan.received_at) >= self.expiry)
            .map(|orphan| orphan.hash)
            .collect();

        expired.iter().filter_map(|hash| self.remove(hash)).collect()
    }

    pub fn count_for(&self, peer: &PeerId) -> usize {
        self.per_peer.get(peer).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    fn oldest(&self) -> Option<BlockHash> {
        self.orphans
            .values()
            .min_by_key(|orphan| orphan.received_at)
            .map(|orphan| orphan.hash)
    }
}
