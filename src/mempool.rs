//! In-memory transaction pool and fee tracker.

use std::collections::{HashMap, VecDeque};

use containers::{Block, BlockHash, Height, OutPoint, Transaction, TxDesc, TxHash};
use networking::types::{FeeEstimator, RejectKind, TransactionPool, TxRejection};
use parking_lot::Mutex;
use tracing::{debug, info};

#[derive(Debug)]
struct PoolEntry {
    desc: TxDesc,
}

#[derive(Debug, Default)]
struct PoolState {
    pool: HashMap<TxHash, PoolEntry>,
    /// Outpoint -> pool transaction spending it.
    spent: HashMap<OutPoint, TxHash>,
    /// Height of the chain the pool was last reconciled against.
    height: Height,
}

impl PoolState {
    fn insert(&mut self, tx: Transaction) -> Result<TxDesc, TxRejection> {
        let hash = tx.hash();
        if self.pool.contains_key(&hash) {
            return Err(TxRejection::new(RejectKind::Duplicate, "already in pool"));
        }
        if tx.is_coinbase() {
            return Err(TxRejection::new(RejectKind::Invalid, "coinbase outside a block"));
        }
        if tx.inputs.is_empty() || tx.outputs.is_empty() {
            return Err(TxRejection::new(RejectKind::ProtocolViolation, "transaction without inputs or outputs"));
        }
        if let Some(conflict) = tx.spends().find_map(|outpoint| self.spent.get(outpoint)) {
            return Err(TxRejection::new(
                RejectKind::Policy,
                format!("conflicts with pool transaction {}", conflict.short()),
            ));
        }

        for outpoint in tx.spends() {
            self.spent.insert(*outpoint, hash);
        }
        // Input values are unknown to the pool.
        let desc = TxDesc {
            tx,
            height: self.height,
            fee: 0,
        };
        self.pool.insert(hash, PoolEntry { desc: desc.clone() });
        Ok(desc)
    }

    fn remove(&mut self, hash: &TxHash) -> Option<PoolEntry> {
        let entry = self.pool.remove(hash)?;
        for outpoint in entry.desc.tx.spends() {
            if self.spent.get(outpoint) == Some(hash) {
                self.spent.remove(outpoint);
            }
        }
        Some(entry)
    }

    /// Drop the transaction and any pool transaction spending the same outputs.
    fn evict_confirmed(&mut self, tx: &Transaction) -> usize {
        let mut evicted = usize::from(self.remove(&tx.hash()).is_some());
        for outpoint in tx.spends() {
            if let Some(conflict) = self.spent.get(outpoint).copied() {
                if self.remove(&conflict).is_some() {
                    evicted += 1;
                }
            }
        }
        evicted
    }
}

/// Transaction pool keyed by transaction hash.
///
/// Script and input-value validation belong to the consensus engine; the
/// pool only enforces uniqueness and double-spend freedom among its entries.
#[derive(Default)]
pub struct InMemoryPool {
    state: Mutex<PoolState>,
}

impl InMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionPool for InMemoryPool {
    fn submit_tx(&self, tx: Transaction) -> Result<Vec<TxDesc>, TxRejection> {
        let mut state = self.state.lock();
        let desc = state.insert(tx)?;
        info!(tx = %desc.hash().short(), pool_size = state.pool.len(), "Transaction added to mempool");
        Ok(vec![desc])
    }

    fn reconcile_after_reorg(&self, disconnected: &[Block], connected: &[Block]) {
        let mut state = self.state.lock();
        state.height = Height(state.height.0.saturating_sub(disconnected.len() as u64));

        let mut readmitted = 0usize;
        for block in disconnected {
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                if state.insert(tx.clone()).is_ok() {
                    readmitted += 1;
                }
            }
        }

        let mut evicted = 0usize;
        for block in connected {
            state.height = Height(state.height.0 + 1);
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                evicted += state.evict_confirmed(tx);
            }
        }

        debug!(
            readmitted,
            evicted,
            height = state.height.0,
            pool_size = state.pool.len(),
            "Mempool reconciled with chain"
        );
    }

    fn have_transaction(&self, hash: &TxHash) -> bool {
        self.state.lock().pool.contains_key(hash)
    }
}

/// Number of recent blocks the fee tracker remembers.
pub const FEE_HISTORY_BLOCKS: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockFees {
    hash: BlockHash,
    tx_count: usize,
}

/// Rolling per-block transaction counts, newest last.
#[derive(Default)]
pub struct FeeTracker {
    blocks: Mutex<VecDeque<BlockFees>>,
}

impl FeeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Average non-coinbase transactions per tracked block.
    pub fn average_tx_count(&self) -> f64 {
        let blocks = self.blocks.lock();
        if blocks.is_empty() {
            return 0.0;
        }
        blocks.iter().map(|entry| entry.tx_count).sum::<usize>() as f64 / blocks.len() as f64
    }

    pub fn tracked_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl FeeEstimator for FeeTracker {
    fn register_block(&self, block: &Block) -> Result<(), String> {
        let hash = block.hash();
        let mut blocks = self.blocks.lock();
        if blocks.iter().any(|entry| entry.hash == hash) {
            return Err(format!("block {} already registered", hash.short()));
        }
        if blocks.len() == FEE_HISTORY_BLOCKS {
            blocks.pop_front();
        }
        blocks.push_back(BlockFees {
            hash,
            tx_count: block.transactions.iter().filter(|tx| !tx.is_coinbase()).count(),
        });
        Ok(())
    }

    /// Only the most recently registered block can be rolled back.
    fn rollback(&self, hash: &BlockHash) -> Result<(), String> {
        let mut blocks = self.blocks.lock();
        match blocks.back() {
            Some(last) if last.hash == *hash => {
                blocks.pop_back();
                Ok(())
            }
            _ => Err(format!("block {} is not the last registered block", hash.short())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use containers::{BlockHeader, Bytes32, TxIn, TxOut};
    use pretty_assertions::assert_eq;

    fn spend(txid: u8, index: u32, value: u64) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint {
                    txid: Bytes32::repeat_byte(txid),
                    index,
                },
                signature_script: vec![0x51],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value,
                script_pubkey: vec![0x76],
            }],
            lock_time: 0,
        }
    }

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                previous_output: OutPoint {
                    txid: Bytes32::ZERO,
                    index: u32::MAX,
                },
                signature_script: vec![tag],
                sequence: u32::MAX,
            }],
            outputs: vec![TxOut {
                value: 50,
                script_pubkey: vec![tag],
            }],
            lock_time: 0,
        }
    }

    fn block(tag: u8, txs: Vec<Transaction>) -> Block {
        let mut transactions = vec![coinbase(tag)];
        transactions.extend(txs);
        Block::new(
            BlockHeader {
                version: 1,
                prev_block: Bytes32::repeat_byte(tag),
                nonce: tag as u32,
                ..Default::default()
            },
            transactions,
        )
    }

    #[test]
    fn test_duplicate_and_conflicting_spends_rejected() {
        let pool = InMemoryPool::new();
        let tx = spend(1, 0, 10);

        let accepted = pool.submit_tx(tx.clone()).unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].hash(), tx.hash());
        assert!(pool.have_transaction(&tx.hash()));

        assert_eq!(pool.submit_tx(tx).unwrap_err().kind, RejectKind::Duplicate);
        assert_eq!(pool.submit_tx(spend(1, 0, 9)).unwrap_err().kind, RejectKind::Policy);
        assert_eq!(pool.submit_tx(coinbase(1)).unwrap_err().kind, RejectKind::Invalid);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_connected_block_evicts_confirmed_and_conflicts() {
        let pool = InMemoryPool::new();
        let confirmed = spend(1, 0, 10);
        let conflicted = spend(2, 0, 10);
        let untouched = spend(3, 0, 10);
        for tx in [&confirmed, &conflicted, &untouched] {
            pool.submit_tx(tx.clone()).unwrap();
        }

        pool.reconcile_after_reorg(&[], &[block(1, vec![confirmed.clone(), spend(2, 0, 7)])]);

        assert!(!pool.have_transaction(&confirmed.hash()));
        assert!(!pool.have_transaction(&conflicted.hash()));
        assert!(pool.have_transaction(&untouched.hash()));
    }

    #[test]
    fn test_disconnected_block_transactions_readmitted() {
        let pool = InMemoryPool::new();
        let orphaned = spend(4, 1, 10);
        let old = block(1, vec![orphaned.clone()]);
        pool.reconcile_after_reorg(&[], &[old.clone()]);
        assert!(pool.is_empty());

        pool.reconcile_after_reorg(&[old], &[block(2, vec![])]);

        assert!(pool.have_transaction(&orphaned.hash()));
        assert_eq!(pool.len(), 1);
        let desc = pool.submit_tx(spend(5, 0, 1)).unwrap();
        assert_eq!(desc[0].height, Height(1));
    }

    #[test]
    fn test_fee_tracker_rolls_back_only_last_block() {
        let tracker = FeeTracker::new();
        let first = block(1, vec![spend(1, 0, 1), spend(2, 0, 1)]);
        let second = block(2, vec![]);

        tracker.register_block(&first).unwrap();
        tracker.register_block(&second).unwrap();
        assert!(tracker.register_block(&second).is_err());
        assert_eq!(tracker.average_tx_count(), 1.0);

        assert!(tracker.rollback(&first.hash()).is_err());
        tracker.rollback(&second.hash()).unwrap();
        tracker.rollback(&first.hash()).unwrap();
        assert_eq!(tracker.tracked_blocks(), 0);
    }

    #[test]
    fn test_fee_tracker_is_bounded() {
        let tracker = FeeTracker::new();
        for tag in 0..(FEE_HISTORY_BLOCKS as u8 + 5) {
            tracker.register_block(&block(tag, vec![])).unwrap();
        }
        assert_eq!(tracker.tracked_blocks(), FEE_HISTORY_BLOCKS);
    }
}
