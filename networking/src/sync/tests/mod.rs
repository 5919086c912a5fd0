//! Shared fixtures for sync tests: a chain validator backed by the
//! fork-choice block index, a scriptable transaction pool and a notifier that
//! records what it was told.

mod scheduler_tests;
mod service_tests;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use chain::ChainParams;
use containers::*;
use fork_choice::Store;
use libp2p_identity::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::sync::{SyncConfig, SyncManager, SyncParams};
use crate::types::{
    BlockAcceptance, ChainValidator, FeeEstimator, OutboundSyncRequest, PeerInfo, PeerNotifier,
    RejectKind, RelayData, TransactionPool, TxRejection,
};

pub struct TestChain {
    store: Mutex<Store>,
}

impl TestChain {
    pub fn new(params: ChainParams) -> Self {
        Self {
            store: Mutex::new(fork_choice::get_forkchoice_store(params)),
        }
    }
}

impl ChainValidator for TestChain {
    fn submit_block(&self, block: &Block) -> Result<BlockAcceptance, String> {
        let outcome = fork_choice::on_block(&mut self.store.lock(), block.clone())?;
        Ok(BlockAcceptance {
            block: outcome.block,
            is_new_tip: outcome.is_new_tip,
            reorg: outcome.reorg,
        })
    }

    fn submit_headers(&self, headers: &[BlockHeader]) -> Result<(), String> {
        fork_choice::on_headers(&mut self.store.lock(), headers)
    }

    fn best_tip(&self) -> ChainTip {
        self.store.lock().head
    }

    fn have_block(&self, hash: &BlockHash) -> bool {
        self.store.lock().has_block(hash)
    }

    fn header_height(&self, hash: &BlockHash) -> Option<Height> {
        self.store.lock().header_height(hash)
    }

    fn block_locator(&self, from: Option<&BlockHash>) -> Vec<BlockHash> {
        let store = self.store.lock();
        let from = from.copied().unwrap_or(store.head.hash);
        fork_choice::block_locator(&store, &from)
    }
}

#[derive(Default)]
pub struct MockTxPool {
    pub pool: Mutex<HashSet<TxHash>>,
    pub rejections: Mutex<HashMap<TxHash, TxRejection>>,
    /// `(disconnected, connected)` block counts per reconcile call.
    pub reconciles: Mutex<Vec<(usize, usize)>>,
}

impl MockTxPool {
    pub fn reject(&self, tx: &Transaction, kind: RejectKind) {
        self.rejections
            .lock()
            .insert(tx.hash(), TxRejection::new(kind, "rejected by test"));
    }
}

impl TransactionPool for MockTxPool {
    fn submit_tx(&self, tx: Transaction) -> Result<Vec<TxDesc>, TxRejection> {
        let hash = tx.hash();
        if let Some(rejection) = self.rejections.lock().get(&hash) {
            return Err(rejection.clone());
        }
        self.pool.lock().insert(hash);
        Ok(vec![TxDesc {
            tx,
            height: Height::GENESIS,
            fee: 0,
        }])
    }

    fn reconcile_after_reorg(&self, disconnected: &[Block], connected: &[Block]) {
        self.reconciles
            .lock()
            .push((disconnected.len(), connected.len()));
    }

    fn have_transaction(&self, hash: &TxHash) -> bool {
        self.pool.lock().contains(hash)
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub announced: Mutex<Vec<(Vec<TxHash>, Option<PeerId>)>>,
    pub heights: Mutex<Vec<(BlockHash, Height, Option<PeerId>)>>,
    pub relayed: Mutex<Vec<InvVect>>,
    pub confirmed: Mutex<Vec<TxHash>>,
}

impl PeerNotifier for RecordingNotifier {
    fn announce_new_transactions(&self, txs: &[TxDesc], source: Option<PeerId>) {
        self.announced
            .lock()
            .push((txs.iter().map(TxDesc::hash).collect(), source));
    }

    fn update_peer_heights(&self, hash: &BlockHash, height: Height, source: Option<PeerId>) {
        self.heights.lock().push((*hash, height, source));
    }

    fn relay_inventory(&self, inv: InvVect, _data: RelayData) {
        self.relayed.lock().push(inv);
    }

    fn transaction_confirmed(&self, tx: &Transaction) {
        self.confirmed.lock().push(tx.hash());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeEvent {
    Register(BlockHash),
    Rollback(BlockHash),
}

#[derive(Default)]
pub struct RecordingFeeEstimator {
    pub events: Mutex<Vec<FeeEvent>>,
}

impl FeeEstimator for RecordingFeeEstimator {
    fn register_block(&self, block: &Block) -> Result<(), String> {
        self.events.lock().push(FeeEvent::Register(block.hash()));
        Ok(())
    }

    fn rollback(&self, hash: &BlockHash) -> Result<(), String> {
        self.events.lock().push(FeeEvent::Rollback(*hash));
        Ok(())
    }
}

/// A sync manager wired to in-memory collaborators, with the outbound request
/// channel kept for inspection.
pub struct Harness {
    pub manager: SyncManager,
    pub chain: Arc<TestChain>,
    pub tx_pool: Arc<MockTxPool>,
    pub notifier: Arc<RecordingNotifier>,
    pub fees: Arc<RecordingFeeEstimator>,
    pub requests: mpsc::UnboundedReceiver<OutboundSyncRequest>,
    pub genesis: Block,
    pub t0: Instant,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ChainParams::regtest(), SyncParams::default())
    }

    pub fn with_params(params: SyncParams) -> Self {
        Self::with(ChainParams::regtest(), params)
    }

    pub fn with(chain_params: ChainParams, params: SyncParams) -> Self {
        let config = test_config(chain_params.clone(), params);
        Self {
            manager: SyncManager::new(config.config),
            chain: config.chain,
            tx_pool: config.tx_pool,
            notifier: config.notifier,
            fees: config.fees,
            requests: config.requests,
            genesis: chain_params.genesis_block(),
            t0: Instant::now(),
        }
    }

    pub fn at(&self, secs: u64) -> Instant {
        self.t0 + Duration::from_secs(secs)
    }

    /// Connect a full node advertising `height` at time zero.
    pub fn connect(&mut self, height: u64) -> PeerId {
        self.connect_with(PeerStatus::full_node(Height(height)))
    }

    pub fn connect_with(&mut self, status: PeerStatus) -> PeerId {
        let peer_id = PeerId::random();
        self.manager
            .peer_connected(PeerInfo::new(peer_id, status), self.t0)
            .unwrap();
        peer_id
    }

    /// Requests sent since the last drain.
    pub fn drain(&mut self) -> Vec<OutboundSyncRequest> {
        let mut sent = Vec::new();
        while let Ok(request) = self.requests.try_recv() {
            sent.push(request);
        }
        sent
    }
}

pub struct TestConfig {
    pub config: SyncConfig,
    pub chain: Arc<TestChain>,
    pub tx_pool: Arc<MockTxPool>,
    pub notifier: Arc<RecordingNotifier>,
    pub fees: Arc<RecordingFeeEstimator>,
    pub requests: mpsc::UnboundedReceiver<OutboundSyncRequest>,
}

pub fn test_config(chain_params: ChainParams, params: SyncParams) -> TestConfig {
    let chain = Arc::new(TestChain::new(chain_params.clone()));
    let tx_pool = Arc::new(MockTxPool::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let fees = Arc::new(RecordingFeeEstimator::default());
    let (network, requests) = mpsc::unbounded_channel();
    let config = SyncConfig::new(
        chain_params,
        chain.clone(),
        tx_pool.clone(),
        notifier.clone(),
        Arc::new(network),
    )
    .with_params(params)
    .with_fee_estimator(fees.clone());

    TestConfig {
        config,
        chain,
        tx_pool,
        notifier,
        fees,
        requests,
    }
}

pub fn coinbase(tag: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                txid: Bytes32::ZERO,
                index: u32::MAX,
            },
            signature_script: tag.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Non-coinbase transaction spending a made-up output.
pub fn spend(tag: u8) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                txid: Bytes32::repeat_byte(tag),
                index: 0,
            },
            signature_script: vec![tag],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 10,
            script_pubkey: vec![0x76, tag],
        }],
        lock_time: 0,
    }
}

pub fn child_with(parent: &Block, tag: u64, mut txs: Vec<Transaction>) -> Block {
    txs.insert(0, coinbase(tag));
    Block::new(
        BlockHeader {
            version: 1,
            prev_block: parent.hash(),
            timestamp: parent.header.timestamp + 1,
            bits: parent.header.bits,
            nonce: tag as u32,
            ..Default::default()
        },
        txs,
    )
}

pub fn child_of(parent: &Block, tag: u64) -> Block {
    child_with(parent, tag, Vec::new())
}

/// `len` blocks on top of `parent`; distinct tags give distinct branches.
pub fn extend(parent: &Block, len: usize, tag: u64) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len);
    let mut tip = parent.clone();
    for i in 0..len {
        let block = child_of(&tip, tag * 10_000 + i as u64);
        tip = block.clone();
        blocks.push(block);
    }
    blocks
}

pub fn headers(blocks: &[Block]) -> Vec<BlockHeader> {
    blocks.iter().map(|block| block.header.clone()).collect()
}

pub fn hashes(blocks: &[Block]) -> Vec<BlockHash> {
    blocks.iter().map(Block::hash).collect()
}

/// Every block and transaction hash is outstanding at no more than one peer.
pub fn assert_no_duplicate_fan_out(manager: &SyncManager) {
    let mut seen = HashSet::new();
    for peer in manager.peers().get_all_peers() {
        for hash in peer.requested_blocks.keys().chain(peer.requested_txs.keys()) {
            assert!(seen.insert(*hash), "{} requested from two peers", hash.short());
        }
    }
}

/// At most one Active peer, and it is the sync peer.
pub fn assert_single_active(manager: &SyncManager) {
    let peers = manager.peers();
    assert!(peers.active_peers() <= 1);
    if peers.active_peers() == 1 {
        let active = peers
            .get_all_peers()
            .into_iter()
            .find(|peer| peer.status == crate::sync::PeerSyncStatus::Active)
            .map(|peer| peer.peer_id);
        assert_eq!(active, manager.sync_peer_id());
    }
}
