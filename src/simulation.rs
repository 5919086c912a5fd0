//! Simulated peer network driving the sync service end to end.
//!
//! A remote chain is built up front and served by in-process peers. Each
//! peer answers the requests routed to it from the sync manager's outbound
//! channel, optionally ignoring block requests to exercise stall handling.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use chain::ChainParams;
use containers::{
    Block, BlockHeader, Height, InvVect, OutPoint, PeerStatus, Transaction, TxHash, TxIn, TxOut,
    types::double_sha256,
};
use fork_choice::Store;
use libp2p_identity::PeerId;
use networking::{
    sync::{MAX_HEADERS_PER_REQUEST, SyncError, SyncHandle, SyncStats},
    types::{OutboundSyncRequest, P2pRequestSource, PeerInfo},
};
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle, time::sleep};
use tracing::{debug, info, trace, warn};

/// Every third remote block confirms a transaction.
const CONFIRMING_BLOCK_INTERVAL: u64 = 3;

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub peers: usize,
    pub chain_length: u64,
    /// Peers that never answer block requests.
    pub stalling_peers: usize,
    /// Loose transactions announced after connecting, each by two peers.
    pub transactions: usize,
    pub latency: Duration,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            peers: 4,
            chain_length: 500,
            stalling_peers: 1,
            transactions: 32,
            latency: Duration::from_millis(20),
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub synced: bool,
    pub elapsed: Duration,
    pub stats: SyncStats,
}

type Routes = Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<OutboundSyncRequest>>>>;

fn coinbase(height: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                txid: TxHash::ZERO,
                index: u32::MAX,
            },
            signature_script: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 50,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Spend of a made-up funding output; `label` keeps chain and pool
/// transactions from conflicting.
pub fn funded_spend(label: &str, index: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            previous_output: OutPoint {
                txid: double_sha256(format!("{label}-{index}").as_bytes()),
                index: 0,
            },
            signature_script: vec![0x51],
            sequence: u32::MAX,
        }],
        outputs: vec![TxOut {
            value: 1_000 + index,
            script_pubkey: vec![0x76, 0xa9],
        }],
        lock_time: 0,
    }
}

/// Build a main chain of `length` blocks on top of the network's genesis.
pub fn build_remote_chain(params: &ChainParams, length: u64) -> Result<Store> {
    let mut store = fork_choice::get_forkchoice_store(params.clone());
    let mut parent = params.genesis_block();

    for height in 1..=length {
        let mut transactions = vec![coinbase(height)];
        if height % CONFIRMING_BLOCK_INTERVAL == 0 {
            transactions.push(funded_spend("chain", height));
        }
        let block = Block::new(
            BlockHeader {
                version: 1,
                prev_block: parent.hash(),
                timestamp: parent.header.timestamp + 600,
                bits: parent.header.bits,
                nonce: height as u32,
                ..Default::default()
            },
            transactions,
        );
        fork_choice::on_block(&mut store, block.clone())
            .map_err(|err| anyhow!(err))
            .with_context(|| format!("remote block at height {height} was rejected"))?;
        parent = block;
    }

    info!(tip = %store.head, "Built remote chain");
    Ok(store)
}

struct SimulatedPeer {
    peer_id: PeerId,
    height: Height,
    stalls: bool,
    chain: Arc<Store>,
    txs: HashMap<TxHash, Transaction>,
    latency: Duration,
    handle: SyncHandle,
}

impl SimulatedPeer {
    async fn run(self, mut requests: mpsc::UnboundedReceiver<OutboundSyncRequest>) {
        let info = PeerInfo::new(self.peer_id, PeerStatus::full_node(self.height));
        if let Err(err) = self.handle.peer_connected(info).await {
            warn!(peer = %self.peer_id, %err, "Simulated peer failed to connect");
            return;
        }

        if !self.txs.is_empty() {
            let inventory = self.txs.keys().copied().map(InvVect::tx).collect();
            if let Err(err) = self.handle.inventory_received(self.peer_id, inventory).await {
                debug!(peer = %self.peer_id, %err, "Transaction announcement not applied");
            }
        }

        while let Some(request) = requests.recv().await {
            sleep(self.latency).await;
            match self.answer(request).await {
                Ok(()) => {}
                Err(SyncError::ManagerStopped) => break,
                Err(err) => debug!(peer = %self.peer_id, %err, "Response not applied"),
            }
        }

        debug!(peer = %self.peer_id, "Simulated peer exiting");
    }

    async fn answer(&self, request: OutboundSyncRequest) -> Result<(), SyncError> {
        match request {
            OutboundSyncRequest::GetHeaders { locator, stop, .. } => {
                let headers = fork_choice::locate_main_chain(&self.chain, &locator, &stop, MAX_HEADERS_PER_REQUEST)
                    .into_iter()
                    .filter(|hash| self.chain.header_height(hash).is_some_and(|height| height <= self.height))
                    .filter_map(|hash| self.chain.get_block(&hash).map(|block| block.header.clone()))
                    .collect::<Vec<_>>();
                trace!(peer = %self.peer_id, count = headers.len(), "Serving headers");
                self.handle.headers_received(self.peer_id, headers).await
            }
            OutboundSyncRequest::GetBlocks { hashes, .. } => {
                if self.stalls {
                    trace!(peer = %self.peer_id, count = hashes.len(), "Ignoring block request");
                    return Ok(());
                }
                let mut missing = Vec::new();
                for hash in hashes {
                    let served = self
                        .chain
                        .header_height(&hash)
                        .is_some_and(|height| height <= self.height);
                    match self.chain.get_block(&hash) {
                        Some(block) if served => {
                            match self.handle.block_received(self.peer_id, block.clone()).await {
                                Err(SyncError::ManagerStopped) => return Err(SyncError::ManagerStopped),
                                Err(err) => debug!(peer = %self.peer_id, %err, "Block not applied"),
                                Ok(()) => {}
                            }
                        }
                        _ => missing.push(InvVect::block(hash)),
                    }
                }
                if missing.is_empty() {
                    return Ok(());
                }
                self.handle.not_found(self.peer_id, missing).await
            }
            OutboundSyncRequest::GetTransactions { hashes, .. } => {
                let mut missing = Vec::new();
                for hash in hashes {
                    match self.txs.get(&hash) {
                        Some(tx) => self.handle.transaction_received(self.peer_id, tx.clone()).await?,
                        None => missing.push(InvVect::tx(hash)),
                    }
                }
                if missing.is_empty() {
                    return Ok(());
                }
                self.handle.not_found(self.peer_id, missing).await
            }
            // Handled by the router.
            OutboundSyncRequest::Disconnect { .. } => Ok(()),
        }
    }
}

/// Forward outbound requests to the addressed peer. A disconnect drops the
/// route, which ends that peer's task.
async fn route_requests<S>(mut source: S, routes: Routes)
where
    S: P2pRequestSource<OutboundSyncRequest>,
{
    while let Some(request) = source.recv().await {
        let peer_id = request.peer_id();
        if let OutboundSyncRequest::Disconnect { reason, .. } = &request {
            info!(peer = %peer_id, reason = reason.as_str(), "Dropping simulated peer");
            routes.lock().remove(&peer_id);
            continue;
        }

        let mut table = routes.lock();
        let delivered = table
            .get(&peer_id)
            .is_some_and(|route| route.send(request).is_ok());
        if !delivered {
            trace!(peer = %peer_id, "No route for outbound request");
            table.remove(&peer_id);
        }
    }

    debug!("Request router stopped");
}

/// Spawn the router and peers, then wait until the local chain reaches the
/// remote tip, is current and has no transaction work left.
pub async fn run<S>(
    config: SimulationConfig,
    params: &ChainParams,
    handle: SyncHandle,
    requests: S,
) -> Result<SimulationReport>
where
    S: P2pRequestSource<OutboundSyncRequest> + 'static,
{
    let remote = Arc::new(build_remote_chain(params, config.chain_length)?);
    let target = remote.head.height;
    let pool_txs: Vec<Transaction> = (0..config.transactions as u64)
        .map(|index| funded_spend("pool", index))
        .collect();

    let routes: Routes = Arc::default();
    let mut peers = Vec::with_capacity(config.peers);
    for index in 0..config.peers {
        let peer_id = PeerId::random();
        let (sender, receiver) = mpsc::unbounded_channel();
        routes.lock().insert(peer_id, sender);

        let txs = pool_txs
            .iter()
            .enumerate()
            .filter(|(j, _)| j % config.peers == index || (j + 1) % config.peers == index)
            .map(|(_, tx)| (tx.hash(), tx.clone()))
            .collect();
        let peer = SimulatedPeer {
            peer_id,
            // Later peers lag a few blocks behind.
            height: Height(target.0.saturating_sub((index % 4) as u64)),
            stalls: index < config.stalling_peers,
            chain: remote.clone(),
            txs,
            latency: config.latency,
            handle: handle.clone(),
        };
        info!(peer = %peer_id, height = peer.height.0, stalls = peer.stalls, "Starting simulated peer");
        peers.push(tokio::spawn(peer.run(receiver)));
    }
    let router: JoinHandle<()> = tokio::spawn(route_requests(requests, routes));

    let started = Instant::now();
    let (synced, stats) = loop {
        sleep(config.poll_interval).await;
        let stats = handle.stats().await?;
        debug!(
            tip = %stats.chain_tip,
            best_known = %stats.best_known_header,
            blocks_in_flight = stats.blocks_in_flight,
            orphans = stats.orphan_blocks,
            peers = stats.peers,
            "Sync progress"
        );

        let done = stats.chain_tip.height >= target
            && stats.is_current
            && stats.txs_in_flight == 0
            && stats.queued_txs == 0;
        if done {
            break (true, stats);
        }
        if started.elapsed() >= config.timeout {
            warn!(tip = %stats.chain_tip, target = target.0, "Simulation timed out");
            break (false, stats);
        }
    };

    for peer in &peers {
        peer.abort();
    }
    drop(handle);
    if let Err(err) = router.await {
        debug!(%err, "Router task ended abnormally");
    }

    Ok(SimulationReport {
        synced,
        elapsed: started.elapsed(),
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{local_chain::LocalChain, mempool::InMemoryPool, notifier::LoggingNotifier};
    use networking::sync::{SyncConfig, SyncParams, SyncService};
    use networking::types::TransactionPool;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_remote_chain_confirms_every_third_block() {
        let params = ChainParams::regtest();
        let store = build_remote_chain(&params, 9).unwrap();

        assert_eq!(store.head.height, Height(9));
        let confirming = store
            .main_chain
            .iter()
            .filter_map(|hash| store.get_block(hash))
            .filter(|block| block.transactions.len() == 2)
            .count();
        assert_eq!(confirming, 3);
    }

    #[tokio::test]
    async fn test_simulation_syncs_to_remote_tip() {
        let params = ChainParams::regtest();
        let chain = Arc::new(LocalChain::new(params.clone()));
        let pool = Arc::new(InMemoryPool::new());
        let (sender, receiver) = mpsc::unbounded_channel();
        let config = SyncConfig::new(
            params.clone(),
            chain.clone(),
            pool.clone(),
            Arc::new(LoggingNotifier::new()),
            Arc::new(sender),
        )
        .with_params(SyncParams {
            tick_interval_secs: 1,
            ..SyncParams::default()
        });
        let (handle, service) = SyncService::spawn(config);

        let simulation = SimulationConfig {
            peers: 3,
            chain_length: 40,
            stalling_peers: 0,
            transactions: 6,
            latency: Duration::from_millis(1),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        };
        let report = run(simulation, &params, handle, receiver).await.unwrap();
        service.await.unwrap();

        assert!(report.synced);
        assert_eq!(report.stats.chain_tip.height, Height(40));
        assert_eq!(chain.block_count(), 41);
        assert_eq!(pool.len(), 6);
        assert!(pool.have_transaction(&funded_spend("pool", 0).hash()));
    }
}
