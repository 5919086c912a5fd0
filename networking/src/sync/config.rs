/// Sync manager configuration.
///
/// Operational parameters for synchronization: request caps, timeouts,
/// pool bounds and penalties, plus the collaborators injected at construction.
use std::{sync::Arc, time::Duration};

use chain::ChainParams;
use metrics::SharedMetrics;
use serde::Deserialize;

use crate::types::{
    ChainValidator, FeeEstimator, OutboundSyncRequest, P2pRequestSink, PeerNotifier,
    TransactionPool,
};

/// Maximum headers a peer may return for one GetHeaders request. A shorter
/// batch from the sync peer ends headers-first mode.
pub const MAX_HEADERS_PER_REQUEST: usize = 2000;

/// Maximum outstanding block requests to a single peer.
pub const MAX_BLOCKS_IN_FLIGHT_PER_PEER: usize = 16;

/// Maximum outstanding block requests across all peers.
pub const MAX_BLOCKS_IN_FLIGHT: usize = 128;

/// Maximum outstanding transaction requests to a single peer.
pub const MAX_TXS_IN_FLIGHT_PER_PEER: usize = 256;

/// Requests unanswered for this long mark the peer as stalled.
pub const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;

pub const MAX_ORPHAN_BLOCKS: usize = 100;

/// Share of the orphan pool a single peer may occupy.
pub const MAX_ORPHANS_PER_PEER: usize = 32;

pub const ORPHAN_EXPIRY_SECS: u64 = 60 * 60;

/// Size of the recently-rejected transaction cache.
pub const MAX_REJECTED_TXNS: usize = 1000;

/// Added to a peer's stall score for every tick it spends stalled.
pub const STALL_PENALTY: u32 = 10;

/// Added to a peer's stall score for each block the validator rejects.
pub const INVALID_BLOCK_PENALTY: u32 = 50;

/// Stall score at which a peer is disconnected.
pub const BAN_THRESHOLD: u32 = 100;

/// Consecutive stalled ticks after which the sync peer is replaced.
pub const MAX_SYNC_PEER_STALLS: u32 = 3;

/// Interval between sync ticks (in seconds).
pub const SYNC_TICK_INTERVAL_SECS: u64 = 1;

/// Tunables of the sync manager. Every field is optional in serialized form
/// and falls back to the constant of the same name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncParams {
    pub stall_timeout_secs: u64,
    pub max_blocks_in_flight_per_peer: usize,
    pub max_blocks_in_flight: usize,
    pub max_txs_in_flight_per_peer: usize,
    pub max_orphan_blocks: usize,
    pub max_orphans_per_peer: usize,
    pub orphan_expiry_secs: u64,
    pub max_rejected_txs: usize,
    pub stall_penalty: u32,
    pub invalid_block_penalty: u32,
    pub ban_threshold: u32,
    pub max_sync_peer_stalls: u32,
    pub tick_interval_secs: u64,
}

impl Default for SyncParams {
    fn default() -> Self {
        Self {
            stall_timeout_secs: DEFAULT_STALL_TIMEOUT_SECS,
            max_blocks_in_flight_per_peer: MAX_BLOCKS_IN_FLIGHT_PER_PEER,
            max_blocks_in_flight: MAX_BLOCKS_IN_FLIGHT,
            max_txs_in_flight_per_peer: MAX_TXS_IN_FLIGHT_PER_PEER,
            max_orphan_blocks: MAX_ORPHAN_BLOCKS,
            max_orphans_per_peer: MAX_ORPHANS_PER_PEER,
            orphan_expiry_secs: ORPHAN_EXPIRY_SECS,
            max_rejected_txs: MAX_REJECTED_TXNS,
            stall_penalty: STALL_PENALTY,
            invalid_block_penalty: INVALID_BLOCK_PENALTY,
            ban_threshold: BAN_THRESHOLD,
            max_sync_peer_stalls: MAX_SYNC_PEER_STALLS,
            tick_interval_secs: SYNC_TICK_INTERVAL_SECS,
        }
    }
}

impl SyncParams {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn orphan_expiry(&self) -> Duration {
        Duration::from_secs(self.orphan_expiry_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// Everything the sync manager needs from the rest of the node.
#[derive(Clone)]
pub struct SyncConfig {
    pub chain_params: ChainParams,
    pub chain: Arc<dyn ChainValidator>,
    pub tx_pool: Arc<dyn TransactionPool>,
    pub notifier: Arc<dyn PeerNotifier>,
    pub network: Arc<dyn P2pRequestSink<OutboundSyncRequest>>,
    pub fee_estimator: Option<Arc<dyn FeeEstimator>>,
    pub disable_checkpoints: bool,
    /// Sizing hint for the peer table; more peers are accepted with a warning.
    pub max_peers: usize,
    pub params: SyncParams,
    pub metrics: Option<SharedMetrics>,
}

impl SyncConfig {
    pub fn new(
        chain_params: ChainParams,
        chain: Arc<dyn ChainValidator>,
        tx_pool: Arc<dyn TransactionPool>,
        notifier: Arc<dyn PeerNotifier>,
        network: Arc<dyn P2pRequestSink<OutboundSyncRequest>>,
    ) -> Self {
        Self {
            chain_params,
            chain,
            tx_pool,
            notifier,
            network,
            fee_estimator: None,
            disable_checkpoints: false,
            max_peers: 125,
            params: SyncParams::default(),
            metrics: None,
        }
    }

    pub fn with_params(mut self, params: SyncParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_fee_estimator(mut self, fee_estimator: Arc<dyn FeeEstimator>) -> Self {
        self.fee_estimator = Some(fee_estimator);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_disable_checkpoints(mut self, disable_checkpoints: bool) -> Self {
        self.disable_checkpoints = disable_checkpoints;
        self
    }

    pub fn with_max_peers(mut self, max_peers: usize) -> Self {
        self.max_peers = max_peers;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_params_partial_yaml_uses_defaults() {
        let params: SyncParams = serde_yaml::from_str("stall_timeout_secs: 5\nmax_orphan_blocks: 8\n").unwrap();

        assert_eq!(params.stall_timeout(), Duration::from_secs(5));
        assert_eq!(params.max_orphan_blocks, 8);
        assert_eq!(params.max_blocks_in_flight_per_peer, MAX_BLOCKS_IN_FLIGHT_PER_PEER);
        assert_eq!(params.stall_penalty, STALL_PENALTY);
    }

    #[test]
    fn test_tick_interval_never_zero() {
        let params = SyncParams {
            tick_interval_secs: 0,
            ..SyncParams::default()
        };
        assert_eq!(params.tick_interval(), Duration::from_secs(1));
    }
}
