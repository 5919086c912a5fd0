pub mod server;

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    // Peers
    peers: IntGauge,
    peer_connection_events: IntCounterVec,
    peer_disconnection_events: IntCounterVec,
    peer_stalls: IntCounterVec,
    // Sync progress
    best_known_height: IntGauge,
    chain_tip_height: IntGauge,
    blocks_in_flight: IntGauge,
    txs_in_flight: IntGauge,
    orphan_blocks: IntGauge,
    blocks_processed: IntCounterVec,
    transactions_processed: IntCounterVec,
    block_processing_time: HistogramVec,
    // Reorgs
    reorgs: IntCounterVec,
    reorg_depth: HistogramVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let peers = IntGauge::with_opts(Opts::new("sync_peers_connected", "Number of peers known to the sync manager")).unwrap();
        registry.register(Box::new(peers.clone())).unwrap();

        let peer_connection_events = IntCounterVec::new(
            Opts::new("sync_peer_connection_events_total", "Total number of peer handshakes seen by the sync manager"),
            &["candidate"],
        ).unwrap();
        registry.register(Box::new(peer_connection_events.clone())).unwrap();

        let peer_disconnection_events = IntCounterVec::new(
            Opts::new("sync_peer_disconnection_events_total", "Total number of peer disconnections"),
            &["reason"],
        ).unwrap();
        registry.register(Box::new(peer_disconnection_events.clone())).unwrap();

        let peer_stalls = IntCounterVec::new(
            Opts::new("sync_peer_stalls_total", "Total number of ticks on which a peer was stalled"),
            &["role"],
        ).unwrap();
        registry.register(Box::new(peer_stalls.clone())).unwrap();

        let best_known_height = IntGauge::with_opts(Opts::new("sync_best_known_height", "Height of the best known header")).unwrap();
        registry.register(Box::new(best_known_height.clone())).unwrap();

        let chain_tip_height = IntGauge::with_opts(Opts::new("sync_chain_tip_height", "Height of the validated chain tip")).unwrap();
        registry.register(Box::new(chain_tip_height.clone())).unwrap();

        let blocks_in_flight = IntGauge::with_opts(Opts::new("sync_blocks_in_flight", "Block requests awaiting a response")).unwrap();
        registry.register(Box::new(blocks_in_flight.clone())).unwrap();

        let txs_in_flight = IntGauge::with_opts(Opts::new("sync_transactions_in_flight", "Transaction requests awaiting a response")).unwrap();
        registry.register(Box::new(txs_in_flight.clone())).unwrap();

        let orphan_blocks = IntGauge::with_opts(Opts::new("sync_orphan_blocks", "Blocks held in the orphan pool")).unwrap();
        registry.register(Box::new(orphan_blocks.clone())).unwrap();

        let blocks_processed = IntCounterVec::new(
            Opts::new("sync_blocks_processed_total", "Total number of blocks handled by the sync manager"),
            &["result"],
        ).unwrap();
        registry.register(Box::new(blocks_processed.clone())).unwrap();

        let transactions_processed = IntCounterVec::new(
            Opts::new("sync_transactions_processed_total", "Total number of transactions handled by the sync manager"),
            &["result"],
        ).unwrap();
        registry.register(Box::new(transactions_processed.clone())).unwrap();

        let block_processing_time = HistogramVec::new(
            HistogramOpts::new("sync_block_processing_time_seconds", "Time taken by the chain validator to process a block")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 1.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(block_processing_time.clone())).unwrap();

        let reorgs = IntCounterVec::new(
            Opts::new("sync_reorgs_total", "Total number of chain reorganizations"),
            &[],
        ).unwrap();
        registry.register(Box::new(reorgs.clone())).unwrap();

        let reorg_depth = HistogramVec::new(
            HistogramOpts::new("sync_reorg_depth", "Depth of chain reorganizations (in blocks)")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 20.0, 30.0, 50.0, 100.0]),
            &[],
        ).unwrap();
        registry.register(Box::new(reorg_depth.clone())).unwrap();

        Self {
            registry,
            peers,
            peer_connection_events,
            peer_disconnection_events,
            peer_stalls,
            best_known_height,
            chain_tip_height,
            blocks_in_flight,
            txs_in_flight,
            orphan_blocks,
            blocks_processed,
            transactions_processed,
            block_processing_time,
            reorgs,
            reorg_depth,
        }
    }

    pub fn gather(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::<u8>::new();
        let encoder = TextEncoder::new();
        encoder.encode(&metric_families, &mut buffer).expect("failed to encode metrics");
        String::from_utf8(buffer).expect("metrics not utf8")
    }

    // Peers
    pub fn set_peers(&self, v: i64) {
        self.peers.set(v);
    }

    pub fn inc_peer_connection(&self, candidate: bool) {
        let label = if candidate { "yes" } else { "no" };
        self.peer_connection_events.with_label_values(&[label]).inc();
    }

    pub fn inc_peer_disconnection(&self, reason: &str) {
        self.peer_disconnection_events.with_label_values(&[reason]).inc();
    }

    pub fn inc_peer_stall(&self, role: &str) {
        self.peer_stalls.with_label_values(&[role]).inc();
    }

    // Sync progress
    pub fn set_best_known_height(&self, v: i64) {
        self.best_known_height.set(v);
    }

    pub fn set_chain_tip_height(&self, v: i64) {
        self.chain_tip_height.set(v);
    }

    pub fn set_blocks_in_flight(&self, v: i64) {
        self.blocks_in_flight.set(v);
    }

    pub fn set_txs_in_flight(&self, v: i64) {
        self.txs_in_flight.set(v);
    }

    pub fn set_orphan_blocks(&self, v: i64) {
        self.orphan_blocks.set(v);
    }

    pub fn inc_blocks_processed(&self, result: &str) {
        self.blocks_processed.with_label_values(&[result]).inc();
    }

    pub fn inc_transactions_processed(&self, result: &str) {
        self.transactions_processed.with_label_values(&[result]).inc();
    }

    pub fn observe_block_processing_time(&self, duration: f64) {
        self.block_processing_time.with_label_values::<&str>(&[]).observe(duration);
    }

    // Reorgs
    pub fn inc_reorgs(&self) {
        self.reorgs.with_label_values::<&str>(&[]).inc();
    }

    pub fn observe_reorg_depth(&self, depth: f64) {
        self.reorg_depth.with_label_values::<&str>(&[]).observe(depth);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exposes_sync_metrics() {
        let metrics = Metrics::new();
        metrics.set_peers(3);
        metrics.inc_blocks_processed("accepted");
        metrics.observe_reorg_depth(2.0);

        let text = metrics.gather();
        assert!(text.contains("sync_peers_connected 3"));
        assert!(text.contains("sync_blocks_processed_total{result=\"accepted\"} 1"));
        assert!(text.contains("sync_reorg_depth_count 1"));
    }
}
