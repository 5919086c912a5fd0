mod local_chain;
mod mempool;
mod notifier;
mod simulation;

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chain::{ChainParams, Network};
use clap::Parser;
use metrics::{
    Metrics,
    server::{MetricsServerConfig, run_metrics_server},
};
use networking::sync::{SyncConfig, SyncParams, SyncService};
use networking::types::OutboundSyncRequest;
use tokio::{sync::mpsc, task};
use tracing::{error, info, warn};

use crate::local_chain::LocalChain;
use crate::mempool::{FeeTracker, InMemoryPool};
use crate::notifier::LoggingNotifier;
use crate::simulation::SimulationConfig;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value = "regtest")]
    network: Network,

    /// YAML file with `checkpoints: [{ height, hash }]`.
    #[arg(long)]
    checkpoints: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    disable_checkpoints: bool,

    #[arg(long, default_value_t = 125)]
    max_peers: usize,

    /// YAML file overriding sync tunables.
    #[arg(long)]
    sync_config: Option<PathBuf>,

    #[arg(long)]
    stall_timeout_secs: Option<u64>,

    #[arg(short, long, default_value_t = 4)]
    peers: usize,

    #[arg(long, default_value_t = 1)]
    stalling_peers: usize,

    #[arg(long, default_value_t = 500)]
    chain_length: u64,

    #[arg(long, default_value_t = 32)]
    transactions: usize,

    #[arg(long, default_value_t = 20)]
    latency_ms: u64,

    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    #[arg(long, default_value_t = false)]
    metrics: bool,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,
}

fn load_sync_params(args: &Args) -> Result<SyncParams> {
    let mut params = match &args.sync_config {
        Some(path) => {
            let file = std::fs::File::open(path)
                .with_context(|| format!("failed to open sync config {path:?}"))?;
            serde_yaml::from_reader(file)
                .with_context(|| format!("failed to parse sync config {path:?}"))?
        }
        None => SyncParams::default(),
    };
    if let Some(stall_timeout_secs) = args.stall_timeout_secs {
        params.stall_timeout_secs = stall_timeout_secs;
    }
    Ok(params)
}

fn load_chain_params(args: &Args) -> Result<ChainParams> {
    let params = ChainParams::for_network(args.network);
    if args.disable_checkpoints {
        return Ok(params.with_checkpoints(Vec::new()));
    }
    match &args.checkpoints {
        Some(path) => params.load_checkpoints(path),
        None => Ok(params),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let chain_params = load_chain_params(&args)?;
    let sync_params = load_sync_params(&args)?;
    if args.checkpoints.is_some() && args.disable_checkpoints {
        warn!("Checkpoint file ignored because checkpoints are disabled");
    }

    let chain = Arc::new(LocalChain::new(chain_params.clone()));
    let tx_pool = Arc::new(InMemoryPool::new());
    let notifier = Arc::new(LoggingNotifier::new());
    let fee_tracker = Arc::new(FeeTracker::new());
    let (outbound_sender, outbound_receiver) = mpsc::unbounded_channel::<OutboundSyncRequest>();

    let mut config = SyncConfig::new(
        chain_params.clone(),
        chain.clone(),
        tx_pool.clone(),
        notifier.clone(),
        Arc::new(outbound_sender),
    )
    .with_params(sync_params)
    .with_fee_estimator(fee_tracker.clone())
    .with_disable_checkpoints(args.disable_checkpoints)
    .with_max_peers(args.max_peers);

    if args.metrics {
        let metrics = Arc::new(Metrics::new());
        config = config.with_metrics(metrics.clone());
        let server_config = MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port: args.metrics_port,
        };
        task::spawn(async move {
            if let Err(err) = run_metrics_server(server_config, metrics).await {
                error!(%err, "Metrics server exited with error");
            }
        });
    }

    info!(
        network = ?chain_params.network,
        checkpoints = chain_params.checkpoints.len(),
        peers = args.peers,
        chain_length = args.chain_length,
        "Starting sync simulation"
    );
    let (handle, service) = SyncService::spawn(config);

    let simulation = SimulationConfig {
        peers: args.peers,
        chain_length: args.chain_length,
        stalling_peers: args.stalling_peers,
        transactions: args.transactions,
        latency: Duration::from_millis(args.latency_ms),
        timeout: Duration::from_secs(args.timeout_secs),
        ..SimulationConfig::default()
    };
    let report = simulation::run(simulation, &chain_params, handle, outbound_receiver).await?;
    service.await.context("sync service panicked")?;

    let counts = notifier.counts();
    info!(
        synced = report.synced,
        elapsed = ?report.elapsed,
        tip = %report.stats.chain_tip,
        blocks = chain.block_count(),
        mempool = tx_pool.len(),
        rejected_txs = report.stats.rejected_txs,
        announced_txs = counts.announced_txs,
        height_updates = counts.height_updates,
        relayed = counts.relayed,
        confirmed_txs = counts.confirmed_txs,
        avg_block_txs = fee_tracker.average_tx_count(),
        "Sync simulation finished"
    );

    if !report.synced {
        anyhow::bail!("local chain did not catch up with the simulated peers");
    }
    Ok(())
}
