//! Feedkeeper binary: wire the components together and run the coordinator.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedkeeper::chain::aggregator::{Aggregator, ChainApi};
use feedkeeper::chain::rpc::RpcClient;
use feedkeeper::chain::wallet::Wallet;
use feedkeeper::coordinator::Coordinator;
use feedkeeper::headtracker::{shared_head, HeadTracker};
use feedkeeper::models::Config;
use feedkeeper::poller::ChainEventPoller;
use feedkeeper::pricefeed::{PriceFetcher, PriceSource};
use feedkeeper::schedule::{run_ticker, FixedBackoff, Scheduler};
use feedkeeper::submitter::Submitter;

/// Jitter fraction applied on top of the ineligibility backoff base.
const BACKOFF_JITTER: f64 = 0.1;

#[derive(Parser, Debug)]
#[command(name = "feedkeeper", about = "Price feed oracle agent")]
struct Cli {
    /// Load environment variables from this file before reading configuration
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Log submissions instead of sending them
    #[arg(long)]
    dry_run: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,feedkeeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenv::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            let _ = dotenv::dotenv();
        }
    }
    init_tracing();

    let mut cfg = Config::from_env().context("configuration error")?;
    cfg.dry_run = cfg.dry_run || cli.dry_run;

    info!(
        contract = %cfg.contract_address,
        oracle = %cfg.oracle_address,
        api = %cfg.api_url,
        dry_run = cfg.dry_run,
        "🚀 starting feedkeeper"
    );

    let rpc = Arc::new(
        RpcClient::new(cfg.node_http_url.clone(), cfg.http_timeout)
            .context("failed to build the RPC client")?,
    );
    let chain: Arc<dyn ChainApi> = Arc::new(Aggregator::new(
        rpc,
        cfg.contract_address,
        cfg.oracle_address,
    ));

    // The scale factor comes from the contract, not from a literal. An
    // unreachable node or a wrong address surfaces here, before any loop runs.
    let decimals = chain
        .decimals()
        .await
        .context("failed to read feed decimals, check the node URL and contract address")?;
    info!(decimals, "feed decimals");

    let wallet = Wallet::new(cfg.oracle_address, chain.clone());
    wallet.log_details().await;

    let price: Arc<dyn PriceSource> =
        Arc::new(PriceFetcher::from_config(&cfg).context("failed to build the price fetcher")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (scheduler, poll_interval_rx, beat_interval_rx) = Scheduler::new(
        cfg.poll_interval,
        cfg.drumbeat_interval,
        FixedBackoff::new(cfg.backoff_base, BACKOFF_JITTER),
    );

    // Timer-driven producers
    let (poll_tick_tx, poll_tick_rx) = mpsc::channel(4);
    let (beat_tx, beat_rx) = mpsc::channel(4);
    let poll_ticker = tokio::spawn(run_ticker(
        "chain-poll",
        poll_interval_rx,
        poll_tick_tx,
        shutdown_rx.clone(),
    ));
    let beat_ticker = tokio::spawn(run_ticker(
        "drumbeat",
        beat_interval_rx,
        beat_tx,
        shutdown_rx.clone(),
    ));

    // Chain event poller, fed by its ticker
    let head = shared_head();
    let (chain_events_tx, chain_events_rx) = mpsc::channel(64);
    let poller = ChainEventPoller::new(
        chain.clone(),
        head.clone(),
        cfg.oracle_address,
        cfg.replay_from_block,
    );
    let poller_task = tokio::spawn(poller.run(
        poll_tick_rx,
        chain_events_tx,
        shutdown_rx.clone(),
    ));

    // Optional head tracker
    let head_task = cfg.node_ws_url.clone().map(|ws_url| {
        tokio::spawn(HeadTracker::new(ws_url, head).run(shutdown_rx.clone()))
    });

    // Ctrl-C flips the shutdown signal every loop watches
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let submitter = Submitter::new(
        chain.clone(),
        cfg.oracle_address,
        cfg.receipt_timeout,
        cfg.dry_run,
        shutdown_rx.clone(),
    );
    let coordinator = Coordinator::new(
        chain,
        price,
        submitter,
        scheduler,
        cfg.oracle_address,
        decimals,
        cfg.answer_round_starts,
    );

    coordinator.run(chain_events_rx, beat_rx, shutdown_rx).await;

    // Let the producers drain before exiting
    for (name, task) in [("poll ticker", poll_ticker), ("drumbeat", beat_ticker), ("poller", poller_task)]
    {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task ended abnormally");
        }
    }
    if let Some(task) = head_task {
        if let Err(e) = task.await {
            warn!(task = "head tracker", error = %e, "task ended abnormally");
        }
    }

    info!("feedkeeper stopped");
    Ok(())
}
