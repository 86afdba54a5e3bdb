//! Ledger Tx Tracker - transaction lifecycle tracking for a ledger-backed UI
//!
//! Estimates fees, submits record transactions, watches them to a target
//! confirmation depth over two redundant paths and speeds up stuck ones by
//! replace-by-fee. A small HTTP API exposes all of it to the front-end.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod metrics;
mod tracker;
mod tx;

use chain::{EthersLedger, EthersSigner, LedgerClient, TxSigner};
use config::Settings;
use metrics::MetricsServer;
use tracker::{TrackerEvent, TransactionTracker};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Ledger Tx Tracker v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({})",
        settings.chain.name, settings.chain.chain_id
    );

    // Connect the shared ledger client
    let ledger = Arc::new(
        EthersLedger::connect(&settings.chain, &settings.tracker)
            .await
            .context("Failed to connect ledger client")?,
    );
    let height = ledger
        .block_number()
        .await
        .context("Failed to read current block")?;
    info!("Ledger client connected at block {}", height);

    // Signing capability
    let signer: Arc<dyn TxSigner> = Arc::new(
        EthersSigner::from_env(
            ledger.http().clone(),
            ledger.chain_id(),
            &settings.wallet.private_key_env,
        )
        .context("Failed to initialize signer")?,
    );
    info!("Sending from {:?}", signer.address());

    let tracker = Arc::new(TransactionTracker::new(
        ledger.chain_id(),
        ledger.clone(),
        &settings.tracker,
    ));
    info!(
        "Tracker ready, target {} confirmations",
        settings.tracker.target_confirmations
    );

    // Start API server
    let api_handle = tokio::spawn({
        let state = api::AppState {
            tracker: tracker.clone(),
            signer: signer.clone(),
            contract: settings.chain.contract()?,
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server and recorder
    let metrics_handles = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let server_handle = tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
        let recorder_handle = tokio::spawn(metrics::record_events(
            ledger.chain_id(),
            tracker.events(),
        ));
        vec![server_handle, recorder_handle]
    } else {
        Vec::new()
    };

    // Lifecycle log
    let events_handle = tokio::spawn(log_events(tracker.events()));

    info!("Ledger Tx Tracker is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Cancels any watcher still running
    tracker.reset().await;

    // Abort background tasks
    api_handle.abort();
    events_handle.abort();
    for handle in metrics_handles {
        handle.abort();
    }

    info!("Ledger Tx Tracker stopped");
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<TrackerEvent>) {
    loop {
        match events.recv().await {
            Ok(TrackerEvent::Submitted { hash, nonce }) => {
                info!(tx_hash = ?hash, ?nonce, "Tracking submitted transaction");
            }
            Ok(TrackerEvent::ConfirmationsUpdated {
                hash,
                confirmations,
            }) => {
                debug!(tx_hash = ?hash, confirmations, "Confirmations updated");
            }
            Ok(TrackerEvent::Confirmed {
                hash,
                confirmations,
                latency_secs,
            }) => {
                info!(
                    tx_hash = ?hash,
                    confirmations,
                    "Transaction confirmed after {:.1}s",
                    latency_secs
                );
            }
            Ok(TrackerEvent::Replaced {
                previous,
                replacement,
            }) => {
                info!(?previous, ?replacement, "Transaction replaced");
            }
            Ok(TrackerEvent::ReplacementFailed { hash, reason }) => {
                warn!(tx_hash = ?hash, "Speed-up failed: {}", reason);
            }
            Ok(TrackerEvent::Reset) => debug!("Tracker reset"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagged behind tracker");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,ledger_tx_tracker=debug,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
