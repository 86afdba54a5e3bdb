//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Submitted, confirmed and replaced transactions
//! - Failures by stage
//! - Confirmation progress and latency
//! - Last quoted fee

use crate::error::{TrackerError, TrackerResult};
use crate::tracker::TrackerEvent;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{info, warn};

lazy_static! {
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "tx_tracker_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "tx_tracker_transactions_confirmed_total",
        "Total transactions that reached the target confirmations",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "tx_tracker_transactions_failed_total",
        "Total failures by stage",
        &["chain_id", "stage"]
    ).unwrap();

    pub static ref TX_REPLACED: CounterVec = register_counter_vec!(
        "tx_tracker_transactions_replaced_total",
        "Total speed-up replacements accepted by the ledger",
        &["chain_id"]
    ).unwrap();

    pub static ref CONFIRMATIONS: GaugeVec = register_gauge_vec!(
        "tx_tracker_confirmations",
        "Confirmations of the active transaction",
        &["chain_id"]
    ).unwrap();

    pub static ref LAST_FEE_WEI: GaugeVec = register_gauge_vec!(
        "tx_tracker_last_fee_wei",
        "Most recently quoted fee in wei",
        &["chain_id"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "tx_tracker_confirmation_latency_seconds",
        "Time from submission to target confirmations",
        &["chain_id"],
        vec![1.0, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> TrackerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TrackerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TrackerError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record tracker lifecycle events until the tracker goes away
pub async fn record_events(chain_id: u64, mut events: broadcast::Receiver<TrackerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => record_event(chain_id, &event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Metrics recorder lagged behind tracker events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub fn record_event(chain_id: u64, event: &TrackerEvent) {
    match event {
        TrackerEvent::Submitted { .. } => {
            record_tx_submitted(chain_id);
            record_confirmations(chain_id, 0);
        }
        TrackerEvent::ConfirmationsUpdated { confirmations, .. } => {
            record_confirmations(chain_id, *confirmations);
        }
        TrackerEvent::Confirmed {
            confirmations,
            latency_secs,
            ..
        } => {
            record_tx_confirmed(chain_id);
            record_confirmations(chain_id, *confirmations);
            record_confirmation_latency(chain_id, *latency_secs);
        }
        TrackerEvent::Replaced { .. } => {
            record_tx_replaced(chain_id);
            record_confirmations(chain_id, 0);
        }
        TrackerEvent::ReplacementFailed { .. } => record_tx_failed(chain_id, "replacement"),
        TrackerEvent::Reset => record_confirmations(chain_id, 0),
    }
}

// Helper functions to record metrics

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64, stage: &str) {
    TX_FAILED
        .with_label_values(&[&chain_id.to_string(), stage])
        .inc();
}

pub fn record_tx_replaced(chain_id: u64) {
    TX_REPLACED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_confirmations(chain_id: u64, confirmations: u64) {
    CONFIRMATIONS
        .with_label_values(&[&chain_id.to_string()])
        .set(confirmations as f64);
}

pub fn record_fee_quote(chain_id: u64, fee_wei: f64) {
    LAST_FEE_WEI
        .with_label_values(&[&chain_id.to_string()])
        .set(fee_wei);
}

pub fn record_confirmation_latency(chain_id: u64, latency_secs: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}
