//! HTTP API for the UI layer: status, estimates, submissions and speed-up

use crate::chain::{TransactionHandle, TxSigner};
use crate::config::ApiConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::tracker::{TrackerSnapshot, TransactionTracker};
use crate::tx::{FeeQuote, TxRequest};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<TransactionTracker>,
    pub signer: Arc<dyn TxSigner>,
    /// DataStorage contract; plain transfers are sent when absent
    pub contract: Option<Address>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        .route("/estimate", post(estimate))
        .route("/records", post(submit_record))
        .route("/speed-up", post(speed_up))
        .route("/reset", post(reset))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> TrackerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TrackerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TrackerError::Internal(format!("API server failed: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_status(State(state): State<AppState>) -> Json<TrackerSnapshot> {
    Json(state.tracker.snapshot())
}

async fn estimate(
    State(state): State<AppState>,
    body: Result<Json<RecordRequest>, JsonRejection>,
) -> Result<Json<FeeQuote>, ApiError> {
    let request = build_request(&state, body)?;
    let quote = state
        .tracker
        .estimate(state.signer.as_ref(), &request)
        .await?;
    Ok(Json(quote))
}

async fn submit_record(
    State(state): State<AppState>,
    body: Result<Json<RecordRequest>, JsonRejection>,
) -> Result<Json<HandleResponse>, ApiError> {
    let request = build_request(&state, body)?;
    let handle = state
        .tracker
        .submit_and_track(state.signer.as_ref(), request)
        .await?;
    Ok(Json(handle.into()))
}

async fn speed_up(State(state): State<AppState>) -> Result<Json<HandleResponse>, ApiError> {
    let handle = state.tracker.speed_up(state.signer.as_ref()).await?;
    Ok(Json(handle.into()))
}

async fn reset(State(state): State<AppState>) -> Json<TrackerSnapshot> {
    state.tracker.reset().await;
    Json(state.tracker.snapshot())
}

fn build_request(
    state: &AppState,
    body: Result<Json<RecordRequest>, JsonRejection>,
) -> Result<TxRequest, ApiError> {
    let Json(record) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let value = match record.value_wei.as_deref() {
        Some(raw) => U256::from_dec_str(raw)
            .map_err(|e| ApiError::BadRequest(format!("Invalid value_wei {:?}: {}", raw, e)))?,
        None => U256::zero(),
    };

    Ok(match state.contract {
        Some(contract) => TxRequest::store_data(contract, record.recipient, &record.message, value),
        None => TxRequest::transfer_with_message(record.recipient, value, &record.message),
    })
}

// Request and response types

/// A message to record on the ledger for `recipient`
#[derive(Debug, Deserialize)]
pub struct RecordRequest {
    pub recipient: Address,
    pub message: String,
    /// Decimal wei amount attached to the call
    #[serde(default)]
    pub value_wei: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HandleResponse {
    pub hash: ethers::types::H256,
    pub nonce: Option<u64>,
}

impl From<TransactionHandle> for HandleResponse {
    fn from(handle: TransactionHandle) -> Self {
        Self {
            hash: handle.hash,
            nonce: handle.nonce,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Error returned by API handlers
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Tracker(TrackerError),
}

impl From<TrackerError> for ApiError {
    fn from(err: TrackerError) -> Self {
        ApiError::Tracker(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Tracker(err) if err.is_caller_error() => StatusCode::CONFLICT,
            ApiError::Tracker(
                TrackerError::EstimationFailed(_)
                | TrackerError::SubmissionFailed(_)
                | TrackerError::ChainConnection { .. },
            ) => StatusCode::BAD_GATEWAY,
            ApiError::Tracker(TrackerError::TransientObservation(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Tracker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(message) => message,
            ApiError::Tracker(err) => err.to_string(),
        };
        if status.is_server_error() {
            warn!(%status, "Request failed: {}", message);
        }
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}
