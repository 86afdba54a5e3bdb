//! Error types for the transaction tracker

use thiserror::Error;

/// Main error type for the tracker
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Fee estimation failed: {0}")]
    EstimationFailed(String),

    #[error("Transaction submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Transient observation error: {0}")]
    TransientObservation(String),

    #[error("No active transaction to speed up")]
    NoActiveTransaction,

    #[error("Replacement rejected: {0}")]
    ReplacementRejected(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    /// Check if error is retryable on the next observation tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::TransientObservation(_) | TrackerError::ChainConnection { .. }
        )
    }

    /// Check if the caller has to resolve this (misuse or ledger rejection)
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            TrackerError::NoActiveTransaction | TrackerError::ReplacementRejected(_)
        )
    }
}

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;
