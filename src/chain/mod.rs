//! Chain module - the ledger capability surface used by the tracker
//!
//! This module provides:
//! - `LedgerClient`: shared read-only access (fees, receipts, block notifications, waits)
//! - `TxSigner`: the signing capability passed into estimate/submit calls
//! - ethers-rs backed implementations of both

pub mod provider;
pub mod signer;
pub mod subscription;

#[cfg(test)]
pub mod testing;

pub use provider::EthersLedger;
pub use signer::EthersSigner;
pub use subscription::BlockSubscription;

use crate::error::TrackerResult;
use crate::tx::TxRequest;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde::Serialize;

/// Current fee market snapshot, as reported by the ledger node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeeSchedule {
    /// EIP-1559 max fee per gas
    pub max_fee_per_gas: Option<U256>,
    /// EIP-1559 priority fee per gas
    pub max_priority_fee_per_gas: Option<U256>,
    /// Legacy gas price
    pub gas_price: Option<U256>,
}

/// Inclusion receipt for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Receipt {
    /// Absent while the node reports the receipt without a block reference
    pub block_number: Option<u64>,
}

/// Identifier of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransactionHandle {
    pub hash: H256,
    /// Sender sequence number, if the signer reported it
    pub nonce: Option<u64>,
}

/// Read-only ledger access shared by every component
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current fee market
    async fn fee_schedule(&self) -> TrackerResult<FeeSchedule>;

    /// Receipt for `hash`, `None` while not yet mined
    async fn receipt(&self, hash: H256) -> TrackerResult<Option<Receipt>>;

    /// Subscribe to new block heights
    async fn subscribe_blocks(&self) -> TrackerResult<BlockSubscription>;

    /// Resolve once `hash` has at least `confirmations` confirmations
    ///
    /// Long-running; callers cancel it by dropping the future.
    async fn wait_for_confirmations(&self, hash: H256, confirmations: u64)
        -> TrackerResult<Receipt>;

    /// Latest block height
    async fn block_number(&self) -> TrackerResult<u64>;
}

/// Signing capability: estimates and sends on behalf of one account
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TxSigner: Send + Sync {
    /// Sending account
    fn address(&self) -> Address;

    /// Gas limit for `request`; fails when the call would revert
    async fn estimate_gas(&self, request: &TxRequest) -> TrackerResult<U256>;

    /// Sign and broadcast `request`
    async fn send(&self, request: &TxRequest) -> TrackerResult<TransactionHandle>;
}
