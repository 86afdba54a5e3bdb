//! Fee quoting and replacement fee bumping

use super::request::{FeeOverrides, TxRequest};
use crate::chain::{FeeSchedule, LedgerClient, TxSigner};
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};

use ethers::types::U256;
use ethers::utils::format_ether;
use serde::Serialize;
use tracing::debug;

/// Cost estimate for a pending request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeQuote {
    pub gas_limit: U256,
    pub fee_wei: U256,
    /// `fee_wei` rendered in ether
    pub fee_native: String,
}

impl FeeQuote {
    /// Quote for `gas_limit` units at `price` wei each
    pub fn new(gas_limit: U256, price: U256) -> Self {
        let fee_wei = gas_limit.saturating_mul(price);
        Self {
            gas_limit,
            fee_wei,
            fee_native: format_ether(fee_wei),
        }
    }
}

/// Gas price a quote is based on: the largest advertised fee, or zero
pub fn quote_price(schedule: &FeeSchedule) -> U256 {
    [schedule.max_fee_per_gas, schedule.gas_price]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or_default()
}

/// Single-round-trip fee estimator
#[derive(Debug, Clone, Default)]
pub struct FeeEstimator;

impl FeeEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Quote the total cost of `request`. No retries at this layer.
    pub async fn estimate(
        &self,
        signer: &dyn TxSigner,
        ledger: &dyn LedgerClient,
        request: &TxRequest,
    ) -> TrackerResult<FeeQuote> {
        let (gas_limit, schedule) =
            futures::try_join!(signer.estimate_gas(request), ledger.fee_schedule())
                .map_err(into_estimation_error)?;

        let quote = FeeQuote::new(gas_limit, quote_price(&schedule));
        debug!(
            gas_limit = %quote.gas_limit,
            fee_wei = %quote.fee_wei,
            "Estimated fee {} ETH",
            quote.fee_native
        );
        Ok(quote)
    }
}

fn into_estimation_error(err: TrackerError) -> TrackerError {
    match err {
        TrackerError::EstimationFailed(_) => err,
        other => TrackerError::EstimationFailed(other.to_string()),
    }
}

/// Fee increase applied when replacing a stuck transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeBump {
    /// Percentage added on top of the current fee
    percent: u64,
    /// Lower bound for the absolute increase
    min_increment: U256,
}

impl FeeBump {
    pub fn new(percent: u64, min_increment: U256) -> Self {
        Self {
            percent,
            min_increment,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.fee_bump_percent, U256::from(config.min_fee_bump_wei))
    }

    /// `value` raised by `percent`, and by at least `min_increment`
    pub fn bump(&self, value: U256) -> U256 {
        let relative = value.saturating_mul(U256::from(self.percent)) / U256::from(100);
        value.saturating_add(relative.max(self.min_increment))
    }

    /// Replacement fee fields derived from the current schedule
    pub fn replacement_fees(&self, schedule: &FeeSchedule) -> TrackerResult<FeeOverrides> {
        if schedule.max_fee_per_gas.is_some() || schedule.max_priority_fee_per_gas.is_some() {
            let priority = schedule.max_priority_fee_per_gas.unwrap_or_else(U256::one);
            let max_fee = schedule
                .max_fee_per_gas
                .unwrap_or_else(|| priority.saturating_mul(U256::from(2)));
            return Ok(FeeOverrides::Eip1559 {
                max_fee_per_gas: self.bump(max_fee),
                max_priority_fee_per_gas: self.bump(priority),
            });
        }

        match schedule.gas_price {
            Some(price) => Ok(FeeOverrides::Legacy {
                gas_price: self.bump(price),
            }),
            None => Err(TrackerError::EstimationFailed(
                "Ledger reported no fee data to bump".to_string(),
            )),
        }
    }
}

impl Default for FeeBump {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}
