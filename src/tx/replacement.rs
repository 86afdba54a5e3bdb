//! Replace-by-fee request construction

use super::fees::FeeBump;
use super::request::TxRequest;
use crate::chain::FeeSchedule;
use crate::error::TrackerResult;

use tracing::debug;

/// Body of a replacement: same request, same nonce, bumped fees
pub fn build_replacement(
    original: &TxRequest,
    nonce: u64,
    schedule: &FeeSchedule,
    bump: &FeeBump,
) -> TrackerResult<TxRequest> {
    let fees = bump.replacement_fees(schedule)?;
    debug!(nonce, ?fees, "Built replacement fees");
    Ok(original.with_nonce(nonce).with_fees(fees))
}

/// Classify a node rejection of a replacement for logging
pub fn rejection_reason(message: &str) -> &'static str {
    let message = message.to_ascii_lowercase();
    if message.contains("replacement transaction underpriced")
        || message.contains("replacement fee too low")
    {
        "underpriced"
    } else if message.contains("nonce too low") || message.contains("already known") {
        "already_mined"
    } else if message.contains("insufficient funds") {
        "insufficient_funds"
    } else {
        "other"
    }
}
