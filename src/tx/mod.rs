//! Transaction requests, fee estimation and replace-by-fee construction

mod fees;
mod replacement;
mod request;

pub use fees::{FeeBump, FeeEstimator, FeeQuote};
pub use replacement::{build_replacement, rejection_reason};
pub use request::{FeeOverrides, TxRequest};
