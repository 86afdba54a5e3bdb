//! Transaction tracker - the coordinator the UI layer talks to
//!
//! This module provides:
//! - Fee estimation with the quote published for display
//! - Submission followed by dual-path confirmation watching
//! - Speed-up by replace-by-fee under the same nonce
//! - Explicit reset back to Idle
//!
//! Operations that swap the active watcher hold one async mutex, so at most
//! one watcher is alive per tracker.

pub mod state;
pub mod watcher;

pub use state::{LifecycleState, StateHolder, TrackedTransaction, TrackerEvent, TrackerSnapshot};
pub use watcher::{ConfirmationWatcher, WatchHandle};

use crate::chain::{LedgerClient, TransactionHandle, TxSigner};
use crate::config::TrackerConfig;
use crate::error::{TrackerError, TrackerResult};
use crate::metrics;
use crate::tx::{build_replacement, rejection_reason, FeeBump, FeeEstimator, FeeQuote, TxRequest};

use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

/// Tracks one logical user action at a time
pub struct TransactionTracker {
    chain_id: u64,
    ledger: Arc<dyn LedgerClient>,
    estimator: FeeEstimator,
    bump: FeeBump,
    state: Arc<StateHolder>,
    watcher: ConfirmationWatcher,
    active: Mutex<Option<WatchHandle>>,
}

impl TransactionTracker {
    pub fn new(chain_id: u64, ledger: Arc<dyn LedgerClient>, config: &TrackerConfig) -> Self {
        let state = Arc::new(StateHolder::new(config.target_confirmations));
        let watcher = ConfirmationWatcher::new(ledger.clone(), state.clone());
        Self {
            chain_id,
            ledger,
            estimator: FeeEstimator::new(),
            bump: FeeBump::from_config(config),
            state,
            watcher,
            active: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        self.state.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<TrackerSnapshot> {
        self.state.watch()
    }

    pub fn events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.state.events()
    }

    /// Quote `request` and publish the quote
    pub async fn estimate(
        &self,
        signer: &dyn TxSigner,
        request: &TxRequest,
    ) -> TrackerResult<FeeQuote> {
        match self
            .estimator
            .estimate(signer, self.ledger.as_ref(), request)
            .await
        {
            Ok(quote) => {
                metrics::record_fee_quote(self.chain_id, wei_as_f64(quote.fee_wei));
                self.state.record_fee_quote(quote.clone()).await;
                Ok(quote)
            }
            Err(e) => {
                warn!("Fee estimation failed: {}", e);
                metrics::record_tx_failed(self.chain_id, "estimate");
                self.state.record_error(&e).await;
                Err(e)
            }
        }
    }

    /// Start a new action: estimate, send with the estimated gas limit, then track
    pub async fn submit_and_track(
        &self,
        signer: &dyn TxSigner,
        request: TxRequest,
    ) -> TrackerResult<TransactionHandle> {
        self.reset().await;

        let quote = self.estimate(signer, &request).await?;
        let request = request.with_gas_limit(quote.gas_limit);

        let handle = match signer.send(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                let err = match e {
                    TrackerError::SubmissionFailed(_) => e,
                    other => TrackerError::SubmissionFailed(other.to_string()),
                };
                warn!("Submission failed: {}", err);
                metrics::record_tx_failed(self.chain_id, "submit");
                self.state.record_error(&err).await;
                return Err(err);
            }
        };

        info!(
            tx_hash = %format_hash(&handle),
            nonce = ?handle.nonce,
            gas_limit = %quote.gas_limit,
            "Transaction submitted"
        );
        self.track(handle, request).await;
        Ok(handle)
    }

    /// Watch `handle` as the new action, replacing whatever was watched before
    pub async fn track(&self, handle: TransactionHandle, request: TxRequest) {
        let mut active = self.active.lock().await;
        stop_watch(&mut active).await;

        let generation = self
            .state
            .begin(TrackedTransaction::new(handle, request))
            .await;
        *active = Some(self.watcher.spawn(handle.hash, generation));
    }

    /// Resubmit the tracked request under the same nonce with bumped fees
    pub async fn speed_up(&self, signer: &dyn TxSigner) -> TrackerResult<TransactionHandle> {
        let mut active = self.active.lock().await;

        let tracked = self
            .state
            .tracked()
            .await
            .ok_or(TrackerError::NoActiveTransaction)?;
        let nonce = tracked.nonce.ok_or(TrackerError::NoActiveTransaction)?;
        if self.state.state().await == LifecycleState::Confirmed {
            return Err(TrackerError::ReplacementRejected(
                "transaction already confirmed".to_string(),
            ));
        }

        stop_watch(&mut active).await;
        self.state.begin_replacement().await;

        match self.send_replacement(signer, &tracked.request, nonce).await {
            Ok((handle, request)) => {
                info!(
                    previous = %hex::encode(tracked.hash.as_bytes()),
                    tx_hash = %format_hash(&handle),
                    nonce,
                    "Replacement submitted"
                );
                let generation = self
                    .state
                    .replace(TrackedTransaction::new(handle, request))
                    .await;
                *active = Some(self.watcher.spawn(handle.hash, generation));
                Ok(handle)
            }
            Err(e) => {
                self.state.replacement_failed(&e).await;
                Err(e)
            }
        }
    }

    async fn send_replacement(
        &self,
        signer: &dyn TxSigner,
        original: &TxRequest,
        nonce: u64,
    ) -> TrackerResult<(TransactionHandle, TxRequest)> {
        let schedule = self.ledger.fee_schedule().await.map_err(|e| {
            warn!(nonce, "Fee schedule unavailable for replacement: {}", e);
            TrackerError::ReplacementRejected(format!("fee schedule unavailable: {}", e))
        })?;
        let replacement =
            build_replacement(original, nonce, &schedule, &self.bump).map_err(|e| {
                warn!(nonce, "Cannot price replacement: {}", e);
                TrackerError::ReplacementRejected(format!("cannot price replacement: {}", e))
            })?;

        let mut handle = signer.send(&replacement).await.map_err(|e| {
            let message = match e {
                TrackerError::SubmissionFailed(message) => message,
                other => other.to_string(),
            };
            warn!(
                nonce,
                reason = rejection_reason(&message),
                "Replacement rejected: {}",
                message
            );
            TrackerError::ReplacementRejected(message)
        })?;
        handle.nonce.get_or_insert(nonce);

        Ok((handle, replacement))
    }

    /// Cancel any watcher and return to Idle
    pub async fn reset(&self) {
        let mut active = self.active.lock().await;
        stop_watch(&mut active).await;
        self.state.reset().await;
    }
}

async fn stop_watch(active: &mut Option<WatchHandle>) {
    if let Some(previous) = active.take() {
        debug!(
            tx_hash = ?previous.hash(),
            generation = previous.generation(),
            "Stopping watcher"
        );
        previous.shutdown().await;
    }
}

fn format_hash(handle: &TransactionHandle) -> String {
    format!("0x{}", hex::encode(handle.hash.as_bytes()))
}

fn wei_as_f64(wei: U256) -> f64 {
    if wei > U256::from(u128::MAX) {
        u128::MAX as f64
    } else {
        wei.as_u128() as f64
    }
}

#[cfg(test)]
pub(crate) async fn wait_for_snapshot<F>(
    rx: &mut watch::Receiver<TrackerSnapshot>,
    mut predicate: F,
) -> TrackerSnapshot
where
    F: FnMut(&TrackerSnapshot) -> bool,
{
    let snapshot = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        rx.wait_for(|s| predicate(s)),
    )
    .await
    .expect("snapshot condition not reached")
    .expect("state holder dropped");
    snapshot.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FakeLedger, FakeSigner};
    use crate::chain::FeeSchedule;
    use crate::tx::FeeOverrides;
    use ethers::types::{Address, H256};
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn config(target: u64) -> TrackerConfig {
        TrackerConfig {
            target_confirmations: target,
            ..Default::default()
        }
    }

    fn request() -> TxRequest {
        TxRequest::transfer_with_message(Address::repeat_byte(0x22), U256::from(5), "hello")
    }

    fn tracker(ledger: &Arc<FakeLedger>, target: u64) -> TransactionTracker {
        TransactionTracker::new(1, ledger.clone(), &config(target))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fn drain(events: &mut broadcast::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    fn confirmed_count(events: &[TrackerEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, TrackerEvent::Confirmed { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_estimate_publishes_quote() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        let quote = assert_ok!(tracker.estimate(&signer, &request()).await);
        assert_eq!(quote.gas_limit, U256::from(21_000));
        assert_eq!(quote.fee_wei, U256::from(21_000 * 100));
        assert_eq!(tracker.snapshot().last_fee_quote, Some(quote));
        assert_eq!(tracker.snapshot().state, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_estimate_failure_is_surfaced() {
        let ledger = Arc::new(FakeLedger::new());
        ledger.set_fee_schedule(FeeSchedule::default());
        let tracker = tracker(&ledger, 2);
        let mut signer = crate::chain::MockTxSigner::new();
        signer
            .expect_estimate_gas()
            .returning(|_| Err(TrackerError::EstimationFailed("execution reverted".into())));

        let err = assert_err!(tracker.estimate(&signer, &request()).await);
        assert!(matches!(err, TrackerError::EstimationFailed(_)));
        assert!(tracker.snapshot().last_error.is_some());
        assert_eq!(tracker.snapshot().last_fee_quote, None);
    }

    #[tokio::test]
    async fn test_submit_sends_with_estimated_gas_limit() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        let handle = assert_ok!(tracker.submit_and_track(&signer, request()).await);

        let sent = signer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].gas_limit(), Some(U256::from(21_000)));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Submitted);
        assert_eq!(snapshot.active_hash, Some(handle.hash));
        assert_eq!(snapshot.nonce, Some(7));
        assert_eq!(snapshot.confirmations, 0);
        assert!(snapshot.action_id.is_some());
        tracker.reset().await;
    }

    #[tokio::test]
    async fn test_submission_failure_stays_idle() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();
        signer.reject_next(TrackerError::SubmissionFailed("insufficient funds".into()));

        let err = assert_err!(tracker.submit_and_track(&signer, request()).await);
        assert!(matches!(err, TrackerError::SubmissionFailed(_)));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert_eq!(snapshot.active_hash, None);
        assert!(snapshot.last_error.unwrap().contains("insufficient funds"));
        assert_eq!(ledger.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_confirms_exactly_once_at_target() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();
        let mut events = tracker.events();
        let mut rx = tracker.watch();

        let handle = tracker.submit_and_track(&signer, request()).await.unwrap();
        ledger.wait_for_subscriptions(1).await;

        ledger.mine(handle.hash, 50);
        ledger.emit_block(50).await;
        let snapshot = wait_for_snapshot(&mut rx, |s| s.confirmations == 1).await;
        assert_eq!(snapshot.state, LifecycleState::Submitted);
        assert_eq!(snapshot.mined_block_height, Some(50));

        ledger.emit_block(51).await;
        let snapshot = wait_for_snapshot(&mut rx, |s| s.state == LifecycleState::Confirmed).await;
        assert_eq!(snapshot.confirmations, 2);

        // Late signal from the blocking wait path
        ledger.release_wait(handle.hash);
        settle().await;

        assert_eq!(tracker.snapshot().state, LifecycleState::Confirmed);
        assert_eq!(confirmed_count(&drain(&mut events)), 1);
    }

    #[tokio::test]
    async fn test_speed_up_without_submission() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        let err = assert_err!(tracker.speed_up(&signer).await);
        assert_eq!(err, TrackerError::NoActiveTransaction);
        assert_eq!(tracker.snapshot().state, LifecycleState::Idle);
        assert!(signer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_speed_up_without_known_nonce() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        tracker
            .track(
                TransactionHandle {
                    hash: H256::from_low_u64_be(0xfe),
                    nonce: None,
                },
                request(),
            )
            .await;

        let err = assert_err!(tracker.speed_up(&signer).await);
        assert_eq!(err, TrackerError::NoActiveTransaction);
        assert_eq!(tracker.snapshot().state, LifecycleState::Submitted);
        tracker.reset().await;
    }

    #[tokio::test]
    async fn test_speed_up_swaps_hash_and_ignores_old_signals() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();
        let mut rx = tracker.watch();

        let first = tracker.submit_and_track(&signer, request()).await.unwrap();
        ledger.wait_for_subscriptions(1).await;
        ledger.mine(first.hash, 10);
        ledger.emit_block(10).await;
        wait_for_snapshot(&mut rx, |s| s.confirmations == 1).await;

        let mut events = tracker.events();
        let second = assert_ok!(tracker.speed_up(&signer).await);
        assert_ne!(second.hash, first.hash);
        assert_eq!(second.nonce, Some(7));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Submitted);
        assert_eq!(snapshot.active_hash, Some(second.hash));
        assert_eq!(snapshot.confirmations, 0);
        assert_eq!(snapshot.mined_block_height, None);
        assert!(!snapshot.speeding_up);

        // Only the new watcher is subscribed
        ledger.wait_for_subscriptions(1).await;

        // Old hash keeps confirming on the ledger; nobody listens for it
        ledger.release_wait(first.hash);
        ledger.emit_block(11).await;
        settle().await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Submitted);
        assert_eq!(snapshot.confirmations, 0);
        assert_eq!(snapshot.active_hash, Some(second.hash));

        let seen = drain(&mut events);
        assert_eq!(confirmed_count(&seen), 0);
        assert!(seen.contains(&TrackerEvent::Replaced {
            previous: first.hash,
            replacement: second.hash,
        }));
        tracker.reset().await;
    }

    #[tokio::test]
    async fn test_replacement_reuses_body_with_bumped_fees() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        tracker.submit_and_track(&signer, request()).await.unwrap();
        tracker.speed_up(&signer).await.unwrap();

        let sent = signer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].to(), sent[0].to());
        assert_eq!(sent[1].data(), sent[0].data());
        assert_eq!(sent[1].gas_limit(), sent[0].gas_limit());
        assert_eq!(sent[1].nonce(), Some(7));
        assert_eq!(
            sent[1].fees(),
            Some(FeeOverrides::Eip1559 {
                max_fee_per_gas: U256::from(120),
                max_priority_fee_per_gas: U256::from(12),
            })
        );
        tracker.reset().await;
    }

    #[tokio::test]
    async fn test_rejected_replacement_keeps_original_hash() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();
        let mut events = tracker.events();

        let first = tracker.submit_and_track(&signer, request()).await.unwrap();
        ledger.wait_for_subscriptions(1).await;
        signer.reject_next(TrackerError::SubmissionFailed(
            "replacement transaction underpriced".into(),
        ));

        let err = assert_err!(tracker.speed_up(&signer).await);
        assert!(matches!(err, TrackerError::ReplacementRejected(_)));

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Submitted);
        assert_eq!(snapshot.active_hash, Some(first.hash));
        assert!(!snapshot.speeding_up);
        assert!(snapshot.last_error.unwrap().contains("underpriced"));

        // Tracking is not re-attached to the original hash
        ledger.wait_for_subscriptions(0).await;
        ledger.mine(first.hash, 5);
        ledger.release_wait(first.hash);
        settle().await;
        assert_eq!(tracker.snapshot().state, LifecycleState::Submitted);

        let seen = drain(&mut events);
        assert!(seen
            .iter()
            .any(|e| matches!(e, TrackerEvent::ReplacementFailed { hash, .. } if *hash == first.hash)));

        // A retry still has the request and nonce to work with
        let retry = assert_ok!(tracker.speed_up(&signer).await);
        assert_eq!(retry.nonce, Some(7));
        tracker.reset().await;
    }

    #[tokio::test]
    async fn test_speed_up_without_fee_data_is_rejected() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        let first = tracker.submit_and_track(&signer, request()).await.unwrap();
        ledger.set_fee_schedule(FeeSchedule::default());

        let err = assert_err!(tracker.speed_up(&signer).await);
        assert!(matches!(err, TrackerError::ReplacementRejected(_)));
        assert!(err.is_caller_error());

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Submitted);
        assert_eq!(snapshot.active_hash, Some(first.hash));
        assert!(!snapshot.speeding_up);
        assert!(snapshot.last_error.unwrap().contains("no fee data"));
        assert_eq!(signer.sent().len(), 1);
        assert_eq!(ledger.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_speed_up_after_confirmation_is_rejected() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 1);
        let signer = FakeSigner::new();
        let mut rx = tracker.watch();

        let handle = tracker.submit_and_track(&signer, request()).await.unwrap();
        ledger.mine(handle.hash, 3);
        ledger.release_wait(handle.hash);
        wait_for_snapshot(&mut rx, |s| s.state == LifecycleState::Confirmed).await;

        let err = assert_err!(tracker.speed_up(&signer).await);
        assert!(matches!(err, TrackerError::ReplacementRejected(_)));
        assert_eq!(tracker.snapshot().state, LifecycleState::Confirmed);
        assert_eq!(signer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_and_silences_previous_hash() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 3);
        let signer = FakeSigner::new();
        let mut rx = tracker.watch();

        let handle = tracker.submit_and_track(&signer, request()).await.unwrap();
        ledger.wait_for_subscriptions(1).await;
        ledger.mine(handle.hash, 8);
        ledger.emit_block(8).await;
        wait_for_snapshot(&mut rx, |s| s.confirmations == 1).await;

        tracker.reset().await;
        assert_eq!(ledger.live_subscriptions(), 0);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert_eq!(snapshot.active_hash, None);
        assert_eq!(snapshot.confirmations, 0);
        assert_eq!(snapshot.last_fee_quote, None);

        ledger.emit_block(9).await;
        ledger.release_wait(handle.hash);
        settle().await;

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.state, LifecycleState::Idle);
        assert_eq!(snapshot.confirmations, 0);
    }

    #[tokio::test]
    async fn test_new_submission_replaces_previous_action() {
        let ledger = Arc::new(FakeLedger::new());
        let tracker = tracker(&ledger, 2);
        let signer = FakeSigner::new();

        let first = tracker.submit_and_track(&signer, request()).await.unwrap();
        let first_action = tracker.snapshot().action_id;
        let second = tracker.submit_and_track(&signer, request()).await.unwrap();

        ledger.wait_for_subscriptions(1).await;
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.active_hash, Some(second.hash));
        assert_ne!(snapshot.action_id, first_action);
        assert_ne!(first.nonce, second.nonce);
        tracker.reset().await;
    }
}
