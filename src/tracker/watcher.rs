//! Dual-path confirmation watcher
//!
//! Two tasks race to observe the target confirmation count for one hash:
//! - block notifications, each followed by a receipt lookup
//! - the ledger's own blocking confirmation wait
//!
//! Both report into the `StateHolder`; whichever performs the transition to
//! Confirmed cancels the shared token, which tears down the other task.

use super::state::{Generation, Observation, StateHolder};
use crate::chain::LedgerClient;

use ethers::types::H256;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

/// Running watch over a single hash
pub struct WatchHandle {
    hash: H256,
    generation: Generation,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal both paths to stop. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel and wait until both paths have exited
    pub async fn shutdown(mut self) {
        self.cancel();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(tx_hash = ?self.hash, "Watcher task panicked: {}", e);
                }
            }
        }
        debug!(tx_hash = ?self.hash, generation = self.generation, "Watcher shut down");
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Starts watchers against a shared ledger client
pub struct ConfirmationWatcher {
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateHolder>,
}

impl ConfirmationWatcher {
    pub fn new(ledger: Arc<dyn LedgerClient>, state: Arc<StateHolder>) -> Self {
        Self { ledger, state }
    }

    /// Spawn both observation paths for `hash` under `generation`
    pub fn spawn(&self, hash: H256, generation: Generation) -> WatchHandle {
        let cancel = CancellationToken::new();
        let span = info_span!("watch", tx_hash = ?hash, generation);

        let blocks = tokio::spawn(
            watch_blocks(
                self.ledger.clone(),
                self.state.clone(),
                hash,
                generation,
                cancel.clone(),
            )
            .instrument(span.clone()),
        );
        let wait = tokio::spawn(
            wait_confirmations(
                self.ledger.clone(),
                self.state.clone(),
                hash,
                generation,
                cancel.clone(),
            )
            .instrument(span),
        );

        WatchHandle {
            hash,
            generation,
            cancel,
            tasks: vec![blocks, wait],
        }
    }
}

async fn watch_blocks(
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateHolder>,
    hash: H256,
    generation: Generation,
    cancel: CancellationToken,
) {
    let subscription = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        sub = ledger.subscribe_blocks() => sub,
    };
    let mut subscription = match subscription {
        Ok(sub) => sub,
        Err(e) => {
            warn!("Block subscription failed, relying on confirmation wait: {}", e);
            return;
        }
    };

    loop {
        let height = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = subscription.next() => match next {
                Some(height) => height,
                None => {
                    warn!("Block subscription ended");
                    break;
                }
            },
        };

        let receipt = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            receipt = ledger.receipt(hash) => receipt,
        };

        let mined = match receipt {
            Ok(Some(receipt)) => match receipt.block_number {
                Some(block) => block,
                None => continue,
            },
            Ok(None) => {
                debug!(height, "Not mined yet");
                continue;
            }
            Err(e) if e.is_retryable() => {
                // Node not caught up yet; the next block retries
                debug!(height, "Receipt lookup failed: {}", e);
                continue;
            }
            Err(e) => {
                warn!(height, "Receipt lookup failed: {}", e);
                continue;
            }
        };

        match state.observe_block(generation, mined, height).await {
            Observation::Progress(_) => {}
            Observation::Confirmed(_) => {
                cancel.cancel();
                break;
            }
            Observation::Stale | Observation::AlreadyConfirmed => break,
        }
    }

    subscription.unsubscribe();
}

async fn wait_confirmations(
    ledger: Arc<dyn LedgerClient>,
    state: Arc<StateHolder>,
    hash: H256,
    generation: Generation,
    cancel: CancellationToken,
) {
    let target = state.target_confirmations();
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = ledger.wait_for_confirmations(hash, target) => outcome,
    };

    match outcome {
        Ok(receipt) => {
            if let Observation::Confirmed(_) =
                state.confirm_from_wait(generation, receipt.block_number).await
            {
                cancel.cancel();
            }
        }
        Err(e) => {
            // Block notifications keep running; state stays Submitted
            warn!("Confirmation wait ended without result: {}", e);
        }
    }
}
