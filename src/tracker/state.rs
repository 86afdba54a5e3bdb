//! Lifecycle state owned by one serialization point
//!
//! Every watcher write carries the generation it was started under. Starting,
//! replacing or resetting an action bumps the generation, so late signals from
//! a torn-down watcher are dropped here instead of racing the new one.

use crate::chain::TransactionHandle;
use crate::error::TrackerError;
use crate::tx::{FeeQuote, TxRequest};

use chrono::{DateTime, Utc};
use ethers::types::H256;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle events buffered for slow consumers
const EVENT_BUFFER: usize = 256;

/// Watcher epoch; writes from older generations are ignored
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Submitted,
    Confirmed,
}

/// A submitted transaction and what has been observed about it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedTransaction {
    pub hash: H256,
    pub nonce: Option<u64>,
    pub request: TxRequest,
    /// Set once, from the first receipt carrying a block reference
    pub mined_block_height: Option<u64>,
    pub submitted_at: DateTime<Utc>,
}

impl TrackedTransaction {
    pub fn new(handle: TransactionHandle, request: TxRequest) -> Self {
        Self {
            hash: handle.hash,
            nonce: handle.nonce,
            request,
            mined_block_height: None,
            submitted_at: Utc::now(),
        }
    }
}

/// Everything the UI layer observes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSnapshot {
    pub state: LifecycleState,
    pub confirmations: u64,
    pub target_confirmations: u64,
    pub active_hash: Option<H256>,
    pub nonce: Option<u64>,
    pub mined_block_height: Option<u64>,
    pub last_fee_quote: Option<FeeQuote>,
    pub last_error: Option<String>,
    pub speeding_up: bool,
    pub action_id: Option<Uuid>,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Lifecycle notifications for downstream side effects
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Submitted {
        hash: H256,
        nonce: Option<u64>,
    },
    ConfirmationsUpdated {
        hash: H256,
        confirmations: u64,
    },
    /// Emitted at most once per tracked hash
    Confirmed {
        hash: H256,
        confirmations: u64,
        latency_secs: f64,
    },
    Replaced {
        previous: H256,
        replacement: H256,
    },
    ReplacementFailed {
        hash: H256,
        reason: String,
    },
    Reset,
}

/// Result of feeding an observation into the state holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Written by a watcher that is no longer current
    Stale,
    /// Action is already confirmed; nothing changed
    AlreadyConfirmed,
    /// New confirmation count, target not reached yet
    Progress(u64),
    /// This call performed the transition to Confirmed
    Confirmed(u64),
}

struct Inner {
    generation: Generation,
    state: LifecycleState,
    tracked: Option<TrackedTransaction>,
    confirmations: u64,
    last_fee_quote: Option<FeeQuote>,
    last_error: Option<String>,
    speeding_up: bool,
    action_id: Option<Uuid>,
}

impl Inner {
    fn idle() -> Self {
        Self {
            generation: 0,
            state: LifecycleState::Idle,
            tracked: None,
            confirmations: 0,
            last_fee_quote: None,
            last_error: None,
            speeding_up: false,
            action_id: None,
        }
    }

    fn snapshot(&self, target_confirmations: u64) -> TrackerSnapshot {
        let tracked = self.tracked.as_ref();
        TrackerSnapshot {
            state: self.state,
            confirmations: self.confirmations,
            target_confirmations,
            active_hash: tracked.map(|t| t.hash),
            nonce: tracked.and_then(|t| t.nonce),
            mined_block_height: tracked.and_then(|t| t.mined_block_height),
            last_fee_quote: self.last_fee_quote.clone(),
            last_error: self.last_error.clone(),
            speeding_up: self.speeding_up,
            action_id: self.action_id,
            submitted_at: tracked.map(|t| t.submitted_at),
        }
    }

    /// Move to Confirmed unless already there; returns the emitted event
    fn finish(&mut self) -> Option<TrackerEvent> {
        if self.state == LifecycleState::Confirmed {
            return None;
        }
        self.state = LifecycleState::Confirmed;
        let tracked = self.tracked.as_ref()?;
        let latency = Utc::now() - tracked.submitted_at;
        Some(TrackerEvent::Confirmed {
            hash: tracked.hash,
            confirmations: self.confirmations,
            latency_secs: latency.num_milliseconds().max(0) as f64 / 1000.0,
        })
    }
}

/// Single owner of lifecycle state
pub struct StateHolder {
    inner: Mutex<Inner>,
    target_confirmations: u64,
    snapshots: watch::Sender<TrackerSnapshot>,
    events: broadcast::Sender<TrackerEvent>,
}

impl StateHolder {
    pub fn new(target_confirmations: u64) -> Self {
        let inner = Inner::idle();
        let (snapshots, _) = watch::channel(inner.snapshot(target_confirmations));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Mutex::new(inner),
            target_confirmations,
            snapshots,
            events,
        }
    }

    pub fn target_confirmations(&self) -> u64 {
        self.target_confirmations
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> TrackerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<TrackerSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<TrackerEvent> {
        self.events.subscribe()
    }

    pub async fn tracked(&self) -> Option<TrackedTransaction> {
        self.inner.lock().await.tracked.clone()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    fn publish(&self, inner: &Inner, event: Option<TrackerEvent>) {
        self.snapshots
            .send_replace(inner.snapshot(self.target_confirmations));
        if let Some(event) = event {
            // No receivers is fine
            let _ = self.events.send(event);
        }
    }

    /// Start tracking a freshly submitted transaction as a new action
    pub async fn begin(&self, tracked: TrackedTransaction) -> Generation {
        let mut inner = self.inner.lock().await;
        let event = TrackerEvent::Submitted {
            hash: tracked.hash,
            nonce: tracked.nonce,
        };
        inner.action_id = Some(Uuid::new_v4());
        let generation = Self::attach(&mut inner, tracked);
        self.publish(&inner, Some(event));
        generation
    }

    /// Swap the active hash for its replacement within the same action
    pub async fn replace(&self, tracked: TrackedTransaction) -> Generation {
        let mut inner = self.inner.lock().await;
        let previous = inner.tracked.as_ref().map(|t| t.hash);
        let replacement = tracked.hash;
        let generation = Self::attach(&mut inner, tracked);
        let event = previous.map(|previous| TrackerEvent::Replaced {
            previous,
            replacement,
        });
        self.publish(&inner, event);
        generation
    }

    fn attach(inner: &mut Inner, tracked: TrackedTransaction) -> Generation {
        inner.generation += 1;
        inner.state = LifecycleState::Submitted;
        inner.confirmations = 0;
        inner.tracked = Some(tracked);
        inner.last_error = None;
        inner.speeding_up = false;
        inner.generation
    }

    /// Detach the current watcher generation ahead of a replacement
    pub async fn begin_replacement(&self) {
        let mut inner = self.inner.lock().await;
        inner.generation += 1;
        inner.speeding_up = true;
        self.publish(&inner, None);
    }

    /// Replacement did not go through; the previous watch is not restored
    pub async fn replacement_failed(&self, err: &TrackerError) {
        let mut inner = self.inner.lock().await;
        inner.speeding_up = false;
        inner.last_error = Some(err.to_string());
        let event = inner.tracked.as_ref().map(|t| TrackerEvent::ReplacementFailed {
            hash: t.hash,
            reason: err.to_string(),
        });
        self.publish(&inner, event);
    }

    /// Block-notification path: receipt at `mined_height`, chain tip at `current_height`
    pub async fn observe_block(
        &self,
        generation: Generation,
        mined_height: u64,
        current_height: u64,
    ) -> Observation {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Observation::Stale;
        }
        if inner.state == LifecycleState::Confirmed {
            return Observation::AlreadyConfirmed;
        }
        let Some(tracked) = inner.tracked.as_mut() else {
            return Observation::Stale;
        };
        let hash = tracked.hash;
        let mined = *tracked.mined_block_height.get_or_insert(mined_height);

        let observed = current_height.saturating_add(1).saturating_sub(mined);
        let confirmations = inner.confirmations.max(observed);
        inner.confirmations = confirmations;

        if confirmations >= self.target_confirmations {
            let event = inner.finish();
            info!(tx_hash = ?hash, confirmations, "Transaction confirmed via block notifications");
            self.publish(&inner, event);
            return Observation::Confirmed(confirmations);
        }

        debug!(tx_hash = ?hash, confirmations, current_height, "Confirmation progress");
        self.publish(
            &inner,
            Some(TrackerEvent::ConfirmationsUpdated {
                hash,
                confirmations,
            }),
        );
        Observation::Progress(confirmations)
    }

    /// Blocking-wait path: the ledger reported the target as reached
    pub async fn confirm_from_wait(
        &self,
        generation: Generation,
        mined_height: Option<u64>,
    ) -> Observation {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Observation::Stale;
        }
        if inner.state == LifecycleState::Confirmed {
            return Observation::AlreadyConfirmed;
        }
        let Some(tracked) = inner.tracked.as_mut() else {
            return Observation::Stale;
        };
        if let Some(height) = mined_height {
            tracked.mined_block_height.get_or_insert(height);
        }
        let hash = tracked.hash;

        let confirmations = inner.confirmations.max(self.target_confirmations);
        inner.confirmations = confirmations;
        let event = inner.finish();
        info!(tx_hash = ?hash, confirmations, "Transaction confirmed via confirmation wait");
        self.publish(&inner, event);
        Observation::Confirmed(confirmations)
    }

    pub async fn record_fee_quote(&self, quote: FeeQuote) {
        let mut inner = self.inner.lock().await;
        inner.last_fee_quote = Some(quote);
        self.publish(&inner, None);
    }

    pub async fn record_error(&self, err: &TrackerError) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(err.to_string());
        self.publish(&inner, None);
    }

    /// Back to Idle; any watcher still running becomes stale
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        let generation = inner.generation + 1;
        *inner = Inner::idle();
        inner.generation = generation;
        self.publish(&inner, Some(TrackerEvent::Reset));
    }
}
