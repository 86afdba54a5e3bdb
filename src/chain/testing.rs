//! Deterministic in-memory ledger and signer for tests

use super::{
    BlockSubscription, FeeSchedule, LedgerClient, Receipt, TransactionHandle, TxSigner,
};
use crate::error::{TrackerError, TrackerResult};
use crate::tx::TxRequest;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Ledger whose blocks, receipts and confirmation waits are driven by the test
#[derive(Default)]
pub struct FakeLedger {
    subscribers: Mutex<Vec<mpsc::Sender<u64>>>,
    receipts: Mutex<HashMap<H256, Receipt>>,
    released: Mutex<HashSet<H256>>,
    failed_waits: Mutex<HashSet<H256>>,
    release_notify: Notify,
    failing_receipts: AtomicUsize,
    failing_subscriptions: AtomicBool,
    fee_schedule: Mutex<FeeSchedule>,
    height: AtomicU64,
}

impl FakeLedger {
    pub fn new() -> Self {
        let ledger = Self::default();
        ledger.set_fee_schedule(FeeSchedule {
            max_fee_per_gas: Some(U256::from(100)),
            max_priority_fee_per_gas: Some(U256::from(10)),
            gas_price: Some(U256::from(80)),
        });
        ledger
    }

    pub fn set_fee_schedule(&self, schedule: FeeSchedule) {
        *self.fee_schedule.lock().unwrap() = schedule;
    }

    /// Record `hash` as included at `height`
    pub fn mine(&self, hash: H256, height: u64) {
        self.receipts.lock().unwrap().insert(
            hash,
            Receipt {
                block_number: Some(height),
            },
        );
    }

    /// Report a receipt for `hash` that carries no block reference yet
    pub fn mine_pending(&self, hash: H256) {
        self.receipts
            .lock()
            .unwrap()
            .insert(hash, Receipt { block_number: None });
    }

    /// Make `wait_for_confirmations` for `hash` fail instead of resolving
    pub fn fail_wait(&self, hash: H256) {
        self.failed_waits.lock().unwrap().insert(hash);
        self.release_notify.notify_waiters();
    }

    /// Make every later `subscribe_blocks` call fail
    pub fn fail_subscriptions(&self) {
        self.failing_subscriptions.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` receipt lookups fail transiently
    pub fn fail_next_receipts(&self, count: usize) {
        self.failing_receipts.store(count, Ordering::SeqCst);
    }

    /// Deliver a new block height to every live subscriber
    pub async fn emit_block(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
        let subscribers: Vec<_> = self.subscribers.lock().unwrap().clone();
        for subscriber in subscribers {
            let _ = subscriber.send(height).await;
        }
    }

    /// Resolve pending `wait_for_confirmations` calls for `hash`
    pub fn release_wait(&self, hash: H256) {
        self.released.lock().unwrap().insert(hash);
        self.release_notify.notify_waiters();
    }

    /// Subscriptions whose receiving side is still alive
    pub fn live_subscriptions(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.is_closed());
        subscribers.len()
    }

    /// Poll until exactly `count` subscriptions are alive
    pub async fn wait_for_subscriptions(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while self.live_subscriptions() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscription count never reached");
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn fee_schedule(&self) -> TrackerResult<FeeSchedule> {
        Ok(self.fee_schedule.lock().unwrap().clone())
    }

    async fn receipt(&self, hash: H256) -> TrackerResult<Option<Receipt>> {
        let failing = self.failing_receipts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_receipts.store(failing - 1, Ordering::SeqCst);
            return Err(TrackerError::TransientObservation(
                "header not found".to_string(),
            ));
        }
        Ok(self.receipts.lock().unwrap().get(&hash).cloned())
    }

    async fn subscribe_blocks(&self) -> TrackerResult<BlockSubscription> {
        if self.failing_subscriptions.load(Ordering::SeqCst) {
            return Err(TrackerError::ChainConnection {
                chain_id: 1,
                message: "subscription refused".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(16);
        self.subscribers.lock().unwrap().push(tx);
        Ok(BlockSubscription::from_receiver(rx))
    }

    async fn wait_for_confirmations(
        &self,
        hash: H256,
        _confirmations: u64,
    ) -> TrackerResult<Receipt> {
        loop {
            let notified = self.release_notify.notified();
            if self.failed_waits.lock().unwrap().contains(&hash) {
                return Err(TrackerError::TransientObservation(
                    "transaction dropped".to_string(),
                ));
            }
            if self.released.lock().unwrap().contains(&hash) {
                let receipt = self.receipts.lock().unwrap().get(&hash).cloned();
                return Ok(receipt.unwrap_or(Receipt { block_number: None }));
            }
            notified.await;
        }
    }

    async fn block_number(&self) -> TrackerResult<u64> {
        Ok(self.height.load(Ordering::SeqCst))
    }
}

/// Signer that hands out sequential hashes and nonces
pub struct FakeSigner {
    address: Address,
    gas: U256,
    next_nonce: AtomicU64,
    next_hash: AtomicU64,
    sent: Mutex<Vec<TxRequest>>,
    rejections: Mutex<Vec<TrackerError>>,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self {
            address: Address::repeat_byte(0x11),
            gas: U256::from(21_000),
            next_nonce: AtomicU64::new(7),
            next_hash: AtomicU64::new(1),
            sent: Mutex::new(Vec::new()),
            rejections: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next send with `err`
    pub fn reject_next(&self, err: TrackerError) {
        self.rejections.lock().unwrap().push(err);
    }

    pub fn sent(&self) -> Vec<TxRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl TxSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn estimate_gas(&self, _request: &TxRequest) -> TrackerResult<U256> {
        Ok(self.gas)
    }

    async fn send(&self, request: &TxRequest) -> TrackerResult<TransactionHandle> {
        if let Some(err) = self.rejections.lock().unwrap().pop() {
            return Err(err);
        }
        let nonce = match request.nonce() {
            Some(nonce) => nonce,
            None => self.next_nonce.fetch_add(1, Ordering::SeqCst),
        };
        let hash = H256::from_low_u64_be(self.next_hash.fetch_add(1, Ordering::SeqCst));
        self.sent.lock().unwrap().push(request.clone());
        Ok(TransactionHandle {
            hash,
            nonce: Some(nonce),
        })
    }
}
