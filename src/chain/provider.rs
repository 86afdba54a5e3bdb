//! Ledger client over ethers-rs with multi-RPC failover

use super::{BlockSubscription, FeeSchedule, LedgerClient, Receipt};
use crate::config::{ChainConfig, TrackerConfig};
use crate::error::{TrackerError, TrackerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, Ws};
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffered heights per subscription before the producer applies backpressure
const SUBSCRIPTION_BUFFER: usize = 64;

/// ethers-backed `LedgerClient`
pub struct EthersLedger {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// WebSocket provider for `newHeads` notifications
    ws_provider: Option<Provider<Ws>>,
    /// Interval between `eth_blockNumber` polls when there is no WebSocket
    poll_interval: Duration,
}

impl EthersLedger {
    /// Connect to the configured chain
    pub async fn connect(config: &ChainConfig, tracker: &TrackerConfig) -> TrackerResult<Self> {
        let poll_interval = Duration::from_millis(tracker.poll_interval_ms);
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(poll_interval));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(TrackerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let ws_provider = if let Some(ref ws_url) = config.ws_url {
            match Provider::<Ws>::connect(ws_url).await {
                Ok(provider) => {
                    info!("WebSocket connected for chain {}", config.chain_id);
                    Some(provider)
                }
                Err(e) => {
                    warn!(
                        "WebSocket connection failed for chain {}, falling back to polling: {}",
                        config.chain_id, e
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            chain_id: config.chain_id,
            http_providers,
            current_provider: AtomicUsize::new(0),
            ws_provider,
            poll_interval,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn spawn_ws_blocks(&self, ws: Provider<Ws>) -> BlockSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let chain_id = self.chain_id;

        let producer = tokio::spawn(async move {
            let mut stream = match ws.subscribe_blocks().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("newHeads subscription failed on chain {}: {}", chain_id, e);
                    return;
                }
            };

            while let Some(block) = stream.next().await {
                let Some(number) = block.number else {
                    continue;
                };
                if tx.send(number.as_u64()).await.is_err() {
                    break;
                }
            }
            debug!("newHeads subscription closed on chain {}", chain_id);
        });

        BlockSubscription::new(rx, producer)
    }

    fn spawn_polled_blocks(&self) -> BlockSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let provider = self.http().clone();
        let poll_interval = self.poll_interval;
        let chain_id = self.chain_id;

        let producer = tokio::spawn(async move {
            let mut last_block = 0u64;
            loop {
                match provider.get_block_number().await {
                    Ok(block) => {
                        let block = block.as_u64();
                        if block > last_block {
                            last_block = block;
                            if tx.send(block).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        debug!("Block poll failed on chain {}: {}", chain_id, e);
                    }
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        BlockSubscription::new(rx, producer)
    }
}

/// Legacy gas price and EIP-1559 fees fetched concurrently
///
/// Either half is left empty when the node cannot supply it.
pub(crate) async fn fetch_fee_schedule<M: Middleware>(client: &M, chain_id: u64) -> FeeSchedule {
    let (gas_price, eip1559) = futures::join!(
        client.get_gas_price(),
        client.estimate_eip1559_fees(None)
    );

    let gas_price = match gas_price {
        Ok(price) => Some(price),
        Err(e) => {
            debug!("Gas price unavailable on chain {}: {}", chain_id, e);
            None
        }
    };
    let (max_fee_per_gas, max_priority_fee_per_gas) = match eip1559 {
        Ok((max_fee, priority_fee)) => (Some(max_fee), Some(priority_fee)),
        Err(e) => {
            debug!("EIP-1559 fees unavailable on chain {}: {}", chain_id, e);
            (None, None)
        }
    };

    FeeSchedule {
        max_fee_per_gas,
        max_priority_fee_per_gas,
        gas_price,
    }
}

#[async_trait]
impl LedgerClient for EthersLedger {
    async fn fee_schedule(&self) -> TrackerResult<FeeSchedule> {
        let schedule = fetch_fee_schedule(self.http(), self.chain_id).await;

        if schedule == FeeSchedule::default() {
            self.failover();
            return Err(TrackerError::EstimationFailed(format!(
                "No fee data available on chain {}",
                self.chain_id
            )));
        }

        Ok(schedule)
    }

    async fn receipt(&self, hash: H256) -> TrackerResult<Option<Receipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| TrackerError::TransientObservation(e.to_string()))?;

        Ok(receipt.map(|r| Receipt {
            block_number: r.block_number.map(|b| b.as_u64()),
        }))
    }

    async fn subscribe_blocks(&self) -> TrackerResult<BlockSubscription> {
        match &self.ws_provider {
            Some(ws) => Ok(self.spawn_ws_blocks(ws.clone())),
            None => Ok(self.spawn_polled_blocks()),
        }
    }

    async fn wait_for_confirmations(
        &self,
        hash: H256,
        confirmations: u64,
    ) -> TrackerResult<Receipt> {
        let receipt = PendingTransaction::new(hash, self.http())
            .interval(self.poll_interval)
            .confirmations(confirmations as usize)
            .await
            .map_err(|e| TrackerError::TransientObservation(e.to_string()))?
            .ok_or_else(|| {
                TrackerError::TransientObservation(format!(
                    "Transaction {:?} dropped from mempool",
                    hash
                ))
            })?;

        Ok(Receipt {
            block_number: receipt.block_number.map(|b| b.as_u64()),
        })
    }

    async fn block_number(&self) -> TrackerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(TrackerError::ChainConnection {
            chain_id: self.chain_id,
            message: "All providers failed".to_string(),
        })
    }
}
