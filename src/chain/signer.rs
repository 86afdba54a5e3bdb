//! Local-key signing capability over ethers-rs

use super::provider::fetch_fee_schedule;
use super::{TransactionHandle, TxSigner};
use crate::error::{TrackerError, TrackerResult};
use crate::tx::{FeeOverrides, TxRequest};

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer};
use tracing::{debug, info};

/// Signs with a local private key and broadcasts over HTTP
pub struct EthersSigner {
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
}

impl EthersSigner {
    /// Build from a provider and a private key read from `key_env`
    pub fn from_env(provider: Provider<Http>, chain_id: u64, key_env: &str) -> TrackerResult<Self> {
        let key = std::env::var(key_env).map_err(|_| {
            TrackerError::Wallet(format!("No wallet configured. Set {}", key_env))
        })?;

        Self::from_key(provider, chain_id, &key)
    }

    pub fn from_key(provider: Provider<Http>, chain_id: u64, key: &str) -> TrackerResult<Self> {
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| TrackerError::Wallet(format!("Invalid private key: {}", e)))?
            .with_chain_id(chain_id);

        info!("Signer initialized with wallet: {:?}", wallet.address());

        Ok(Self {
            client: SignerMiddleware::new(provider, wallet),
        })
    }
}

#[async_trait]
impl TxSigner for EthersSigner {
    fn address(&self) -> Address {
        self.client.address()
    }

    async fn estimate_gas(&self, request: &TxRequest) -> TrackerResult<U256> {
        let tx = request.to_typed(self.address());
        self.client
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| TrackerError::EstimationFailed(e.to_string()))
    }

    async fn send(&self, request: &TxRequest) -> TrackerResult<TransactionHandle> {
        // Without pinned fees ethers would assume EIP-1559 support
        let request = match request.fees() {
            Some(_) => request.clone(),
            None => {
                let chain_id = self.client.signer().chain_id();
                let schedule = fetch_fee_schedule(self.client.inner(), chain_id).await;
                match FeeOverrides::from_schedule(&schedule) {
                    Some(fees) => {
                        debug!(?fees, "Pinned fees from current schedule");
                        request.with_fees(fees)
                    }
                    None => {
                        return Err(TrackerError::SubmissionFailed(
                            "No fee data available to price transaction".to_string(),
                        ))
                    }
                }
            }
        };
        let mut tx = request.to_typed(self.address());

        // Fill before sending so the nonce is known for a later replacement
        self.client
            .fill_transaction(&mut tx, None)
            .await
            .map_err(|e| TrackerError::SubmissionFailed(e.to_string()))?;
        let nonce = tx.nonce().map(|n| n.as_u64());

        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| TrackerError::SubmissionFailed(e.to_string()))?;

        Ok(TransactionHandle {
            hash: pending.tx_hash(),
            nonce,
        })
    }
}
