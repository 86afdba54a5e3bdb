//! Ledger mutation descriptors

use crate::chain::FeeSchedule;

use ethers::abi::{self, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use ethers::utils::id;
use serde::Serialize;

/// DataStorage entry point used for on-chain records
const STORE_DATA_SIGNATURE: &str = "storeData(address,string)";

/// Fee fields a request may pin explicitly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeOverrides {
    Legacy {
        gas_price: U256,
    },
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl FeeOverrides {
    /// Fees a request should pin for the given market
    ///
    /// EIP-1559 when the node reports both 1559 fields, otherwise legacy.
    pub fn from_schedule(schedule: &FeeSchedule) -> Option<Self> {
        match (
            schedule.max_fee_per_gas,
            schedule.max_priority_fee_per_gas,
            schedule.gas_price,
        ) {
            (Some(max_fee_per_gas), Some(max_priority_fee_per_gas), _) => Some(Self::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            }),
            (_, _, Some(gas_price)) => Some(Self::Legacy { gas_price }),
            _ => None,
        }
    }
}

/// Immutable description of a ledger mutation
///
/// Only the fee fields, gas limit and nonce are ever replaced, and always by
/// building a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxRequest {
    to: Address,
    value: U256,
    data: Bytes,
    gas_limit: Option<U256>,
    nonce: Option<u64>,
    fees: Option<FeeOverrides>,
}

impl TxRequest {
    pub fn new(to: Address, value: U256, data: Bytes) -> Self {
        Self {
            to,
            value,
            data,
            gas_limit: None,
            nonce: None,
            fees: None,
        }
    }

    /// Value transfer carrying a UTF-8 message as calldata
    pub fn transfer_with_message(to: Address, value: U256, message: &str) -> Self {
        Self::new(to, value, Bytes::from(message.as_bytes().to_vec()))
    }

    /// `DataStorage.storeData(recipient, message)` call
    pub fn store_data(contract: Address, recipient: Address, message: &str, value: U256) -> Self {
        let mut data = id(STORE_DATA_SIGNATURE).to_vec();
        data.extend(abi::encode(&[
            Token::Address(recipient),
            Token::String(message.to_string()),
        ]));
        Self::new(contract, value, Bytes::from(data))
    }

    pub fn with_gas_limit(&self, gas_limit: U256) -> Self {
        Self {
            gas_limit: Some(gas_limit),
            ..self.clone()
        }
    }

    pub fn with_nonce(&self, nonce: u64) -> Self {
        Self {
            nonce: Some(nonce),
            ..self.clone()
        }
    }

    pub fn with_fees(&self, fees: FeeOverrides) -> Self {
        Self {
            fees: Some(fees),
            ..self.clone()
        }
    }

    pub fn to(&self) -> Address {
        self.to
    }

    pub fn value(&self) -> U256 {
        self.value
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn gas_limit(&self) -> Option<U256> {
        self.gas_limit
    }

    pub fn nonce(&self) -> Option<u64> {
        self.nonce
    }

    pub fn fees(&self) -> Option<FeeOverrides> {
        self.fees
    }

    /// Convert into an ethers transaction, legacy or EIP-1559 depending on the fees
    pub fn to_typed(&self, from: Address) -> TypedTransaction {
        match self.fees {
            Some(FeeOverrides::Legacy { gas_price }) => {
                let mut tx = TransactionRequest::new()
                    .from(from)
                    .to(self.to)
                    .value(self.value)
                    .data(self.data.clone())
                    .gas_price(gas_price);
                if let Some(gas) = self.gas_limit {
                    tx = tx.gas(gas);
                }
                if let Some(nonce) = self.nonce {
                    tx = tx.nonce(nonce);
                }
                TypedTransaction::Legacy(tx)
            }
            fees => {
                let mut tx = Eip1559TransactionRequest::new()
                    .from(from)
                    .to(self.to)
                    .value(self.value)
                    .data(self.data.clone());
                if let Some(FeeOverrides::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                }) = fees
                {
                    tx = tx
                        .max_fee_per_gas(max_fee_per_gas)
                        .max_priority_fee_per_gas(max_priority_fee_per_gas);
                }
                if let Some(gas) = self.gas_limit {
                    tx = tx.gas(gas);
                }
                if let Some(nonce) = self.nonce {
                    tx = tx.nonce(nonce);
                }
                TypedTransaction::Eip1559(tx)
            }
        }
    }
}
