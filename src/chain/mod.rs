//! Chain access
//!
//! The [`ChainClient`] trait is the only seam to the blockchain. Engine code
//! talks to it through [`ChainGateway`], which adds per-call timeouts,
//! bounded retries and confirmation polling.

pub mod gateway;
pub mod simulated;

#[cfg(feature = "evm")]
pub mod evm;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::secrets::SigningKey;

pub use gateway::{ChainGateway, ConfirmationPolicy, RetryPolicy};
pub use simulated::SimulatedChain;

#[cfg(feature = "evm")]
pub use evm::EvmChainClient;

/// Asset held or moved on chain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Asset {
    /// The chain's gas currency
    Native { symbol: String },
    /// Fungible token contract
    Token {
        symbol: String,
        contract: String,
        decimals: u32,
    },
}

impl Asset {
    pub fn symbol(&self) -> &str {
        match self {
            Asset::Native { symbol } | Asset::Token { symbol, .. } => symbol,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, Asset::Native { .. })
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Gas pricing for the transfers the engine sends
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSchedule {
    pub chain_id: u64,
    pub gas_price_gwei: Decimal,
    pub token_transfer_gas_limit: u64,
    pub native_transfer_gas_limit: u64,
}

impl FeeSchedule {
    /// Native cost of `gas_limit` units at the configured price
    pub fn fee_for(&self, gas_limit: u64) -> Decimal {
        Decimal::from(gas_limit) * self.gas_price_gwei / Decimal::from(1_000_000_000u64)
    }

    /// Native needed by a deposit wallet to send one token transfer
    pub fn token_transfer_fee(&self) -> Decimal {
        self.fee_for(self.token_transfer_gas_limit)
    }

    pub fn native_transfer_fee(&self) -> Decimal {
        self.fee_for(self.native_transfer_gas_limit)
    }

    /// Gas limit for a transfer of `asset`
    pub fn gas_limit_for(&self, asset: &Asset) -> u64 {
        if asset.is_native() {
            self.native_transfer_gas_limit
        } else {
            self.token_transfer_gas_limit
        }
    }
}

/// A transfer ready to be signed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransfer {
    pub chain_id: u64,
    pub from: String,
    pub to: String,
    pub asset: Asset,
    pub amount: Decimal,
    pub nonce: u64,
    pub gas_limit: u64,
    pub gas_price_gwei: Decimal,
}

impl UnsignedTransfer {
    /// Maximum native fee this transfer can burn
    pub fn max_fee(&self) -> Decimal {
        Decimal::from(self.gas_limit) * self.gas_price_gwei / Decimal::from(1_000_000_000u64)
    }
}

/// A signed transaction with its deterministic hash
///
/// The hash is known before broadcast, so callers persist it first.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedTransaction {
    pub hash: String,
    pub raw: Vec<u8>,
    pub transfer: UnsignedTransfer,
}

/// What the chain currently knows about a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// Not mined (or not known to this node)
    Unknown,
    /// Mined successfully with the given depth
    Included { block: u64, confirmations: u64 },
    /// Mined but execution failed
    Reverted { reason: String },
}

/// Terminal result of waiting on a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed { block: u64 },
    Reverted { reason: String },
    TimedOut,
}

impl TxOutcome {
    /// Turn anything but a confirmation into an error
    pub fn into_result(self, tx_hash: &str) -> Result<u64> {
        match self {
            TxOutcome::Confirmed { block } => Ok(block),
            TxOutcome::Reverted { reason } => Err(Error::Reverted(format!("{}: {}", tx_hash, reason))),
            TxOutcome::TimedOut => Err(Error::ConfirmationTimeout(tx_hash.to_string())),
        }
    }
}

/// Single-attempt chain operations
///
/// Implementations do no retrying of their own; [`ChainGateway`] owns
/// timeouts and retry policy.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Balance of `asset` held by `address`, in whole units
    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Decimal>;

    /// Native balance of `address`, in whole units
    async fn get_native_balance(&self, address: &str) -> Result<Decimal>;

    /// Next nonce for `address`, counting pending transactions
    async fn get_nonce(&self, address: &str) -> Result<u64>;

    /// Encode and sign a transfer
    fn sign(&self, key: &SigningKey, transfer: &UnsignedTransfer) -> Result<SignedTransaction>;

    /// Broadcast a signed transaction, returning its hash
    ///
    /// Re-broadcasting an already accepted transaction is not an error.
    async fn submit(&self, tx: &SignedTransaction) -> Result<String>;

    /// Look up a transaction receipt
    async fn receipt(&self, tx_hash: &str) -> Result<ReceiptStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fees() -> FeeSchedule {
        FeeSchedule {
            chain_id: 56,
            gas_price_gwei: dec!(3),
            token_transfer_gas_limit: 65_000,
            native_transfer_gas_limit: 21_000,
        }
    }

    #[test]
    fn test_fee_schedule() {
        let fees = fees();
        assert_eq!(fees.token_transfer_fee(), dec!(0.000195));
        assert_eq!(fees.native_transfer_fee(), dec!(0.000063));

        let native = Asset::Native { symbol: "BNB".into() };
        assert_eq!(fees.gas_limit_for(&native), 21_000);
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(TxOutcome::Confirmed { block: 7 }.into_result("0x1").unwrap(), 7);
        assert!(matches!(
            TxOutcome::TimedOut.into_result("0x1"),
            Err(Error::ConfirmationTimeout(_))
        ));
        assert!(matches!(
            TxOutcome::Reverted { reason: "oops".into() }.into_result("0x1"),
            Err(Error::Reverted(_))
        ));
    }
}
