//! Simulated chain
//!
//! In-memory ledger of native and token balances with nonces, receipts and
//! failure injection. Backs dry runs and the engine tests. Every receipt
//! lookup mines one block so confirmation depth grows while callers poll.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::secrets::SigningKey;

use super::{Asset, ChainClient, ReceiptStatus, SignedTransaction, UnsignedTransfer};

/// BSC-USD contract, used as the default simulated token
const DEFAULT_TOKEN_CONTRACT: &str = "0x55d398326f99059ff775485246999027b3197955";

/// A transaction the simulated chain accepted
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedTx {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub asset: Asset,
    pub amount: Decimal,
    pub nonce: u64,
}

#[derive(Debug, Clone)]
struct SimTx {
    block: Option<u64>,
    revert_reason: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SimEnvelope {
    transfer: UnsignedTransfer,
    signature: String,
}

#[derive(Default)]
struct SimState {
    block: u64,
    native: HashMap<String, Decimal>,
    tokens: HashMap<(String, String), Decimal>,
    nonces: HashMap<String, u64>,
    txs: HashMap<String, SimTx>,
    submissions: Vec<SubmittedTx>,
    failing_balances: HashSet<String>,
    reverting_senders: HashSet<String>,
    stalled_senders: HashSet<String>,
    fail_calls: u32,
}

impl SimState {
    fn take_injected_failure(&mut self) -> Result<()> {
        if self.fail_calls > 0 {
            self.fail_calls -= 1;
            return Err(Error::Network("injected failure".to_string()));
        }
        Ok(())
    }

    fn native_of(&self, address: &str) -> Decimal {
        self.native.get(address).copied().unwrap_or_default()
    }

    fn token_of(&self, address: &str, contract: &str) -> Decimal {
        self.tokens
            .get(&(address.to_string(), contract.to_string()))
            .copied()
            .unwrap_or_default()
    }
}

/// In-memory chain backend
pub struct SimulatedChain {
    native: Asset,
    token: Asset,
    state: Mutex<SimState>,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    /// Chain with BNB as native currency and BSC-USD as the token
    pub fn new() -> Self {
        Self::with_assets(
            Asset::Native {
                symbol: "BNB".to_string(),
            },
            Asset::Token {
                symbol: "USDT".to_string(),
                contract: DEFAULT_TOKEN_CONTRACT.to_string(),
                decimals: 18,
            },
        )
    }

    pub fn with_assets(native: Asset, token: Asset) -> Self {
        Self {
            native,
            token,
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn token_contract(asset: &Asset) -> Option<String> {
        match asset {
            Asset::Token { contract, .. } => Some(contract.to_lowercase()),
            Asset::Native { .. } => None,
        }
    }

    pub fn native(&self) -> Asset {
        self.native.clone()
    }

    pub fn token(&self) -> Asset {
        self.token.clone()
    }

    // ------------------------------------------------------------------
    // Test and dry-run controls
    // ------------------------------------------------------------------

    pub fn set_native_balance(&self, address: &str, amount: Decimal) {
        self.lock().native.insert(address.to_lowercase(), amount);
    }

    /// Set the balance of the configured token
    pub fn set_token_balance(&self, address: &str, amount: Decimal) {
        if let Some(contract) = Self::token_contract(&self.token) {
            self.lock()
                .tokens
                .insert((address.to_lowercase(), contract), amount);
        }
    }

    /// Add to the configured token balance, as an incoming deposit would
    pub fn credit_token(&self, address: &str, amount: Decimal) {
        if let Some(contract) = Self::token_contract(&self.token) {
            *self
                .lock()
                .tokens
                .entry((address.to_lowercase(), contract))
                .or_default() += amount;
        }
    }

    pub fn native_balance_of(&self, address: &str) -> Decimal {
        self.lock().native_of(&address.to_lowercase())
    }

    pub fn token_balance_of(&self, address: &str) -> Decimal {
        match Self::token_contract(&self.token) {
            Some(contract) => self.lock().token_of(&address.to_lowercase(), &contract),
            None => Decimal::ZERO,
        }
    }

    /// Balance queries for `address` fail with a network error
    pub fn fail_balance_queries(&self, address: &str) {
        self.lock().failing_balances.insert(address.to_lowercase());
    }

    /// The next `n` calls of any kind fail with a network error
    pub fn fail_next_calls(&self, n: u32) {
        self.lock().fail_calls = n;
    }

    /// Transactions from `address` are mined but revert
    pub fn revert_submissions_from(&self, address: &str) {
        self.lock().reverting_senders.insert(address.to_lowercase());
    }

    /// Transactions from `address` are accepted but never mined
    pub fn stall_submissions_from(&self, address: &str) {
        self.lock().stalled_senders.insert(address.to_lowercase());
    }

    /// Every transaction accepted so far, in order
    pub fn submissions(&self) -> Vec<SubmittedTx> {
        self.lock().submissions.clone()
    }

    pub fn submissions_from(&self, address: &str) -> Vec<SubmittedTx> {
        let address = address.to_lowercase();
        self.lock()
            .submissions
            .iter()
            .filter(|tx| tx.from == address)
            .cloned()
            .collect()
    }

    fn digest_hex(parts: &[&[u8]]) -> String {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Decimal> {
        let address = address.to_lowercase();
        let mut state = self.lock();
        state.take_injected_failure()?;
        if state.failing_balances.contains(&address) {
            return Err(Error::Network(format!("balance query failed for {}", address)));
        }
        Ok(match Self::token_contract(asset) {
            Some(contract) => state.token_of(&address, &contract),
            None => state.native_of(&address),
        })
    }

    async fn get_native_balance(&self, address: &str) -> Result<Decimal> {
        let native = self.native.clone();
        self.get_balance(address, &native).await
    }

    async fn get_nonce(&self, address: &str) -> Result<u64> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        Ok(state
            .nonces
            .get(&address.to_lowercase())
            .copied()
            .unwrap_or(0))
    }

    fn sign(&self, key: &SigningKey, transfer: &UnsignedTransfer) -> Result<SignedTransaction> {
        let payload = serde_json::to_vec(transfer)?;
        let signature = Self::digest_hex(&[key.expose_secret(), &payload]);
        let raw = serde_json::to_vec(&SimEnvelope {
            transfer: transfer.clone(),
            signature,
        })?;
        let hash = format!("0x{}", Self::digest_hex(&[&raw]));

        Ok(SignedTransaction {
            hash,
            raw,
            transfer: transfer.clone(),
        })
    }

    async fn submit(&self, tx: &SignedTransaction) -> Result<String> {
        let envelope: SimEnvelope = serde_json::from_slice(&tx.raw)?;
        let transfer = envelope.transfer;
        let from = transfer.from.to_lowercase();
        let to = transfer.to.to_lowercase();

        let mut state = self.lock();
        state.take_injected_failure()?;

        if state.txs.contains_key(&tx.hash) {
            return Ok(tx.hash.clone());
        }

        let expected = state.nonces.get(&from).copied().unwrap_or(0);
        if transfer.nonce != expected {
            return Err(Error::Reverted(format!(
                "nonce mismatch for {}: expected {}, got {}",
                from, expected, transfer.nonce
            )));
        }

        let fee = transfer.max_fee();
        let native_needed = if transfer.asset.is_native() {
            fee + transfer.amount
        } else {
            fee
        };
        let native_available = state.native_of(&from);
        if native_available < native_needed {
            return Err(Error::Reverted(format!(
                "insufficient funds for gas * price + value: have {}, need {}",
                native_available, native_needed
            )));
        }

        state.nonces.insert(from.clone(), expected + 1);
        state.native.insert(from.clone(), native_available - fee);

        let stalled = state.stalled_senders.contains(&from);
        let mut revert_reason = if state.reverting_senders.contains(&from) {
            Some("execution reverted".to_string())
        } else {
            None
        };

        if !stalled && revert_reason.is_none() {
            match Self::token_contract(&transfer.asset) {
                Some(contract) => {
                    let from_balance = state.token_of(&from, &contract);
                    if from_balance < transfer.amount {
                        revert_reason = Some("transfer amount exceeds balance".to_string());
                    } else {
                        state
                            .tokens
                            .insert((from.clone(), contract.clone()), from_balance - transfer.amount);
                        *state.tokens.entry((to.clone(), contract)).or_default() += transfer.amount;
                    }
                }
                None => {
                    let from_native = state.native_of(&from);
                    state
                        .native
                        .insert(from.clone(), from_native - transfer.amount);
                    *state.native.entry(to.clone()).or_default() += transfer.amount;
                }
            }
        }

        let block = if stalled {
            None
        } else {
            state.block += 1;
            Some(state.block)
        };
        state.txs.insert(
            tx.hash.clone(),
            SimTx {
                block,
                revert_reason,
            },
        );
        state.submissions.push(SubmittedTx {
            hash: tx.hash.clone(),
            from,
            to,
            asset: transfer.asset.clone(),
            amount: transfer.amount,
            nonce: transfer.nonce,
        });

        debug!(tx_hash = %tx.hash, nonce = transfer.nonce, "Simulated transaction accepted");
        Ok(tx.hash.clone())
    }

    async fn receipt(&self, tx_hash: &str) -> Result<ReceiptStatus> {
        let mut state = self.lock();
        state.take_injected_failure()?;
        state.block += 1;
        let current = state.block;

        Ok(match state.txs.get(tx_hash) {
            None => ReceiptStatus::Unknown,
            Some(SimTx { block: None, .. }) => ReceiptStatus::Unknown,
            Some(SimTx {
                revert_reason: Some(reason),
                ..
            }) => ReceiptStatus::Reverted {
                reason: reason.clone(),
            },
            Some(SimTx {
                block: Some(block), ..
            }) => ReceiptStatus::Included {
                block: *block,
                confirmations: current - block + 1,
            },
        })
    }
}
