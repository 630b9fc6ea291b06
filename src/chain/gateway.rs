//! Chain gateway
//!
//! Wraps a [`ChainClient`] with a per-call timeout and exponential backoff
//! for transient failures. Only `Network` and `Timeout` errors are retried;
//! everything else surfaces on the first attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backoff::{future::retry, ExponentialBackoff};
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::secrets::SigningKey;

use super::{Asset, ChainClient, ReceiptStatus, SignedTransaction, TxOutcome, UnsignedTransfer};

/// Timeout and retry bounds for single chain calls
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub call_timeout: Duration,
    pub base_delay: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            base_delay: Duration::from_millis(250),
            max_elapsed: Duration::from_secs(5),
        }
    }
}

/// How deep a transaction must be before it counts as final
#[derive(Debug, Clone)]
pub struct ConfirmationPolicy {
    pub confirmations: u64,
    pub poll_interval: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            confirmations: 3,
            poll_interval: Duration::from_secs(3),
        }
    }
}

/// Retrying, timeout-bounded access to a chain backend
#[derive(Clone)]
pub struct ChainGateway {
    client: Arc<dyn ChainClient>,
    retry: RetryPolicy,
    confirmation: ConfirmationPolicy,
}

impl ChainGateway {
    pub fn new(client: Arc<dyn ChainClient>, retry: RetryPolicy, confirmation: ConfirmationPolicy) -> Self {
        Self {
            client,
            retry,
            confirmation,
        }
    }

    /// Backend name
    pub fn backend(&self) -> &str {
        self.client.name()
    }

    pub fn confirmations(&self) -> u64 {
        self.confirmation.confirmations
    }

    /// Run one chain call with timeout and bounded retries
    async fn call<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.retry.call_timeout;
        let backoff = ExponentialBackoff {
            initial_interval: self.retry.base_delay,
            max_interval: self.retry.base_delay * 4,
            max_elapsed_time: Some(self.retry.max_elapsed),
            ..Default::default()
        };
        let f = &f;

        retry(backoff, || {
            let attempt = f();
            async move {
                let result = match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(timeout.as_millis() as u64)),
                };
                match result {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() => {
                        warn!("Retryable chain error in {}: {}", op, e);
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await
    }

    pub async fn get_balance(&self, address: &str, asset: &Asset) -> Result<Decimal> {
        self.call("get_balance", || self.client.get_balance(address, asset))
            .await
    }

    pub async fn get_native_balance(&self, address: &str) -> Result<Decimal> {
        self.call("get_native_balance", || self.client.get_native_balance(address))
            .await
    }

    pub async fn get_nonce(&self, address: &str) -> Result<u64> {
        self.call("get_nonce", || self.client.get_nonce(address)).await
    }

    /// Sign locally; no I/O, so no retry
    pub fn sign(&self, key: &SigningKey, transfer: &UnsignedTransfer) -> Result<SignedTransaction> {
        self.client.sign(key, transfer)
    }

    /// Broadcast; safe to retry because the signed bytes are fixed
    pub async fn submit(&self, tx: &SignedTransaction) -> Result<String> {
        let hash = self.call("submit", || self.client.submit(tx)).await?;
        debug!(tx_hash = %hash, backend = %self.backend(), "Transaction broadcast");
        Ok(hash)
    }

    pub async fn receipt(&self, tx_hash: &str) -> Result<ReceiptStatus> {
        self.call("receipt", || self.client.receipt(tx_hash)).await
    }

    /// Poll until the transaction is final, reverted, or `timeout` elapses
    ///
    /// Transient receipt errors are logged and polling continues.
    pub async fn wait_for_confirmation(&self, tx_hash: &str, timeout: Duration) -> Result<TxOutcome> {
        let deadline = Instant::now() + timeout;
        let required = self.confirmation.confirmations.max(1);

        loop {
            match self.receipt(tx_hash).await {
                Ok(ReceiptStatus::Included {
                    block,
                    confirmations,
                }) if confirmations >= required => {
                    debug!(tx_hash = %tx_hash, block, confirmations, "Transaction confirmed");
                    return Ok(TxOutcome::Confirmed { block });
                }
                Ok(ReceiptStatus::Reverted { reason }) => {
                    warn!(tx_hash = %tx_hash, "Transaction reverted: {}", reason);
                    return Ok(TxOutcome::Reverted { reason });
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!(tx_hash = %tx_hash, "Receipt lookup failed, still polling: {}", e);
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(tx_hash = %tx_hash, "Confirmation timed out after {:?}", timeout);
                return Ok(TxOutcome::TimedOut);
            }
            tokio::time::sleep(self.confirmation.poll_interval.min(deadline - now)).await;
        }
    }

    /// Wait for confirmation and map failures to errors
    pub async fn ensure_confirmed(&self, tx_hash: &str, timeout: Duration) -> Result<u64> {
        self.wait_for_confirmation(tx_hash, timeout)
            .await?
            .into_result(tx_hash)
    }
}
