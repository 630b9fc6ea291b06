//! Withdrawal processor
//!
//! Pays user withdrawals from the master wallet in FIFO order. Balance and
//! reserve checks run under the master submission lock. The transaction
//! hash is persisted before broadcast, and a request that already carries
//! a hash is never broadcast again.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chain::{ReceiptStatus, TxOutcome, UnsignedTransfer};
use crate::error::{Error, Result};
use crate::ledger::{WithdrawalRequest, WithdrawalStatus};
use crate::registry::normalize_address;

use super::context::EngineContext;

/// Result of draining the pending queue
#[derive(Debug, Clone, Default, Serialize)]
pub struct WithdrawalDrain {
    /// Requests that reached a new status, in processing order
    pub processed: Vec<WithdrawalRequest>,
    /// Request that stopped the drain on a funds guard
    pub blocked_on: Option<String>,
    pub errors: Vec<String>,
}

pub struct WithdrawalProcessor {
    ctx: Arc<EngineContext>,
}

fn lock_key(id: &str) -> String {
    format!("withdrawal:{}", id)
}

impl WithdrawalProcessor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Queue a new withdrawal with a generated id
    pub async fn create_withdrawal(
        &self,
        user_id: &str,
        to_address: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRequest> {
        self.insert(&Uuid::new_v4().to_string(), user_id, to_address, amount, None)
            .await
    }

    async fn insert(
        &self,
        id: &str,
        user_id: &str,
        to_address: &str,
        amount: Decimal,
        retry_of: Option<String>,
    ) -> Result<WithdrawalRequest> {
        let to_address = normalize_address(to_address)?;
        if amount <= Decimal::ZERO {
            return Err(Error::Configuration(format!(
                "Withdrawal amount must be positive, got {}",
                amount
            )));
        }
        if user_id.trim().is_empty() {
            return Err(Error::Configuration("user_id is empty".to_string()));
        }

        let now = Utc::now();
        let request = self
            .ctx
            .ledger
            .insert_withdrawal(WithdrawalRequest {
                id: id.to_string(),
                user_id: user_id.to_string(),
                to_address,
                amount,
                status: WithdrawalStatus::Pending,
                tx_hash: None,
                failure_reason: None,
                retry_of,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(withdrawal = %request.id, user = %request.user_id, amount = %request.amount, "Withdrawal queued");
        Ok(request)
    }

    pub async fn list_pending(&self) -> Vec<WithdrawalRequest> {
        self.ctx.ledger.pending_withdrawals().await
    }

    pub async fn list(&self, status: WithdrawalStatus) -> Vec<WithdrawalRequest> {
        self.ctx.ledger.withdrawals_with_status(status).await
    }

    /// Process one pending request
    ///
    /// Funds guards (`InsufficientFunds`, `InsufficientReserve`) leave the
    /// request pending. A broadcast or confirmation that cannot be resolved
    /// leaves it processing for reconciliation. Completed and failed
    /// requests are returned unchanged.
    pub async fn process(&self, id: &str) -> Result<WithdrawalRequest> {
        let _guard = self
            .ctx
            .locks
            .try_acquire(&lock_key(id))
            .ok_or_else(|| Error::WithdrawalBusy(id.to_string()))?;

        let request = self.ctx.ledger.get_withdrawal(id).await?;
        match request.status {
            WithdrawalStatus::Pending => {}
            WithdrawalStatus::Processing => return Err(Error::WithdrawalBusy(id.to_string())),
            WithdrawalStatus::Completed | WithdrawalStatus::Failed => return Ok(request),
        }

        let master = self.ctx.registry.master_config().await?;
        let settings = &self.ctx.settings;
        let fees = &settings.fees;

        let slot = self.ctx.submitter.reserve(&master.address).await?;

        let balance = self
            .ctx
            .chain
            .get_balance(&master.address, &settings.asset)
            .await?;
        let spendable = balance - settings.withdrawal_reserve;
        if request.amount > spendable {
            warn!(
                withdrawal = %id,
                amount = %request.amount,
                spendable = %spendable,
                "Withdrawal deferred: master balance too low"
            );
            return Err(Error::InsufficientFunds {
                available: spendable,
                required: request.amount,
            });
        }

        let native = self.ctx.chain.get_native_balance(&master.address).await?;
        let fee = fees.fee_for(fees.gas_limit_for(&settings.asset));
        let native_available = native - master.min_reserve;
        if native_available < fee {
            warn!(withdrawal = %id, "Withdrawal deferred: gas would breach master reserve");
            return Err(Error::InsufficientReserve {
                available: native_available,
                required: fee,
            });
        }

        let signed = slot.sign(
            &master.key_handle,
            UnsignedTransfer {
                chain_id: fees.chain_id,
                from: master.address.clone(),
                to: request.to_address.clone(),
                asset: settings.asset.clone(),
                amount: request.amount,
                nonce: slot.nonce(),
                gas_limit: fees.gas_limit_for(&settings.asset),
                gas_price_gwei: fees.gas_price_gwei,
            },
        )?;

        self.ctx
            .ledger
            .update_withdrawal(id, WithdrawalStatus::Processing, Some(signed.hash.clone()), None)
            .await?;

        match slot.broadcast(&signed).await {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                error!(withdrawal = %id, tx_hash = %signed.hash, "Broadcast unresolved, left processing: {}", e);
                return Err(e);
            }
            Err(e) => {
                error!(withdrawal = %id, "Withdrawal rejected: {}", e);
                return self
                    .ctx
                    .ledger
                    .update_withdrawal(id, WithdrawalStatus::Failed, None, Some(e.to_string()))
                    .await;
            }
        }

        match self
            .ctx
            .chain
            .wait_for_confirmation(&signed.hash, settings.confirmation_timeout)
            .await?
        {
            TxOutcome::Confirmed { block } => {
                info!(
                    withdrawal = %id,
                    tx_hash = %signed.hash,
                    block,
                    "Withdrawal completed: {} {} to {}",
                    request.amount,
                    settings.asset,
                    request.to_address
                );
                self.ctx
                    .ledger
                    .update_withdrawal(id, WithdrawalStatus::Completed, None, None)
                    .await
            }
            TxOutcome::Reverted { reason } => {
                self.ctx
                    .ledger
                    .update_withdrawal(
                        id,
                        WithdrawalStatus::Failed,
                        None,
                        Some(format!("withdrawal reverted: {}", reason)),
                    )
                    .await
            }
            TxOutcome::TimedOut => {
                warn!(withdrawal = %id, tx_hash = %signed.hash, "Confirmation timed out, left processing");
                Err(Error::ConfirmationTimeout(signed.hash))
            }
        }
    }

    /// Drain the pending queue in FIFO order
    ///
    /// Stops at the first request that hits a funds guard so later requests
    /// cannot overtake it.
    pub async fn process_pending(&self) -> WithdrawalDrain {
        let mut drain = WithdrawalDrain::default();

        for request in self.list_pending().await {
            match self.process(&request.id).await {
                Ok(processed) => drain.processed.push(processed),
                Err(e) if e.is_funds_guard() => {
                    info!(withdrawal = %request.id, "Withdrawal queue paused: {}", e);
                    drain.blocked_on = Some(request.id);
                    break;
                }
                Err(Error::WithdrawalBusy(_)) => {}
                Err(e) => {
                    warn!(withdrawal = %request.id, "Withdrawal processing error: {}", e);
                    drain.errors.push(format!("{}: {}", request.id, e));
                }
            }
        }

        drain
    }

    /// Create-or-verify a request by id, process it, return the tx hash
    ///
    /// Calling again with the same arguments after completion returns the
    /// original hash without sending anything.
    pub async fn submit_withdrawal(
        &self,
        id: &str,
        to_address: &str,
        amount: Decimal,
        user_id: &str,
    ) -> Result<String> {
        let to = normalize_address(to_address)?;

        match self.ctx.ledger.get_withdrawal(id).await {
            Ok(existing) => {
                let mismatch = if existing.to_address != to {
                    Some(format!("destination {} != {}", to, existing.to_address))
                } else if existing.amount != amount {
                    Some(format!("amount {} != {}", amount, existing.amount))
                } else if existing.user_id != user_id {
                    Some(format!("user {} != {}", user_id, existing.user_id))
                } else {
                    None
                };
                if let Some(reason) = mismatch {
                    return Err(Error::WithdrawalMismatch {
                        id: id.to_string(),
                        reason,
                    });
                }
            }
            Err(Error::WithdrawalNotFound(_)) => {
                self.insert(id, user_id, &to, amount, None).await?;
            }
            Err(e) => return Err(e),
        }

        let request = self.process(id).await?;
        match request.status {
            WithdrawalStatus::Completed => request
                .tx_hash
                .ok_or_else(|| Error::Internal(format!("Completed withdrawal {} has no hash", id))),
            WithdrawalStatus::Failed => Err(Error::Reverted(
                request
                    .failure_reason
                    .unwrap_or_else(|| "withdrawal failed".to_string()),
            )),
            status => Err(Error::Internal(format!(
                "Withdrawal {} unexpectedly {}",
                id, status
            ))),
        }
    }

    /// Re-queue a failed request as a new one
    pub async fn retry_failed(&self, id: &str) -> Result<WithdrawalRequest> {
        let original = self.ctx.ledger.get_withdrawal(id).await?;
        if original.status != WithdrawalStatus::Failed {
            return Err(Error::WithdrawalMismatch {
                id: id.to_string(),
                reason: format!("only failed withdrawals can be retried, status is {}", original.status),
            });
        }

        // A failed row may still have a mined transaction (unresolved after restart)
        if let Some(hash) = &original.tx_hash {
            if let ReceiptStatus::Included { .. } = self.ctx.chain.receipt(hash).await? {
                return Err(Error::WithdrawalMismatch {
                    id: id.to_string(),
                    reason: format!("transaction {} was mined; refusing to pay twice", hash),
                });
            }
        }

        self.insert(
            &Uuid::new_v4().to_string(),
            &original.user_id,
            &original.to_address,
            original.amount,
            Some(original.id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::testing::{fixture, fixture_with, MASTER, USER_ADDR};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_withdrawal_completes() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(1000));
        let processor = WithdrawalProcessor::new(fx.ctx.clone());

        let hash = processor
            .submit_withdrawal("wd-1", USER_ADDR, dec!(250), "alice")
            .await
            .unwrap();

        let request = fx.ctx.ledger.get_withdrawal("wd-1").await.unwrap();
        assert_eq!(request.status, WithdrawalStatus::Completed);
        assert_eq!(request.tx_hash.as_deref(), Some(hash.as_str()));
        assert_eq!(fx.chain.token_balance_of(USER_ADDR), dec!(250));

        // Same id again: no second transfer
        let again = processor
            .submit_withdrawal("wd-1", USER_ADDR, dec!(250), "alice")
            .await
            .unwrap();
        assert_eq!(again, hash);
        assert_eq!(fx.chain.submissions_from(MASTER).len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_pending() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(300));
        let processor = WithdrawalProcessor::new(fx.ctx.clone());

        let err = processor
            .submit_withdrawal("wd-big", USER_ADDR, dec!(500), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds { .. }));

        let request = fx.ctx.ledger.get_withdrawal("wd-big").await.unwrap();
        assert_eq!(request.status, WithdrawalStatus::Pending);
        assert!(request.tx_hash.is_none());
        assert!(fx.chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_reserve_is_kept() {
        let fx = fixture_with(|s| s.withdrawal_reserve = dec!(100)).await;
        fx.chain.set_token_balance(MASTER, dec!(300));
        let processor = WithdrawalProcessor::new(fx.ctx.clone());

        let request = processor.create_withdrawal("alice", USER_ADDR, dec!(250)).await.unwrap();
        assert!(matches!(
            processor.process(&request.id).await,
            Err(Error::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn test_mismatched_resubmission_rejected() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(1000));
        let processor = WithdrawalProcessor::new(fx.ctx.clone());
        processor
            .submit_withdrawal("wd-1", USER_ADDR, dec!(10), "alice")
            .await
            .unwrap();

        let err = processor
            .submit_withdrawal("wd-1", USER_ADDR, dec!(11), "alice")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::WithdrawalMismatch { .. }));
    }

    #[tokio::test]
    async fn test_fifo_drain_stops_at_first_shortfall() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(100));
        let processor = WithdrawalProcessor::new(fx.ctx.clone());

        let first = processor.create_withdrawal("alice", USER_ADDR, dec!(60)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = processor.create_withdrawal("bob", USER_ADDR, dec!(60)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let third = processor.create_withdrawal("carol", USER_ADDR, dec!(10)).await.unwrap();

        let drain = processor.process_pending().await;
        assert_eq!(drain.processed.len(), 1);
        assert_eq!(drain.processed[0].id, first.id);
        assert_eq!(drain.blocked_on.as_deref(), Some(second.id.as_str()));

        // The smaller later request did not overtake
        let third = fx.ctx.ledger.get_withdrawal(&third.id).await.unwrap();
        assert_eq!(third.status, WithdrawalStatus::Pending);
    }

    #[tokio::test]
    async fn test_rejected_broadcast_fails_and_can_be_retried() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(1000));
        fx.chain.revert_submissions_from(MASTER);
        let processor = WithdrawalProcessor::new(fx.ctx.clone());

        let request = processor.create_withdrawal("alice", USER_ADDR, dec!(5)).await.unwrap();
        let failed = processor.process(&request.id).await.unwrap();
        assert_eq!(failed.status, WithdrawalStatus::Failed);
        assert!(failed.failure_reason.unwrap().contains("reverted"));

        // Failed requests are left alone by later passes
        let unchanged = processor.process(&request.id).await.unwrap();
        assert_eq!(unchanged.status, WithdrawalStatus::Failed);

        let retry = processor.retry_failed(&request.id).await.unwrap();
        assert_eq!(retry.retry_of.as_deref(), Some(request.id.as_str()));
        assert_eq!(retry.status, WithdrawalStatus::Pending);

        assert!(processor.retry_failed(&retry.id).await.is_err());
    }

    #[tokio::test]
    async fn test_retry_refused_when_transaction_mined() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(1000));
        let processor = WithdrawalProcessor::new(fx.ctx.clone());
        let request = processor.create_withdrawal("alice", USER_ADDR, dec!(5)).await.unwrap();

        // Paid on chain, but the row was failed during recovery
        let master = fx.ctx.registry.master_config().await.unwrap();
        let hash = fx
            .ctx
            .submitter
            .transfer(&master, USER_ADDR, &fx.ctx.settings.asset, dec!(5), &fx.ctx.settings.fees)
            .await
            .unwrap();
        let ledger = &fx.ctx.ledger;
        ledger
            .update_withdrawal(&request.id, WithdrawalStatus::Processing, Some(hash), None)
            .await
            .unwrap();
        ledger
            .update_withdrawal(&request.id, WithdrawalStatus::Failed, None, Some("lost".into()))
            .await
            .unwrap();

        assert!(matches!(
            processor.retry_failed(&request.id).await,
            Err(Error::WithdrawalMismatch { .. })
        ));
        assert_eq!(fx.chain.token_balance_of(USER_ADDR), dec!(5));
    }

    #[tokio::test]
    async fn test_locked_request_is_busy() {
        let fx = fixture().await;
        let processor = WithdrawalProcessor::new(fx.ctx.clone());
        let request = processor.create_withdrawal("alice", USER_ADDR, dec!(5)).await.unwrap();

        let _held = fx.ctx.locks.try_acquire(&lock_key(&request.id)).unwrap();
        assert!(matches!(
            processor.process(&request.id).await,
            Err(Error::WithdrawalBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let fx = fixture().await;
        let processor = WithdrawalProcessor::new(fx.ctx.clone());
        assert!(processor.create_withdrawal("alice", "nope", dec!(5)).await.is_err());
        assert!(processor.create_withdrawal("alice", USER_ADDR, dec!(0)).await.is_err());
    }
}
