//! Startup reconciliation
//!
//! Resolves sweeps, withdrawals and gas top-ups a crash left mid-flight by
//! asking the chain about their recorded transaction hashes. Nothing is ever
//! re-broadcast from here.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::chain::ReceiptStatus;
use crate::error::Result;
use crate::ledger::{
    DepositStatus, DepositUpdate, GasDistributionStatus, SweepOperation, SweepStatus, SweepUpdate,
    WithdrawalStatus,
};

use super::context::EngineContext;

const UNRESOLVED: &str = "unresolved after restart; manual review";

/// What reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub sweeps_completed: usize,
    pub sweeps_failed: usize,
    pub withdrawals_completed: usize,
    pub withdrawals_failed: usize,
    /// Failed withdrawals whose transaction the chain does not know
    pub unresolved_withdrawals: Vec<String>,
    /// Pending gas top-ups the chain has since mined or reverted
    pub gas_distributions_settled: usize,
}

pub struct Recovery {
    ctx: Arc<EngineContext>,
}

impl Recovery {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn reconcile(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for op in self.ctx.ledger.active_sweeps().await {
            // A live sweep holds the wallet lock; leave it alone
            let Some(_guard) = self.ctx.locks.try_acquire(&op.wallet) else {
                continue;
            };
            match self.reconcile_sweep(&op).await? {
                SweepStatus::Completed => report.sweeps_completed += 1,
                _ => report.sweeps_failed += 1,
            }
        }

        for request in self
            .ctx
            .ledger
            .withdrawals_with_status(WithdrawalStatus::Processing)
            .await
        {
            let Some(_guard) = self
                .ctx
                .locks
                .try_acquire(&format!("withdrawal:{}", request.id))
            else {
                continue;
            };

            let Some(hash) = request.tx_hash.clone() else {
                self.ctx
                    .ledger
                    .update_withdrawal(
                        &request.id,
                        WithdrawalStatus::Failed,
                        None,
                        Some("interrupted before broadcast".to_string()),
                    )
                    .await?;
                report.withdrawals_failed += 1;
                continue;
            };

            match self.ctx.chain.receipt(&hash).await? {
                ReceiptStatus::Included { .. } => {
                    self.ctx
                        .ledger
                        .update_withdrawal(&request.id, WithdrawalStatus::Completed, None, None)
                        .await?;
                    report.withdrawals_completed += 1;
                }
                ReceiptStatus::Reverted { reason } => {
                    self.ctx
                        .ledger
                        .update_withdrawal(
                            &request.id,
                            WithdrawalStatus::Failed,
                            None,
                            Some(format!("withdrawal reverted: {}", reason)),
                        )
                        .await?;
                    report.withdrawals_failed += 1;
                }
                ReceiptStatus::Unknown => {
                    self.ctx
                        .ledger
                        .update_withdrawal(
                            &request.id,
                            WithdrawalStatus::Failed,
                            None,
                            Some(UNRESOLVED.to_string()),
                        )
                        .await?;
                    warn!(
                        withdrawal = %request.id,
                        tx_hash = %hash,
                        "Withdrawal transaction unknown after restart; needs manual review"
                    );
                    report.withdrawals_failed += 1;
                    report.unresolved_withdrawals.push(request.id);
                }
            }
        }

        for gas in self.ctx.ledger.pending_gas_distributions().await {
            let status = match self.ctx.chain.receipt(&gas.tx_hash).await? {
                ReceiptStatus::Included { .. } => GasDistributionStatus::Confirmed,
                ReceiptStatus::Reverted { .. } => GasDistributionStatus::Failed,
                // Still in flight or dropped; stays pending and counted as unconfirmed
                ReceiptStatus::Unknown => continue,
            };
            self.ctx
                .ledger
                .set_gas_distribution_status(&gas.id, status)
                .await?;
            report.gas_distributions_settled += 1;
        }

        info!(
            "Recovery complete: {} sweeps completed, {} sweeps failed, {} withdrawals completed, {} withdrawals failed, {} unresolved, {} gas top-ups settled",
            report.sweeps_completed,
            report.sweeps_failed,
            report.withdrawals_completed,
            report.withdrawals_failed,
            report.unresolved_withdrawals.len(),
            report.gas_distributions_settled
        );
        Ok(report)
    }

    async fn reconcile_sweep(&self, op: &SweepOperation) -> Result<SweepStatus> {
        let deposits = self.ctx.ledger.open_deposits(&op.wallet).await;

        let receipt = match &op.sweep_tx_hash {
            Some(hash) => Some(self.ctx.chain.receipt(hash).await?),
            None => None,
        };

        let (status, deposit_status, reason) = match receipt {
            Some(ReceiptStatus::Included { .. }) => (SweepStatus::Completed, DepositStatus::Swept, None),
            Some(ReceiptStatus::Reverted { reason }) => (
                SweepStatus::Failed,
                DepositStatus::Failed,
                Some(format!("sweep reverted: {}", reason)),
            ),
            Some(ReceiptStatus::Unknown) => (
                SweepStatus::Failed,
                DepositStatus::Failed,
                Some(UNRESOLVED.to_string()),
            ),
            None => {
                // Never broadcast: deposits stay open for the next pass
                let reason = "interrupted before broadcast".to_string();
                for deposit in &deposits {
                    self.ctx
                        .ledger
                        .update_deposit(
                            &deposit.id,
                            deposit.status,
                            DepositUpdate {
                                failure_reason: Some(reason.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                self.ctx
                    .ledger
                    .update_sweep(
                        &op.id,
                        SweepStatus::Failed,
                        SweepUpdate {
                            error: Some(reason),
                            ..Default::default()
                        },
                    )
                    .await?;
                warn!(wallet = %op.wallet, sweep = %op.id, "Interrupted sweep marked failed");
                return Ok(SweepStatus::Failed);
            }
        };

        for deposit in &deposits {
            self.ctx
                .ledger
                .update_deposit(
                    &deposit.id,
                    deposit_status,
                    DepositUpdate {
                        sweep_tx_hash: op.sweep_tx_hash.clone(),
                        failure_reason: reason.clone(),
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.ctx
            .ledger
            .update_sweep(
                &op.id,
                status,
                SweepUpdate {
                    error: reason,
                    ..Default::default()
                },
            )
            .await?;

        if status == SweepStatus::Completed {
            let balance = self
                .ctx
                .chain
                .get_balance(&op.wallet, &self.ctx.settings.asset)
                .await?;
            self.ctx.registry.set_last_balance(&op.wallet, balance).await?;
        }

        info!(wallet = %op.wallet, sweep = %op.id, status = %status, "Reconciled interrupted sweep");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ChainClient, UnsignedTransfer};
    use crate::engine::context::testing::{fixture, Fixture, MASTER, USER_ADDR, W1};
    use crate::ledger::{SweepTrigger, WithdrawalRequest};
    use crate::secrets::KeySource;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Broadcast a real sweep transfer on the simulated chain, bypassing the executor
    async fn broadcast_sweep(fx: &Fixture, amount: Decimal) -> String {
        fx.chain.set_native_balance(W1, dec!(0.01));
        let transfer = UnsignedTransfer {
            chain_id: 56,
            from: W1.to_string(),
            to: MASTER.to_string(),
            asset: fx.chain.token(),
            amount,
            nonce: 0,
            gas_limit: 65_000,
            gas_price_gwei: dec!(3),
        };
        let key = fx.keys.load("h1111").unwrap();
        let signed = fx.chain.sign(&key, &transfer).unwrap();
        fx.chain.submit(&signed).await.unwrap()
    }

    async fn in_progress_sweep(fx: &Fixture, hash: Option<String>) -> SweepOperation {
        let op = fx.ctx.ledger.open_sweep(W1, SweepTrigger::Scheduled).await.unwrap();
        fx.ctx
            .ledger
            .update_sweep(
                &op.id,
                SweepStatus::InProgress,
                SweepUpdate {
                    amount: Some(dec!(150)),
                    sweep_tx_hash: hash,
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_mined_sweep_is_completed() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        let deposit = fx.ctx.ledger.record_deposit(W1, dec!(150), "USDT").await.unwrap();
        let hash = broadcast_sweep(&fx, dec!(150)).await;
        let op = in_progress_sweep(&fx, Some(hash)).await;

        let report = Recovery::new(fx.ctx.clone()).reconcile().await.unwrap();
        assert_eq!(report.sweeps_completed, 1);

        assert_eq!(
            fx.ctx.ledger.get_sweep(&op.id).await.unwrap().status,
            SweepStatus::Completed
        );
        assert_eq!(
            fx.ctx.ledger.get_deposit(&deposit.id).await.unwrap().status,
            DepositStatus::Swept
        );
        // Nothing re-sent
        assert_eq!(fx.chain.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sweep_fails_for_review() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        let op = in_progress_sweep(&fx, Some("0xfeed".to_string())).await;

        let report = Recovery::new(fx.ctx.clone()).reconcile().await.unwrap();
        assert_eq!(report.sweeps_failed, 1);
        let op = fx.ctx.ledger.get_sweep(&op.id).await.unwrap();
        assert_eq!(op.status, SweepStatus::Failed);
        assert!(op.error.unwrap().contains("manual review"));
        assert!(fx.chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_unbroadcast_sweep_keeps_deposits_open() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        let deposit = fx.ctx.ledger.record_deposit(W1, dec!(150), "USDT").await.unwrap();
        in_progress_sweep(&fx, None).await;

        Recovery::new(fx.ctx.clone()).reconcile().await.unwrap();
        let deposit = fx.ctx.ledger.get_deposit(&deposit.id).await.unwrap();
        assert_eq!(deposit.status, DepositStatus::Detected);
        assert!(fx.ctx.ledger.active_sweeps().await.is_empty());
    }

    #[tokio::test]
    async fn test_processing_withdrawals_reconciled() {
        let fx = fixture().await;
        let now = Utc::now();
        let request = |id: &str, hash: Option<&str>| WithdrawalRequest {
            id: id.to_string(),
            user_id: "alice".to_string(),
            to_address: USER_ADDR.to_string(),
            amount: dec!(5),
            status: WithdrawalStatus::Pending,
            tx_hash: hash.map(str::to_string),
            failure_reason: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
        };

        for (id, hash) in [("no-hash", None), ("lost", Some("0xbeef"))] {
            fx.ctx.ledger.insert_withdrawal(request(id, hash)).await.unwrap();
            fx.ctx
                .ledger
                .update_withdrawal(id, WithdrawalStatus::Processing, None, None)
                .await
                .unwrap();
        }

        let report = Recovery::new(fx.ctx.clone()).reconcile().await.unwrap();
        assert_eq!(report.withdrawals_failed, 2);
        assert_eq!(report.unresolved_withdrawals, vec!["lost".to_string()]);
        assert_eq!(
            fx.ctx.ledger.get_withdrawal("no-hash").await.unwrap().status,
            WithdrawalStatus::Failed
        );
        let lost = fx.ctx.ledger.get_withdrawal("lost").await.unwrap();
        assert_eq!(lost.status, WithdrawalStatus::Failed);
        assert!(lost.failure_reason.unwrap().contains("manual review"));
        assert!(fx.chain.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_pending_gas_top_ups_settled() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        let mined = fx
            .ctx
            .submitter
            .transfer(
                &fx.ctx.registry.master_config().await.unwrap(),
                W1,
                &fx.ctx.settings.native,
                dec!(0.001),
                &fx.ctx.settings.fees,
            )
            .await
            .unwrap();
        let mined = fx.ctx.ledger.record_gas_distribution(W1, dec!(0.001), &mined).await.unwrap();
        let lost = fx
            .ctx
            .ledger
            .record_gas_distribution(W1, dec!(0.001), "0xnever")
            .await
            .unwrap();

        let report = Recovery::new(fx.ctx.clone()).reconcile().await.unwrap();
        assert_eq!(report.gas_distributions_settled, 1);

        let pending = fx.ctx.ledger.pending_gas_distributions().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, lost.id);
        assert_ne!(pending[0].id, mined.id);
    }
}
