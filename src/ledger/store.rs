//! Persistence ledger
//!
//! Durable record of deposits, sweeps, gas distributions and withdrawals.
//! Every mutation is written through to `ledger.json` before returning, so
//! the file is always enough to reconstruct state after a crash.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{read_json_or_default, write_json_atomic};

use super::types::{
    check_transition, Deposit, DepositStatus, DepositUpdate, GasDistribution, GasDistributionStatus, GasStats,
    LedgerSnapshot, SweepOperation, SweepStatus, SweepTrigger, SweepUpdate, WithdrawalRequest,
    WithdrawalStatus,
};

#[derive(Default)]
struct LedgerState {
    deposits: HashMap<String, Deposit>,
    sweeps: HashMap<String, SweepOperation>,
    gas_distributions: Vec<GasDistribution>,
    withdrawals: HashMap<String, WithdrawalRequest>,
}

/// Durable ledger
pub struct PersistenceLedger {
    path: Option<PathBuf>,
    state: RwLock<LedgerState>,
    /// Held from snapshot to rename so saves land in mutation order
    save_lock: Mutex<()>,
}

impl PersistenceLedger {
    /// Load the ledger from a JSON snapshot (empty if missing)
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot: LedgerSnapshot = read_json_or_default(&path).await?;

        let state = LedgerState {
            deposits: snapshot
                .deposits
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            sweeps: snapshot
                .sweeps
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect(),
            gas_distributions: snapshot.gas_distributions,
            withdrawals: snapshot
                .withdrawals
                .into_iter()
                .map(|w| (w.id.clone(), w))
                .collect(),
        };

        info!(
            "Loaded ledger from {}: {} deposits, {} sweeps, {} withdrawals",
            path.display(),
            state.deposits.len(),
            state.sweeps.len(),
            state.withdrawals.len()
        );

        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            save_lock: Mutex::new(()),
        })
    }

    /// Ledger that never touches disk (dry runs, tests)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(LedgerState::default()),
            save_lock: Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Deposits
    // ------------------------------------------------------------------

    /// Record a newly detected deposit
    pub async fn record_deposit(&self, wallet: &str, amount: Decimal, asset: &str) -> Result<Deposit> {
        let now = Utc::now();
        let deposit = Deposit {
            id: Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            amount,
            asset: asset.to_string(),
            status: DepositStatus::Detected,
            gas_tx_hash: None,
            sweep_tx_hash: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };

        self.state
            .write()
            .await
            .deposits
            .insert(deposit.id.clone(), deposit.clone());
        self.save().await?;

        Ok(deposit)
    }

    /// Deposits for a wallet that have not reached a terminal status
    pub async fn open_deposits(&self, wallet: &str) -> Vec<Deposit> {
        let state = self.state.read().await;
        let mut open: Vec<Deposit> = state
            .deposits
            .values()
            .filter(|d| d.wallet == wallet && !matches!(d.status, DepositStatus::Swept | DepositStatus::Failed))
            .cloned()
            .collect();
        open.sort_by_key(|d| d.created_at);
        open
    }

    /// List deposits, optionally for one wallet, oldest first
    pub async fn list_deposits(&self, wallet: Option<&str>) -> Vec<Deposit> {
        let state = self.state.read().await;
        let mut deposits: Vec<Deposit> = state
            .deposits
            .values()
            .filter(|d| wallet.map_or(true, |w| d.wallet == w))
            .cloned()
            .collect();
        deposits.sort_by_key(|d| d.created_at);
        deposits
    }

    /// Get a deposit by id
    pub async fn get_deposit(&self, id: &str) -> Result<Deposit> {
        self.state
            .read()
            .await
            .deposits
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Persistence(format!("Deposit not found: {}", id)))
    }

    /// Advance a deposit, rejecting regressions
    pub async fn update_deposit(
        &self,
        id: &str,
        status: DepositStatus,
        update: DepositUpdate,
    ) -> Result<Deposit> {
        let deposit = {
            let mut state = self.state.write().await;
            let deposit = state
                .deposits
                .get_mut(id)
                .ok_or_else(|| Error::Persistence(format!("Deposit not found: {}", id)))?;

            check_transition("deposit", id, deposit.status, status)?;

            deposit.status = status;
            if update.gas_tx_hash.is_some() {
                deposit.gas_tx_hash = update.gas_tx_hash;
            }
            if update.sweep_tx_hash.is_some() {
                deposit.sweep_tx_hash = update.sweep_tx_hash;
            }
            if update.failure_reason.is_some() {
                deposit.failure_reason = update.failure_reason;
            }
            deposit.updated_at = Utc::now();
            deposit.clone()
        };

        debug!(deposit = %id, status = %status, "Deposit updated");
        self.save().await?;
        Ok(deposit)
    }

    // ------------------------------------------------------------------
    // Sweeps
    // ------------------------------------------------------------------

    /// Open a sweep operation for a wallet
    ///
    /// Fails with `WalletBusy` if the wallet already has an active operation.
    pub async fn open_sweep(&self, wallet: &str, trigger: SweepTrigger) -> Result<SweepOperation> {
        let op = {
            let mut state = self.state.write().await;
            if state
                .sweeps
                .values()
                .any(|s| s.wallet == wallet && s.status.is_active())
            {
                return Err(Error::WalletBusy(wallet.to_string()));
            }

            let now = Utc::now();
            let op = SweepOperation {
                id: Uuid::new_v4().to_string(),
                wallet: wallet.to_string(),
                amount: Decimal::ZERO,
                gas_tx_hash: None,
                sweep_tx_hash: None,
                status: SweepStatus::Pending,
                error: None,
                trigger,
                created_at: now,
                updated_at: now,
            };
            state.sweeps.insert(op.id.clone(), op.clone());
            op
        };

        self.save().await?;
        Ok(op)
    }

    /// Advance a sweep operation, rejecting regressions
    pub async fn update_sweep(
        &self,
        id: &str,
        status: SweepStatus,
        update: SweepUpdate,
    ) -> Result<SweepOperation> {
        let op = {
            let mut state = self.state.write().await;
            let op = state
                .sweeps
                .get_mut(id)
                .ok_or_else(|| Error::Persistence(format!("Sweep not found: {}", id)))?;

            check_transition("sweep", id, op.status, status)?;

            op.status = status;
            if let Some(amount) = update.amount {
                op.amount = amount;
            }
            if update.gas_tx_hash.is_some() {
                op.gas_tx_hash = update.gas_tx_hash;
            }
            if update.sweep_tx_hash.is_some() {
                op.sweep_tx_hash = update.sweep_tx_hash;
            }
            if update.error.is_some() {
                op.error = update.error;
            }
            op.updated_at = Utc::now();
            op.clone()
        };

        debug!(sweep = %id, status = %status, "Sweep updated");
        self.save().await?;
        Ok(op)
    }

    /// Get a sweep operation by id
    pub async fn get_sweep(&self, id: &str) -> Result<SweepOperation> {
        self.state
            .read()
            .await
            .sweeps
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Persistence(format!("Sweep not found: {}", id)))
    }

    /// Operations left pending or in progress (crash leftovers on startup)
    pub async fn active_sweeps(&self) -> Vec<SweepOperation> {
        let state = self.state.read().await;
        let mut active: Vec<SweepOperation> = state
            .sweeps
            .values()
            .filter(|s| s.status.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        active
    }

    /// List sweeps, optionally for one wallet, oldest first
    pub async fn list_sweeps(&self, wallet: Option<&str>) -> Vec<SweepOperation> {
        let state = self.state.read().await;
        let mut sweeps: Vec<SweepOperation> = state
            .sweeps
            .values()
            .filter(|s| wallet.map_or(true, |w| s.wallet == w))
            .cloned()
            .collect();
        sweeps.sort_by_key(|s| s.created_at);
        sweeps
    }

    /// Sum of all completed sweep amounts
    pub async fn total_swept(&self) -> Decimal {
        self.state
            .read()
            .await
            .sweeps
            .values()
            .filter(|s| s.status == SweepStatus::Completed)
            .map(|s| s.amount)
            .sum()
    }

    // ------------------------------------------------------------------
    // Gas distributions
    // ------------------------------------------------------------------

    /// Record a broadcast gas top-up as pending
    pub async fn record_gas_distribution(
        &self,
        wallet: &str,
        amount: Decimal,
        tx_hash: &str,
    ) -> Result<GasDistribution> {
        let record = GasDistribution {
            id: Uuid::new_v4().to_string(),
            wallet: wallet.to_string(),
            amount,
            tx_hash: tx_hash.to_string(),
            status: GasDistributionStatus::Pending,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.state.write().await.gas_distributions.push(record.clone());
        self.save().await?;
        Ok(record)
    }

    /// Settle a pending gas top-up
    pub async fn set_gas_distribution_status(
        &self,
        id: &str,
        status: GasDistributionStatus,
    ) -> Result<GasDistribution> {
        let record = {
            let mut state = self.state.write().await;
            let record = state
                .gas_distributions
                .iter_mut()
                .find(|g| g.id == id)
                .ok_or_else(|| Error::Persistence(format!("Gas distribution not found: {}", id)))?;
            if record.status != GasDistributionStatus::Pending && record.status != status {
                return Err(Error::Persistence(format!(
                    "Gas distribution {} already {}",
                    id, record.status
                )));
            }
            record.status = status;
            record.updated_at = Some(Utc::now());
            record.clone()
        };
        self.save().await?;
        Ok(record)
    }

    /// Top-ups broadcast but never settled
    pub async fn pending_gas_distributions(&self) -> Vec<GasDistribution> {
        self.state
            .read()
            .await
            .gas_distributions
            .iter()
            .filter(|g| g.status == GasDistributionStatus::Pending)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Withdrawals
    // ------------------------------------------------------------------

    /// Insert a new withdrawal request; the id must be unused
    pub async fn insert_withdrawal(&self, request: WithdrawalRequest) -> Result<WithdrawalRequest> {
        {
            let mut state = self.state.write().await;
            if state.withdrawals.contains_key(&request.id) {
                return Err(Error::Persistence(format!(
                    "Withdrawal already exists: {}",
                    request.id
                )));
            }
            state.withdrawals.insert(request.id.clone(), request.clone());
        }
        self.save().await?;
        Ok(request)
    }

    /// Get a withdrawal request by id
    pub async fn get_withdrawal(&self, id: &str) -> Result<WithdrawalRequest> {
        self.state
            .read()
            .await
            .withdrawals
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WithdrawalNotFound(id.to_string()))
    }

    /// Withdrawals in a given status, oldest first
    pub async fn withdrawals_with_status(&self, status: WithdrawalStatus) -> Vec<WithdrawalRequest> {
        let state = self.state.read().await;
        let mut requests: Vec<WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        requests
    }

    /// Pending withdrawal queue in FIFO order
    pub async fn pending_withdrawals(&self) -> Vec<WithdrawalRequest> {
        self.withdrawals_with_status(WithdrawalStatus::Pending).await
    }

    /// Advance a withdrawal, rejecting regressions
    pub async fn update_withdrawal(
        &self,
        id: &str,
        status: WithdrawalStatus,
        tx_hash: Option<String>,
        failure_reason: Option<String>,
    ) -> Result<WithdrawalRequest> {
        let request = {
            let mut state = self.state.write().await;
            let request = state
                .withdrawals
                .get_mut(id)
                .ok_or_else(|| Error::WithdrawalNotFound(id.to_string()))?;

            check_transition("withdrawal", id, request.status, status)?;

            request.status = status;
            if tx_hash.is_some() {
                request.tx_hash = tx_hash;
            }
            if failure_reason.is_some() {
                request.failure_reason = failure_reason;
            }
            request.updated_at = Utc::now();
            request.clone()
        };

        debug!(withdrawal = %id, status = %status, "Withdrawal updated");
        self.save().await?;
        Ok(request)
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    /// Gas and sweep statistics over the trailing `days`
    pub async fn gas_stats(&self, days: u32) -> GasStats {
        let since = Utc::now() - Duration::days(i64::from(days));
        let state = self.state.read().await;

        let gas: Vec<&GasDistribution> = state
            .gas_distributions
            .iter()
            .filter(|g| g.created_at >= since)
            .collect();
        let completed: Vec<&SweepOperation> = state
            .sweeps
            .values()
            .filter(|s| s.status == SweepStatus::Completed && s.updated_at >= since)
            .collect();
        let withdrawn: Vec<&WithdrawalRequest> = state
            .withdrawals
            .values()
            .filter(|w| w.status == WithdrawalStatus::Completed && w.updated_at >= since)
            .collect();

        GasStats {
            days,
            gas_distributions: gas.len(),
            total_gas_distributed: gas.iter().map(|g| g.amount).sum(),
            unconfirmed_gas_distributions: gas
                .iter()
                .filter(|g| g.status != GasDistributionStatus::Confirmed)
                .count(),
            sweeps_completed: completed.len(),
            sweeps_failed: state
                .sweeps
                .values()
                .filter(|s| s.status == SweepStatus::Failed && s.updated_at >= since)
                .count(),
            total_swept: completed.iter().map(|s| s.amount).sum(),
            withdrawals_completed: withdrawn.len(),
            total_withdrawn: withdrawn.iter().map(|w| w.amount).sum(),
            pending_withdrawals: state
                .withdrawals
                .values()
                .filter(|w| w.status == WithdrawalStatus::Pending)
                .count(),
        }
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _saving = self.save_lock.lock().await;
        let snapshot = {
            let state = self.state.read().await;
            LedgerSnapshot {
                version: "1.0".to_string(),
                deposits: state.deposits.values().cloned().collect(),
                sweeps: state.sweeps.values().cloned().collect(),
                gas_distributions: state.gas_distributions.clone(),
                withdrawals: state.withdrawals.values().cloned().collect(),
            }
        };
        write_json_atomic(path, &snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    const W1: &str = "0x1111111111111111111111111111111111111111";

    fn withdrawal(id: &str, amount: Decimal) -> WithdrawalRequest {
        let now = Utc::now();
        WithdrawalRequest {
            id: id.to_string(),
            user_id: "alice".to_string(),
            to_address: W1.to_string(),
            amount,
            status: WithdrawalStatus::Pending,
            tx_hash: None,
            failure_reason: None,
            retry_of: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_deposit_lifecycle_is_monotonic() {
        let ledger = PersistenceLedger::in_memory();
        let deposit = ledger.record_deposit(W1, dec!(10), "USDT").await.unwrap();

        ledger
            .update_deposit(&deposit.id, DepositStatus::GasFunded, DepositUpdate::default())
            .await
            .unwrap();
        let regress = ledger
            .update_deposit(&deposit.id, DepositStatus::Detected, DepositUpdate::default())
            .await;
        assert!(matches!(regress, Err(Error::Persistence(_))));

        assert_eq!(ledger.open_deposits(W1).await.len(), 1);
        ledger
            .update_deposit(
                &deposit.id,
                DepositStatus::Swept,
                DepositUpdate {
                    sweep_tx_hash: Some("0xabc".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(ledger.open_deposits(W1).await.is_empty());
    }

    #[tokio::test]
    async fn test_one_active_sweep_per_wallet() {
        let ledger = PersistenceLedger::in_memory();
        let op = ledger.open_sweep(W1, SweepTrigger::Scheduled).await.unwrap();

        let second = ledger.open_sweep(W1, SweepTrigger::Emergency).await;
        assert!(matches!(second, Err(Error::WalletBusy(_))));

        ledger
            .update_sweep(&op.id, SweepStatus::InProgress, SweepUpdate::default())
            .await
            .unwrap();
        ledger
            .update_sweep(&op.id, SweepStatus::Failed, SweepUpdate::default())
            .await
            .unwrap();

        assert!(ledger.open_sweep(W1, SweepTrigger::Emergency).await.is_ok());
    }

    #[tokio::test]
    async fn test_total_swept_matches_completed_sum() {
        let ledger = PersistenceLedger::in_memory();
        for amount in [dec!(150), dec!(25.5)] {
            let op = ledger.open_sweep(W1, SweepTrigger::Scheduled).await.unwrap();
            ledger
                .update_sweep(&op.id, SweepStatus::InProgress, SweepUpdate::default())
                .await
                .unwrap();
            ledger
                .update_sweep(
                    &op.id,
                    SweepStatus::Completed,
                    SweepUpdate {
                        amount: Some(amount),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let failed = ledger.open_sweep(W1, SweepTrigger::Scheduled).await.unwrap();
        ledger
            .update_sweep(
                &failed.id,
                SweepStatus::Failed,
                SweepUpdate {
                    amount: Some(dec!(99)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(ledger.total_swept().await, dec!(175.5));
        let stats = ledger.gas_stats(7).await;
        assert_eq!(stats.total_swept, dec!(175.5));
        assert_eq!(stats.sweeps_completed, 2);
        assert_eq!(stats.sweeps_failed, 1);
    }

    #[tokio::test]
    async fn test_pending_withdrawals_fifo() {
        let ledger = PersistenceLedger::in_memory();
        let mut first = withdrawal("w-b", dec!(1));
        first.created_at = Utc::now() - Duration::minutes(5);
        ledger.insert_withdrawal(first).await.unwrap();
        ledger.insert_withdrawal(withdrawal("w-a", dec!(2))).await.unwrap();

        let pending = ledger.pending_withdrawals().await;
        assert_eq!(pending[0].id, "w-b");
        assert_eq!(pending[1].id, "w-a");

        assert!(ledger.insert_withdrawal(withdrawal("w-a", dec!(2))).await.is_err());
    }

    #[tokio::test]
    async fn test_ledger_survives_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        {
            let ledger = PersistenceLedger::load(&path).await.unwrap();
            ledger.record_deposit(W1, dec!(3), "USDT").await.unwrap();
            ledger.record_gas_distribution(W1, dec!(0.001), "0xgas").await.unwrap();
            ledger.insert_withdrawal(withdrawal("w-1", dec!(5))).await.unwrap();
        }

        let ledger = PersistenceLedger::load(&path).await.unwrap();
        assert_eq!(ledger.list_deposits(Some(W1)).await.len(), 1);
        assert_eq!(ledger.gas_stats(1).await.gas_distributions, 1);
        assert_eq!(ledger.get_withdrawal("w-1").await.unwrap().amount, dec!(5));
    }

    #[tokio::test]
    async fn test_gas_distribution_settles_once() {
        let ledger = PersistenceLedger::in_memory();
        let record = ledger.record_gas_distribution(W1, dec!(0.001), "0xgas").await.unwrap();
        assert_eq!(record.status, GasDistributionStatus::Pending);
        assert_eq!(ledger.gas_stats(1).await.unconfirmed_gas_distributions, 1);
        assert_eq!(ledger.pending_gas_distributions().await.len(), 1);

        ledger
            .set_gas_distribution_status(&record.id, GasDistributionStatus::Confirmed)
            .await
            .unwrap();
        let stats = ledger.gas_stats(1).await;
        assert_eq!(stats.gas_distributions, 1);
        assert_eq!(stats.unconfirmed_gas_distributions, 0);
        assert!(ledger.pending_gas_distributions().await.is_empty());

        assert!(ledger
            .set_gas_distribution_status(&record.id, GasDistributionStatus::Failed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_legacy_gas_records_load_as_confirmed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(
            &path,
            r#"{"version":"1.0","gas_distributions":[{"id":"g1","wallet":"0x1111111111111111111111111111111111111111","amount":"0.001","tx_hash":"0xgas","created_at":"2026-01-01T00:00:00Z"}]}"#,
        )
        .unwrap();

        let ledger = PersistenceLedger::load(&path).await.unwrap();
        assert!(ledger.pending_gas_distributions().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_all_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = std::sync::Arc::new(PersistenceLedger::load(&path).await.unwrap());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        ledger.record_deposit(W1, dec!(1), "USDT").await.map(|_| ())
                    } else {
                        ledger
                            .record_gas_distribution(W1, dec!(0.001), &format!("0xgas{}", i))
                            .await
                            .map(|_| ())
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reloaded = PersistenceLedger::load(&path).await.unwrap();
        assert_eq!(reloaded.list_deposits(Some(W1)).await.len(), 32);
        assert_eq!(reloaded.gas_stats(1).await.gas_distributions, 32);
    }
}
