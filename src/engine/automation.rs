//! Automation controller
//!
//! Runs the periodic pass (scan, sweep due wallets, drain withdrawals) on a
//! background task, and exposes the administrative entry points. Passes are
//! serialized by a mutex and are never cut short by `stop`; cancellation is
//! only observed between passes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::ledger::{GasStats, SweepOperation, SweepStatus, SweepTrigger};
use crate::registry::{normalize_address, MasterWalletConfig};

use super::context::EngineContext;
use super::recovery::{Recovery, RecoveryReport};
use super::scanner::{DepositScanner, ScanResult};
use super::sweep::SweepExecutor;
use super::withdrawal::{WithdrawalDrain, WithdrawalProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Running,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Running => write!(f, "running"),
        }
    }
}

/// Summary of one automation pass
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub trigger: SweepTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scan: ScanResult,
    /// False when auto sweep is disabled for a scheduled pass
    pub sweeps_enabled: bool,
    pub sweeps_completed: usize,
    pub sweeps_failed: usize,
    pub total_swept: Decimal,
    pub sweep_errors: Vec<String>,
    pub withdrawals: WithdrawalDrain,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: ControllerState,
    pub initialized: bool,
    pub auto_sweep_enabled: bool,
    pub interval_secs: u64,
    pub passes_run: u64,
    pub last_pass: Option<PassSummary>,
}

/// Master wallet view for operators
#[derive(Debug, Clone, Serialize)]
pub struct HotWalletStatus {
    pub address: String,
    pub native_balance: Option<Decimal>,
    pub asset_balance: Option<Decimal>,
    pub native_symbol: String,
    pub asset_symbol: String,
    pub min_reserve: Decimal,
    pub is_connected: bool,
    pub last_update: DateTime<Utc>,
}

/// Pass logic shared with the background task
struct Orchestrator {
    ctx: Arc<EngineContext>,
    scanner: DepositScanner,
    sweeper: SweepExecutor,
    withdrawals: WithdrawalProcessor,
    pass_lock: Mutex<()>,
    last_pass: RwLock<Option<PassSummary>>,
    passes_run: RwLock<u64>,
}

impl Orchestrator {
    async fn run_pass(&self, trigger: SweepTrigger) -> Result<PassSummary> {
        let _pass = self.pass_lock.lock().await;
        let started_at = Utc::now();

        let master = self.ctx.registry.master_config().await?;
        let scan = self.scanner.scan(None).await?;

        let sweeps_enabled = trigger != SweepTrigger::Scheduled || master.auto_sweep_enabled;
        let mut summary = PassSummary {
            trigger,
            started_at,
            finished_at: started_at,
            scan,
            sweeps_enabled,
            sweeps_completed: 0,
            sweeps_failed: 0,
            total_swept: Decimal::ZERO,
            sweep_errors: Vec::new(),
            withdrawals: WithdrawalDrain::default(),
        };

        if sweeps_enabled {
            let targets: Vec<String> = summary.scan.due.iter().map(|d| d.address.clone()).collect();
            let results: Vec<(String, Result<SweepOperation>)> = stream::iter(targets)
                .map(|address| async move {
                    let result = self.sweeper.sweep(&address, trigger).await;
                    (address, result)
                })
                .buffer_unordered(self.ctx.settings.max_concurrency.max(1))
                .collect()
                .await;

            for (address, result) in results {
                match result {
                    Ok(op) if op.status == SweepStatus::Completed => {
                        summary.sweeps_completed += 1;
                        summary.total_swept += op.amount;
                    }
                    Ok(op) => {
                        summary.sweeps_failed += 1;
                        summary.sweep_errors.push(format!(
                            "{}: {}",
                            address,
                            op.error.unwrap_or_else(|| "failed".to_string())
                        ));
                    }
                    Err(e) => {
                        summary.sweeps_failed += 1;
                        summary.sweep_errors.push(format!("{}: {}", address, e));
                    }
                }
            }
        } else {
            info!("Auto sweep disabled; skipping {} due wallets", summary.scan.due.len());
        }

        summary.withdrawals = self.withdrawals.process_pending().await;
        summary.finished_at = Utc::now();

        info!(
            trigger = %trigger,
            "Pass complete: {} scanned, {} deposits, {} swept ({}), {} sweep failures, {} withdrawals processed",
            summary.scan.total_scanned,
            summary.scan.new_deposits,
            summary.sweeps_completed,
            summary.total_swept,
            summary.sweeps_failed,
            summary.withdrawals.processed.len()
        );

        *self.last_pass.write().await = Some(summary.clone());
        *self.passes_run.write().await += 1;
        Ok(summary)
    }
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Entry point for the automation loop and administrative actions
pub struct AutomationController {
    orchestrator: Arc<Orchestrator>,
    recovery: Recovery,
    runner: Mutex<Option<Runner>>,
    initialized: RwLock<bool>,
}

impl AutomationController {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let orchestrator = Arc::new(Orchestrator {
            scanner: DepositScanner::new(ctx.clone()),
            sweeper: SweepExecutor::new(ctx.clone()),
            withdrawals: WithdrawalProcessor::new(ctx.clone()),
            pass_lock: Mutex::new(()),
            last_pass: RwLock::new(None),
            passes_run: RwLock::new(0),
            ctx: ctx.clone(),
        });

        Self {
            orchestrator,
            recovery: Recovery::new(ctx),
            runner: Mutex::new(None),
            initialized: RwLock::new(false),
        }
    }

    fn ctx(&self) -> &Arc<EngineContext> {
        &self.orchestrator.ctx
    }

    pub fn scanner(&self) -> &DepositScanner {
        &self.orchestrator.scanner
    }

    pub fn withdrawals(&self) -> &WithdrawalProcessor {
        &self.orchestrator.withdrawals
    }

    /// Store the master config if none exists yet, then reconcile
    /// interrupted work
    pub async fn initialize(&self, defaults: Option<MasterWalletConfig>) -> Result<RecoveryReport> {
        let registry = &self.ctx().registry;
        if !registry.is_master_configured().await {
            let master = defaults.ok_or(Error::MasterNotConfigured)?;
            registry.set_master_config(master).await?;
        }

        let report = self.recovery.reconcile().await?;
        *self.initialized.write().await = true;
        info!("Sweeper initialized");
        Ok(report)
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.read().await && self.ctx().registry.is_master_configured().await
    }

    /// Reconcile interrupted work without restarting
    pub async fn reconcile(&self) -> Result<RecoveryReport> {
        self.recovery.reconcile().await
    }

    /// Start the background loop; `false` if it was already running
    pub async fn start(&self) -> Result<bool> {
        if !self.is_initialized().await {
            return Err(Error::Configuration(
                "Sweeper must be initialized before starting".to_string(),
            ));
        }

        let mut runner = self.runner.lock().await;
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = self.orchestrator.clone();
        let interval = self.ctx().settings.pass_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.run_pass(SweepTrigger::Scheduled).await {
                            error!("Automation pass failed: {}", e);
                        }
                    }
                }
            }
            info!("Automation loop stopped");
        });

        *runner = Some(Runner { cancel, handle });
        info!("Automation loop started (every {:?})", interval);
        Ok(true)
    }

    /// Stop the loop after the current pass; `false` if it was idle
    pub async fn stop(&self) -> bool {
        let Some(runner) = self.runner.lock().await.take() else {
            return false;
        };
        runner.cancel.cancel();
        if let Err(e) = runner.handle.await {
            warn!("Automation task ended abnormally: {}", e);
        }
        true
    }

    pub async fn state(&self) -> ControllerState {
        match self.runner.lock().await.as_ref() {
            Some(r) if !r.handle.is_finished() => ControllerState::Running,
            _ => ControllerState::Idle,
        }
    }

    /// Run one pass now, sweeping even if auto sweep is disabled
    pub async fn trigger_manual_sweep(&self) -> Result<PassSummary> {
        self.orchestrator.run_pass(SweepTrigger::Manual).await
    }

    /// Scan and sweep one wallet now, ignoring tier and cadence
    pub async fn emergency_sweep(&self, wallet: &str) -> Result<SweepOperation> {
        let address = normalize_address(wallet)?;
        warn!(wallet = %address, "Emergency sweep requested");
        self.orchestrator.scanner.scan(Some(&address)).await?;
        self.orchestrator
            .sweeper
            .sweep(&address, SweepTrigger::Emergency)
            .await
    }

    pub async fn status(&self) -> Result<ControllerStatus> {
        let auto_sweep_enabled = match self.ctx().registry.master_config().await {
            Ok(master) => master.auto_sweep_enabled,
            Err(Error::MasterNotConfigured) => false,
            Err(e) => return Err(e),
        };

        Ok(ControllerStatus {
            state: self.state().await,
            initialized: self.is_initialized().await,
            auto_sweep_enabled,
            interval_secs: self.ctx().settings.pass_interval.as_secs(),
            passes_run: *self.orchestrator.passes_run.read().await,
            last_pass: self.orchestrator.last_pass.read().await.clone(),
        })
    }

    pub async fn get_gas_stats(&self, days: u32) -> GasStats {
        self.ctx().ledger.gas_stats(days).await
    }

    /// Master wallet balances; RPC failures show as disconnected
    pub async fn get_hot_wallet_status(&self) -> Result<HotWalletStatus> {
        let ctx = self.ctx();
        let master = ctx.registry.master_config().await?;

        let native = ctx.chain.get_native_balance(&master.address).await;
        let asset = ctx.chain.get_balance(&master.address, &ctx.settings.asset).await;
        if let Err(e) = &native {
            warn!("Hot wallet native balance unavailable: {}", e);
        }

        Ok(HotWalletStatus {
            is_connected: native.is_ok() && asset.is_ok(),
            native_balance: native.ok(),
            asset_balance: asset.ok(),
            native_symbol: ctx.settings.native.symbol().to_string(),
            asset_symbol: ctx.settings.asset.symbol().to_string(),
            address: master.address,
            min_reserve: master.min_reserve,
            last_update: Utc::now(),
        })
    }

    /// Wait for an in-flight pass, if any, to finish
    pub async fn wait_idle(&self) {
        let _pass = self.orchestrator.pass_lock.lock().await;
    }

    pub fn pass_interval(&self) -> Duration {
        self.ctx().settings.pass_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::testing::{fixture, MASTER, USER_ADDR, W1, W2};
    use crate::ledger::DepositStatus;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_scheduled_pass_sweeps_and_pays() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        fx.add_wallet(W2, dec!(2)).await;
        let controller = AutomationController::new(fx.ctx.clone());
        controller.initialize(None).await.unwrap();

        let request = controller
            .withdrawals()
            .create_withdrawal("alice", USER_ADDR, dec!(100))
            .await
            .unwrap();

        let summary = controller
            .orchestrator
            .run_pass(SweepTrigger::Scheduled)
            .await
            .unwrap();
        assert_eq!(summary.scan.total_scanned, 2);
        assert_eq!(summary.sweeps_completed, 1);
        assert_eq!(summary.total_swept, dec!(150));
        assert_eq!(summary.withdrawals.processed.len(), 1);

        let paid = fx.ctx.ledger.get_withdrawal(&request.id).await.unwrap();
        assert_eq!(paid.status, crate::ledger::WithdrawalStatus::Completed);
        assert_eq!(fx.chain.token_balance_of(MASTER), dec!(50));
        assert_eq!(fx.chain.token_balance_of(W2), dec!(2));
    }

    #[tokio::test]
    async fn test_disabled_auto_sweep_still_scans() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        fx.set_master(|m| m.auto_sweep_enabled = false).await;
        let controller = AutomationController::new(fx.ctx.clone());
        controller.initialize(None).await.unwrap();

        let summary = controller
            .orchestrator
            .run_pass(SweepTrigger::Scheduled)
            .await
            .unwrap();
        assert!(!summary.sweeps_enabled);
        assert_eq!(summary.scan.new_deposits, 1);
        assert!(fx.chain.submissions().is_empty());

        // Manual trigger sweeps regardless
        let manual = controller.trigger_manual_sweep().await.unwrap();
        assert_eq!(manual.sweeps_completed, 1);
    }

    #[tokio::test]
    async fn test_emergency_sweep_ignores_tier() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(2)).await;
        let controller = AutomationController::new(fx.ctx.clone());
        controller.initialize(None).await.unwrap();

        let op = controller.emergency_sweep(W1).await.unwrap();
        assert_eq!(op.status, SweepStatus::Completed);
        assert_eq!(op.trigger, SweepTrigger::Emergency);
        assert_eq!(op.amount, dec!(2));

        let deposit = &fx.ctx.ledger.list_deposits(Some(W1)).await[0];
        assert_eq!(deposit.status, DepositStatus::Swept);
    }

    #[tokio::test]
    async fn test_emergency_and_scheduled_do_not_double_sweep() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        let controller = AutomationController::new(fx.ctx.clone());
        controller.initialize(None).await.unwrap();

        let (pass, emergency) = tokio::join!(
            controller.orchestrator.run_pass(SweepTrigger::Scheduled),
            controller.emergency_sweep(W1)
        );
        let pass = pass.unwrap();

        let completed = pass.sweeps_completed
            + usize::from(matches!(&emergency, Ok(op) if op.status == SweepStatus::Completed));
        assert_eq!(completed, 1);
        assert_eq!(fx.chain.submissions_from(W1).len(), 1);
        assert_eq!(fx.chain.token_balance_of(MASTER), dec!(150));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let fx = fixture().await;
        fx.add_wallet(W1, dec!(150)).await;
        let controller = AutomationController::new(fx.ctx.clone());

        assert!(controller.start().await.is_err());
        controller.initialize(None).await.unwrap();
        assert!(controller.is_initialized().await);

        assert!(controller.start().await.unwrap());
        assert!(!controller.start().await.unwrap());
        assert_eq!(controller.state().await, ControllerState::Running);

        // First tick fires immediately
        for _ in 0..200 {
            if controller.status().await.unwrap().passes_run > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(controller.stop().await);
        assert!(!controller.stop().await);
        assert_eq!(controller.state().await, ControllerState::Idle);

        let status = controller.status().await.unwrap();
        assert!(status.passes_run >= 1);
        assert_eq!(fx.ctx.ledger.total_swept().await, dec!(150));
    }

    #[tokio::test]
    async fn test_initialize_requires_master() {
        let fx = fixture().await;
        let registry = crate::registry::WalletRegistry::in_memory();
        let ctx = EngineContext::new(
            Arc::new(registry),
            fx.ctx.ledger.clone(),
            fx.ctx.chain.clone(),
            fx.ctx.secrets.clone(),
            fx.ctx.settings.clone(),
        );
        let controller = AutomationController::new(ctx);

        assert!(matches!(
            controller.initialize(None).await,
            Err(Error::MasterNotConfigured)
        ));
        let report = controller
            .initialize(Some(MasterWalletConfig::with_defaults(MASTER, "master")))
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert!(controller.is_initialized().await);
    }

    #[tokio::test]
    async fn test_hot_wallet_status_and_stats() {
        let fx = fixture().await;
        fx.chain.set_token_balance(MASTER, dec!(42));
        let controller = AutomationController::new(fx.ctx.clone());

        let hot = controller.get_hot_wallet_status().await.unwrap();
        assert!(hot.is_connected);
        assert_eq!(hot.native_balance, Some(dec!(2)));
        assert_eq!(hot.asset_balance, Some(dec!(42)));

        fx.chain.fail_balance_queries(MASTER);
        let hot = controller.get_hot_wallet_status().await.unwrap();
        assert!(!hot.is_connected);

        assert_eq!(controller.get_gas_stats(7).await.gas_distributions, 0);
    }
}
