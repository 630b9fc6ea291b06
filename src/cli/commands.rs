//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{ChainClient, ChainGateway, SimulatedChain};
use crate::config::{ChainBackend, Config};
use crate::engine::{AutomationController, EngineContext, PassSummary, RecoveryReport, ScanResult};
use crate::ledger::{PersistenceLedger, SweepStatus, WithdrawalRequest, WithdrawalStatus};
use crate::registry::{MasterWalletConfig, Tier, WalletFilter, WalletRegistry};
use crate::secrets::{MemoryKeySource, SecretStore};

/// Wired-up engine for one CLI invocation
pub struct Engine {
    pub ctx: Arc<EngineContext>,
    pub controller: AutomationController,
}

/// Build the engine from configuration
///
/// Dry runs never touch disk state or a real chain: the registry is copied
/// into memory, the chain is simulated and keys are derived per handle.
pub async fn build_engine(config: &Config, dry_run: bool) -> Result<Engine> {
    let settings = config.engine_settings()?;

    let persisted = Arc::new(
        WalletRegistry::load(config.registry_path())
            .await
            .context("Failed to load wallet registry")?,
    );

    let (registry, ledger, secrets, client): (_, _, _, Arc<dyn ChainClient>) = if dry_run {
        warn!("DRY-RUN: in-memory state, simulated chain, derived keys");
        let registry = Arc::new(WalletRegistry::in_memory());
        let keys = Arc::new(MemoryKeySource::new());

        for wallet in persisted.list_wallets(&WalletFilter::default()).await {
            registry
                .add_wallet(&wallet.address, &wallet.user_id, &wallet.key_handle)
                .await?;
            keys.insert_derived(&wallet.key_handle);
        }
        let master = match persisted.master_config().await {
            Ok(master) => Some(master),
            Err(_) if !config.master.address.is_empty() => Some(config.master_defaults()?),
            Err(_) => None,
        };
        if let Some(master) = master {
            keys.insert_derived(&master.key_handle);
            registry.set_master_config(master).await?;
        }

        let chain: Arc<dyn ChainClient> = Arc::new(SimulatedChain::with_assets(
            config.native_asset(),
            config.token_asset(),
        ));
        (
            registry,
            Arc::new(PersistenceLedger::in_memory()),
            Arc::new(SecretStore::new(keys)),
            chain,
        )
    } else {
        let ledger = PersistenceLedger::load(config.ledger_path())
            .await
            .context("Failed to load ledger")?;
        (
            persisted,
            Arc::new(ledger),
            Arc::new(SecretStore::from_dir(&config.secrets.keys_dir)),
            chain_client(config)?,
        )
    };

    let gateway = ChainGateway::new(client, config.retry_policy(), config.confirmation_policy());
    info!("Chain backend: {}", gateway.backend());

    let ctx = EngineContext::new(registry, ledger, gateway, secrets, settings);
    let controller = AutomationController::new(ctx.clone());
    Ok(Engine { ctx, controller })
}

fn chain_client(config: &Config) -> Result<Arc<dyn ChainClient>> {
    match config.chain.backend {
        ChainBackend::Simulated => {
            warn!("Using the simulated chain backend; balances are not real");
            Ok(Arc::new(SimulatedChain::with_assets(
                config.native_asset(),
                config.token_asset(),
            )))
        }
        #[cfg(feature = "evm")]
        ChainBackend::Evm => Ok(Arc::new(crate::chain::EvmChainClient::new(
            &config.chain.rpc_url,
            config.chain.chain_id,
            config.native_asset(),
        )?)),
        #[cfg(not(feature = "evm"))]
        ChainBackend::Evm => anyhow::bail!("The evm backend requires building with --features evm"),
    }
}

/// Master config from `[master]` when an address is configured
fn master_seed(config: &Config) -> Result<Option<MasterWalletConfig>> {
    if config.master.address.is_empty() {
        return Ok(None);
    }
    Ok(Some(config.master_defaults()?))
}

/// Build, store the master config if missing, and reconcile interrupted work
async fn initialized_engine(config: &Config, dry_run: bool) -> Result<Engine> {
    let engine = build_engine(config, dry_run).await?;
    let report = engine
        .controller
        .initialize(master_seed(config)?)
        .await
        .context("Initialization failed (set [master] address or run `sweeper master set`)")?;
    if report != RecoveryReport::default() {
        print_recovery(&report);
    }
    Ok(engine)
}

/// Store the master configuration and reconcile interrupted work
pub async fn init(config: &Config) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let report = engine.controller.initialize(master_seed(config)?).await?;
    let master = engine.ctx.registry.master_config().await?;

    println!("\n=== SWEEPER INITIALIZED ===\n");
    println!("Master wallet: {}", master.address);
    println!("Key handle:    {}", master.key_handle);
    print_recovery(&report);
    Ok(())
}

/// Run the automation loop until Ctrl+C
pub async fn run(config: &Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - no real transactions will be sent");
    }

    let engine = initialized_engine(config, dry_run).await?;
    engine.controller.start().await?;
    info!(
        "Sweeper running every {:?}. Press Ctrl+C to stop.",
        engine.controller.pass_interval()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down after the current pass...");
    engine.controller.stop().await;

    if let Some(pass) = engine.controller.status().await?.last_pass {
        print_pass(&pass);
    }
    Ok(())
}

/// Scan one wallet (forced) or all wallets
pub async fn scan(config: &Config, wallet: Option<String>) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let result = engine.controller.scanner().scan(wallet.as_deref()).await?;
    print_scan(&result);
    Ok(())
}

/// Run one pass that sweeps due wallets regardless of auto sweep
pub async fn sweep_manual(config: &Config) -> Result<()> {
    let engine = initialized_engine(config, false).await?;
    let pass = engine.controller.trigger_manual_sweep().await?;
    print_pass(&pass);
    Ok(())
}

/// Sweep a single wallet immediately
pub async fn sweep_emergency(config: &Config, wallet: &str, force: bool) -> Result<()> {
    if !force {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Emergency sweep {}? Gas will be sent from the master wallet.",
                wallet
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Emergency sweep cancelled by user");
            return Ok(());
        }
    }

    let engine = initialized_engine(config, false).await?;
    let op = engine.controller.emergency_sweep(wallet).await?;

    println!("\n=== EMERGENCY SWEEP ===");
    println!("Wallet:   {}", op.wallet);
    println!("Status:   {}", op.status);
    println!("Amount:   {} {}", op.amount, engine.ctx.settings.asset);
    if let Some(hash) = &op.gas_tx_hash {
        println!("Gas tx:   {}", hash);
    }
    if let Some(hash) = &op.sweep_tx_hash {
        println!("Sweep tx: {}", hash);
    }
    if let Some(error) = &op.error {
        println!("Error:    {}", error);
    }

    if op.status != SweepStatus::Completed {
        anyhow::bail!("Emergency sweep did not complete");
    }
    Ok(())
}

/// Controller, hot wallet and queue overview
pub async fn status(config: &Config) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let status = engine.controller.status().await?;

    println!("\n=== SWEEPER STATUS ===\n");
    println!("State:        {}", status.state);
    println!("Auto sweep:   {}", status.auto_sweep_enabled);
    println!("Interval:     {}s", status.interval_secs);

    match engine.controller.get_hot_wallet_status().await {
        Ok(hot) => {
            println!("\n=== HOT WALLET ===\n");
            println!("Address:      {}", hot.address);
            println!("Connected:    {}", hot.is_connected);
            println!(
                "Native:       {} {} (reserve {})",
                display_opt(hot.native_balance),
                hot.native_symbol,
                hot.min_reserve
            );
            println!("Asset:        {} {}", display_opt(hot.asset_balance), hot.asset_symbol);
        }
        Err(e) => println!("\nHot wallet: {}", e),
    }

    let wallets = engine.ctx.registry.list_wallets(&WalletFilter::default()).await;
    let active = engine.ctx.ledger.active_sweeps().await;
    let pending = engine.controller.withdrawals().list_pending().await;
    let processing = engine
        .controller
        .withdrawals()
        .list(WithdrawalStatus::Processing)
        .await;

    println!("\n=== QUEUES ===\n");
    println!("Deposit wallets:        {}", wallets.len());
    println!("Active sweeps:          {}", active.len());
    println!("Pending withdrawals:    {}", pending.len());
    println!("Processing withdrawals: {}", processing.len());
    println!();
    Ok(())
}

/// Gas and sweep totals over a window
pub async fn stats(config: &Config, days: u32) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let stats = engine.controller.get_gas_stats(days).await;
    let native = &engine.ctx.settings.native;
    let asset = &engine.ctx.settings.asset;

    println!("\n=== LAST {} DAYS ===\n", stats.days);
    println!(
        "Gas distributions:     {} ({} {}), {} unconfirmed",
        stats.gas_distributions,
        stats.total_gas_distributed,
        native,
        stats.unconfirmed_gas_distributions
    );
    println!(
        "Sweeps:                {} completed, {} failed ({} {})",
        stats.sweeps_completed, stats.sweeps_failed, stats.total_swept, asset
    );
    println!(
        "Withdrawals:           {} completed ({} {})",
        stats.withdrawals_completed, stats.total_withdrawn, asset
    );
    println!("Pending withdrawals:   {}", stats.pending_withdrawals);
    println!();
    Ok(())
}

pub async fn wallet_add(config: &Config, address: &str, user_id: &str, key_handle: &str) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let wallet = engine
        .ctx
        .registry
        .add_wallet(address, user_id, key_handle)
        .await?;
    println!("Added deposit wallet {} for user {}", wallet.address, wallet.user_id);
    Ok(())
}

pub async fn wallet_list(config: &Config, user_id: Option<String>, tier: Option<Tier>) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let wallets = engine
        .ctx
        .registry
        .list_wallets(&WalletFilter { user_id, tier })
        .await;

    println!("\n=== DEPOSIT WALLETS ===\n");
    println!(
        "{:<44} {:<16} {:<8} {:>16} {}",
        "ADDRESS", "USER", "TIER", "LAST BALANCE", "LAST SCANNED"
    );
    println!("{}", "-".repeat(110));

    for wallet in &wallets {
        println!(
            "{:<44} {:<16} {:<8} {:>16} {}",
            wallet.address,
            wallet.user_id,
            wallet.tier.to_string(),
            wallet.last_balance,
            wallet
                .last_scanned_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string())
        );
    }

    println!("\n{} wallets", wallets.len());
    Ok(())
}

pub async fn master_show(config: &Config) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let master = engine.ctx.registry.master_config().await?;
    print_master(&master, &engine);
    Ok(())
}

/// Fields `master set` may change; unset fields keep their stored value
#[derive(Debug, Default)]
pub struct MasterUpdate {
    pub address: Option<String>,
    pub key_handle: Option<String>,
    pub min_reserve: Option<Decimal>,
    pub gas_distribution_amount: Option<Decimal>,
    pub threshold_high: Option<Decimal>,
    pub threshold_medium: Option<Decimal>,
    pub threshold_low: Option<Decimal>,
    pub auto_sweep_enabled: Option<bool>,
}

impl MasterUpdate {
    fn apply(self, mut master: MasterWalletConfig) -> MasterWalletConfig {
        if let Some(v) = self.address {
            master.address = v;
        }
        if let Some(v) = self.key_handle {
            master.key_handle = v;
        }
        if let Some(v) = self.min_reserve {
            master.min_reserve = v;
        }
        if let Some(v) = self.gas_distribution_amount {
            master.gas_distribution_amount = v;
        }
        if let Some(v) = self.threshold_high {
            master.thresholds.high = v;
        }
        if let Some(v) = self.threshold_medium {
            master.thresholds.medium = v;
        }
        if let Some(v) = self.threshold_low {
            master.thresholds.low = v;
        }
        if let Some(v) = self.auto_sweep_enabled {
            master.auto_sweep_enabled = v;
        }
        master
    }
}

pub async fn master_set(config: &Config, update: MasterUpdate) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let registry = &engine.ctx.registry;

    let current = match registry.master_config().await {
        Ok(master) => master,
        Err(_) => match master_seed(config)? {
            Some(seed) => seed,
            None => MasterWalletConfig::with_defaults(
                update.address.as_deref().unwrap_or_default(),
                &config.master.key_handle,
            ),
        },
    };

    let master = registry.set_master_config(update.apply(current)).await?;
    println!("Master wallet configuration updated");
    print_master(&master, &engine);
    Ok(())
}

pub async fn withdrawals_list(config: &Config, status: Option<WithdrawalStatus>) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let requests = match status {
        Some(status) => engine.controller.withdrawals().list(status).await,
        None => engine.ctx.ledger.pending_withdrawals().await,
    };

    println!("\n=== WITHDRAWALS ===\n");
    println!(
        "{:<38} {:<14} {:>14} {:<11} {}",
        "ID", "USER", "AMOUNT", "STATUS", "TX / REASON"
    );
    println!("{}", "-".repeat(120));
    for request in &requests {
        print_withdrawal_row(request);
    }
    println!("\n{} requests", requests.len());
    Ok(())
}

pub async fn withdrawals_request(config: &Config, user_id: &str, to: &str, amount: Decimal) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let request = engine
        .controller
        .withdrawals()
        .create_withdrawal(user_id, to, amount)
        .await?;
    println!(
        "Queued withdrawal {} ({} {} to {})",
        request.id, request.amount, engine.ctx.settings.asset, request.to_address
    );
    Ok(())
}

/// Idempotent create-and-process for a caller-supplied id
pub async fn withdrawals_submit(
    config: &Config,
    id: &str,
    user_id: &str,
    to: &str,
    amount: Decimal,
) -> Result<()> {
    let engine = initialized_engine(config, false).await?;
    let hash = engine
        .controller
        .withdrawals()
        .submit_withdrawal(id, to, amount, user_id)
        .await?;
    println!("Withdrawal {} completed: {}", id, hash);
    Ok(())
}

/// Process one request, or drain the pending queue in FIFO order
pub async fn withdrawals_process(config: &Config, id: Option<String>) -> Result<()> {
    let engine = initialized_engine(config, false).await?;
    let withdrawals = engine.controller.withdrawals();

    match id {
        Some(id) => {
            let request = withdrawals.process(&id).await?;
            print_withdrawal_row(&request);
        }
        None => {
            let drain = withdrawals.process_pending().await;
            println!("\n=== WITHDRAWAL DRAIN ===\n");
            println!("Processed: {}", drain.processed.len());
            for request in &drain.processed {
                print_withdrawal_row(request);
            }
            if let Some(id) = &drain.blocked_on {
                println!("Blocked on {} (insufficient hot wallet balance)", id);
            }
            for error in &drain.errors {
                println!("Error: {}", error);
            }
        }
    }
    Ok(())
}

pub async fn withdrawals_retry(config: &Config, id: &str) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let request = engine.controller.withdrawals().retry_failed(id).await?;
    println!("Re-queued {} as {}", id, request.id);
    Ok(())
}

/// Resolve in-flight sweeps and withdrawals against chain state
pub async fn reconcile(config: &Config) -> Result<()> {
    let engine = build_engine(config, false).await?;
    let report = engine.controller.reconcile().await?;
    print_recovery(&report);
    Ok(())
}

pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

fn display_opt(value: Option<Decimal>) -> String {
    value.map_or_else(|| "unavailable".to_string(), |v| v.to_string())
}

fn print_master(master: &MasterWalletConfig, engine: &Engine) {
    let native = &engine.ctx.settings.native;
    let asset = &engine.ctx.settings.asset;
    println!("\n=== MASTER WALLET ===\n");
    println!("Address:          {}", master.address);
    println!("Key handle:       {}", master.key_handle);
    println!("Min reserve:      {} {}", master.min_reserve, native);
    println!("Gas per top-up:   {} {}", master.gas_distribution_amount, native);
    println!(
        "Thresholds:       high {} / medium {} / low {} {}",
        master.thresholds.high, master.thresholds.medium, master.thresholds.low, asset
    );
    println!("Auto sweep:       {}", master.auto_sweep_enabled);
    println!("Updated:          {}", master.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
}

fn print_withdrawal_row(request: &WithdrawalRequest) {
    let detail = request
        .tx_hash
        .as_deref()
        .or(request.failure_reason.as_deref())
        .unwrap_or("-");
    println!(
        "{:<38} {:<14} {:>14} {:<11} {}",
        request.id,
        request.user_id,
        request.amount,
        request.status.to_string(),
        detail
    );
}

fn print_scan(result: &ScanResult) {
    println!("\n=== SCAN ===\n");
    println!("Wallets scanned: {}", result.total_scanned);
    println!("New deposits:    {}", result.new_deposits);
    println!("Due for sweep:   {}", result.due.len());
    if result.skipped_busy > 0 {
        println!("Busy (sweeping): {}", result.skipped_busy);
    }
    for due in &result.due {
        println!("  {:<44} {:>16} {}", due.address, due.balance, due.tier);
    }
    for error in &result.errors {
        println!("Error: {}", error);
    }
    println!();
}

fn print_pass(pass: &PassSummary) {
    print_scan(&pass.scan);
    println!("=== PASS ({}) ===\n", pass.trigger);
    if pass.sweeps_enabled {
        println!(
            "Sweeps: {} completed, {} failed, {} swept",
            pass.sweeps_completed, pass.sweeps_failed, pass.total_swept
        );
    } else {
        println!("Sweeps: skipped (auto sweep disabled)");
    }
    for error in &pass.sweep_errors {
        println!("Sweep error: {}", error);
    }
    println!("Withdrawals processed: {}", pass.withdrawals.processed.len());
    if let Some(id) = &pass.withdrawals.blocked_on {
        println!("Withdrawals blocked on {}", id);
    }
    println!(
        "Duration: {}ms\n",
        (pass.finished_at - pass.started_at).num_milliseconds()
    );
}

fn print_recovery(report: &RecoveryReport) {
    println!("\n=== RECOVERY ===\n");
    println!(
        "Sweeps:      {} completed, {} failed",
        report.sweeps_completed, report.sweeps_failed
    );
    println!(
        "Withdrawals: {} completed, {} failed",
        report.withdrawals_completed, report.withdrawals_failed
    );
    println!("Gas top-ups: {} settled", report.gas_distributions_settled);
    for id in &report.unresolved_withdrawals {
        println!("Unresolved withdrawal (manual review): {}", id);
    }
    println!();
}
