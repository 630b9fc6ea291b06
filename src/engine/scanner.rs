//! Deposit scanner
//!
//! Reads each deposit wallet's balance with bounded concurrency, records a
//! deposit for any increase over the last recorded balance, and reports
//! which wallets are due for a sweep. One wallet's RPC failure never aborts
//! the scan. A wallet whose sweep is running is skipped; the sweep records
//! its inflow.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::Deposit;
use crate::registry::{normalize_address, DepositWallet, SweepThresholds, Tier, WalletFilter};

use super::context::EngineContext;
use super::scheduler::PriorityScheduler;

/// A wallet the scheduler wants swept this pass
#[derive(Debug, Clone, Serialize)]
pub struct DueWallet {
    pub address: String,
    pub balance: Decimal,
    pub tier: Tier,
}

/// Outcome of a scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    pub new_deposits: usize,
    pub total_scanned: usize,
    /// `"<address>: <message>"` per failed wallet
    pub errors: Vec<String>,
    pub due: Vec<DueWallet>,
    /// Wallets left alone because a sweep held them
    pub skipped_busy: usize,
}

struct WalletScan {
    deposit: Option<Deposit>,
    due: Option<DueWallet>,
}

pub struct DepositScanner {
    ctx: Arc<EngineContext>,
    scheduler: PriorityScheduler,
}

impl DepositScanner {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let scheduler = PriorityScheduler::new(ctx.settings.cadence.clone());
        Self { ctx, scheduler }
    }

    /// Scan one wallet (forced, ignores cadence) or the whole registry
    pub async fn scan(&self, wallet: Option<&str>) -> Result<ScanResult> {
        let thresholds = self.ctx.registry.master_config().await?.thresholds;

        let (wallets, force) = match wallet {
            Some(address) => {
                let lookup = match normalize_address(address) {
                    Ok(normalized) => self.ctx.registry.get_wallet(&normalized).await,
                    Err(e) => Err(e),
                };
                match lookup {
                    Ok(found) => (vec![found], true),
                    Err(e) => {
                        warn!(wallet = %address, "Scan failed: {}", e);
                        return Ok(ScanResult {
                            total_scanned: 1,
                            errors: vec![format!("{}: {}", address, e)],
                            ..Default::default()
                        });
                    }
                }
            }
            None => (self.ctx.registry.list_wallets(&WalletFilter::default()).await, false),
        };

        let total = wallets.len();
        let concurrency = self.ctx.settings.max_concurrency.max(1);
        let thresholds = &thresholds;

        let outcomes: Vec<(String, Result<Option<WalletScan>>)> = stream::iter(wallets)
            .map(|w| async move {
                let address = w.address.clone();
                let outcome = self.scan_wallet(w, thresholds, force).await;
                (address, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut result = ScanResult {
            total_scanned: total,
            ..Default::default()
        };
        for (address, outcome) in outcomes {
            match outcome {
                Ok(None) => result.skipped_busy += 1,
                Ok(Some(scan)) => {
                    if scan.deposit.is_some() {
                        result.new_deposits += 1;
                    }
                    if let Some(due) = scan.due {
                        result.due.push(due);
                    }
                }
                Err(e) => {
                    warn!(wallet = %address, "Scan failed: {}", e);
                    result.errors.push(format!("{}: {}", address, e));
                }
            }
        }
        result.due.sort_by(|a, b| b.tier.cmp(&a.tier).then_with(|| a.address.cmp(&b.address)));

        info!(
            "Scan complete: {} wallets, {} new deposits, {} due, {} errors, {} busy",
            result.total_scanned,
            result.new_deposits,
            result.due.len(),
            result.errors.len(),
            result.skipped_busy
        );
        Ok(result)
    }

    /// `None` when a sweep holds the wallet
    async fn scan_wallet(
        &self,
        wallet: DepositWallet,
        thresholds: &SweepThresholds,
        force: bool,
    ) -> Result<Option<WalletScan>> {
        let Some(_guard) = self.ctx.locks.try_acquire(&wallet.address) else {
            debug!(wallet = %wallet.address, "Sweep in progress, scan skipped");
            return Ok(None);
        };
        // Re-read under the lock; a sweep may have moved last_balance since listing
        let wallet = self.ctx.registry.get_wallet(&wallet.address).await?;

        let asset = &self.ctx.settings.asset;
        let balance = self.ctx.chain.get_balance(&wallet.address, asset).await?;
        let now = Utc::now();
        let decision = self
            .scheduler
            .evaluate(&wallet, balance, thresholds, now, force);

        if !decision.due {
            self.ctx.registry.set_tier(&wallet.address, decision.tier).await?;
            debug!(wallet = %wallet.address, tier = %decision.tier, "Not due this pass");
            return Ok(Some(WalletScan {
                deposit: None,
                due: None,
            }));
        }

        let deposit = if balance > wallet.last_balance {
            let amount = balance - wallet.last_balance;
            let deposit = self
                .ctx
                .ledger
                .record_deposit(&wallet.address, amount, asset.symbol())
                .await?;
            info!(
                wallet = %wallet.address,
                amount = %amount,
                "Deposit detected: {} {}",
                amount,
                asset.symbol()
            );
            Some(deposit)
        } else {
            None
        };

        self.ctx
            .registry
            .record_scan(&wallet.address, balance, decision.tier, now)
            .await?;

        let sweepable = force || decision.tier > Tier::None;
        Ok(Some(WalletScan {
            deposit,
            due: sweepable.then(|| DueWallet {
                address: wallet.address,
                balance,
                tier: decision.tier,
            }),
        }))
    }
}
