//! Sweep executor
//!
//! Moves a deposit wallet's balance into the master wallet:
//! gas top-up, confirmation, then the token transfer. Only one sweep per
//! wallet runs at a time; a concurrent request fails fast with
//! `WalletBusy`. Scans skip a wallet while its sweep holds the lock, so any
//! inflow not yet recorded is recorded here before the balance is moved.

use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{error, info, warn};

use crate::chain::{TxOutcome, UnsignedTransfer};
use crate::error::{Error, Result};
use crate::ledger::{
    Deposit, DepositStatus, DepositUpdate, SweepOperation, SweepStatus, SweepTrigger, SweepUpdate,
};
use crate::registry::normalize_address;

use super::context::EngineContext;
use super::gas::GasDistributor;

/// Round a balance down to the sweep precision
pub fn sweep_amount(balance: Decimal, decimals: u32) -> Decimal {
    balance.round_dp_with_strategy(decimals, RoundingStrategy::ToZero)
}

pub struct SweepExecutor {
    ctx: Arc<EngineContext>,
    gas: GasDistributor,
}

impl SweepExecutor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let gas = GasDistributor::new(ctx.clone());
        Self { ctx, gas }
    }

    /// Sweep one wallet into the master wallet
    ///
    /// Preconditions (busy wallet, unknown wallet, missing master config)
    /// are returned as errors. Once an operation is opened, failures are
    /// recorded on it and the failed operation is returned.
    pub async fn sweep(&self, wallet: &str, trigger: SweepTrigger) -> Result<SweepOperation> {
        let address = normalize_address(wallet)?;
        let _guard = self
            .ctx
            .locks
            .try_acquire(&address)
            .ok_or_else(|| Error::WalletBusy(address.clone()))?;

        let record = self.ctx.registry.get_wallet(&address).await?;
        let master = self.ctx.registry.master_config().await?;

        let op = self.ctx.ledger.open_sweep(&address, trigger).await?;
        let op = self
            .ctx
            .ledger
            .update_sweep(&op.id, SweepStatus::InProgress, SweepUpdate::default())
            .await?;
        info!(wallet = %address, sweep = %op.id, trigger = %trigger, "Sweep started");

        let mut deposits = self.ctx.ledger.open_deposits(&address).await;

        let asset = &self.ctx.settings.asset;
        let balance = match self.ctx.chain.get_balance(&address, asset).await {
            Ok(balance) => balance,
            Err(e) => return self.fail(&op, &deposits, &e.to_string(), None).await,
        };
        if balance > record.last_balance {
            let inflow = balance - record.last_balance;
            let deposit = self
                .ctx
                .ledger
                .record_deposit(&address, inflow, asset.symbol())
                .await?;
            self.ctx.registry.set_last_balance(&address, balance).await?;
            info!(wallet = %address, amount = %inflow, "Unscanned deposit recorded by sweep");
            deposits.push(deposit);
        }
        let amount = sweep_amount(balance, self.ctx.settings.sweep_decimals);
        if amount <= Decimal::ZERO {
            return self.fail(&op, &deposits, "nothing to sweep", None).await;
        }

        // Gas before the transfer; deposits stay open if this fails
        let funding = match self.gas.ensure_gas(&address).await {
            Ok(funding) => funding,
            Err(e) => {
                warn!(wallet = %address, "Gas funding failed: {}", e);
                return self.fail(&op, &deposits, &e.to_string(), None).await;
            }
        };

        for deposit in &deposits {
            if deposit.status == DepositStatus::Detected {
                self.ctx
                    .ledger
                    .update_deposit(
                        &deposit.id,
                        DepositStatus::GasFunded,
                        DepositUpdate {
                            gas_tx_hash: funding.tx_hash.clone(),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }
        let op = self
            .ctx
            .ledger
            .update_sweep(
                &op.id,
                SweepStatus::InProgress,
                SweepUpdate {
                    gas_tx_hash: funding.tx_hash.clone(),
                    ..Default::default()
                },
            )
            .await?;

        let nonce = match self.ctx.chain.get_nonce(&address).await {
            Ok(nonce) => nonce,
            Err(e) => return self.fail(&op, &deposits, &e.to_string(), None).await,
        };
        let fees = &self.ctx.settings.fees;
        let transfer = UnsignedTransfer {
            chain_id: fees.chain_id,
            from: address.clone(),
            to: master.address.clone(),
            asset: asset.clone(),
            amount,
            nonce,
            gas_limit: fees.gas_limit_for(asset),
            gas_price_gwei: fees.gas_price_gwei,
        };
        let signed = match self
            .ctx
            .secrets
            .with_signer(&record.key_handle, |key| self.ctx.chain.sign(key, &transfer))
        {
            Ok(signed) => signed,
            Err(e) => return self.fail(&op, &deposits, &e.to_string(), None).await,
        };

        // Hash is durable before broadcast so recovery can find it
        let op = self
            .ctx
            .ledger
            .update_sweep(
                &op.id,
                SweepStatus::InProgress,
                SweepUpdate {
                    amount: Some(amount),
                    sweep_tx_hash: Some(signed.hash.clone()),
                    ..Default::default()
                },
            )
            .await?;

        if let Err(e) = self.ctx.chain.submit(&signed).await {
            error!(wallet = %address, tx_hash = %signed.hash, "Sweep broadcast failed: {}", e);
            return self
                .fail(&op, &deposits, &e.to_string(), Some(&signed.hash))
                .await;
        }

        let outcome = self
            .ctx
            .chain
            .wait_for_confirmation(&signed.hash, self.ctx.settings.confirmation_timeout)
            .await;
        match outcome {
            Ok(TxOutcome::Confirmed { block }) => {
                for deposit in &deposits {
                    self.ctx
                        .ledger
                        .update_deposit(
                            &deposit.id,
                            DepositStatus::Swept,
                            DepositUpdate {
                                sweep_tx_hash: Some(signed.hash.clone()),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
                let op = self
                    .ctx
                    .ledger
                    .update_sweep(&op.id, SweepStatus::Completed, SweepUpdate::default())
                    .await?;
                self.ctx
                    .registry
                    .set_last_balance(&address, balance - amount)
                    .await?;

                info!(
                    wallet = %address,
                    tx_hash = %signed.hash,
                    block,
                    "Swept {} {} to master",
                    amount,
                    asset
                );
                Ok(op)
            }
            Ok(TxOutcome::Reverted { reason }) => {
                self.fail(&op, &deposits, &format!("sweep reverted: {}", reason), Some(&signed.hash))
                    .await
            }
            Ok(TxOutcome::TimedOut) => {
                self.fail(&op, &deposits, "sweep confirmation timed out", Some(&signed.hash))
                    .await
            }
            Err(e) => self.fail(&op, &deposits, &e.to_string(), Some(&signed.hash)).await,
        }
    }

    /// Mark the operation failed
    ///
    /// Before any sweep broadcast the deposits keep their status and only
    /// carry the reason; after it they fail alongside the operation.
    async fn fail(
        &self,
        op: &SweepOperation,
        deposits: &[Deposit],
        reason: &str,
        sweep_tx_hash: Option<&str>,
    ) -> Result<SweepOperation> {
        for deposit in deposits {
            let status = match sweep_tx_hash {
                Some(_) => DepositStatus::Failed,
                None => self.ctx.ledger.get_deposit(&deposit.id).await?.status,
            };
            self.ctx
                .ledger
                .update_deposit(
                    &deposit.id,
                    status,
                    DepositUpdate {
                        sweep_tx_hash: sweep_tx_hash.map(str::to_string),
                        failure_reason: Some(reason.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let op = self
            .ctx
            .ledger
            .update_sweep(
                &op.id,
                SweepStatus::Failed,
                SweepUpdate {
                    error: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        warn!(wallet = %op.wallet, sweep = %op.id, "Sweep failed: {}", reason);
        Ok(op)
    }
}
