//! Gas distributor
//!
//! Tops up a deposit wallet with enough native currency for one token
//! transfer. The master wallet's reserve floor is checked while holding the
//! master nonce slot, so concurrent top-ups and withdrawals see each
//! other's spending before anything is submitted.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chain::UnsignedTransfer;
use crate::error::{Error, Result};
use crate::ledger::GasDistributionStatus;
use crate::registry::normalize_address;

use super::context::EngineContext;

/// Result of a gas check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GasFunding {
    /// Whether a top-up was sent
    pub funded: bool,
    pub tx_hash: Option<String>,
}

pub struct GasDistributor {
    ctx: Arc<EngineContext>,
}

impl GasDistributor {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Make sure `wallet` can pay for one token transfer
    ///
    /// Returns once any top-up is confirmed. Fails with
    /// `InsufficientReserve` (nothing submitted) when the master cannot
    /// spare `gas_distribution_amount` plus its own transfer fee above
    /// `min_reserve`. A broadcast top-up is in the ledger even when its
    /// confirmation later fails.
    pub async fn ensure_gas(&self, wallet: &str) -> Result<GasFunding> {
        let wallet = normalize_address(wallet)?;
        let fees = &self.ctx.settings.fees;
        let native = &self.ctx.settings.native;
        let required = fees.token_transfer_fee();

        let current = self.ctx.chain.get_native_balance(&wallet).await?;
        if current >= required {
            debug!(wallet = %wallet, balance = %current, "Wallet already has gas");
            return Ok(GasFunding {
                funded: false,
                tx_hash: None,
            });
        }

        let master = self.ctx.registry.master_config().await?;
        let amount = master.gas_distribution_amount.max(required - current);
        if master.gas_distribution_amount < required - current {
            warn!(
                wallet = %wallet,
                "Configured gas amount {} is below the {} shortfall; sending the shortfall",
                master.gas_distribution_amount,
                required - current
            );
        }

        let slot = self.ctx.submitter.reserve(&master.address).await?;

        let master_native = self.ctx.chain.get_native_balance(&master.address).await?;
        let needed = amount + fees.native_transfer_fee();
        let available = master_native - master.min_reserve;
        if available < needed {
            warn!(
                wallet = %wallet,
                master_balance = %master_native,
                min_reserve = %master.min_reserve,
                "Gas distribution refused: reserve floor would be breached"
            );
            return Err(Error::InsufficientReserve {
                available,
                required: needed,
            });
        }

        let signed = slot.sign(
            &master.key_handle,
            UnsignedTransfer {
                chain_id: fees.chain_id,
                from: master.address.clone(),
                to: wallet.clone(),
                asset: native.clone(),
                amount,
                nonce: slot.nonce(),
                gas_limit: fees.gas_limit_for(native),
                gas_price_gwei: fees.gas_price_gwei,
            },
        )?;
        let tx_hash = slot.broadcast(&signed).await?;
        info!(wallet = %wallet, tx_hash = %tx_hash, "Gas distribution sent: {} {}", amount, native);

        let record = self
            .ctx
            .ledger
            .record_gas_distribution(&wallet, amount, &tx_hash)
            .await?;

        match self
            .ctx
            .chain
            .ensure_confirmed(&tx_hash, self.ctx.settings.confirmation_timeout)
            .await
        {
            Ok(_) => {
                self.ctx
                    .ledger
                    .set_gas_distribution_status(&record.id, GasDistributionStatus::Confirmed)
                    .await?;
            }
            Err(e) => {
                // A timed-out top-up may still land; only a revert settles it
                if matches!(e, Error::Reverted(_)) {
                    self.ctx
                        .ledger
                        .set_gas_distribution_status(&record.id, GasDistributionStatus::Failed)
                        .await?;
                }
                return Err(e);
            }
        }

        Ok(GasFunding {
            funded: true,
            tx_hash: Some(tx_hash),
        })
    }

    /// Native balance the master can still spend above its reserve
    pub async fn spendable_native(&self) -> Result<Decimal> {
        let master = self.ctx.registry.master_config().await?;
        let balance = self.ctx.chain.get_native_balance(&master.address).await?;
        Ok(balance - master.min_reserve)
    }
}
