//! Master wallet submitter
//!
//! Gas distributions and withdrawals both spend from the master wallet. All
//! of them go through one async mutex around the cached next nonce, so two
//! transactions can never be signed with the same nonce. Callers check the
//! master balance while holding the slot.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::chain::{ChainGateway, SignedTransaction, UnsignedTransfer};
use crate::error::Result;
use crate::secrets::SecretStore;

/// Cached (address, next nonce)
type NonceCache = Option<(String, u64)>;

pub struct MasterSubmitter {
    chain: ChainGateway,
    secrets: Arc<SecretStore>,
    next_nonce: Mutex<NonceCache>,
}

/// Exclusive right to the master wallet's next nonce
///
/// Dropping the slot without broadcasting leaves the nonce unused.
pub struct NonceSlot<'a> {
    guard: MutexGuard<'a, NonceCache>,
    chain: &'a ChainGateway,
    secrets: &'a SecretStore,
    address: String,
    nonce: u64,
}

impl MasterSubmitter {
    pub fn new(chain: ChainGateway, secrets: Arc<SecretStore>) -> Self {
        Self {
            chain,
            secrets,
            next_nonce: Mutex::new(None),
        }
    }

    /// Wait for the master lock and resolve the next nonce
    pub async fn reserve(&self, address: &str) -> Result<NonceSlot<'_>> {
        let mut guard = self.next_nonce.lock().await;

        let cached = guard
            .as_ref()
            .filter(|(cached_address, _)| cached_address == address)
            .map(|(_, nonce)| *nonce);

        let nonce = match cached {
            Some(nonce) => nonce,
            None => {
                let nonce = self.chain.get_nonce(address).await?;
                *guard = Some((address.to_string(), nonce));
                nonce
            }
        };

        Ok(NonceSlot {
            guard,
            chain: &self.chain,
            secrets: &self.secrets,
            address: address.to_string(),
            nonce,
        })
    }
}

impl<'a> NonceSlot<'a> {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Sign with the master key; `transfer.nonce` must be this slot's nonce
    pub fn sign(&self, key_handle: &str, transfer: UnsignedTransfer) -> Result<SignedTransaction> {
        debug_assert_eq!(transfer.nonce, self.nonce);
        self.secrets
            .with_signer(key_handle, |key| self.chain.sign(key, &transfer))
    }

    /// Broadcast and advance the nonce, releasing the master lock
    ///
    /// Any failure drops the cached nonce so the next slot re-reads it.
    pub async fn broadcast(mut self, tx: &SignedTransaction) -> Result<String> {
        match self.chain.submit(tx).await {
            Ok(hash) => {
                *self.guard = Some((self.address.clone(), self.nonce + 1));
                debug!(tx_hash = %hash, nonce = self.nonce, "Master transaction broadcast");
                Ok(hash)
            }
            Err(e) => {
                warn!(nonce = self.nonce, "Master broadcast failed, nonce cache cleared: {}", e);
                *self.guard = None;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
impl MasterSubmitter {
    /// Sign and broadcast a master transfer with no balance checks
    pub async fn transfer(
        &self,
        master: &crate::registry::MasterWalletConfig,
        to: &str,
        asset: &crate::chain::Asset,
        amount: rust_decimal::Decimal,
        fees: &crate::chain::FeeSchedule,
    ) -> Result<String> {
        let slot = self.reserve(&master.address).await?;
        let signed = slot.sign(
            &master.key_handle,
            UnsignedTransfer {
                chain_id: fees.chain_id,
                from: master.address.clone(),
                to: to.to_string(),
                asset: asset.clone(),
                amount,
                nonce: slot.nonce(),
                gas_limit: fees.gas_limit_for(asset),
                gas_price_gwei: fees.gas_price_gwei,
            },
        )?;
        slot.broadcast(&signed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::testing::{fixture, MASTER, USER_ADDR};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_concurrent_transfers_get_distinct_nonces() {
        let fx = fixture().await;
        let master = fx.ctx.registry.master_config().await.unwrap();
        let native = fx.ctx.settings.native.clone();

        let send = || {
            fx.ctx
                .submitter
                .transfer(&master, USER_ADDR, &native, dec!(0.01), &fx.ctx.settings.fees)
        };
        let (a, b, c) = tokio::join!(send(), send(), send());
        assert!(a.is_ok() && b.is_ok() && c.is_ok());

        let mut nonces: Vec<u64> = fx
            .chain
            .submissions_from(MASTER)
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        nonces.sort();
        assert_eq!(nonces, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_failed_broadcast_resyncs_nonce() {
        let fx = fixture().await;
        let master = fx.ctx.registry.master_config().await.unwrap();
        let native = fx.ctx.settings.native.clone();

        // More than the master holds: rejected at submit
        let err = fx
            .ctx
            .submitter
            .transfer(&master, USER_ADDR, &native, dec!(50), &fx.ctx.settings.fees)
            .await;
        assert!(err.is_err());

        fx.ctx
            .submitter
            .transfer(&master, USER_ADDR, &native, dec!(0.01), &fx.ctx.settings.fees)
            .await
            .unwrap();
        assert_eq!(fx.chain.submissions_from(MASTER)[0].nonce, 0);
    }
}
