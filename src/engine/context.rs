//! Shared engine context

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use crate::chain::{Asset, ChainGateway, FeeSchedule};
use crate::ledger::PersistenceLedger;
use crate::registry::WalletRegistry;
use crate::secrets::SecretStore;

use super::locks::KeyedLocks;
use super::submitter::MasterSubmitter;

/// Rescan cadence for non-high tiers
#[derive(Debug, Clone)]
pub struct Cadence {
    pub medium_interval: Duration,
    pub low_interval: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            medium_interval: Duration::from_secs(3600),
            low_interval: Duration::from_secs(86_400),
        }
    }
}

/// Runtime knobs for the engine components
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Asset deposits arrive in and sweeps move
    pub asset: Asset,
    pub native: Asset,
    pub fees: FeeSchedule,
    pub confirmation_timeout: Duration,
    pub max_concurrency: usize,
    pub cadence: Cadence,
    /// Sweep amounts are rounded down to this many decimals
    pub sweep_decimals: u32,
    /// Asset balance the master wallet keeps back from withdrawals
    pub withdrawal_reserve: Decimal,
    pub pass_interval: Duration,
}

/// Everything the engine components share
pub struct EngineContext {
    pub registry: Arc<WalletRegistry>,
    pub ledger: Arc<PersistenceLedger>,
    pub chain: ChainGateway,
    pub secrets: Arc<SecretStore>,
    pub settings: EngineSettings,
    /// Per-wallet sweep locks and per-request withdrawal locks
    pub locks: KeyedLocks,
    /// Serializes every master-wallet transaction
    pub submitter: MasterSubmitter,
}

impl EngineContext {
    pub fn new(
        registry: Arc<WalletRegistry>,
        ledger: Arc<PersistenceLedger>,
        chain: ChainGateway,
        secrets: Arc<SecretStore>,
        settings: EngineSettings,
    ) -> Arc<Self> {
        let submitter = MasterSubmitter::new(chain.clone(), secrets.clone());
        Arc::new(Self {
            registry,
            ledger,
            chain,
            secrets,
            settings,
            locks: KeyedLocks::new(),
            submitter,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Engine fixture on the simulated chain

    use super::*;
    use crate::chain::{ConfirmationPolicy, RetryPolicy, SimulatedChain};
    use crate::registry::MasterWalletConfig;
    use crate::secrets::MemoryKeySource;
    use rust_decimal_macros::dec;

    pub const MASTER: &str = "0x00000000000000000000000000000000000000aa";
    pub const W1: &str = "0x1111111111111111111111111111111111111111";
    pub const W2: &str = "0x2222222222222222222222222222222222222222";
    pub const USER_ADDR: &str = "0x9999999999999999999999999999999999999999";

    pub struct Fixture {
        pub chain: Arc<SimulatedChain>,
        pub keys: Arc<MemoryKeySource>,
        pub ctx: Arc<EngineContext>,
    }

    pub fn settings(chain: &SimulatedChain) -> EngineSettings {
        EngineSettings {
            asset: chain.token(),
            native: chain.native(),
            fees: FeeSchedule {
                chain_id: 56,
                gas_price_gwei: dec!(3),
                token_transfer_gas_limit: 65_000,
                native_transfer_gas_limit: 21_000,
            },
            confirmation_timeout: Duration::from_millis(200),
            max_concurrency: 4,
            cadence: Cadence::default(),
            sweep_decimals: 6,
            withdrawal_reserve: Decimal::ZERO,
            pass_interval: Duration::from_millis(20),
        }
    }

    pub fn gateway(chain: Arc<SimulatedChain>) -> ChainGateway {
        ChainGateway::new(
            chain,
            RetryPolicy {
                call_timeout: Duration::from_millis(200),
                base_delay: Duration::from_millis(1),
                max_elapsed: Duration::from_millis(20),
            },
            ConfirmationPolicy {
                confirmations: 3,
                poll_interval: Duration::from_millis(1),
            },
        )
    }

    /// Master configured with 2 BNB, auto sweep on, no deposit wallets yet
    pub async fn fixture() -> Fixture {
        fixture_with(|_| {}).await
    }

    pub async fn fixture_with(tweak: impl FnOnce(&mut EngineSettings)) -> Fixture {
        let chain = Arc::new(SimulatedChain::new());
        let keys = Arc::new(MemoryKeySource::new());
        keys.insert_derived("master");

        let mut engine_settings = settings(&chain);
        tweak(&mut engine_settings);

        let registry = Arc::new(WalletRegistry::in_memory());
        let mut master = MasterWalletConfig::with_defaults(MASTER, "master");
        master.auto_sweep_enabled = true;
        registry.set_master_config(master).await.unwrap();
        chain.set_native_balance(MASTER, dec!(2));

        let ctx = EngineContext::new(
            registry,
            Arc::new(PersistenceLedger::in_memory()),
            gateway(chain.clone()),
            Arc::new(SecretStore::new(keys.clone())),
            engine_settings,
        );

        Fixture { chain, keys, ctx }
    }

    impl Fixture {
        /// Register a deposit wallet holding `balance` tokens and no gas
        pub async fn add_wallet(&self, address: &str, balance: Decimal) {
            let handle = format!("h{}", &address[address.len() - 4..]);
            self.keys.insert_derived(&handle);
            self.ctx
                .registry
                .add_wallet(address, "alice", &handle)
                .await
                .unwrap();
            self.chain.set_token_balance(address, balance);
        }

        pub async fn set_master(&self, f: impl FnOnce(&mut MasterWalletConfig)) {
            let mut master = self.ctx.registry.master_config().await.unwrap();
            f(&mut master);
            self.ctx.registry.set_master_config(master).await.unwrap();
        }
    }
}
