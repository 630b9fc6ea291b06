//! Wallet registry store
//!
//! Owns deposit-wallet records and the master wallet configuration,
//! persisted as `registry.json`. No chain I/O happens here.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{Error, Result};
use crate::storage::{read_json_or_default, write_json_atomic};

use super::types::{
    normalize_address, DepositWallet, MasterWalletConfig, RegistrySnapshot, Tier, WalletFilter,
};

struct RegistryState {
    master: Option<MasterWalletConfig>,
    wallets: HashMap<String, DepositWallet>,
}

/// Registry of deposit wallets plus the master wallet config
pub struct WalletRegistry {
    path: Option<PathBuf>,
    state: RwLock<RegistryState>,
    /// Held from snapshot to rename so saves land in mutation order
    save_lock: Mutex<()>,
}

impl WalletRegistry {
    /// Load the registry from a JSON snapshot (empty if missing)
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let snapshot: RegistrySnapshot = read_json_or_default(&path).await?;

        let wallets: HashMap<String, DepositWallet> = snapshot
            .wallets
            .into_iter()
            .map(|w| (w.address.clone(), w))
            .collect();

        info!("Loaded {} deposit wallets from {}", wallets.len(), path.display());

        Ok(Self {
            path: Some(path),
            state: RwLock::new(RegistryState {
                master: snapshot.master,
                wallets,
            }),
            save_lock: Mutex::new(()),
        })
    }

    /// Registry that never touches disk (dry runs, tests)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(RegistryState {
                master: None,
                wallets: HashMap::new(),
            }),
            save_lock: Mutex::new(()),
        }
    }

    /// List wallets matching the filter, oldest first
    pub async fn list_wallets(&self, filter: &WalletFilter) -> Vec<DepositWallet> {
        let state = self.state.read().await;
        let mut wallets: Vec<DepositWallet> = state
            .wallets
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        wallets.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.address.cmp(&b.address))
        });
        wallets
    }

    /// Get a single wallet by address
    pub async fn get_wallet(&self, address: &str) -> Result<DepositWallet> {
        let key = address.trim().to_lowercase();
        self.state
            .read()
            .await
            .wallets
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::WalletNotFound(address.to_string()))
    }

    /// Provision a deposit wallet for a user
    pub async fn add_wallet(
        &self,
        address: &str,
        user_id: &str,
        key_handle: &str,
    ) -> Result<DepositWallet> {
        let address = normalize_address(address)?;
        if user_id.trim().is_empty() {
            return Err(Error::Configuration("user_id is empty".to_string()));
        }
        if key_handle.trim().is_empty() {
            return Err(Error::Configuration("key_handle is empty".to_string()));
        }

        let wallet = {
            let mut state = self.state.write().await;
            if state.wallets.contains_key(&address) {
                return Err(Error::Configuration(format!(
                    "Wallet already registered: {}",
                    address
                )));
            }
            let wallet = DepositWallet {
                address: address.clone(),
                user_id: user_id.to_string(),
                key_handle: key_handle.to_string(),
                last_scanned_at: None,
                tier: Tier::None,
                last_balance: Decimal::ZERO,
                created_at: Utc::now(),
            };
            state.wallets.insert(address.clone(), wallet.clone());
            wallet
        };

        info!(wallet = %address, user = %user_id, "Registered deposit wallet");
        self.save().await?;
        Ok(wallet)
    }

    /// Record a scan result: balance, tier and scan time
    pub async fn record_scan(
        &self,
        address: &str,
        balance: Decimal,
        tier: Tier,
        at: DateTime<Utc>,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let wallet = state
                .wallets
                .get_mut(address)
                .ok_or_else(|| Error::WalletNotFound(address.to_string()))?;
            wallet.last_balance = balance;
            wallet.tier = tier;
            wallet.last_scanned_at = Some(at);
        }
        self.save().await
    }

    /// Update the tier only, leaving the scan timestamp alone
    pub async fn set_tier(&self, address: &str, tier: Tier) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let wallet = state
                .wallets
                .get_mut(address)
                .ok_or_else(|| Error::WalletNotFound(address.to_string()))?;
            if wallet.tier == tier {
                return Ok(());
            }
            wallet.tier = tier;
        }
        self.save().await
    }

    /// Set the recorded balance after a sweep moved funds out
    pub async fn set_last_balance(&self, address: &str, balance: Decimal) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let wallet = state
                .wallets
                .get_mut(address)
                .ok_or_else(|| Error::WalletNotFound(address.to_string()))?;
            wallet.last_balance = balance;
        }
        self.save().await
    }

    /// Get the master wallet configuration
    pub async fn master_config(&self) -> Result<MasterWalletConfig> {
        self.state
            .read()
            .await
            .master
            .clone()
            .ok_or(Error::MasterNotConfigured)
    }

    /// Whether a master wallet config has been stored
    pub async fn is_master_configured(&self) -> bool {
        self.state.read().await.master.is_some()
    }

    /// Replace the master wallet configuration
    ///
    /// Fails with a configuration error on a malformed address or when the
    /// thresholds are not strictly ordered.
    pub async fn set_master_config(&self, config: MasterWalletConfig) -> Result<MasterWalletConfig> {
        let mut config = config.validated()?;
        config.updated_at = Utc::now();

        self.state.write().await.master = Some(config.clone());
        info!(
            address = %config.address,
            auto_sweep = config.auto_sweep_enabled,
            "Master wallet configuration updated"
        );

        self.save().await?;
        Ok(config)
    }

    async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let _saving = self.save_lock.lock().await;
        let snapshot = {
            let state = self.state.read().await;
            RegistrySnapshot {
                version: "1.0".to_string(),
                master: state.master.clone(),
                wallets: state.wallets.values().cloned().collect(),
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
    const W2: &str = "0x2222222222222222222222222222222222222222";
    const MASTER: &str = "0x00000000000000000000000000000000000000aa";

    #[tokio::test]
    async fn test_add_and_list_wallets() {
        let registry = WalletRegistry::in_memory();
        registry.add_wallet(W1, "alice", "k1").await.unwrap();
        registry.add_wallet(W2, "bob", "k2").await.unwrap();

        let all = registry.list_wallets(&WalletFilter::default()).await;
        assert_eq!(all.len(), 2);

        let bob = registry
            .list_wallets(&WalletFilter {
                user_id: Some("bob".into()),
                tier: None,
            })
            .await;
        assert_eq!(bob.len(), 1);
        assert_eq!(bob[0].address, W2);
    }

    #[tokio::test]
    async fn test_duplicate_and_malformed_wallets_rejected() {
        let registry = WalletRegistry::in_memory();
        registry.add_wallet(W1, "alice", "k1").await.unwrap();

        assert!(registry.add_wallet(W1, "alice", "k1").await.is_err());
        assert!(matches!(
            registry.add_wallet("0xnope", "alice", "k1").await,
            Err(Error::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_master_config_validation() {
        let registry = WalletRegistry::in_memory();
        assert!(matches!(
            registry.master_config().await,
            Err(Error::MasterNotConfigured)
        ));

        let mut cfg = MasterWalletConfig::with_defaults(MASTER, "master");
        cfg.thresholds.low = dec!(50);
        assert!(matches!(
            registry.set_master_config(cfg).await,
            Err(Error::Configuration(_))
        ));
        assert!(!registry.is_master_configured().await);

        let cfg = MasterWalletConfig::with_defaults(MASTER, "master");
        registry.set_master_config(cfg).await.unwrap();
        assert!(registry.is_master_configured().await);
    }

    #[tokio::test]
    async fn test_registry_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let registry = WalletRegistry::load(&path).await.unwrap();
            registry.add_wallet(W1, "alice", "k1").await.unwrap();
            registry
                .set_master_config(MasterWalletConfig::with_defaults(MASTER, "master"))
                .await
                .unwrap();
            registry
                .record_scan(W1, dec!(42), Tier::Medium, Utc::now())
                .await
                .unwrap();
        }

        let reloaded = WalletRegistry::load(&path).await.unwrap();
        let wallet = reloaded.get_wallet(W1).await.unwrap();
        assert_eq!(wallet.last_balance, dec!(42));
        assert_eq!(wallet.tier, Tier::Medium);
        assert!(wallet.last_scanned_at.is_some());
        assert_eq!(reloaded.master_config().await.unwrap().address, MASTER);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_all_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = std::sync::Arc::new(WalletRegistry::load(&path).await.unwrap());

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    let address = format!("0x{:040x}", 0x1000 + i);
                    registry
                        .add_wallet(&address, "alice", &format!("k{}", i))
                        .await
                        .map(|_| ())
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let reloaded = WalletRegistry::load(&path).await.unwrap();
        assert_eq!(reloaded.list_wallets(&WalletFilter::default()).await.len(), 64);
    }
}
