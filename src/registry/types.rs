//! Core types for the wallet registry
//!
//! Defines deposit wallets, the master wallet configuration and tiers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

lazy_static::lazy_static! {
    static ref EVM_ADDRESS: regex::Regex =
        regex::Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("Invalid address regex");
}

/// Validate an EVM-style address and return its canonical (lowercase) form
pub fn normalize_address(address: &str) -> Result<String> {
    let trimmed = address.trim();
    if !EVM_ADDRESS.is_match(trimmed) {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    Ok(trimmed.to_lowercase())
}

/// Scan/sweep cadence tier derived from a wallet's balance
///
/// Variants are declared lowest first so the derived ordering gives
/// `High > Medium > Low > None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Below the low threshold, never scanned by the scheduler
    None,

    /// Scanned at most once per day
    Low,

    /// Scanned at most once per hour
    Medium,

    /// Scanned and swept on every pass
    High,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::None
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::None => write!(f, "none"),
            Tier::Low => write!(f, "low"),
            Tier::Medium => write!(f, "medium"),
            Tier::High => write!(f, "high"),
        }
    }
}

/// Per-user deposit wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositWallet {
    /// Wallet address (lowercase)
    pub address: String,

    /// Owning user reference
    pub user_id: String,

    /// Opaque handle resolved by the secret store
    pub key_handle: String,

    /// When the scanner last looked at this wallet
    #[serde(default)]
    pub last_scanned_at: Option<DateTime<Utc>>,

    /// Tier assigned on the last scan
    #[serde(default)]
    pub tier: Tier,

    /// Token balance recorded on the last scan
    #[serde(default)]
    pub last_balance: Decimal,

    /// When the wallet was provisioned
    pub created_at: DateTime<Utc>,
}

/// Balance thresholds that drive tier classification
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepThresholds {
    pub high: Decimal,
    pub medium: Decimal,
    pub low: Decimal,
}

impl Default for SweepThresholds {
    fn default() -> Self {
        Self {
            high: dec!(100.00),
            medium: dec!(20.00),
            low: dec!(5.00),
        }
    }
}

impl SweepThresholds {
    /// Require `low < medium < high` with a non-negative floor
    pub fn validate(&self) -> Result<()> {
        if self.low < Decimal::ZERO {
            return Err(Error::Configuration(format!(
                "sweep_threshold_low must be non-negative, got {}",
                self.low
            )));
        }
        if !(self.low < self.medium && self.medium < self.high) {
            return Err(Error::Configuration(format!(
                "Sweep thresholds must satisfy low < medium < high (got {} / {} / {})",
                self.low, self.medium, self.high
            )));
        }
        Ok(())
    }
}

/// Master/hot wallet configuration (singleton)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterWalletConfig {
    /// Hot wallet address (lowercase)
    pub address: String,

    /// Opaque handle resolved by the secret store
    pub key_handle: String,

    /// Native gas floor the master wallet never spends below
    pub min_reserve: Decimal,

    /// Native amount sent to a deposit wallet per gas top-up
    pub gas_distribution_amount: Decimal,

    /// Tier thresholds
    pub thresholds: SweepThresholds,

    /// Whether scheduled passes sweep automatically
    pub auto_sweep_enabled: bool,

    /// Last administrative update
    pub updated_at: DateTime<Utc>,
}

impl MasterWalletConfig {
    /// Build a config with the persisted defaults
    pub fn with_defaults(address: &str, key_handle: &str) -> Self {
        Self {
            address: address.to_string(),
            key_handle: key_handle.to_string(),
            min_reserve: dec!(1.0),
            gas_distribution_amount: dec!(0.001),
            thresholds: SweepThresholds::default(),
            auto_sweep_enabled: false,
            updated_at: Utc::now(),
        }
    }

    /// Validate address format, thresholds and amounts
    ///
    /// Returns the config with its address normalized.
    pub fn validated(mut self) -> Result<Self> {
        self.address = normalize_address(&self.address)
            .map_err(|_| Error::Configuration(format!("Invalid master address: {}", self.address)))?;

        if self.key_handle.trim().is_empty() {
            return Err(Error::Configuration("Master key handle is empty".to_string()));
        }
        if self.min_reserve < Decimal::ZERO {
            return Err(Error::Configuration("min_reserve must be non-negative".to_string()));
        }
        if self.gas_distribution_amount <= Decimal::ZERO {
            return Err(Error::Configuration(
                "gas_distribution_amount must be positive".to_string(),
            ));
        }
        self.thresholds.validate()?;
        Ok(self)
    }
}

/// Optional filter for listing wallets
#[derive(Debug, Clone, Default)]
pub struct WalletFilter {
    pub user_id: Option<String>,
    pub tier: Option<Tier>,
}

impl WalletFilter {
    pub fn matches(&self, wallet: &DepositWallet) -> bool {
        self.user_id.as_ref().map_or(true, |u| &wallet.user_id == u)
            && self.tier.map_or(true, |t| wallet.tier == t)
    }
}

/// Registry file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Registry format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Master wallet configuration, absent until initialized
    #[serde(default)]
    pub master: Option<MasterWalletConfig>,

    /// Deposit wallets
    #[serde(default)]
    pub wallets: Vec<DepositWallet>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for RegistrySnapshot {
    fn default() -> Self {
        Self {
            version: default_version(),
            master: None,
            wallets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "0x00000000000000000000000000000000000000AA";

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(MASTER).unwrap(),
            "0x00000000000000000000000000000000000000aa"
        );
        assert!(normalize_address("0x123").is_err());
        assert!(normalize_address("00000000000000000000000000000000000000aa").is_err());
        assert!(normalize_address("0xZZ000000000000000000000000000000000000aa").is_err());
    }

    #[test]
    fn test_tier_total_order() {
        assert!(Tier::High > Tier::Medium);
        assert!(Tier::Medium > Tier::Low);
        assert!(Tier::Low > Tier::None);
    }

    #[test]
    fn test_threshold_ordering_validation() {
        assert!(SweepThresholds::default().validate().is_ok());

        let equal = SweepThresholds {
            high: dec!(20),
            medium: dec!(20),
            low: dec!(5),
        };
        assert!(matches!(equal.validate(), Err(Error::Configuration(_))));

        let inverted = SweepThresholds {
            high: dec!(5),
            medium: dec!(20),
            low: dec!(100),
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_master_defaults() {
        let cfg = MasterWalletConfig::with_defaults(MASTER, "master").validated().unwrap();
        assert_eq!(cfg.min_reserve, dec!(1.0));
        assert_eq!(cfg.gas_distribution_amount, dec!(0.001));
        assert_eq!(cfg.thresholds.high, dec!(100));
        assert!(!cfg.auto_sweep_enabled);
        assert_eq!(cfg.address, MASTER.to_lowercase());
    }

    #[test]
    fn test_master_rejects_bad_address() {
        let cfg = MasterWalletConfig::with_defaults("not-an-address", "master");
        assert!(matches!(cfg.validated(), Err(Error::Configuration(_))));
    }
}
