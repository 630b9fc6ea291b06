//! Configuration loading and validation

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::chain::{Asset, ConfirmationPolicy, FeeSchedule, RetryPolicy};
use crate::engine::{Cadence, EngineSettings};
use crate::registry::{normalize_address, MasterWalletConfig, SweepThresholds};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub withdrawals: WithdrawalConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

/// Which chain backend to talk to
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainBackend {
    /// In-memory chain (dry runs, local testing)
    Simulated,
    /// JSON-RPC EVM node (requires the `evm` feature)
    Evm,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    #[serde(default = "default_backend")]
    pub backend: ChainBackend,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_native_symbol")]
    pub native_symbol: String,
    #[serde(default = "default_token_symbol")]
    pub token_symbol: String,
    #[serde(default = "default_token_contract")]
    pub token_contract: String,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
    /// Blocks on top of the inclusion block before a tx is final
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_gas_price_gwei")]
    pub gas_price_gwei: f64,
    #[serde(default = "default_token_transfer_gas_limit")]
    pub token_transfer_gas_limit: u64,
    #[serde(default = "default_native_transfer_gas_limit")]
    pub native_transfer_gas_limit: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_max_retry_elapsed_ms")]
    pub max_retry_elapsed_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    #[serde(default = "default_medium_interval_secs")]
    pub medium_interval_secs: u64,
    #[serde(default = "default_low_interval_secs")]
    pub low_interval_secs: u64,
    /// Sweep amounts are rounded down to this many decimals
    #[serde(default = "default_sweep_decimals")]
    pub sweep_decimals: u32,
}

/// Master wallet seed values, stored into the registry on `init`
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_master_key_handle")]
    pub key_handle: String,
    #[serde(default = "default_min_reserve")]
    pub min_reserve: f64,
    #[serde(default = "default_gas_distribution_amount")]
    pub gas_distribution_amount: f64,
    #[serde(default = "default_threshold_high")]
    pub sweep_threshold_high: f64,
    #[serde(default = "default_threshold_medium")]
    pub sweep_threshold_medium: f64,
    #[serde(default = "default_threshold_low")]
    pub sweep_threshold_low: f64,
    #[serde(default)]
    pub auto_sweep_enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WithdrawalConfig {
    /// Token balance the master keeps back from withdrawals
    #[serde(default)]
    pub reserve: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    #[serde(default = "default_keys_dir")]
    pub keys_dir: PathBuf,
}

// Default value functions
fn default_backend() -> ChainBackend {
    ChainBackend::Simulated
}
fn default_chain_id() -> u64 {
    56
}
fn default_native_symbol() -> String {
    "BNB".to_string()
}
fn default_token_symbol() -> String {
    "USDT".to_string()
}
fn default_token_contract() -> String {
    "0x55d398326f99059fF775485246999027B3197955".to_string()
}
fn default_token_decimals() -> u32 {
    18
}
fn default_confirmations() -> u64 {
    3
}
fn default_poll_interval_ms() -> u64 {
    3000
}
fn default_gas_price_gwei() -> f64 {
    3.0
}
fn default_token_transfer_gas_limit() -> u64 {
    65_000
}
fn default_native_transfer_gas_limit() -> u64 {
    21_000
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_retry_base_delay_ms() -> u64 {
    250
}
fn default_max_retry_elapsed_ms() -> u64 {
    5_000
}
fn default_interval_secs() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    8
}
fn default_confirmation_timeout_secs() -> u64 {
    120
}
fn default_medium_interval_secs() -> u64 {
    3600
}
fn default_low_interval_secs() -> u64 {
    86_400
}
fn default_sweep_decimals() -> u32 {
    6
}
fn default_master_key_handle() -> String {
    "master".to_string()
}
fn default_min_reserve() -> f64 {
    1.0
}
fn default_gas_distribution_amount() -> f64 {
    0.001
}
fn default_threshold_high() -> f64 {
    100.0
}
fn default_threshold_medium() -> f64 {
    20.0
}
fn default_threshold_low() -> f64 {
    5.0
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_keys_dir() -> PathBuf {
    PathBuf::from("keys")
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            rpc_url: String::new(),
            chain_id: default_chain_id(),
            native_symbol: default_native_symbol(),
            token_symbol: default_token_symbol(),
            token_contract: default_token_contract(),
            token_decimals: default_token_decimals(),
            confirmations: default_confirmations(),
            poll_interval_ms: default_poll_interval_ms(),
            gas_price_gwei: default_gas_price_gwei(),
            token_transfer_gas_limit: default_token_transfer_gas_limit(),
            native_transfer_gas_limit: default_native_transfer_gas_limit(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_retry_elapsed_ms: default_max_retry_elapsed_ms(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrency: default_max_concurrency(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            medium_interval_secs: default_medium_interval_secs(),
            low_interval_secs: default_low_interval_secs(),
            sweep_decimals: default_sweep_decimals(),
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            key_handle: default_master_key_handle(),
            min_reserve: default_min_reserve(),
            gas_distribution_amount: default_gas_distribution_amount(),
            sweep_threshold_high: default_threshold_high(),
            sweep_threshold_medium: default_threshold_medium(),
            sweep_threshold_low: default_threshold_low(),
            auto_sweep_enabled: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            keys_dir: default_keys_dir(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            rpc: RpcConfig::default(),
            automation: AutomationConfig::default(),
            master: MasterConfig::default(),
            withdrawals: WithdrawalConfig::default(),
            storage: StorageConfig::default(),
            secrets: SecretsConfig::default(),
        }
    }
}

/// Exact decimal for a config float (`0.001` stays `0.001`)
fn decimal(value: f64, field: &str) -> Result<Decimal> {
    if !value.is_finite() {
        anyhow::bail!("{} must be a finite number", field);
    }
    Decimal::from_str(&value.to_string()).with_context(|| format!("{} is out of range: {}", field, value))
}

impl Config {
    /// Load configuration from file and environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("chain.backend", "simulated")?
            .set_default("chain.confirmations", default_confirmations() as i64)?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            .set_default("automation.interval_secs", default_interval_secs() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SWEEPER__)
            .add_source(
                config::Environment::with_prefix("SWEEPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.chain.backend == ChainBackend::Evm {
            if cfg!(not(feature = "evm")) {
                anyhow::bail!("chain.backend = \"evm\" requires building with --features evm");
            }
            if self.chain.rpc_url.trim().is_empty() {
                anyhow::bail!("chain.rpc_url is required for the evm backend");
            }
        }

        normalize_address(&self.chain.token_contract)
            .context("chain.token_contract is not a valid address")?;

        if self.chain.token_decimals > 28 {
            anyhow::bail!("token_decimals cannot exceed 28");
        }
        if self.automation.sweep_decimals > self.chain.token_decimals {
            anyhow::bail!(
                "sweep_decimals ({}) cannot exceed token_decimals ({})",
                self.automation.sweep_decimals,
                self.chain.token_decimals
            );
        }
        if self.chain.confirmations == 0 {
            anyhow::bail!("confirmations must be at least 1");
        }
        if self.chain.gas_price_gwei <= 0.0 {
            anyhow::bail!("gas_price_gwei must be positive");
        }
        if self.automation.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.automation.interval_secs == 0 {
            anyhow::bail!("interval_secs must be at least 1");
        }
        if self.withdrawals.reserve < 0.0 {
            anyhow::bail!("withdrawals.reserve cannot be negative");
        }

        if !self.master.address.is_empty() {
            self.master_defaults()?;
        } else {
            tracing::warn!("master.address is not set; run `sweeper master set` before starting");
        }

        Ok(())
    }

    /// Master wallet config seeded from the `[master]` section
    pub fn master_defaults(&self) -> Result<MasterWalletConfig> {
        let m = &self.master;
        let config = MasterWalletConfig {
            min_reserve: decimal(m.min_reserve, "master.min_reserve")?,
            gas_distribution_amount: decimal(m.gas_distribution_amount, "master.gas_distribution_amount")?,
            thresholds: SweepThresholds {
                high: decimal(m.sweep_threshold_high, "master.sweep_threshold_high")?,
                medium: decimal(m.sweep_threshold_medium, "master.sweep_threshold_medium")?,
                low: decimal(m.sweep_threshold_low, "master.sweep_threshold_low")?,
            },
            auto_sweep_enabled: m.auto_sweep_enabled,
            ..MasterWalletConfig::with_defaults(&m.address, &m.key_handle)
        };

        let config = config.validated().context("Invalid [master] configuration")?;
        let fee = self.fee_schedule()?.token_transfer_fee();
        if config.gas_distribution_amount < fee {
            tracing::warn!(
                "gas_distribution_amount {} is below one token transfer fee ({})",
                config.gas_distribution_amount,
                fee
            );
        }
        Ok(config)
    }

    pub fn native_asset(&self) -> Asset {
        Asset::Native {
            symbol: self.chain.native_symbol.clone(),
        }
    }

    /// The token deposits arrive in
    pub fn token_asset(&self) -> Asset {
        Asset::Token {
            symbol: self.chain.token_symbol.clone(),
            contract: self.chain.token_contract.to_lowercase(),
            decimals: self.chain.token_decimals,
        }
    }

    pub fn fee_schedule(&self) -> Result<FeeSchedule> {
        Ok(FeeSchedule {
            chain_id: self.chain.chain_id,
            gas_price_gwei: decimal(self.chain.gas_price_gwei, "chain.gas_price_gwei")?,
            token_transfer_gas_limit: self.chain.token_transfer_gas_limit,
            native_transfer_gas_limit: self.chain.native_transfer_gas_limit,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_millis(self.rpc.timeout_ms),
            base_delay: Duration::from_millis(self.rpc.retry_base_delay_ms),
            max_elapsed: Duration::from_millis(self.rpc.max_retry_elapsed_ms),
        }
    }

    pub fn confirmation_policy(&self) -> ConfirmationPolicy {
        ConfirmationPolicy {
            confirmations: self.chain.confirmations,
            poll_interval: Duration::from_millis(self.chain.poll_interval_ms),
        }
    }

    /// Runtime settings for the engine components
    pub fn engine_settings(&self) -> Result<EngineSettings> {
        Ok(EngineSettings {
            asset: self.token_asset(),
            native: self.native_asset(),
            fees: self.fee_schedule()?,
            confirmation_timeout: Duration::from_secs(self.automation.confirmation_timeout_secs),
            max_concurrency: self.automation.max_concurrency,
            cadence: Cadence {
                medium_interval: Duration::from_secs(self.automation.medium_interval_secs),
                low_interval: Duration::from_secs(self.automation.low_interval_secs),
            },
            sweep_decimals: self.automation.sweep_decimals,
            withdrawal_reserve: decimal(self.withdrawals.reserve, "withdrawals.reserve")?,
            pass_interval: Duration::from_secs(self.automation.interval_secs),
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage.data_dir.join("registry.json")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.storage.data_dir.join("ledger.json")
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Chain:
    backend: {:?}
    rpc_url: {}
    chain_id: {}
    token: {} ({}, {} decimals)
    confirmations: {}
    gas_price: {} gwei
  RPC:
    timeout: {}ms
    retry_base_delay: {}ms
    max_retry_elapsed: {}ms
  Automation:
    interval: {}s
    max_concurrency: {}
    confirmation_timeout: {}s
    sweep_decimals: {}
  Master:
    address: {}
    key_handle: {}
    min_reserve: {} {}
    gas_distribution_amount: {} {}
    thresholds: high {} / medium {} / low {}
    auto_sweep: {}
  Withdrawals:
    reserve: {} {}
  Storage:
    data_dir: {}
  Secrets:
    keys_dir: {}
"#,
            self.chain.backend,
            if self.chain.rpc_url.is_empty() {
                "(not set)".to_string()
            } else {
                mask_url(&self.chain.rpc_url)
            },
            self.chain.chain_id,
            self.chain.token_symbol,
            self.chain.token_contract,
            self.chain.token_decimals,
            self.chain.confirmations,
            self.chain.gas_price_gwei,
            self.rpc.timeout_ms,
            self.rpc.retry_base_delay_ms,
            self.rpc.max_retry_elapsed_ms,
            self.automation.interval_secs,
            self.automation.max_concurrency,
            self.automation.confirmation_timeout_secs,
            self.automation.sweep_decimals,
            if self.master.address.is_empty() {
                "(not set)"
            } else {
                self.master.address.as_str()
            },
            self.master.key_handle,
            self.master.min_reserve,
            self.chain.native_symbol,
            self.master.gas_distribution_amount,
            self.chain.native_symbol,
            self.master.sweep_threshold_high,
            self.master.sweep_threshold_medium,
            self.master.sweep_threshold_low,
            self.master.auto_sweep_enabled,
            self.withdrawals.reserve,
            self.chain.token_symbol,
            self.storage.data_dir.display(),
            self.secrets.keys_dir.display(),
        )
    }
}

/// Mask URL for display (hide API keys in paths and query params)
fn mask_url(url: &str) -> String {
    let base = match url.find('?') {
        Some(idx) => format!("{}?***", &url[..idx]),
        None => url.to_string(),
    };

    // Providers often embed the key as the last path segment
    match base.rfind('/') {
        Some(idx) if idx > "https://".len() && base[idx + 1..].len() >= 20 => {
            format!("{}/***", &base[..idx])
        }
        _ => base,
    }
}
