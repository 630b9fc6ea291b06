//! Wallet registry
//!
//! Per-user deposit wallets and the single master/hot wallet configuration.

pub mod store;
pub mod types;

pub use store::WalletRegistry;
pub use types::{
    normalize_address, DepositWallet, MasterWalletConfig, SweepThresholds, Tier, WalletFilter,
};
