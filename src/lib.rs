//! Deposit Sweeper Library
//!
//! Custodial deposit scanning, gas distribution, sweeping and withdrawal
//! processing for per-user token deposit wallets.

pub mod chain;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod secrets;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
