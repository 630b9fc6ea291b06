//! Error types for the deposit sweeper

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the deposit sweeper
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // Fund guards
    #[error("Insufficient reserve: {available} available above reserve, {required} required")]
    InsufficientReserve { available: Decimal, required: Decimal },

    #[error("Insufficient funds: {available} spendable, {required} requested")]
    InsufficientFunds { available: Decimal, required: Decimal },

    // Chain errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Chain call timed out after {0}ms")]
    Timeout(u64),

    #[error("Transaction reverted: {0}")]
    Reverted(String),

    #[error("Confirmation timed out for {0}")]
    ConfirmationTimeout(String),

    // Persistence errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Concurrency guards
    #[error("Wallet busy: {0} already has a sweep in progress")]
    WalletBusy(String),

    #[error("Withdrawal {0} is already being processed")]
    WithdrawalBusy(String),

    // Lookup errors
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    #[error("Withdrawal not found: {0}")]
    WithdrawalNotFound(String),

    #[error("Withdrawal {id} does not match stored request: {reason}")]
    WithdrawalMismatch { id: String, reason: String },

    #[error("Master wallet is not configured")]
    MasterNotConfigured,

    // Secret errors
    #[error("Secret error: {0}")]
    Secret(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient RPC failure)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Check if this error came from a fund-protection guard
    ///
    /// Guarded operations leave their entity in a non-terminal state.
    pub fn is_funds_guard(&self) -> bool {
        matches!(
            self,
            Error::InsufficientReserve { .. } | Error::InsufficientFunds { .. }
        )
    }

    /// Short label for status badges
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Configuration(_) | Error::InvalidAddress(_) | Error::MasterNotConfigured => {
                "configuration"
            }
            Error::InsufficientReserve { .. } => "insufficient_reserve",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::Network(_) | Error::Timeout(_) | Error::ConfirmationTimeout(_) => "network",
            Error::Reverted(_) => "reverted",
            Error::Persistence(_) | Error::Serialization(_) | Error::Io(_) => "persistence",
            Error::WalletBusy(_) | Error::WithdrawalBusy(_) => "busy",
            _ => "internal",
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::Timeout(5000).is_retryable());
        assert!(!Error::Reverted("out of gas".into()).is_retryable());
        assert!(!Error::InsufficientFunds {
            available: dec!(300),
            required: dec!(500)
        }
        .is_retryable());
    }

    #[test]
    fn test_funds_guard_kind() {
        let err = Error::InsufficientReserve {
            available: dec!(-0.1),
            required: dec!(0.001),
        };
        assert!(err.is_funds_guard());
        assert_eq!(err.kind(), "insufficient_reserve");
        assert_eq!(Error::Reverted("x".into()).kind(), "reverted");
    }
}
