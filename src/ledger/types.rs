//! Ledger record types
//!
//! Deposits, sweep operations, gas distributions and withdrawal requests,
//! each with a monotonic status lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A status whose transitions only move forward
pub trait Lifecycle: Copy + PartialEq + std::fmt::Display {
    /// Whether `self -> next` is an allowed forward step
    fn can_transition_to(self, next: Self) -> bool;

    /// Whether no further transitions are possible
    fn is_terminal(self) -> bool;
}

/// Reject a status change that would regress or skip the lifecycle
///
/// Re-applying the current status is allowed so callers can attach
/// metadata (hashes, reasons) without moving the row.
pub fn check_transition<S: Lifecycle>(entity: &str, id: &str, from: S, to: S) -> Result<()> {
    if from == to || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::Persistence(format!(
            "Illegal {} transition for {}: {} -> {}",
            entity, id, from, to
        )))
    }
}

/// Deposit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Detected,
    GasFunded,
    Swept,
    Failed,
}

impl Lifecycle for DepositStatus {
    fn can_transition_to(self, next: Self) -> bool {
        use DepositStatus::*;
        matches!(
            (self, next),
            (Detected, GasFunded) | (Detected, Swept) | (Detected, Failed)
                | (GasFunded, Swept)
                | (GasFunded, Failed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, DepositStatus::Swept | DepositStatus::Failed)
    }
}

impl std::fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DepositStatus::Detected => write!(f, "detected"),
            DepositStatus::GasFunded => write!(f, "gas_funded"),
            DepositStatus::Swept => write!(f, "swept"),
            DepositStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A detected balance increase on a deposit wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub wallet: String,
    pub amount: Decimal,
    pub asset: String,
    pub status: DepositStatus,
    #[serde(default)]
    pub gas_tx_hash: Option<String>,
    #[serde(default)]
    pub sweep_tx_hash: Option<String>,
    /// Last failure seen while processing (status may still be non-terminal)
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional fields attached when a deposit advances
#[derive(Debug, Clone, Default)]
pub struct DepositUpdate {
    pub gas_tx_hash: Option<String>,
    pub sweep_tx_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Sweep operation lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl SweepStatus {
    /// Pending or in-progress operations hold the wallet
    pub fn is_active(self) -> bool {
        matches!(self, SweepStatus::Pending | SweepStatus::InProgress)
    }
}

impl Lifecycle for SweepStatus {
    fn can_transition_to(self, next: Self) -> bool {
        use SweepStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress) | (Pending, Failed) | (InProgress, Completed) | (InProgress, Failed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, SweepStatus::Completed | SweepStatus::Failed)
    }
}

impl std::fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepStatus::Pending => write!(f, "pending"),
            SweepStatus::InProgress => write!(f, "in_progress"),
            SweepStatus::Completed => write!(f, "completed"),
            SweepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What started a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    /// Automation loop pass
    Scheduled,
    /// Administrator ran a manual pass
    Manual,
    /// Administrator targeted one wallet
    Emergency,
}

impl std::fmt::Display for SweepTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepTrigger::Scheduled => write!(f, "scheduled"),
            SweepTrigger::Manual => write!(f, "manual"),
            SweepTrigger::Emergency => write!(f, "emergency"),
        }
    }
}

/// Consolidation of one wallet's balance into the hot wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOperation {
    pub id: String,
    pub wallet: String,
    pub amount: Decimal,
    #[serde(default)]
    pub gas_tx_hash: Option<String>,
    #[serde(default)]
    pub sweep_tx_hash: Option<String>,
    pub status: SweepStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub trigger: SweepTrigger,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional fields attached when a sweep advances
#[derive(Debug, Clone, Default)]
pub struct SweepUpdate {
    pub amount: Option<Decimal>,
    pub gas_tx_hash: Option<String>,
    pub sweep_tx_hash: Option<String>,
    pub error: Option<String>,
}

/// Gas top-up state; recorded as soon as the transaction is broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GasDistributionStatus {
    Pending,
    Confirmed,
    Failed,
}

impl std::fmt::Display for GasDistributionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GasDistributionStatus::Pending => "pending",
            GasDistributionStatus::Confirmed => "confirmed",
            GasDistributionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// Snapshots written before statuses existed only held confirmed top-ups
fn legacy_gas_status() -> GasDistributionStatus {
    GasDistributionStatus::Confirmed
}

/// Native gas sent from the master wallet to a deposit wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GasDistribution {
    pub id: String,
    pub wallet: String,
    pub amount: Decimal,
    pub tx_hash: String,
    #[serde(default = "legacy_gas_status")]
    pub status: GasDistributionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Withdrawal lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Lifecycle for WithdrawalStatus {
    fn can_transition_to(self, next: Self) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, WithdrawalStatus::Completed | WithdrawalStatus::Failed)
    }
}

impl std::fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WithdrawalStatus::Pending => write!(f, "pending"),
            WithdrawalStatus::Processing => write!(f, "processing"),
            WithdrawalStatus::Completed => write!(f, "completed"),
            WithdrawalStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outbound transfer requested by a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub user_id: String,
    pub to_address: String,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Failed request this one re-submits
    #[serde(default)]
    pub retry_of: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregates over a trailing window
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GasStats {
    pub days: u32,
    /// Every broadcast top-up, confirmed or not; all of them spend master gas
    pub gas_distributions: usize,
    pub total_gas_distributed: Decimal,
    pub unconfirmed_gas_distributions: usize,
    pub sweeps_completed: usize,
    pub sweeps_failed: usize,
    pub total_swept: Decimal,
    pub withdrawals_completed: usize,
    pub total_withdrawn: Decimal,
    pub pending_withdrawals: usize,
}

/// Ledger file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub deposits: Vec<Deposit>,
    #[serde(default)]
    pub sweeps: Vec<SweepOperation>,
    #[serde(default)]
    pub gas_distributions: Vec<GasDistribution>,
    #[serde(default)]
    pub withdrawals: Vec<WithdrawalRequest>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for LedgerSnapshot {
    fn default() -> Self {
        Self {
            version: default_version(),
            deposits: Vec::new(),
            sweeps: Vec::new(),
            gas_distributions: Vec::new(),
            withdrawals: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_transitions_never_regress() {
        use DepositStatus::*;
        assert!(Detected.can_transition_to(GasFunded));
        assert!(GasFunded.can_transition_to(Swept));
        assert!(!GasFunded.can_transition_to(Detected));
        assert!(!Swept.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Detected));
        assert!(Swept.is_terminal());
    }

    #[test]
    fn test_sweep_and_withdrawal_transitions() {
        assert!(SweepStatus::Pending.can_transition_to(SweepStatus::InProgress));
        assert!(!SweepStatus::Completed.can_transition_to(SweepStatus::InProgress));
        assert!(!SweepStatus::Pending.can_transition_to(SweepStatus::Completed));

        assert!(WithdrawalStatus::Processing.can_transition_to(WithdrawalStatus::Completed));
        assert!(!WithdrawalStatus::Processing.can_transition_to(WithdrawalStatus::Pending));
    }

    #[test]
    fn test_check_transition_allows_same_status() {
        assert!(check_transition("deposit", "d1", DepositStatus::Detected, DepositStatus::Detected).is_ok());
        assert!(matches!(
            check_transition("deposit", "d1", DepositStatus::Swept, DepositStatus::Detected),
            Err(Error::Persistence(_))
        ));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SweepStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&DepositStatus::GasFunded).unwrap();
        assert_eq!(json, "\"gas_funded\"");
    }
}
