//! Persistence ledger
//!
//! Deposits, sweep operations, gas distributions and withdrawal requests
//! with monotonic status history.

pub mod store;
pub mod types;

pub use store::PersistenceLedger;
pub use types::{
    Deposit, DepositStatus, DepositUpdate, GasDistribution, GasDistributionStatus,
    GasStats, Lifecycle, SweepOperation,
    SweepStatus, SweepTrigger, SweepUpdate, WithdrawalRequest, WithdrawalStatus,
};
