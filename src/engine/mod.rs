//! Sweep engine
//!
//! Deposit scanning, gas distribution, sweeps, withdrawals and the
//! automation loop that ties them together.

pub mod automation;
pub mod context;
pub mod gas;
pub mod locks;
pub mod recovery;
pub mod scanner;
pub mod scheduler;
pub mod submitter;
pub mod sweep;
pub mod withdrawal;

pub use automation::{AutomationController, ControllerState, ControllerStatus, HotWalletStatus, PassSummary};
pub use context::{Cadence, EngineContext, EngineSettings};
pub use gas::{GasDistributor, GasFunding};
pub use recovery::{Recovery, RecoveryReport};
pub use scanner::{DepositScanner, DueWallet, ScanResult};
pub use scheduler::{classify, PriorityScheduler, ScheduleDecision};
pub use sweep::{sweep_amount, SweepExecutor};
pub use withdrawal::{WithdrawalDrain, WithdrawalProcessor};
