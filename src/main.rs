//! Deposit Sweeper - custodial deposit sweeping and gas orchestration
//!
//! # WARNING
//! - This tool moves real funds between custodial wallets.
//! - Keep key files readable by the service user only (`chmod 600`).
//! - Run with `--dry-run` against a copy of your registry before going live.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::error;

// Use the library crate
use deposit_sweeper::cli::commands::{self, MasterUpdate};
use deposit_sweeper::config::Config;
use deposit_sweeper::ledger::WithdrawalStatus;
use deposit_sweeper::registry::Tier;

/// Deposit Sweeper - sweep user deposit wallets into the master wallet
#[derive(Parser)]
#[command(name = "sweeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sweeper.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the master wallet config and reconcile interrupted work
    Init,

    /// Run the automation loop until Ctrl+C
    Run {
        /// In-memory state, simulated chain, no real transactions
        #[arg(long)]
        dry_run: bool,
    },

    /// Scan deposit wallets for new deposits
    Scan {
        /// Scan only this wallet, ignoring cadence
        #[arg(long)]
        wallet: Option<String>,
    },

    /// Sweep commands
    Sweep {
        #[command(subcommand)]
        action: SweepAction,
    },

    /// Show controller, hot wallet and queue status
    Status,

    /// Show gas and sweep statistics
    Stats {
        /// Window in days
        #[arg(long, default_value = "7")]
        days: u32,
    },

    /// Deposit wallet management
    Wallet {
        #[command(subcommand)]
        action: WalletAction,
    },

    /// Master (hot) wallet configuration
    Master {
        #[command(subcommand)]
        action: MasterAction,
    },

    /// Withdrawal queue management
    Withdrawals {
        #[command(subcommand)]
        action: WithdrawalAction,
    },

    /// Resolve in-flight sweeps and withdrawals against the chain
    Reconcile,

    /// Show current configuration (secrets masked)
    Config,
}

#[derive(Subcommand)]
enum SweepAction {
    /// Run one pass that sweeps every due wallet
    Manual,

    /// Sweep one wallet now regardless of tier
    Emergency {
        /// Deposit wallet address
        address: String,

        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum WalletAction {
    /// Register a deposit wallet
    Add {
        /// Wallet address
        address: String,

        /// Owning user id
        #[arg(long)]
        user: String,

        /// Key handle resolved in the keys directory
        #[arg(long)]
        key_handle: String,
    },

    /// List deposit wallets
    List {
        #[arg(long)]
        user: Option<String>,

        #[arg(long, value_enum)]
        tier: Option<TierArg>,
    },
}

#[derive(Subcommand)]
enum MasterAction {
    /// Show the stored master wallet config
    Show,

    /// Update the master wallet config
    Set {
        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        key_handle: Option<String>,

        /// Native balance the master never spends below
        #[arg(long)]
        min_reserve: Option<Decimal>,

        /// Native amount sent per gas top-up
        #[arg(long)]
        gas_amount: Option<Decimal>,

        #[arg(long)]
        high: Option<Decimal>,

        #[arg(long)]
        medium: Option<Decimal>,

        #[arg(long)]
        low: Option<Decimal>,

        /// Sweep due wallets on scheduled passes
        #[arg(long)]
        auto_sweep: Option<bool>,
    },
}

#[derive(Subcommand)]
enum WithdrawalAction {
    /// List withdrawals (pending by default)
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },

    /// Queue a withdrawal
    Request {
        #[arg(long)]
        user: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: Decimal,
    },

    /// Create-or-verify a withdrawal by id and process it
    Submit {
        #[arg(long)]
        id: String,

        #[arg(long)]
        user: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: Decimal,
    },

    /// Process one withdrawal, or drain the pending queue
    Process {
        id: Option<String>,
    },

    /// Re-queue a failed withdrawal
    Retry {
        id: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TierArg {
    None,
    Low,
    Medium,
    High,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::None => Tier::None,
            TierArg::Low => Tier::Low,
            TierArg::Medium => Tier::Medium,
            TierArg::High => Tier::High,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl From<StatusArg> for WithdrawalStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => WithdrawalStatus::Pending,
            StatusArg::Processing => WithdrawalStatus::Processing,
            StatusArg::Completed => WithdrawalStatus::Completed,
            StatusArg::Failed => WithdrawalStatus::Failed,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "deposit_sweeper=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Init => commands::init(&config).await,
        Commands::Run { dry_run } => commands::run(&config, dry_run).await,
        Commands::Scan { wallet } => commands::scan(&config, wallet).await,
        Commands::Sweep { action } => match action {
            SweepAction::Manual => commands::sweep_manual(&config).await,
            SweepAction::Emergency { address, force } => {
                commands::sweep_emergency(&config, &address, force).await
            }
        },
        Commands::Status => commands::status(&config).await,
        Commands::Stats { days } => commands::stats(&config, days).await,
        Commands::Wallet { action } => match action {
            WalletAction::Add {
                address,
                user,
                key_handle,
            } => commands::wallet_add(&config, &address, &user, &key_handle).await,
            WalletAction::List { user, tier } => {
                commands::wallet_list(&config, user, tier.map(Tier::from)).await
            }
        },
        Commands::Master { action } => match action {
            MasterAction::Show => commands::master_show(&config).await,
            MasterAction::Set {
                address,
                key_handle,
                min_reserve,
                gas_amount,
                high,
                medium,
                low,
                auto_sweep,
            } => {
                let update = MasterUpdate {
                    address,
                    key_handle,
                    min_reserve,
                    gas_distribution_amount: gas_amount,
                    threshold_high: high,
                    threshold_medium: medium,
                    threshold_low: low,
                    auto_sweep_enabled: auto_sweep,
                };
                commands::master_set(&config, update).await
            }
        },
        Commands::Withdrawals { action } => match action {
            WithdrawalAction::List { status } => {
                commands::withdrawals_list(&config, status.map(WithdrawalStatus::from)).await
            }
            WithdrawalAction::Request { user, to, amount } => {
                commands::withdrawals_request(&config, &user, &to, amount).await
            }
            WithdrawalAction::Submit {
                id,
                user,
                to,
                amount,
            } => commands::withdrawals_submit(&config, &id, &user, &to, amount).await,
            WithdrawalAction::Process { id } => commands::withdrawals_process(&config, id).await,
            WithdrawalAction::Retry { id } => commands::withdrawals_retry(&config, &id).await,
        },
        Commands::Reconcile => commands::reconcile(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
