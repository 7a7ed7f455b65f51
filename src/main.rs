use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use creditgate::billing::{
    open_store, Account, CreditEngine, Feature, PoolTarget, SubscriptionStatus, SubscriptionTier,
};
use creditgate::config::{self, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt::time::ChronoUtc, EnvFilter};

/// Credit and entitlement metering engine.
#[derive(Parser, Debug)]
#[command(name = "creditgate", version, about)]
struct Cli {
    /// Path to config.toml (default: ~/.creditgate/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Check whether one unit of a feature is available
    Check { account: String, feature: Feature },
    /// Consume units of a feature
    Consume {
        account: String,
        feature: Feature,
        #[arg(long, default_value_t = 1)]
        units: u64,
    },
    /// Add purchased credits
    Grant {
        account: String,
        pool: GrantPool,
        amount: u64,
        /// Feature for paid credits
        #[arg(long)]
        feature: Option<Feature>,
    },
    /// Show an account's balances
    Balance { account: String },
    /// Show recent usage records
    Usage {
        account: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Print the per-feature summary instead of records
        #[arg(long)]
        summary: bool,
    },
    /// Manage accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCommands {
    /// Create or update an account's subscription
    Set {
        id: String,
        #[arg(long, default_value = "free")]
        tier: SubscriptionTier,
        #[arg(long, default_value = "inactive")]
        status: SubscriptionStatus,
    },
    /// Delete an account and its ledger
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the config JSON Schema
    Schema,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GrantPool {
    General,
    Paid,
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config {
        command: ConfigCommands::Schema,
    } = cli.command
    {
        println!("{}", config::json_schema()?);
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log_level);

    let (store, usage) = open_store(&config.storage).context("Failed to open ledger store")?;
    let engine = Arc::new(CreditEngine::with_system_clock(
        store,
        usage,
        config.engine_settings(),
    ));

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            creditgate::gateway::run_gateway(&host, port, &config, engine).await?;
        }
        Commands::Check { account, feature } => {
            print_json(&engine.check_availability(&account, feature)?)?;
        }
        Commands::Consume {
            account,
            feature,
            units,
        } => {
            print_json(&engine.consume(&account, feature, units, None)?)?;
        }
        Commands::Grant {
            account,
            pool,
            amount,
            feature,
        } => {
            let target = match pool {
                GrantPool::General => PoolTarget::General,
                GrantPool::Paid => PoolTarget::Paid(
                    feature.context("--feature is required for paid credits")?,
                ),
            };
            let balance = engine.add_credits(&account, target, amount)?;
            print_json(&serde_json::json!({
                "account_id": account,
                "pool": target.kind(),
                "balance": balance,
            }))?;
        }
        Commands::Balance { account } => {
            print_json(&engine.balance(&account)?)?;
        }
        Commands::Usage {
            account,
            limit,
            summary,
        } => {
            if summary {
                print_json(&engine.usage_summary(&account, None)?)?;
            } else {
                print_json(&engine.recent_usage(&account, limit)?)?;
            }
        }
        Commands::Account { command } => match command {
            AccountCommands::Set { id, tier, status } => {
                let account = Account::new(id).with_subscription(tier, status);
                engine.upsert_account(&account)?;
                print_json(&account)?;
            }
            AccountCommands::Delete { id } => {
                let removed = engine.delete_account(&id)?;
                print_json(&serde_json::json!({ "account_id": id, "deleted": removed }))?;
            }
        },
        Commands::Config { .. } => {}
    }

    Ok(())
}
