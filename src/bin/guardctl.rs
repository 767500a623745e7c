use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use requestguard::config::GuardConfig;
use requestguard::logging::init_tracing;
use requestguard::{PgSecurityStore, RequestContext, SecurityGuard, SystemClock};

#[derive(Parser)]
#[command(name = "guardctl")]
#[command(about = "Administration CLI for the request guard store", long_about = None)]
struct Cli {
    /// TOML configuration file; GUARD_* environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Print a security report for the trailing window
    Report {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Delete old events, unblocked counters and expired CSRF tokens
    Cleanup {
        /// Retention in days (default: audit.retention_days)
        #[arg(long)]
        days: Option<i64>,
    },
    /// Check an address against the deny-list and its recent activity
    CheckIp { ip: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = GuardConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    if matches!(cli.command, Commands::Migrate) {
        config.store.auto_migrate = false;
    }

    let store = PgSecurityStore::connect(&config.store)
        .await
        .context("Failed to connect to database")?;

    if let Commands::Migrate = cli.command {
        store.migrate().await?;
        println!("migrations applied");
        store.close().await;
        return Ok(());
    }

    let retention_days = config.audit.retention_days;
    let guard = SecurityGuard::new(config, Arc::new(store.clone()), Arc::new(SystemClock))?;

    match cli.command {
        Commands::Migrate => {}
        Commands::Report { days } => {
            let report = guard.get_security_report(days).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Cleanup { days } => {
            let summary = guard
                .cleanup_security_logs(days.unwrap_or(retention_days))
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::CheckIp { ip } => {
            let ctx = RequestContext::new(ip.clone()).with_user_agent("guardctl");
            let blacklisted = guard.is_ip_blacklisted(&ctx, None).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "ip": ip, "blacklisted": blacklisted }))?
            );
        }
    }

    store.close().await;
    Ok(())
}
