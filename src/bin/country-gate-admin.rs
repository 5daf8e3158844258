use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use country_gate::config::{Config, DatabaseBackend};
use country_gate::gate::{
    is_blocked, sanitize_blocked_countries, BlockListInput, BlockPolicyConfig,
};
use country_gate::models::{CountryCode, COUNTRY_CODES};
use country_gate::storage::{PostgresStorage, SqliteStorage, Storage};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "country-gate-admin")]
#[command(about = "Country gate admin management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show visit statistics per country
    Stats {
        /// Include countries that were never visited
        #[arg(long)]
        all: bool,
    },
    /// Show the block policy
    Policy,
    /// Add countries to the block list
    Block {
        /// Comma-separated two-letter codes, e.g. "CN,RU"
        countries: String,
    },
    /// Remove countries from the block list
    Unblock {
        /// Comma-separated two-letter codes
        countries: String,
    },
    /// Replace the block list (an empty string clears it)
    SetBlocked {
        /// Comma-separated two-letter codes
        countries: String,
    },
    /// Forget the protected admin country
    ResetAdminCountry,
    /// Seed zero-count rows for every known country
    Preload,
}

fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_policy(policy: &BlockPolicyConfig) {
    let blocked: Vec<&str> = policy.blocked_countries.iter().map(|c| c.as_str()).collect();
    let effective: Vec<String> = policy
        .effective_blocked()
        .into_iter()
        .map(String::from)
        .collect();

    println!(
        "Admin country:     {}",
        policy.admin_country.as_ref().map(|c| c.as_str()).unwrap_or("(not set)")
    );
    println!("Blocked countries: {}", blocked.join(", "));
    println!("Effective block:   {}", effective.join(", "));
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => Arc::new(
            SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
        DatabaseBackend::Postgres => Arc::new(
            PostgresStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
    };

    // Ensure database is initialized
    storage.init().await.context("failed to initialize database")?;

    match cli.command {
        Commands::Stats { all } => {
            let stats = storage.list_stats().await?;
            let policy = storage.load_policy().await?;
            println!(
                "{:<6} {:>12} {:>12} {:<20} {:<20} {}",
                "Code", "Visits", "Blocked", "First visit", "Last visit", "Status"
            );
            println!("{}", "-".repeat(84));
            for stat in stats.iter().filter(|s| all || s.total_visits > 0) {
                let status = match CountryCode::parse(&stat.country_code) {
                    Ok(code) if is_blocked(&code, &policy) => "blocked",
                    _ => "allowed",
                };
                println!(
                    "{:<6} {:>12} {:>12} {:<20} {:<20} {}",
                    stat.country_code,
                    stat.total_visits,
                    stat.blocked_visits,
                    format_timestamp(stat.first_visit),
                    format_timestamp(stat.last_visit),
                    status
                );
            }
        }
        Commands::Policy => {
            print_policy(&storage.load_policy().await?);
        }
        Commands::Block { countries } => {
            let mut policy = storage.load_policy().await?;
            let added = sanitize_blocked_countries(&BlockListInput::Text(countries));
            policy.blocked_countries.extend(added);
            storage
                .save_blocked_countries(&policy.blocked_countries)
                .await?;
            println!("✓ Block list updated");
            print_policy(&storage.load_policy().await?);
        }
        Commands::Unblock { countries } => {
            let mut policy = storage.load_policy().await?;
            let removed = sanitize_blocked_countries(&BlockListInput::Text(countries));
            policy.blocked_countries.retain(|c| !removed.contains(c));
            storage
                .save_blocked_countries(&policy.blocked_countries)
                .await?;
            println!("✓ Block list updated");
            print_policy(&storage.load_policy().await?);
        }
        Commands::SetBlocked { countries } => {
            let blocked = sanitize_blocked_countries(&BlockListInput::Text(countries));
            storage.save_blocked_countries(&blocked).await?;
            println!("✓ Block list replaced");
            print_policy(&storage.load_policy().await?);
        }
        Commands::ResetAdminCountry => {
            if storage.clear_admin_country().await? {
                println!("✓ Admin country reset; the next privileged visitor will set it");
            } else {
                println!("⚠ Admin country was not set");
            }
        }
        Commands::Preload => {
            let inserted = storage.preload(COUNTRY_CODES).await?;
            println!("✓ Preloaded {} countries", inserted);
        }
    }

    Ok(())
}
