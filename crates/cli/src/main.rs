// deferq CLI
//
// Operator tool for a PostgreSQL-backed broker: migrations, the lease
// reaper daemon, queue inspection and manual dead-letter handling.

mod commands;
mod output;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deferq_broker::{Broker, BrokerConfig, PostgresTaskStore};

use crate::output::OutputFormat;
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "deferq")]
#[command(about = "deferq - Reliable background task broker")]
#[command(version)]
pub struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Broker configuration file (TOML); defaults apply when omitted
    #[arg(long, short, env = "DEFERQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Maximum database connections
    #[arg(long, env = "DEFERQ_MAX_CONNECTIONS", default_value = "5")]
    pub max_connections: u32,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply database migrations
    Migrate,

    /// Reclaim expired leases until interrupted
    Reaper {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },

    /// Show task counts for a queue
    Stats {
        /// Queue name
        queue: String,
    },

    /// Inspect and act on dead letters
    Dlq {
        #[command(subcommand)]
        command: commands::dlq::DlqCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_telemetry(TelemetryConfig::from_env());

    let config = match &cli.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => BrokerConfig::default(),
    };

    let store = PostgresTaskStore::connect(&cli.database_url, cli.max_connections)
        .await
        .context("Failed to connect to PostgreSQL")?;

    if let Commands::Migrate = cli.command {
        store.migrate().await.context("Failed to run migrations")?;
        tracing::info!("Migrations applied");
        return Ok(());
    }

    let broker = Broker::new(Arc::new(store), config).context("Invalid broker config")?;

    match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Reaper { once } => commands::reaper::run(&broker, cli.output, once).await,
        Commands::Stats { queue } => commands::stats::run(&broker, cli.output, &queue).await,
        Commands::Dlq { command } => commands::dlq::run(command, &broker, cli.output).await,
    }
}
