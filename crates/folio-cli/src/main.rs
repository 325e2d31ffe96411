//! Folio CLI
//!
//! Administrative command-line interface for a Folio database: migrations,
//! categories, tenants, schema families and entities. Every command prints
//! its result as JSON on stdout.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use commands::{CategoryCommand, EntityCommand, SchemaCommand, TenantCommand};
use config::FolioConfig;

#[derive(Parser)]
#[command(name = "folio")]
#[command(about = "Folio - Multi-tenant schema and entity registry", long_about = None)]
struct Cli {
    /// Path to a YAML or TOML config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL connection URL (overrides config and FOLIO_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Recorded as `created_by` on every write
    #[arg(long, global = true, default_value = "folio-cli")]
    actor: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending admin schema migrations
    Migrate,
    /// Manage categories
    #[command(subcommand)]
    Category(CategoryCommand),
    /// Manage tenants
    #[command(subcommand)]
    Tenant(TenantCommand),
    /// Manage schema families and their versions
    #[command(subcommand)]
    Schema(SchemaCommand),
    /// Manage entities of one schema family within one tenant
    Entity(EntityCommand),
}

fn load_config(cli: &Cli) -> anyhow::Result<FolioConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = shellexpand::tilde(&path.to_string_lossy()).to_string();
            FolioConfig::from_file(path)?
        }
        None => FolioConfig::default(),
    };
    config.merge_env();

    if let Some(url) = &cli.database_url {
        config.database.url = Some(url.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

fn init_tracing(config: &FolioConfig) -> anyhow::Result<()> {
    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::new(format!("{}", log_level));

    // sqlx logs every query at INFO; keep it quiet unless asked for
    if !config.logging.log_sql_queries {
        match "sqlx=warn".parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => tracing::warn!("Failed to set sqlx log filter: {}", e),
        }
    }

    // Logs go to stderr so stdout stays valid JSON
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config)?;

    let actor = cli.actor.as_str();
    let output = match cli.command {
        Commands::Migrate => commands::migrate(&config).await?,
        Commands::Category(command) => {
            commands::category(&commands::connect(&config).await?, command, actor).await?
        }
        Commands::Tenant(command) => {
            commands::tenant(&commands::connect(&config).await?, command, actor).await?
        }
        Commands::Schema(command) => {
            commands::schema(&commands::connect(&config).await?, command, actor).await?
        }
        Commands::Entity(command) => {
            commands::entity(&commands::connect(&config).await?, command, actor).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
