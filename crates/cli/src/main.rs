//! DriveTalk CLI — the main entry point.
//!
//! Commands:
//! - `run`     — Replay a JSONL scenario through the full runtime
//! - `config`  — Show, validate or locate configuration
//! - `doctor`  — Diagnose configuration and stage health

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod loopback;
mod runtime;
mod scenario;

#[derive(Parser)]
#[command(
    name = "drivetalk",
    about = "DriveTalk — context fusion and turn scheduling for in-vehicle assistants",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.drivetalk/config.toml)
    #[arg(short, long, global = true, env = "DRIVETALK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario against loopback stage adapters
    Run {
        /// JSONL scenario file
        scenario: PathBuf,

        /// Stop after this long without outputs once all steps ran
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,

        /// Print outputs and the summary as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Diagnose configuration and stage health
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Validate the configuration and print key limits
    Validate,
    /// Print the built-in defaults
    Defaults,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config_path = cli.config.as_deref();

    // Initialize tracing; `log_level` already carries any DRIVETALK_LOG override
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        commands::load_config(config_path)
            .map(|c| c.log_level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            settle_ms,
            json,
        } => {
            let config = commands::load_config(config_path)
                .map_err(|e| format!("Failed to load config: {e}"))?;
            commands::run::run(config, &scenario, settle_ms, json).await?
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config_path).await?,
            ConfigAction::Validate => commands::config_cmd::validate(config_path).await?,
            ConfigAction::Defaults => commands::config_cmd::defaults().await?,
            ConfigAction::Path => commands::config_cmd::path(config_path).await?,
        },
        Commands::Doctor => commands::doctor::run(config_path).await?,
    }

    Ok(())
}
