//! keeld — the keel daemon.
//!
//! Single binary that assembles every keel subsystem:
//! - State store (redb): runs, manifests, sync and scaling history
//! - Pipeline dispatcher with one worker per workload
//! - One reconcile loop per sync set
//! - One autoscaler loop per workload
//! - REST API
//!
//! # Usage
//!
//! ```text
//! keeld run --config keel.toml --data-dir /var/lib/keel --port 8480
//! keeld validate --config keel.toml
//! keeld defaults > keel.toml
//! ```

mod daemon;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use keel_core::KeelConfig;

#[derive(Parser)]
#[command(name = "keeld", about = "keel delivery daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run {
        /// Path to keel.toml.
        #[arg(long, default_value = "keel.toml")]
        config: PathBuf,

        /// Data directory for the state store and artifacts.
        #[arg(long, default_value = "/var/lib/keel")]
        data_dir: PathBuf,

        /// API port.
        #[arg(long, default_value = "8480")]
        port: u16,
    },
    /// Parse and validate a config file, then exit.
    Validate {
        #[arg(long, default_value = "keel.toml")]
        config: PathBuf,
    },
    /// Print the default configuration as TOML.
    Defaults,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
        } => {
            let config = load_config(&config)?;
            daemon::run(config, data_dir, port).await
        }
        Command::Validate { config: path } => {
            let config = load_config(&path)?;
            println!(
                "{}: ok ({} workloads, {} sync sets)",
                path.display(),
                config.workloads.len(),
                config.reconcile.sets.len()
            );
            Ok(())
        }
        Command::Defaults => {
            print!("{}", KeelConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keeld=debug,keel=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<KeelConfig> {
    let config = KeelConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?;
    config.validate()?;
    Ok(config)
}
