//! # sync-cli
//!
//! CLI tool for inspecting and simulating the clipmesh sync engine.
//!
//! ## Commands
//!
//! - `init`: Create the local profile (device identity and engine settings)
//! - `chunks`: Show how files would be cut into transfer chunks
//! - `invite`: Encode or decode a pairing payload
//! - `simulate`: Run the engine against a fleet of mock peers
//!
//! ## Example
//!
//! ```bash
//! # Initialize device
//! sync-cli init --name "Desk" --chunk-size 524288
//!
//! # Produce a pairing payload for another device to scan
//! sync-cli invite encode --host 192.168.1.20 --port 13129
//!
//! # Inspect it on the other side
//! sync-cli invite decode <PAYLOAD>
//!
//! # Watch five simulated peers converge
//! sync-cli simulate --devices 5 --seconds 3
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sync_client::EngineConfig;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{chunks, init, invite, simulate};
use config::Profile;

/// CLI tool for the clipmesh sync engine.
#[derive(Parser, Debug)]
#[command(name = "sync-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the device identity and pulled files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine configuration file (TOML); overrides the profile's settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the local profile
    Init {
        /// Device name
        #[arg(long, short)]
        name: String,

        /// Poll interval of a healthy link, in milliseconds
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// First retry delay after a failure, in milliseconds
        #[arg(long)]
        retry_base_ms: Option<u64>,

        /// Transfer chunk size in bytes
        #[arg(long)]
        chunk_size: Option<u64>,

        /// Concurrent chunk requests per transfer
        #[arg(long)]
        max_concurrency: Option<usize>,
    },

    /// Show the chunk plan for a set of files
    Chunks {
        /// Files in item order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Chunk size in bytes (defaults to the configured size)
        #[arg(long)]
        chunk_size: Option<u64>,
    },

    /// Encode or decode a pairing payload
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },

    /// Run the engine against simulated peers
    Simulate {
        /// Number of simulated peers
        #[arg(long, default_value = "4")]
        devices: usize,

        /// How long to let the fleet converge
        #[arg(long, default_value = "2")]
        seconds: u64,
    },
}

#[derive(Subcommand, Debug)]
enum InviteAction {
    /// Build a payload announcing this device
    Encode {
        /// Device name (used when no identity was initialized)
        #[arg(long, short)]
        name: Option<String>,

        /// Address peers should connect to
        #[arg(long)]
        host: String,

        /// Sync server port
        #[arg(long, default_value = "13129")]
        port: u16,

        /// Six-digit pairing token (random when omitted)
        #[arg(long)]
        token: Option<String>,
    },

    /// Show the contents of a payload
    Decode {
        /// Payload as produced by `invite encode`
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Determine data directory
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    match cli.command {
        Commands::Init {
            name,
            poll_interval_ms,
            retry_base_ms,
            chunk_size,
            max_concurrency,
        } => {
            let base = match &cli.config {
                Some(path) => EngineConfig::from_file(path)?,
                None => EngineConfig::default(),
            };
            let seeds = init::Seeds {
                poll_interval_ms,
                retry_base_ms,
                chunk_size,
                max_concurrency,
            };
            config::ensure_data_dir(&data_dir).await?;
            init::run(&data_dir, &name, base, &seeds).await?;
        }
        Commands::Chunks { files, chunk_size } => {
            let engine_config = Profile::engine_config(&data_dir, cli.config.as_deref()).await?;
            let chunk_size = chunk_size.unwrap_or(engine_config.pull.chunk_size);
            chunks::run(&files, chunk_size).await?;
        }
        Commands::Invite { action } => match action {
            InviteAction::Encode {
                name,
                host,
                port,
                token,
            } => {
                invite::encode(&data_dir, name.as_deref(), &host, port, token.as_deref()).await?;
            }
            InviteAction::Decode { payload } => {
                invite::decode(&payload)?;
            }
        },
        Commands::Simulate { devices, seconds } => {
            let engine_config = Profile::engine_config(&data_dir, cli.config.as_deref()).await?;
            config::ensure_data_dir(&data_dir).await?;
            simulate::run(&data_dir, devices, seconds, engine_config).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory for sync-cli.
fn default_data_dir() -> Result<PathBuf> {
    let dirs = directories::ProjectDirs::from("io", "clipmesh", "sync-cli")
        .context("Could not determine home directory")?;
    Ok(dirs.data_dir().to_path_buf())
}
