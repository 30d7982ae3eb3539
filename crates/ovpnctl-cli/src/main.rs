//! ovpnctl - supervise a privileged OpenVPN client from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ovpnctl_cli::commands::{self, Overrides};
use ovpnctl_cli::exit_code;

/// Start and stop an OpenVPN tunnel
#[derive(Parser, Debug)]
#[command(name = "ovpnctl")]
#[command(about = "Supervise a privileged OpenVPN client", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory for the pid file, captured output and readiness sockets
    #[arg(long, global = true, env = "OVPNCTL_RUNTIME_DIR")]
    runtime_dir: Option<PathBuf>,

    /// Environment variable holding the sudo password
    #[arg(long, global = true, env = "OVPNCTL_CREDENTIAL_ENV")]
    credential_env: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the tunnel and wait until it is up
    Connect {
        /// OpenVPN configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Seconds to wait for the tunnel to come up
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Stop the running tunnel
    Disconnect,

    /// Report readiness to a waiting `connect` (route-up hook)
    #[command(hide = true)]
    NotifyReady {
        #[arg(long)]
        socket: PathBuf,

        #[arg(long)]
        attempt: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => exit_code::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code::for_error(&e)
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    init_logging(&cli.log_level)?;

    let overrides = Overrides {
        runtime_dir: cli.runtime_dir,
        credential_env: cli.credential_env,
    };

    match cli.command {
        Commands::Connect { config, timeout } => {
            let settings = commands::load_settings(&overrides)?;
            debug!("Settings: {:?}", settings);
            commands::connect(settings, &config, timeout).await
        }
        Commands::Disconnect => {
            let settings = commands::load_settings(&overrides)?;
            commands::disconnect(settings).await
        }
        Commands::NotifyReady { socket, attempt } => {
            commands::notify_ready(&socket, &attempt).await
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
