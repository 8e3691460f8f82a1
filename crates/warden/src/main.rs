use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

use warden::{Config, WardenError};

/// Warden: remote key custody over encrypted relay RPC.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the signer service
    Run {
        /// Override the parent websocket endpoint
        #[arg(long)]
        parent_url: Option<String>,

        /// Override the inbox relay
        #[arg(long)]
        relay: Option<String>,

        /// Require production-tagged build and instance records
        #[arg(long)]
        production: bool,
    },
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("warden=debug,warden_relay=debug,warden_rpc=debug,warden_perms=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, WardenError> {
    match path {
        Some(p) => Config::load(p),
        None => Config::load(&Config::default_config_path()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), WardenError> {
    match cli.command {
        Commands::Run {
            parent_url,
            relay,
            production,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(parent_url) = parent_url {
                config.parent_url = parent_url;
            }
            if let Some(relay) = relay {
                config.inbox_relay_url = relay;
            }
            if production {
                config.production = true;
            }
            config.validate()?;
            warden::run(config).await
        }
    }
}
