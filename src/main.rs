//! yrunner - sandboxed language runtimes for collaborative editor rooms.
//!
//! Usage:
//!   yrunner serve --config langs.yaml [--bind 127.0.0.1:4500]   # Start server
//!   yrunner version

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};

use yrunner::config::LangConfig;
use yrunner::http_server;
use yrunner::sandbox::docker::DockerBackend;
use yrunner::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "yrunner")]
#[command(about = "Sandboxed language runtimes over WebSocket")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the room server
    Serve {
        /// Language config file (YAML)
        #[arg(long)]
        config: PathBuf,

        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:4500")]
        bind: String,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,

        /// Seconds between orphan reconciliation passes, 0 disables
        #[arg(long, default_value = "300")]
        gc_interval_secs: u64,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match args.command {
        Commands::Serve {
            config,
            bind,
            debug,
            gc_interval_secs,
        } => {
            let level = if debug { Level::DEBUG } else { Level::INFO };
            tracing_subscriber::fmt().with_max_level(level).init();

            if let Err(e) = serve(config, &bind, gc_interval_secs).await {
                error!("{}", e);
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Version => {
            println!("yrunner {}", env!("CARGO_PKG_VERSION"));
        }
    }
}

async fn serve(
    config: PathBuf,
    bind: &str,
    gc_interval_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(LangConfig::load(&config)?);
    let backend = Arc::new(DockerBackend::connect()?);
    let state = AppState::new(backend, config);

    let report = state.reconcile_orphans().await;
    info!(
        killed = report.killed_processes.len(),
        removed = report.removed_networks.len(),
        "Startup reconciliation done"
    );

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let gc_interval = (gc_interval_secs > 0).then(|| Duration::from_secs(gc_interval_secs));
    http_server::run_server(listener, state, gc_interval).await?;
    Ok(())
}
