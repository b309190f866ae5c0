mod commands;
mod config;
mod ipc;
mod logging;
mod render_pump;
mod server;
mod state;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::net::TcpListener;

use config::ConfigLoader;
use state::{start_notifier, AppState};

/// Headless terminal session daemon.
#[derive(Debug, Parser)]
#[command(name = "tetherd", version)]
struct Cli {
    /// Config file (TOML). Falls back to $TETHER_CONFIG, then built-in defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file.
    #[arg(short, long)]
    listen: Option<String>,

    /// Log filter (`info`, `tether_pty=debug,info`, ...), overriding the config file.
    #[arg(long, env = "TETHER_LOG")]
    log_level: Option<String>,

    /// SQLite database for settings, overriding the config file.
    #[arg(long)]
    database: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match ConfigLoader::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(database) = cli.database {
        config.server.database = Some(database);
    }
    if let Err(e) = ConfigLoader::validate(&config) {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }

    if let Err(e) = logging::init(&config.logging.level) {
        eprintln!("fatal: {e}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(config)) {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let db = match &config.server.database {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            tether_db::open(path)?
        }
        None => tether_db::open_in_memory()?,
    };

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.server.listen))?;
    info!("listening on {}", listener.local_addr()?);

    let (state, events) = AppState::new(config, db)?;
    let state = Arc::new(state);
    let notifier = start_notifier(events, state.gate(), state.notifications.clone());

    let accept = tokio::spawn(server::run_accept_loop(listener, Arc::clone(&state)));

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    state.trigger_shutdown();
    let _ = accept.await;

    let report = state.registry.shutdown().await;
    for (id, reason) in &report.failed {
        warn!("session {id} survived shutdown: {reason}");
    }
    notifier.abort();
    info!("shutdown complete");
    Ok(())
}
