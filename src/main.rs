//! # rotad: Rota scheduler daemon
//!
//! Runs configured commands on remote hosts on a cron schedule, keeps a
//! bounded run history per job and serves a small JSON control API.
//!
//! Usage:
//!   rotad                              # ~/.rota/rota.toml, API on 127.0.0.1:7070
//!   rotad --config /etc/rota.toml      # Custom config file
//!   rotad --listen 0.0.0.0:7070        # Override [web] listen

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rota_core::resolve_run_dir;
use rota_gateway::AppState;
use rota_scheduler::{RunStore, Runners, Scheduler};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rotad", version, about = "⏰ Rota: cron-style remote command scheduler")]
struct Cli {
    /// Config file
    #[arg(short, long, default_value = "~/.rota/rota.toml")]
    config: String,

    /// Directory for job state and run artifacts (default: $ROTA_PATH/run, else ~/.rota/run)
    #[arg(long)]
    run_dir: Option<String>,

    /// API listen address (overrides [web] listen)
    #[arg(short, long)]
    listen: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "rotad=debug,rota_scheduler=debug,rota_gateway=debug,tower_http=debug"
    } else {
        "rotad=info,rota_scheduler=info,rota_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = PathBuf::from(shellexpand::tilde(&cli.config).into_owned());
    let run_dir = resolve_run_dir(cli.run_dir.as_deref());
    std::fs::create_dir_all(&run_dir).with_context(|| format!("create {}", run_dir.display()))?;

    tracing::info!("⏰ rotad v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!("   Config:  {}", config_path.display());
    tracing::info!("   Run dir: {}", run_dir.display());

    let store = RunStore::new(&run_dir);
    let mut scheduler = Scheduler::new(store.clone(), Runners::default());

    // Previous state first, so a bad config file leaves the last good setup running.
    scheduler.restore()?;
    match scheduler.load_config_file(&config_path) {
        Ok(summary) => tracing::info!(
            "📋 Config loaded: {} added, {} updated, {} removed",
            summary.added.len(),
            summary.updated.len(),
            summary.removed.len()
        ),
        Err(e) => tracing::error!("❌ Config not loaded, keeping previous jobs: {e}"),
    }
    let tick = scheduler.config().general.tick_interval();
    let listen = cli.listen.clone().unwrap_or_else(|| scheduler.config().web.listen.clone());
    let mut scheduler = scheduler.with_tick_interval(tick);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    let endpoint = format!("http://{}", listener.local_addr()?);
    store.write_pid(std::process::id())?;
    store.write_endpoint(&endpoint)?;

    scheduler.start_boot_jobs();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (handle, engine) = scheduler.spawn(shutdown_rx.clone());
    let state = AppState::new(handle, store, config_path);
    let server = tokio::spawn(rota_gateway::serve(listener, state, shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutting down");
    shutdown_tx.send(true).ok();

    if let Err(e) = engine.await {
        tracing::error!("❌ Scheduler task failed: {e}");
    }
    match server.await {
        Ok(Err(e)) => tracing::error!("❌ API server error: {e}"),
        Err(e) => tracing::error!("❌ API server task failed: {e}"),
        Ok(Ok(())) => {}
    }
    tracing::info!("👋 rotad stopped");
    Ok(())
}
