#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # xxtc-hub
//!
//! Cloud control hub brokering real-time control traffic between XXTouch
//! devices and their controllers over authenticated websocket connections,
//! with an embedded TURN relay, large-file transfer gateway, and self-updater.
//!
//! ## Subcommands
//!
//! - `xxtc-hub serve` (default) — run the HTTP/WS server
//! - `xxtc-hub supervise` — run as supervisor: starts the server and
//!   restarts it on crash
//! - `xxtc-hub --update-worker <job>` — internal: perform an in-place binary
//!   swap handed off by a running server applying an update

use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use xxtc_hub::config::Config;
use xxtc_hub::signer::Signer;
use xxtc_hub::state::AppState;
use xxtc_hub::supervisor;
use xxtc_hub::updater::worker;

#[derive(Parser)]
#[command(name = "xxtc-hub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Set the controller password and persist its hash, then exit.
    #[arg(long = "set-password", global = true)]
    set_password: Option<String>,

    /// Set the TURN relay's advertised public IPv4 address, then exit.
    #[arg(long = "set-turn-ip", global = true)]
    set_turn_ip: Option<String>,

    /// Set the TURN relay's UDP/TCP listen port, then exit.
    #[arg(long = "set-turn-port", global = true)]
    set_turn_port: Option<u16>,

    /// Internal: run the update-worker helper for job file `PATH`.
    #[arg(long = "update-worker", global = true, value_name = "PATH")]
    update_worker: Option<std::path::PathBuf>,

    /// Config file path, used by every mode.
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand is given).
    Serve,
    /// Run as supervisor: starts the server and restarts it on crash.
    Supervise,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Some(job_path) = cli.update_worker {
        run_update_worker(&job_path).await;
        return;
    }

    if let Some(password) = cli.set_password {
        run_set_password(cli.config.as_deref(), &password).await;
        return;
    }
    if let Some(ip) = cli.set_turn_ip {
        run_set_turn_ip(cli.config.as_deref(), &ip).await;
        return;
    }
    if let Some(port) = cli.set_turn_port {
        run_set_turn_port(cli.config.as_deref(), port).await;
        return;
    }

    match cli.command {
        Some(Commands::Supervise) => run_supervisor_mode(cli.config.as_deref()).await,
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `-update-worker <job>`: perform the in-place binary swap handed off by a
/// running server, then exit — exit code 0 on success, 2 on a job the worker
/// itself could not recover from (§6 exit code table).
async fn run_update_worker(job_path: &std::path::Path) {
    init_tracing();
    match worker::run(job_path).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "update worker failed");
            std::process::exit(2);
        }
    }
}

async fn run_set_password(config_path: Option<&str>, password: &str) {
    init_tracing();
    let config = match Config::load(config_path).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };
    let mut config = config;
    config.passhash = Signer::hash_password(password);
    persist_config_or_exit(config_path, &config).await;
    info!("password updated");
}

async fn run_set_turn_ip(config_path: Option<&str>, ip: &str) {
    init_tracing();
    let mut config = load_config_or_exit(config_path).await;
    match ip.parse() {
        Ok(addr) => config.turn.public_ip = Some(addr),
        Err(e) => {
            error!(error = %e, "invalid IPv4 address");
            std::process::exit(1);
        }
    }
    persist_config_or_exit(config_path, &config).await;
    info!("TURN public IP updated");
}

async fn run_set_turn_port(config_path: Option<&str>, port: u16) {
    init_tracing();
    let mut config = load_config_or_exit(config_path).await;
    config.turn.port = port;
    persist_config_or_exit(config_path, &config).await;
    info!("TURN port updated");
}

async fn load_config_or_exit(config_path: Option<&str>) -> Config {
    match Config::load(config_path).await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    }
}

async fn persist_config_or_exit(config_path: Option<&str>, config: &Config) {
    let path = config_path.map(std::path::PathBuf::from).unwrap_or_else(|| config.default_save_path());
    if let Err(e) = config.save(&path).await {
        error!(error = %e, "failed to persist config");
        std::process::exit(1);
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = load_config_or_exit(config_path).await;
    init_tracing();
    info!("xxtc-hub supervisor starting");
    supervisor::run_supervisor(config_path, &config.supervisor).await
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = load_config_or_exit(config_path).await;
    init_tracing();

    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            error!("config error: {err}");
        }
        std::process::exit(1);
    }

    info!("xxtc-hub v{} starting", env!("CARGO_PKG_VERSION"));
    info!("listening on {}", config.listen);
    if config.passhash.is_empty() {
        warn!("no controller password set — run with --set-password to configure one");
    }

    let listen_addr = config.listen.clone();
    let state = match AppState::bootstrap(config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(1);
        }
    };

    if let Err(e) = xxtc_hub::turn::spawn_listeners(state.turn.clone()).await {
        error!(error = %e, "failed to start TURN listeners");
        std::process::exit(1);
    }

    let sweep_transfer = state.transfer.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let evicted = sweep_transfer.sweep_expired().await;
            if evicted > 0 {
                info!(evicted, "expired transfer tokens swept");
            }
        }
    });

    let app = xxtc_hub::routes::build_router(state.clone());

    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, listen_addr, "failed to bind");
            std::process::exit(1);
        }
    };
    info!("server ready");

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    axum::serve(listener, app).with_graceful_shutdown(shutdown).await.expect("server error");

    info!("shutting down...");
    sweep_task.abort();
    info!("goodbye");
}

#[allow(dead_code)]
fn connection_count_placeholder() -> Arc<AtomicU32> {
    Arc::new(AtomicU32::new(0))
}

#[allow(dead_code)]
fn uptime_placeholder() -> Instant {
    Instant::now()
}
