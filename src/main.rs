#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # foxy-switch
//!
//! Light-group switch relay for Homebridge.
//!
//! foxy-switch exposes a tiny HTTP API (port 2322 by default) that turns a
//! whole group of Homebridge accessories on or off with one GET request, so
//! dumb clients (wall tablets, shell scripts, NFC tags) never deal with
//! tokens or HomeKit characteristics.
//!
//! ## Subcommands
//!
//! - `foxy-switch serve` (default) — run the HTTP server
//! - `foxy-switch check` — validate the config and print the light groups
//!
//! ## API surface
//!
//! | Method | Path                        | Description                         |
//! |--------|-----------------------------|-------------------------------------|
//! | GET    | `/health`                   | Liveness, session and warm state    |
//! | GET    | `/lightgroups`              | Configured groups and device UUIDs  |
//! | GET    | `/switch/on?switch=<id>`    | Turn every device of a group on     |
//! | GET    | `/switch/off?switch=<id>`   | Turn every device of a group off    |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, startup, graceful shutdown
//! config.rs        — JSON/TOML + env-var configuration, legacy env migration
//! registry.rs      — light group id → ordered device UUIDs
//! session.rs       — login token, session generation, event-stream channel
//! warm.rs          — accessory-cache warm-up (event stream, REST fallback)
//! dispatch.rs      — per-device control state machine
//! keepalive.rs     — periodic token refresh and warm-up tasks
//! upstream/
//!   client.rs      — Homebridge REST client
//!   socket.rs      — Socket.IO event-stream channel
//!   frame.rs       — Engine.IO / Socket.IO frame codec
//! routes/
//!   health.rs      — GET /health
//!   groups.rs      — GET /lightgroups
//!   switch.rs      — GET /switch/on, GET /switch/off
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::ServiceExt;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use foxy_switch::config::{Config, ConfigSource};
use foxy_switch::keepalive::{self, Keepalive};
use foxy_switch::upstream::{ChannelConnector, HomebridgeApi, HomebridgeClient, SocketIoConnector};
use foxy_switch::{routes, AppState, Dispatcher, GroupRegistry, SessionManager, WarmTracker};

/// Light-group switch relay for Homebridge.
#[derive(Parser)]
#[command(name = "foxy-switch", version)]
struct Cli {
    /// Path to the config file (JSON, or TOML with a `.toml` extension).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve,
    /// Validate the configuration and print the light groups.
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (config, source) = match Config::load(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("foxy-switch: {e}");
            std::process::exit(1);
        }
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Check => run_check(&config, &source),
        Commands::Serve => run_server(config, source).await,
    }
}

fn run_check(config: &Config, source: &ConfigSource) {
    match source {
        ConfigSource::File(path) => println!("Config OK: {}", path.display()),
        ConfigSource::MigratedEnv(path) => {
            println!("Config migrated from environment to {}", path.display());
        }
    }
    println!("Homebridge: {}", config.homebridge.url);
    println!("Listen: {}", config.listen_addr());
    println!(
        "Event stream: {}",
        if config.homebridge.event_stream { "enabled" } else { "disabled" }
    );
    for (group, devices) in &config.light_groups {
        println!("  group {group}: {} device(s)", devices.len());
        for device in devices {
            println!("    {device}");
        }
    }
}

async fn run_server(config: Config, source: ConfigSource) {
    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("foxy-switch v{} starting", env!("CARGO_PKG_VERSION"));
    match &source {
        ConfigSource::File(path) => info!("Config loaded from {}", path.display()),
        ConfigSource::MigratedEnv(path) => {
            info!("Configuration migrated from environment to {}", path.display());
        }
    }
    info!("Homebridge at {}", config.homebridge.url);
    if config.light_groups.is_empty() {
        warn!("No light groups configured");
    }

    let client = match HomebridgeClient::new(&config.homebridge, &config.timing) {
        Ok(client) => client,
        Err(e) => {
            error!("Cannot build Homebridge client: {e}");
            std::process::exit(1);
        }
    };
    let api: Arc<dyn HomebridgeApi> = Arc::new(client);

    let connector: Option<Arc<dyn ChannelConnector>> = if config.homebridge.event_stream {
        Some(Arc::new(SocketIoConnector::new(
            &config.homebridge.url,
            &config.homebridge.username,
            config.timing.connect_timeout(),
        )))
    } else {
        info!("Event stream disabled, all commands go over REST");
        None
    };

    let registry = Arc::new(GroupRegistry::new(config.light_groups.clone()));
    let session = Arc::new(SessionManager::new(Arc::clone(&api), connector));
    let warm = Arc::new(WarmTracker::new(
        Arc::clone(&session),
        Arc::clone(&api),
        &config.timing,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        Arc::clone(&session),
        Arc::clone(&warm),
        Arc::clone(&api),
    ));

    // Startup login; failure is not fatal, the refresher keeps trying.
    if !keepalive::refresh_and_warm(&session, &warm).await {
        warn!("Initial login failed, will retry every {}s", config.timing.token_refresh_secs);
    }
    let keepalive = Keepalive::spawn(Arc::clone(&session), Arc::clone(&warm), &config.timing);

    let listen = config.listen_addr();
    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        registry,
        session: Arc::clone(&session),
        warm,
        dispatcher,
    };
    let app = routes::app(state);

    let listener = match TcpListener::bind(&listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {listen}: {e}");
            std::process::exit(1);
        }
    };
    info!("Listening on {listen}");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    let served = axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    // Cleanup
    info!("Shutting down...");
    keepalive.shutdown().await;
    session.shutdown().await;

    if let Err(e) = served {
        error!("Server error: {e}");
        std::process::exit(1);
    }
    info!("Shutdown complete");
}
