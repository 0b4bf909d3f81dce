//! balanz: OCPP 1.6 central system with smart-charging load balancing.
//!
//! Reads configuration from a TOML file (`--config <path>`), loads the
//! entity CSVs, then serves chargers and API clients on one WebSocket
//! endpoint while the per-group engine loops and the model watchdog run in
//! the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use balanz::api::UserTable;
use balanz::config::AppConfig;
use balanz::engine::{watchdog, BalanzLoop};
use balanz::model::{csv as model_csv, Store};
use balanz::ocpp::{CallSender, OcppServer, ProfileDriver, ServerContext, SessionRegistry};
use balanz::support::shutdown::ShutdownSignal;

const DEFAULT_CONFIG: &str = "config/balanz.toml";

fn config_path_from_args() -> PathBuf {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        }
    }
    PathBuf::from(DEFAULT_CONFIG)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config_path = config_path_from_args();
    let cfg = match AppConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load {}: {e}", config_path.display());
            return Err(e.into());
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
        )
        .init();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting balanz"
    );

    let cfg = Arc::new(cfg);
    let store = Arc::new(Store::new(cfg.clone()));

    // ── Entity CSVs ────────────────────────────────────────────
    if let Some(path) = cfg.model.groups_csv.as_deref() {
        model_csv::load_groups(&store, Path::new(path))?;
    }
    if let Some(path) = cfg.model.chargers_csv.as_deref() {
        model_csv::load_chargers(&store, Path::new(path))?;
    }
    if let Some(path) = cfg.model.tags_csv.as_deref() {
        model_csv::load_tags(&store, Path::new(path))?;
    }
    if let Some(path) = cfg.history.session_csv.as_deref() {
        store.register_session_log(Path::new(path))?;
    }
    let users = Arc::new(UserTable::new());
    if let Some(path) = cfg.api.users_csv.as_deref() {
        users.load_csv(Path::new(path))?;
    }

    // ── Shared infrastructure ──────────────────────────────────
    let registry = Arc::new(SessionRegistry::new());
    let calls = Arc::new(CallSender::new(
        registry.clone(),
        Duration::from_secs(cfg.csms.call_timeout),
    ));
    let profiles = Arc::new(ProfileDriver::new(calls.clone(), cfg.balanz.min_allocation));

    let shutdown = ShutdownSignal::new();
    shutdown.listen_for_signals();

    // ── Engine loops, one per allocation group ─────────────────
    if cfg.balanz.run_interval == 0 {
        info!("smart charging disabled in configuration");
    } else {
        for group_id in store.allocation_group_ids() {
            info!(group_id = group_id.as_str(), "starting balanz loop");
            let group_loop = BalanzLoop::new(
                cfg.clone(),
                store.clone(),
                profiles.clone(),
                registry.clone(),
                group_id,
            );
            let loop_shutdown = shutdown.clone();
            tokio::spawn(async move { group_loop.run(loop_shutdown).await });
        }
    }

    // ── Stale-transaction watchdog ─────────────────────────────
    tokio::spawn(watchdog::run(cfg.clone(), store.clone(), shutdown.clone()));

    // ── Serve ──────────────────────────────────────────────────
    let server = OcppServer::new(
        ServerContext {
            cfg,
            store,
            registry,
            calls,
            profiles,
            users,
            started_at: Utc::now(),
        },
        shutdown,
    );
    if let Err(e) = server.run().await {
        error!(error = %e, "server failed");
        return Err(e);
    }

    info!("👋 balanz shutdown complete");
    Ok(())
}
