//! copybot – paper-trading copy-trader entry point.
//!
//! Wires the composition root: one venue client, one ledger, one engine
//! task, one dashboard server. SIGINT/SIGTERM route through the engine's
//! cooperative shutdown so the ledger is rewritten before exit.

use anyhow::{Context, Result};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use copybot::audit::{AuditLog, LogCategory};
use copybot::config::Config;
use copybot::dashboard::{self, DashboardContext, ProfileView};
use copybot::engine::{Engine, TradeSettings};
use copybot::filter::PositionFilter;
use copybot::ledger::Ledger;
use copybot::venue::VenueClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Logging – RUST_LOG wins; DEBUG_LOGS bumps the default level.
    let default_level = if config.debug_logs { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        source = %config.profile_address,
        poll_ms = config.poll_interval_ms,
        port = config.port,
        "copybot starting"
    );

    let audit = Arc::new(AuditLog::new(&config.logs_dir));
    audit.log(LogCategory::Boot, "process starting");

    let ledger = Arc::new(Ledger::open(config.ledger_path(), config.starting_balance));
    let blacklist = Arc::new(PositionFilter::open(config.blacklist_path()));
    let settings = Arc::new(RwLock::new(TradeSettings::load(&config.settings_path())));
    let venue = Arc::new(VenueClient::new(config.venue_urls()));

    // Source profile is cosmetic; fall back to the bare address.
    let profile = match venue.get_user_profile(&config.profile_address).await {
        Ok(p) => ProfileView {
            address: config.profile_address.clone(),
            name: p.name.or(p.pseudonym).unwrap_or_default(),
        },
        Err(e) => {
            warn!(error = %e, "Could not fetch source profile");
            ProfileView {
                address: config.profile_address.clone(),
                name: String::new(),
            }
        }
    };

    let (engine, handle) = Engine::new(
        config.clone(),
        Arc::clone(&venue),
        Arc::clone(&ledger),
        Arc::clone(&blacklist),
        Arc::clone(&audit),
        Arc::clone(&settings),
    );

    let ctx = Arc::new(DashboardContext {
        ledger: Arc::clone(&ledger),
        engine: handle.clone(),
        settings: Arc::clone(&settings),
        settings_path: config.settings_path(),
        audit: Arc::clone(&audit),
        profile,
    });
    let router = dashboard::create_router(ctx);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind dashboard port {}", config.port))?;
    info!(port = config.port, "Dashboard listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "Dashboard server ended");
        }
    });

    let engine_task = tokio::spawn(engine.run());

    shutdown_signal().await;
    info!("Shutdown signal received");
    handle.request_shutdown();
    let _ = engine_task.await;
    audit.log(LogCategory::Shutdown, "process exiting");
    audit.flush();
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
