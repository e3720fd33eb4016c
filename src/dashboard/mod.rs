//! Dashboard Module
//!
//! Read-mostly HTTP control plane: account stats, trade history, and the
//! start/stop, close, and sizing controls. Commands are queued onto the
//! engine's channel rather than executed inline, so a request never blocks
//! on a venue call the engine might be suspended in.

mod types;

pub use types::*;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::audit::{AuditLog, LogCategory};
use crate::engine::{EngineCommand, EngineHandle, TradeSettings, TradeSettingsPatch};
use crate::ledger::{Ledger, Side};

/// Shared state for all handlers.
pub struct DashboardContext {
    pub ledger: Arc<Ledger>,
    pub engine: EngineHandle,
    pub settings: Arc<RwLock<TradeSettings>>,
    pub settings_path: PathBuf,
    pub audit: Arc<AuditLog>,
    pub profile: ProfileView,
}

/// Create the API router with all endpoints.
pub fn create_router(ctx: Arc<DashboardContext>) -> Router {
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/control/toggle", post(post_toggle))
        .route("/api/control/close-all", post(post_close_all))
        .route("/api/close", post(post_close))
        .route(
            "/api/settings/trade-amount",
            get(get_trade_amount).post(post_trade_amount),
        )
        .with_state(ctx)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET /api/stats - balance, P&L rollups, positions, and history.
async fn get_stats(State(ctx): State<Arc<DashboardContext>>) -> impl IntoResponse {
    let positions = ctx.ledger.positions();
    let closed = ctx.ledger.closed_positions();
    let events = ctx.ledger.trade_events();

    let today_start = Utc::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp_millis())
        .unwrap_or(0);

    let daily_realized: f64 = closed
        .iter()
        .filter(|c| c.closed_at >= today_start)
        .map(|c| c.realized_pnl)
        .sum();
    let all_time: f64 = closed.iter().map(|c| c.realized_pnl).sum();
    let unrealized: f64 = positions.iter().map(|(_, p)| p.unrealized_pnl).sum();

    let response = StatsResponse {
        bot_status: if ctx.engine.is_running() {
            "running".to_string()
        } else {
            "stopped".to_string()
        },
        balance: ctx.ledger.balance(),
        daily_realized_pnl: daily_realized,
        total_unrealized_pnl: unrealized,
        daily_pnl: daily_realized + unrealized,
        all_time_pnl: all_time,
        active_positions: positions.iter().map(|(_, p)| p.into()).collect(),
        closed_positions: closed.iter().map(ClosedPositionView::from).collect(),
        history: events.iter().map(TradeEventView::from).collect(),
        profile: ctx.profile.clone(),
    };
    Json(ApiResponse::success(response))
}

/// POST /api/control/toggle - flip copy trading on/off.
async fn post_toggle(State(ctx): State<Arc<DashboardContext>>) -> impl IntoResponse {
    let is_running = ctx.engine.toggle();
    ctx.audit.log(
        LogCategory::Api,
        if is_running { "bot started" } else { "bot stopped" },
    );
    Json(ApiResponse::success(ToggleData { is_running }))
}

/// POST /api/control/close-all - queue a close for every open position.
async fn post_close_all(State(ctx): State<Arc<DashboardContext>>) -> impl IntoResponse {
    if ctx.engine.cmd_tx.try_send(EngineCommand::CloseAll).is_ok() {
        Json(ApiResponse::ok())
    } else {
        warn!("Engine command queue full, close-all dropped");
        Json(ApiResponse::error("engine command queue full"))
    }
}

/// POST /api/close - queue a close for one position.
async fn post_close(
    State(ctx): State<Arc<DashboardContext>>,
    Json(req): Json<CloseRequest>,
) -> impl IntoResponse {
    if req.market_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("marketId is required")),
        );
    }
    let cmd = EngineCommand::Close {
        market_id: req.market_id,
        side: Side::from(req.side),
        token_id: req.token_id,
        outcome_label: req.outcome_label,
    };
    if ctx.engine.cmd_tx.try_send(cmd).is_ok() {
        (StatusCode::OK, Json(ApiResponse::ok()))
    } else {
        warn!("Engine command queue full, close dropped");
        (StatusCode::OK, Json(ApiResponse::error("engine command queue full")))
    }
}

/// GET /api/settings/trade-amount - current sizing settings.
async fn get_trade_amount(State(ctx): State<Arc<DashboardContext>>) -> impl IntoResponse {
    let settings = ctx.settings.read().unwrap().clone();
    Json(ApiResponse::success(settings))
}

/// POST /api/settings/trade-amount - patch sizing settings.
async fn post_trade_amount(
    State(ctx): State<Arc<DashboardContext>>,
    Json(patch): Json<TradeSettingsPatch>,
) -> impl IntoResponse {
    let updated = {
        let mut guard = ctx.settings.write().unwrap();
        let changed = guard.apply(&patch);
        if changed {
            if let Err(e) = guard.save(&ctx.settings_path) {
                warn!(error = %e, "Failed to persist trade settings");
            }
            ctx.audit.log(LogCategory::Api, "trade settings updated");
        }
        guard.clone()
    };
    Json(ApiResponse::success(updated))
}
