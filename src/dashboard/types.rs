//! Dashboard Types
//!
//! JSON shapes for the control plane. Ticks convert to decimal prices at
//! this boundary only; everything behind it stays integer.

use serde::{Deserialize, Serialize};

use crate::ledger::{ClosedPosition, Position, TradeEvent};
use crate::ticks::from_tick;

/// Uniform JSON envelope for every control-plane response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl ApiResponse<()> {
    /// A bare `{success: true}` acknowledgement with no payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }
}

/// Who the bot is copying, surfaced on the stats page.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileView {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivePositionView {
    pub market_id: String,
    pub token_id: Option<String>,
    pub question: String,
    pub slug: String,
    pub side: String,
    pub outcome_label: String,
    pub market_type: String,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub invested_usd: f64,
    pub current_value: f64,
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: f64,
    pub state: String,
}

impl From<&Position> for ActivePositionView {
    fn from(p: &Position) -> Self {
        Self {
            market_id: p.market_id.clone(),
            token_id: p.token_id.clone(),
            question: p.question.clone(),
            slug: p.slug.clone(),
            side: p.side.as_str().to_string(),
            outcome_label: p.outcome_label.clone(),
            market_type: p.market_type.as_str().to_string(),
            size: p.size,
            entry_price: from_tick(p.entry_tick),
            current_price: from_tick(p.current_tick),
            invested_usd: p.invested_usd,
            current_value: p.current_value,
            unrealized_pnl: p.unrealized_pnl,
            state: p.state.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosedPositionView {
    pub market_id: String,
    pub question: String,
    pub side: String,
    pub outcome_label: String,
    pub size: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub invested_usd: f64,
    pub return_usd: f64,
    #[serde(rename = "realizedPnL")]
    pub realized_pnl: f64,
    pub close_trigger: Option<String>,
    pub close_cause: Option<String>,
    pub closed_at: i64,
}

impl From<&ClosedPosition> for ClosedPositionView {
    fn from(p: &ClosedPosition) -> Self {
        Self {
            market_id: p.market_id.clone(),
            question: p.question.clone(),
            side: p.side.as_str().to_string(),
            outcome_label: p.outcome_label.clone(),
            size: p.size,
            entry_price: from_tick(p.entry_tick),
            exit_price: from_tick(p.exit_tick),
            invested_usd: p.invested_usd,
            return_usd: p.return_usd,
            realized_pnl: p.realized_pnl,
            close_trigger: p.close_trigger.map(|t| t.as_str().to_string()),
            close_cause: p.close_cause.map(|c| c.as_str().to_string()),
            closed_at: p.closed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEventView {
    pub tx_hash: String,
    pub timestamp: i64,
    pub market_id: String,
    pub question: String,
    pub direction: String,
    pub side: String,
    pub outcome_label: String,
    pub size: f64,
    pub price: f64,
    pub intent: String,
}

impl From<&TradeEvent> for TradeEventView {
    fn from(e: &TradeEvent) -> Self {
        Self {
            tx_hash: e.tx_hash.clone(),
            timestamp: e.timestamp,
            market_id: e.market_id.clone(),
            question: e.question.clone(),
            direction: e.direction.as_str().to_string(),
            side: e.side.as_str().to_string(),
            outcome_label: e.outcome_label.clone(),
            size: e.size,
            price: from_tick(e.tick),
            intent: e.intent.clone(),
        }
    }
}

/// `GET /api/stats` payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub bot_status: String,
    pub balance: f64,
    #[serde(rename = "dailyRealizedPnL")]
    pub daily_realized_pnl: f64,
    #[serde(rename = "totalUnrealizedPnL")]
    pub total_unrealized_pnl: f64,
    #[serde(rename = "dailyPnL")]
    pub daily_pnl: f64,
    #[serde(rename = "allTimePnL")]
    pub all_time_pnl: f64,
    pub active_positions: Vec<ActivePositionView>,
    pub closed_positions: Vec<ClosedPositionView>,
    pub history: Vec<TradeEventView>,
    pub profile: ProfileView,
}

/// Payload of the toggle acknowledgement.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleData {
    pub is_running: bool,
}

/// `POST /api/close` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseRequest {
    pub market_id: String,
    pub side: String,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub outcome_label: Option<String>,
}
