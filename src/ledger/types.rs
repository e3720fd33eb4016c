//! Ledger Types
//!
//! Durable domain model for the paper ledger: positions, closed positions,
//! trade events, and the closed enumerations that gate the position
//! lifecycle. All enums decode leniently: a ledger file written by an older
//! build (or edited by hand) coerces unknown variants to safe defaults
//! instead of failing the whole load.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Sides and market shape
// ─────────────────────────────────────────────────────────────────

/// Which leg of a binary pair a position holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Side {
    Yes,
    No,
}

impl From<String> for Side {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "NO" => Side::No,
            _ => Side::Yes,
        }
    }
}

impl From<Side> for String {
    fn from(side: Side) -> Self {
        side.as_str().to_string()
    }
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Yes => "YES",
            Side::No => "NO",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the position lives in a standalone binary market or one leg of a
/// multi-outcome event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum MarketType {
    #[default]
    Single,
    Multi,
}

impl From<String> for MarketType {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "MULTI" => MarketType::Multi,
            _ => MarketType::Single,
        }
    }
}

impl From<MarketType> for String {
    fn from(mt: MarketType) -> Self {
        mt.as_str().to_string()
    }
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Single => "SINGLE",
            MarketType::Multi => "MULTI",
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Position lifecycle
// ─────────────────────────────────────────────────────────────────

/// Finite states of a paper position. Unknown values coerce to `Open` at
/// ledger load so a stale file never wedges the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "String", into = "String")]
pub enum PositionState {
    #[default]
    Open,
    Closing,
    PendingResolution,
    Closed,
    Settled,
    Invalidated,
}

impl From<String> for PositionState {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "CLOSING" => PositionState::Closing,
            "PENDING_RESOLUTION" => PositionState::PendingResolution,
            "CLOSED" => PositionState::Closed,
            "SETTLED" => PositionState::Settled,
            "INVALIDATED" => PositionState::Invalidated,
            _ => PositionState::Open,
        }
    }
}

impl From<PositionState> for String {
    fn from(state: PositionState) -> Self {
        state.as_str().to_string()
    }
}

impl PositionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionState::Open => "OPEN",
            PositionState::Closing => "CLOSING",
            PositionState::PendingResolution => "PENDING_RESOLUTION",
            PositionState::Closed => "CLOSED",
            PositionState::Settled => "SETTLED",
            PositionState::Invalidated => "INVALIDATED",
        }
    }
}

/// What initiated a close. Numeric rank arbitrates racing close intents:
/// lower is stronger, and an incoming trigger may overwrite an existing one
/// only when its priority is less than or equal to the recorded one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CloseTrigger {
    MarketResolution,
    SystemGuard,
    UserAction,
    CopyTraderEvent,
    SystemPolicy,
    Timeout,
}

impl From<String> for CloseTrigger {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "MARKET_RESOLUTION" => CloseTrigger::MarketResolution,
            "SYSTEM_GUARD" => CloseTrigger::SystemGuard,
            "USER_ACTION" => CloseTrigger::UserAction,
            "COPY_TRADER_EVENT" => CloseTrigger::CopyTraderEvent,
            "TIMEOUT" => CloseTrigger::Timeout,
            _ => CloseTrigger::SystemPolicy,
        }
    }
}

impl From<CloseTrigger> for String {
    fn from(trigger: CloseTrigger) -> Self {
        trigger.as_str().to_string()
    }
}

impl CloseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseTrigger::MarketResolution => "MARKET_RESOLUTION",
            CloseTrigger::SystemGuard => "SYSTEM_GUARD",
            CloseTrigger::UserAction => "USER_ACTION",
            CloseTrigger::CopyTraderEvent => "COPY_TRADER_EVENT",
            CloseTrigger::SystemPolicy => "SYSTEM_POLICY",
            CloseTrigger::Timeout => "TIMEOUT",
        }
    }

    /// Numeric priority, 1 strongest.
    pub fn priority(&self) -> u8 {
        match self {
            CloseTrigger::MarketResolution => 1,
            CloseTrigger::SystemGuard => 2,
            CloseTrigger::UserAction => 3,
            CloseTrigger::CopyTraderEvent => 4,
            CloseTrigger::SystemPolicy => 5,
            CloseTrigger::Timeout => 6,
        }
    }
}

impl std::fmt::Display for CloseTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a close happened, recorded alongside the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CloseCause {
    WinnerYes,
    WinnerNo,
    TargetSelloff,
    UserRequest,
    CloseAll,
    Unknown,
}

impl From<String> for CloseCause {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "WINNER_YES" => CloseCause::WinnerYes,
            "WINNER_NO" => CloseCause::WinnerNo,
            "TARGET_SELLOFF" => CloseCause::TargetSelloff,
            "USER_REQUEST" => CloseCause::UserRequest,
            "CLOSE_ALL" => CloseCause::CloseAll,
            _ => CloseCause::Unknown,
        }
    }
}

impl From<CloseCause> for String {
    fn from(cause: CloseCause) -> Self {
        cause.as_str().to_string()
    }
}

impl CloseCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseCause::WinnerYes => "WINNER_YES",
            CloseCause::WinnerNo => "WINNER_NO",
            CloseCause::TargetSelloff => "TARGET_SELLOFF",
            CloseCause::UserRequest => "USER_REQUEST",
            CloseCause::CloseAll => "CLOSE_ALL",
            CloseCause::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse an action-reason string of the form `"TRIGGER|CAUSE"` as written by
/// the close arbiter. Anything else is treated as a plain intent with no
/// trigger/cause attached.
pub fn parse_close_reason(reason: &str) -> Option<(CloseTrigger, CloseCause)> {
    let (trigger, cause) = reason.split_once('|')?;
    Some((
        CloseTrigger::from(trigger.to_string()),
        CloseCause::from(cause.to_string()),
    ))
}

/// True when the reason string marks a system settlement rather than a
/// user-initiated sell. Settlements do not emit SELL trade events.
pub fn is_resolution_reason(reason: &str) -> bool {
    reason.contains("MARKET_RESOLUTION") || reason.contains("RESOLUTION")
}

// ─────────────────────────────────────────────────────────────────
// Positions
// ─────────────────────────────────────────────────────────────────

/// An open (or closing) paper position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub market_id: String,
    /// Canonical outcome token. Absent on legacy binary entries that were
    /// keyed by side alone; migrated forward on first write.
    #[serde(default)]
    pub token_id: Option<String>,
    pub question: String,
    #[serde(default)]
    pub slug: String,
    pub side: Side,
    #[serde(default)]
    pub outcome_label: String,
    #[serde(default)]
    pub market_type: MarketType,
    /// Shares held; never negative.
    pub size: f64,
    /// Size-weighted average entry price in ticks.
    pub entry_tick: u16,
    pub invested_usd: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    pub current_tick: u16,
    #[serde(default)]
    pub current_value: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub state: PositionState,
    #[serde(default)]
    pub close_trigger: Option<CloseTrigger>,
    #[serde(default)]
    pub close_cause: Option<CloseCause>,
    #[serde(default)]
    pub close_priority: Option<u8>,
    /// Milliseconds since epoch of the most recent entry fill.
    #[serde(default)]
    pub last_entry_time: i64,
}

impl Position {
    /// Canonical map key for this position.
    pub fn key(&self) -> String {
        position_key(
            &self.market_id,
            self.token_id.as_deref(),
            self.side,
            &self.outcome_label,
        )
    }

    /// Mark value against a fresh tick.
    pub fn revalue(&mut self, tick: u16) {
        self.current_tick = tick;
        self.current_value = self.size * crate::ticks::from_tick(tick);
        self.unrealized_pnl = self.current_value - self.invested_usd;
    }
}

/// Canonical position key: `(marketId, tokenId)` when the token is known,
/// else `(marketId, side, outcomeLabel)`.
pub fn position_key(
    market_id: &str,
    token_id: Option<&str>,
    side: Side,
    outcome_label: &str,
) -> String {
    match token_id {
        Some(token) if !token.is_empty() => format!("{market_id}:{token}"),
        _ => format!("{market_id}:{}:{}", side.as_str(), outcome_label),
    }
}

/// Legacy binary key: `(marketId, side)`. Still resolvable for reads so old
/// ledgers keep working; first write migrates to the canonical key.
pub fn legacy_key(market_id: &str, side: Side) -> String {
    format!("{market_id}:{}", side.as_str())
}

/// Immutable record of a realized close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedPosition {
    pub market_id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    pub question: String,
    #[serde(default)]
    pub slug: String,
    pub side: Side,
    #[serde(default)]
    pub outcome_label: String,
    #[serde(default)]
    pub market_type: MarketType,
    pub size: f64,
    pub entry_tick: u16,
    pub exit_tick: u16,
    pub invested_usd: f64,
    pub return_usd: f64,
    pub realized_pnl: f64,
    #[serde(default)]
    pub close_trigger: Option<CloseTrigger>,
    #[serde(default)]
    pub close_cause: Option<CloseCause>,
    /// Milliseconds since epoch.
    pub closed_at: i64,
}

// ─────────────────────────────────────────────────────────────────
// Trade events
// ─────────────────────────────────────────────────────────────────

/// Direction of an audited fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl From<String> for TradeDirection {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "SELL" => TradeDirection::Sell,
            _ => TradeDirection::Buy,
        }
    }
}

impl From<TradeDirection> for String {
    fn from(d: TradeDirection) -> Self {
        d.as_str().to_string()
    }
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "BUY",
            TradeDirection::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record: one per BUY and one per user-initiated SELL.
/// System settlements never append here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    /// External transaction hash keying the event for dedup.
    pub tx_hash: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub market_id: String,
    #[serde(default)]
    pub token_id: Option<String>,
    pub question: String,
    pub direction: TradeDirection,
    pub side: Side,
    #[serde(default)]
    pub outcome_label: String,
    pub size: f64,
    pub tick: u16,
    /// The source account's own fill tick, when known.
    #[serde(default)]
    pub source_tick: Option<u16>,
    /// Observation-to-commit latency for the replicated fill.
    #[serde(default)]
    pub latency_ms: Option<i64>,
    /// Intent string, e.g. `COPY_TRADE` or `"TRIGGER|CAUSE"`.
    pub intent: String,
}
