//! Venue Types
//!
//! Raw response shapes for the venue's data, gamma, and CLOB endpoints plus
//! the normalized market model the engine consumes. The gamma API is loose
//! with types: `outcomes`, `clobTokenIds`, and `outcomePrices` arrive either
//! as JSON-encoded strings or native lists depending on the endpoint, and
//! numeric fields arrive as strings or numbers. Everything is normalized
//! here so nothing downstream ever touches a raw payload.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::ticks::to_tick;

// ─────────────────────────────────────────────────────────────────
// Flexible field decoding
// ─────────────────────────────────────────────────────────────────

/// Decode a list that may arrive as a native array or a JSON-encoded string
/// (`"[\"Yes\",\"No\"]"`).
fn de_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(list_of_strings(&value))
}

fn list_of_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .map(|inner| list_of_strings(&inner))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Decode a number that may arrive as a JSON number or a quoted string.
fn de_flexible_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(flexible_f64(&value).unwrap_or(0.0))
}

pub(crate) fn flexible_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────
// Source-account activity
// ─────────────────────────────────────────────────────────────────

/// One raw activity row from `data-api/activity`, newest first on the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivityItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, alias = "transactionHash")]
    pub transaction_hash: Option<String>,
    /// Seconds since epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub side: String,
    #[serde(default)]
    pub outcome: String,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub size: f64,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub price: f64,
    #[serde(default, alias = "conditionId", alias = "marketId")]
    pub condition_id: Option<String>,
}

impl ActivityItem {
    pub fn is_trade(&self) -> bool {
        self.activity_type.eq_ignore_ascii_case("TRADE")
    }

    pub fn is_buy(&self) -> bool {
        self.side.eq_ignore_ascii_case("BUY")
    }

    /// The hash keying this fill for dedup; falls back to the row id.
    pub fn tx_hash(&self) -> Option<&str> {
        self.transaction_hash
            .as_deref()
            .filter(|h| !h.is_empty())
            .or(self.id.as_deref().filter(|h| !h.is_empty()))
    }

    pub fn timestamp_ms(&self) -> i64 {
        if self.timestamp < 10_000_000_000 {
            self.timestamp * 1000
        } else {
            self.timestamp
        }
    }
}

/// A current holding of the source account, used for the blacklist scan.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceHolding {
    #[serde(default, alias = "conditionId", alias = "marketId")]
    pub condition_id: Option<String>,
    #[serde(default, deserialize_with = "de_flexible_f64")]
    pub size: f64,
}

/// Public profile of the source account.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SourceProfile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pseudonym: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// Gamma market payloads
// ─────────────────────────────────────────────────────────────────

/// Raw gamma market. Also serves as a child market inside an event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMarket {
    #[serde(default, alias = "conditionId", alias = "condition_id")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "de_string_or_list")]
    pub outcomes: Vec<String>,
    #[serde(default, alias = "clobTokenIds", deserialize_with = "de_string_or_list")]
    pub clob_token_ids: Vec<String>,
    #[serde(default, alias = "outcomePrices", deserialize_with = "de_string_or_list")]
    pub outcome_prices: Vec<String>,
    #[serde(default)]
    pub resolved: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "umaResolutionStatus")]
    pub uma_resolution_status: Option<String>,
    #[serde(default, alias = "winnerTokenId")]
    pub winner_token_id: Option<String>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default, alias = "outcomeStatuses")]
    pub outcome_statuses: Vec<String>,
    #[serde(default, alias = "endDate")]
    pub end_date: Option<String>,
    #[serde(default, alias = "acceptingOrders")]
    pub accepting_orders: Option<bool>,
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

/// Event wrapper: groups the sibling child markets of a multi-outcome event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub markets: Vec<RawMarket>,
}

impl RawMarket {
    /// Any of the ids the venue uses for this market.
    pub fn matches_id(&self, target: &str) -> bool {
        self.condition_id.as_deref() == Some(target) || self.id.as_deref() == Some(target)
    }

    /// Resolution is declared through several independent fields; any one of
    /// them settles it.
    pub fn is_resolved(&self) -> bool {
        if self.resolved == Some(true) {
            return true;
        }
        if matches!(&self.status, Some(s) if s.eq_ignore_ascii_case("resolved")) {
            return true;
        }
        if matches!(&self.uma_resolution_status, Some(s) if s.eq_ignore_ascii_case("resolved")) {
            return true;
        }
        if self.winner_token_id.is_some() {
            return true;
        }
        !self.outcome_statuses.is_empty()
            && self
                .outcome_statuses
                .iter()
                .all(|s| s.eq_ignore_ascii_case("resolved"))
    }

    pub fn end_date_ms(&self) -> Option<i64> {
        let raw = self.end_date.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.timestamp_millis())
            .or_else(|| raw.parse::<i64>().ok())
    }

    pub fn outcome_prices_f64(&self) -> Vec<f64> {
        self.outcome_prices
            .iter()
            .filter_map(|p| p.trim().parse::<f64>().ok())
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Normalized market model
// ─────────────────────────────────────────────────────────────────

/// One outcome leg, aligned by index with the venue's token list.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub token_id: String,
    pub label: String,
    pub tick_price: Option<u16>,
}

/// Normalized market the engine consumes: outcome labels aligned 1:1 with
/// token ids, venue ordering preserved.
#[derive(Debug, Clone)]
pub struct Market {
    pub market_id: String,
    pub question: String,
    pub slug: String,
    pub end_time_ms: Option<i64>,
    pub outcomes: Vec<Outcome>,
    pub is_resolved: bool,
}

impl Market {
    /// Binary iff exactly two outcomes.
    pub fn is_binary(&self) -> bool {
        self.outcomes.len() == 2
    }

    pub fn from_raw(raw: &RawMarket) -> Option<Self> {
        let market_id = raw
            .condition_id
            .clone()
            .or_else(|| raw.id.clone())
            .filter(|id| !id.is_empty())?;
        if raw.clob_token_ids.is_empty() {
            return None;
        }
        let prices = raw.outcome_prices_f64();
        let outcomes = raw
            .clob_token_ids
            .iter()
            .enumerate()
            .map(|(idx, token_id)| Outcome {
                token_id: token_id.clone(),
                label: raw.outcomes.get(idx).cloned().unwrap_or_default(),
                tick_price: prices.get(idx).and_then(|p| to_tick(*p)),
            })
            .collect();
        Some(Self {
            market_id,
            question: raw.question.clone(),
            slug: raw.slug.clone().unwrap_or_default(),
            end_time_ms: raw.end_date_ms(),
            outcomes,
            is_resolved: raw.is_resolved(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Order books
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RawBookLevel {
    #[serde(deserialize_with = "de_flexible_f64")]
    pub price: f64,
    #[serde(deserialize_with = "de_flexible_f64")]
    pub size: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawBook {
    #[serde(default)]
    pub bids: Vec<RawBookLevel>,
    #[serde(default)]
    pub asks: Vec<RawBookLevel>,
}

/// One normalized book level, price already on the tick grid.
#[derive(Debug, Clone, Copy)]
pub struct BookLevel {
    pub tick: u16,
    pub size: f64,
}

/// Normalized order book: bids best-first descending, asks best-first
/// ascending, all sizes finite and positive.
#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn from_raw(raw: RawBook) -> Self {
        let mut book = Self {
            bids: normalize_levels(raw.bids),
            asks: normalize_levels(raw.asks),
        };
        book.bids.sort_by(|a, b| b.tick.cmp(&a.tick));
        book.asks.sort_by(|a, b| a.tick.cmp(&b.tick));
        book
    }

    pub fn best_bid(&self) -> Option<u16> {
        self.bids.first().map(|l| l.tick)
    }

    pub fn best_ask(&self) -> Option<u16> {
        self.asks.first().map(|l| l.tick)
    }

    pub fn mid_tick(&self) -> Option<u16> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2),
            _ => None,
        }
    }

    pub fn has_both_sides(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }
}

fn normalize_levels(raw: Vec<RawBookLevel>) -> Vec<BookLevel> {
    raw.into_iter()
        .filter(|l| l.price.is_finite() && l.size.is_finite() && l.price > 0.0 && l.size > 0.0)
        .filter_map(|l| {
            to_tick(l.price).map(|tick| BookLevel {
                tick,
                size: l.size,
            })
        })
        .collect()
}

/// Top-of-book snapshot for the close path.
#[derive(Debug, Clone, Copy)]
pub struct LivePrice {
    pub best_bid: u16,
    pub best_ask: u16,
    pub mid_tick: u16,
}

impl LivePrice {
    pub fn from_book(book: &OrderBook) -> Option<Self> {
        let best_bid = book.best_bid()?;
        let best_ask = book.best_ask()?;
        Some(Self {
            best_bid,
            best_ask,
            mid_tick: (best_bid + best_ask) / 2,
        })
    }
}

// ─────────────────────────────────────────────────────────────────
// Streaming updates
// ─────────────────────────────────────────────────────────────────

/// One decoded message from the market book channel. The wire shape varies
/// (full book snapshots vs ticker-style price changes); both collapse here.
#[derive(Debug, Clone)]
pub struct StreamUpdate {
    pub token_id: String,
    pub kind: StreamKind,
}

#[derive(Debug, Clone)]
pub enum StreamKind {
    /// Full or partial book snapshot.
    Book(OrderBook),
    /// Single traded/quoted price.
    Ticker(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_decode_from_string_or_list() {
        let as_list: RawMarket = serde_json::from_str(
            r#"{"conditionId":"m1","outcomes":["No","Yes"],"clobTokenIds":["t0","t1"]}"#,
        )
        .unwrap();
        assert_eq!(as_list.outcomes, vec!["No", "Yes"]);
        assert_eq!(as_list.clob_token_ids, vec!["t0", "t1"]);

        let as_string: RawMarket = serde_json::from_str(
            r#"{"conditionId":"m1","outcomes":"[\"No\",\"Yes\"]","clobTokenIds":"[\"t0\",\"t1\"]"}"#,
        )
        .unwrap();
        assert_eq!(as_string.outcomes, vec!["No", "Yes"]);
        assert_eq!(as_string.clob_token_ids, vec!["t0", "t1"]);
    }

    #[test]
    fn resolution_is_detected_from_any_signal() {
        let mk = |json: &str| serde_json::from_str::<RawMarket>(json).unwrap();
        assert!(mk(r#"{"resolved":true}"#).is_resolved());
        assert!(mk(r#"{"status":"resolved"}"#).is_resolved());
        assert!(mk(r#"{"umaResolutionStatus":"resolved"}"#).is_resolved());
        assert!(mk(r#"{"winnerTokenId":"t1"}"#).is_resolved());
        assert!(mk(r#"{"outcomeStatuses":["resolved","resolved"]}"#).is_resolved());
        assert!(!mk(r#"{"outcomeStatuses":["resolved","open"]}"#).is_resolved());
        assert!(!mk(r#"{"active":true}"#).is_resolved());
    }

    #[test]
    fn book_normalizes_ordering_and_drops_junk() {
        let raw: RawBook = serde_json::from_str(
            r#"{
                "bids":[{"price":"0.40","size":"100"},{"price":"0.42","size":"50"},{"price":"0","size":"10"}],
                "asks":[{"price":"0.47","size":"10"},{"price":"0.44","size":"500"},{"price":"0.45","size":"-2"}]
            }"#,
        )
        .unwrap();
        let book = OrderBook::from_raw(raw);
        assert_eq!(book.best_bid(), Some(420));
        assert_eq!(book.best_ask(), Some(440));
        assert_eq!(book.bids.len(), 2);
        assert_eq!(book.asks.len(), 2);
        assert_eq!(book.mid_tick(), Some(430));
    }

    #[test]
    fn market_normalizes_aligned_outcomes() {
        let raw: RawMarket = serde_json::from_str(
            r#"{
                "conditionId":"m1","question":"Will it?","slug":"will-it",
                "outcomes":"[\"No\",\"Yes\"]",
                "clobTokenIds":"[\"t0\",\"t1\"]",
                "outcomePrices":"[\"0.56\",\"0.44\"]",
                "endDate":"2026-08-01T12:00:00Z"
            }"#,
        )
        .unwrap();
        let market = Market::from_raw(&raw).unwrap();
        assert!(market.is_binary());
        assert_eq!(market.outcomes[1].token_id, "t1");
        assert_eq!(market.outcomes[1].label, "Yes");
        assert_eq!(market.outcomes[1].tick_price, Some(440));
        assert!(market.end_time_ms.is_some());
    }

    #[test]
    fn activity_hash_prefers_transaction_hash() {
        let item: ActivityItem = serde_json::from_str(
            r#"{"id":"row-1","transactionHash":"0xabc","timestamp":1700000000,
                "type":"TRADE","side":"BUY","outcome":"Yes","size":"100","price":"0.44",
                "conditionId":"m1"}"#,
        )
        .unwrap();
        assert_eq!(item.tx_hash(), Some("0xabc"));
        assert_eq!(item.timestamp_ms(), 1_700_000_000_000);
        assert!(item.is_trade());
        assert!(item.is_buy());
        assert_eq!(item.size, 100.0);
    }
}
