//! Ledger Store
//!
//! Durable state for the paper account: cash balance, open positions, closed
//! positions, the append-only trade-event log, cached market metadata, and
//! the processed-transaction set that makes every mutation idempotent.
//!
//! All writes go through this one value and every state-changing call
//! persists before returning, via an atomic temp-write + rename, so a crash
//! at any point leaves the last fully-persisted ledger on disk.

mod types;

pub use types::*;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ticks::{clamp_tick, from_tick, to_tick};

/// Open positions below this share count are dust and migrate to the closed
/// set instead of lingering in the open map.
pub const MIN_POSITION_SIZE: f64 = 0.1;

/// Price-cache entries older than this are stale for the REST fallback.
pub const PRICE_CACHE_MAX_AGE_MS: i64 = 30_000;

// ─────────────────────────────────────────────────────────────────
// Persistent root
// ─────────────────────────────────────────────────────────────────

/// Cached market metadata, enough to resolve outcome tokens offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMarket {
    pub question: String,
    #[serde(default)]
    pub slug: String,
    pub outcomes: Vec<String>,
    pub clob_token_ids: Vec<String>,
    /// Milliseconds since epoch.
    #[serde(default)]
    pub end_time_ms: Option<i64>,
}

impl CachedMarket {
    /// The other leg's token in a two-token market. Ordering of the venue's
    /// token list is not guaranteed, so this is a lookup, not index math.
    pub fn other_token(&self, token_id: &str) -> Option<&str> {
        if self.clob_token_ids.len() != 2 {
            return None;
        }
        self.clob_token_ids
            .iter()
            .find(|t| t.as_str() != token_id)
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerState {
    balance: f64,
    #[serde(default)]
    positions: HashMap<String, Position>,
    #[serde(default)]
    closed_positions: Vec<ClosedPosition>,
    #[serde(default)]
    trade_events: Vec<TradeEvent>,
    #[serde(default)]
    market_cache: HashMap<String, CachedMarket>,
    #[serde(default)]
    processed_tx_hashes: HashSet<String>,
}

impl LedgerState {
    fn fresh(balance: f64) -> Self {
        Self {
            balance,
            positions: HashMap::new(),
            closed_positions: Vec::new(),
            trade_events: Vec::new(),
            market_cache: HashMap::new(),
            processed_tx_hashes: HashSet::new(),
        }
    }
}

/// In-memory live price, derived state only.
#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub tick: u16,
    pub updated_at: i64,
}

// ─────────────────────────────────────────────────────────────────
// Trade application input
// ─────────────────────────────────────────────────────────────────

/// One fill to apply against the ledger. Positive `signed_shares` buys,
/// negative sells.
#[derive(Debug, Clone)]
pub struct TradeApply {
    pub market_id: String,
    pub question: String,
    pub slug: String,
    pub side: Side,
    pub outcome_label: String,
    pub signed_shares: f64,
    pub tick: u16,
    pub tx_hash: String,
    pub reason: String,
    pub source_tick: Option<u16>,
    pub latency_ms: Option<i64>,
    pub token_id: Option<String>,
    pub market_type: MarketType,
}

// ─────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────

/// Durable paper-account ledger. One instance owns the backing file.
pub struct Ledger {
    path: PathBuf,
    state: RwLock<LedgerState>,
    price_cache: RwLock<HashMap<String, PricePoint>>,
}

impl Ledger {
    /// Load the ledger from `path`, or start fresh with `starting_balance`
    /// when the file is missing or unreadable. Never aborts: a corrupt file
    /// is logged and replaced on the next persist.
    pub fn open(path: impl Into<PathBuf>, starting_balance: f64) -> Self {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<LedgerState>(&raw) {
                Ok(state) => {
                    info!(
                        path = %path.display(),
                        balance = state.balance,
                        positions = state.positions.len(),
                        "💾 Ledger loaded"
                    );
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ledger file unreadable, starting fresh");
                    LedgerState::fresh(starting_balance)
                }
            },
            Err(_) => {
                info!(path = %path.display(), "No ledger file found, starting fresh");
                LedgerState::fresh(starting_balance)
            }
        };

        Self {
            path,
            state: RwLock::new(state),
            price_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Atomic whole-file rewrite: serialize, write a sibling temp file, then
    /// rename over the target.
    pub fn save(&self) -> Result<()> {
        let json = {
            let state = self.state.read().unwrap();
            serde_json::to_string_pretty(&*state).context("serialize ledger")?
        };
        atomic_write(&self.path, &json)
    }

    fn persist(&self, state: &LedgerState) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("serialize ledger")?;
        atomic_write(&self.path, &json)
    }

    // ── Read accessors ──────────────────────────────────────────

    pub fn balance(&self) -> f64 {
        self.state.read().unwrap().balance
    }

    pub fn positions(&self) -> Vec<(String, Position)> {
        self.state
            .read()
            .unwrap()
            .positions
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect()
    }

    pub fn closed_positions(&self) -> Vec<ClosedPosition> {
        self.state.read().unwrap().closed_positions.clone()
    }

    pub fn trade_events(&self) -> Vec<TradeEvent> {
        self.state.read().unwrap().trade_events.clone()
    }

    pub fn market_cache(&self, market_id: &str) -> Option<CachedMarket> {
        self.state.read().unwrap().market_cache.get(market_id).cloned()
    }

    pub fn is_processed(&self, tx_hash: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .processed_tx_hashes
            .contains(tx_hash)
    }

    /// Whether the paper account holds any open position in this market.
    pub fn has_position_in_market(&self, market_id: &str) -> bool {
        self.state
            .read()
            .unwrap()
            .positions
            .values()
            .any(|p| p.market_id == market_id)
    }

    /// Resolve a position by canonical key with label and legacy fallbacks.
    pub fn find_position(
        &self,
        market_id: &str,
        token_id: Option<&str>,
        side: Side,
        outcome_label: &str,
    ) -> Option<(String, Position)> {
        let state = self.state.read().unwrap();
        resolve_key(&state.positions, market_id, token_id, side, outcome_label)
            .map(|k| (k.clone(), state.positions[&k].clone()))
    }

    // ── Market cache ────────────────────────────────────────────

    /// Upsert cached market metadata. A seconds-scale `end_time` (< 10^10)
    /// is normalized to milliseconds.
    pub fn update_market_cache(
        &self,
        market_id: &str,
        question: &str,
        slug: &str,
        outcomes: Vec<String>,
        clob_token_ids: Vec<String>,
        end_time: Option<i64>,
    ) -> Result<()> {
        let mut state = self.state.write().unwrap();
        let end_time_ms = end_time.map(|t| if t < 10_000_000_000 { t * 1000 } else { t });
        state.market_cache.insert(
            market_id.to_string(),
            CachedMarket {
                question: question.to_string(),
                slug: slug.to_string(),
                outcomes,
                clob_token_ids,
                end_time_ms,
            },
        );
        self.persist(&state)
    }

    // ── Live prices ─────────────────────────────────────────────

    pub fn price_point(&self, key: &str) -> Option<PricePoint> {
        self.price_cache.read().unwrap().get(key).copied()
    }

    /// Whether a fresh cache entry exists for `token_id` (or the market id
    /// for legacy positions).
    pub fn price_is_fresh(&self, key: &str, now_ms: i64) -> bool {
        self.price_point(key)
            .map(|p| now_ms - p.updated_at < PRICE_CACHE_MAX_AGE_MS)
            .unwrap_or(false)
    }

    /// Write a live tick into the price cache and re-mark matching open
    /// positions. Positions carrying the exact token take the tick as-is;
    /// legacy binary positions without a token derive theirs from the side
    /// (`tick` on YES, `1000 - tick` on NO). Persists only when a position
    /// actually moved.
    pub fn update_real_time_price(
        &self,
        market_id: &str,
        tick: u16,
        token_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let cache_key = token_id.unwrap_or(market_id).to_string();
        self.price_cache.write().unwrap().insert(
            cache_key,
            PricePoint {
                tick,
                updated_at: now,
            },
        );

        let mut state = self.state.write().unwrap();
        let mut dirty = false;
        for pos in state.positions.values_mut() {
            if pos.market_id != market_id {
                continue;
            }
            let derived = match (&pos.token_id, token_id) {
                (Some(own), Some(incoming)) if own == incoming => Some(tick),
                (None, _) => Some(match pos.side {
                    Side::Yes => tick,
                    Side::No => clamp_tick(1000 - i64::from(tick)),
                }),
                _ => None,
            };
            if let Some(t) = derived {
                if pos.current_tick != t {
                    pos.revalue(t);
                    dirty = true;
                }
            }
        }
        if dirty {
            self.persist(&state)?;
        }
        Ok(())
    }

    // ── Position state ──────────────────────────────────────────

    pub fn update_position_state(&self, key: &str, new_state: PositionState) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let Some(pos) = state.positions.get_mut(key) else {
            return Ok(false);
        };
        pos.state = new_state;
        self.persist(&state)?;
        Ok(true)
    }

    /// Stamp a position `CLOSING` with its arbitration metadata. The close
    /// arbiter owns the priority discipline; this just records the winner.
    pub fn mark_closing(
        &self,
        key: &str,
        trigger: CloseTrigger,
        cause: CloseCause,
    ) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let Some(pos) = state.positions.get_mut(key) else {
            return Ok(false);
        };
        pos.state = PositionState::Closing;
        pos.close_trigger = Some(trigger);
        pos.close_cause = Some(cause);
        pos.close_priority = Some(trigger.priority());
        self.persist(&state)?;
        Ok(true)
    }

    /// Undo a failed close commit so a later (possibly stronger) trigger can
    /// retry from a clean slate.
    pub fn revert_close(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(pos) = state.positions.get_mut(key) {
            pos.state = PositionState::Open;
            pos.close_trigger = None;
            pos.close_cause = None;
            pos.close_priority = None;
            self.persist(&state)?;
        }
        Ok(())
    }

    // ── Trade application ───────────────────────────────────────

    /// Apply one fill. Returns `Ok(false)` when the ledger refuses the
    /// mutation (duplicate hash, orphan sell, insolvency, state mismatch),
    /// `Ok(true)` on commit. File-level failures surface as `Err` so the
    /// caller's retry wrapper can re-drive an idempotent re-application.
    pub fn apply_trade(&self, trade: &TradeApply) -> Result<bool> {
        let mut state = self.state.write().unwrap();

        if state.processed_tx_hashes.contains(&trade.tx_hash) {
            debug!(tx = %trade.tx_hash, "Duplicate transaction hash, skipping");
            return Ok(false);
        }

        let canonical = position_key(
            &trade.market_id,
            trade.token_id.as_deref(),
            trade.side,
            &trade.outcome_label,
        );
        let existing_key = resolve_key(
            &state.positions,
            &trade.market_id,
            trade.token_id.as_deref(),
            trade.side,
            &trade.outcome_label,
        );

        let now = Utc::now().timestamp_millis();

        if trade.signed_shares == 0.0 || !trade.signed_shares.is_finite() {
            return Ok(false);
        }

        if trade.signed_shares < 0.0 && existing_key.is_none() {
            if !is_resolution_reason(&trade.reason) {
                warn!(
                    market_id = %trade.market_id,
                    side = %trade.side,
                    "Orphan sell with no open position, dropping"
                );
                state.processed_tx_hashes.insert(trade.tx_hash.clone());
                self.persist(&state)?;
                return Ok(false);
            }
            // A resolution against a position we no longer hold is a no-op.
            state.processed_tx_hashes.insert(trade.tx_hash.clone());
            self.persist(&state)?;
            return Ok(false);
        }

        if trade.signed_shares > 0.0 {
            let cost = trade.signed_shares * from_tick(trade.tick);
            if state.balance < cost {
                warn!(
                    market_id = %trade.market_id,
                    cost,
                    balance = state.balance,
                    "Insufficient balance for copy buy, dropping"
                );
                state.processed_tx_hashes.insert(trade.tx_hash.clone());
                self.persist(&state)?;
                return Ok(false);
            }

            state.balance -= cost;
            // Migrate legacy entries onto the canonical key on first write.
            let mut pos = match existing_key {
                Some(k) => state.positions.remove(&k).unwrap(),
                None => Position {
                    market_id: trade.market_id.clone(),
                    token_id: trade.token_id.clone(),
                    question: trade.question.clone(),
                    slug: trade.slug.clone(),
                    side: trade.side,
                    outcome_label: trade.outcome_label.clone(),
                    market_type: trade.market_type,
                    size: 0.0,
                    entry_tick: trade.tick,
                    invested_usd: 0.0,
                    realized_pnl: 0.0,
                    current_tick: trade.tick,
                    current_value: 0.0,
                    unrealized_pnl: 0.0,
                    state: PositionState::Open,
                    close_trigger: None,
                    close_cause: None,
                    close_priority: None,
                    last_entry_time: now,
                },
            };

            if pos.token_id.is_none() {
                pos.token_id = trade.token_id.clone();
            }
            let total_cost = pos.invested_usd + cost;
            let total_shares = pos.size + trade.signed_shares;
            pos.entry_tick = to_tick(total_cost / total_shares).unwrap_or(trade.tick);
            pos.size = total_shares;
            pos.invested_usd = total_cost;
            pos.state = PositionState::Open;
            pos.last_entry_time = now;
            pos.revalue(trade.tick);
            state.positions.insert(canonical, pos);

            state.trade_events.push(TradeEvent {
                tx_hash: trade.tx_hash.clone(),
                timestamp: now,
                market_id: trade.market_id.clone(),
                token_id: trade.token_id.clone(),
                question: trade.question.clone(),
                direction: TradeDirection::Buy,
                side: trade.side,
                outcome_label: trade.outcome_label.clone(),
                size: trade.signed_shares,
                tick: trade.tick,
                source_tick: trade.source_tick,
                latency_ms: trade.latency_ms,
                intent: trade.reason.clone(),
            });
        } else {
            let key = existing_key.expect("sell path requires a resolved position");
            let pos = state.positions.get(&key).unwrap();
            if !matches!(pos.state, PositionState::Open | PositionState::Closing) {
                debug!(
                    key = %key,
                    state = pos.state.as_str(),
                    "Sell refused: position not open or closing"
                );
                return Ok(false);
            }

            let mut pos = state.positions.remove(&key).unwrap();
            let sell_shares = trade.signed_shares.abs().min(pos.size);
            let cost_basis = from_tick(pos.entry_tick) * sell_shares;
            let proceeds = from_tick(trade.tick) * sell_shares;
            let pnl = proceeds - cost_basis;

            state.balance += proceeds;
            pos.size -= sell_shares;
            pos.invested_usd = (pos.invested_usd - cost_basis).max(0.0);
            pos.realized_pnl += pnl;

            if !is_resolution_reason(&trade.reason) {
                state.trade_events.push(TradeEvent {
                    tx_hash: trade.tx_hash.clone(),
                    timestamp: now,
                    market_id: trade.market_id.clone(),
                    token_id: pos.token_id.clone(),
                    question: pos.question.clone(),
                    direction: TradeDirection::Sell,
                    side: pos.side,
                    outcome_label: pos.outcome_label.clone(),
                    size: sell_shares,
                    tick: trade.tick,
                    source_tick: trade.source_tick,
                    latency_ms: trade.latency_ms,
                    intent: trade.reason.clone(),
                });
            }

            if pos.size < MIN_POSITION_SIZE {
                let (close_trigger, close_cause) = match (pos.close_trigger, pos.close_cause) {
                    (Some(t), Some(c)) => (Some(t), Some(c)),
                    _ => match parse_close_reason(&trade.reason) {
                        Some((t, c)) => (Some(t), Some(c)),
                        None => (None, None),
                    },
                };
                state.closed_positions.push(ClosedPosition {
                    market_id: pos.market_id.clone(),
                    token_id: pos.token_id.clone(),
                    question: pos.question.clone(),
                    slug: pos.slug.clone(),
                    side: pos.side,
                    outcome_label: pos.outcome_label.clone(),
                    market_type: pos.market_type,
                    size: sell_shares,
                    entry_tick: pos.entry_tick,
                    exit_tick: trade.tick,
                    invested_usd: cost_basis,
                    return_usd: proceeds,
                    realized_pnl: pos.realized_pnl,
                    close_trigger,
                    close_cause,
                    closed_at: now,
                });
                info!(
                    market_id = %pos.market_id,
                    side = %pos.side,
                    pnl = %format!("{pnl:+.2}"),
                    "Position closed"
                );
            } else {
                // Partial sell: keep the remainder open under the canonical key.
                pos.state = PositionState::Open;
                pos.close_trigger = None;
                pos.close_cause = None;
                pos.close_priority = None;
                state.positions.insert(canonical, pos);
            }
        }

        state.processed_tx_hashes.insert(trade.tx_hash.clone());
        self.persist(&state)?;
        Ok(true)
    }
}

/// Resolve the map key an existing position lives under, preferring the
/// canonical `(marketId, tokenId)` form, then the label form, then the
/// legacy `(marketId, side)` form.
fn resolve_key(
    positions: &HashMap<String, Position>,
    market_id: &str,
    token_id: Option<&str>,
    side: Side,
    outcome_label: &str,
) -> Option<String> {
    let canonical = position_key(market_id, token_id, side, outcome_label);
    if positions.contains_key(&canonical) {
        return Some(canonical);
    }
    let labeled = position_key(market_id, None, side, outcome_label);
    if positions.contains_key(&labeled) {
        return Some(labeled);
    }
    let legacy = legacy_key(market_id, side);
    if positions.contains_key(&legacy) {
        return Some(legacy);
    }
    None
}

fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create ledger directory")?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger(dir: &TempDir) -> Ledger {
        Ledger::open(dir.path().join("ledger.json"), 1000.0)
    }

    fn buy(market: &str, token: &str, shares: f64, tick: u16, tx: &str) -> TradeApply {
        TradeApply {
            market_id: market.to_string(),
            question: "Will it?".to_string(),
            slug: "will-it".to_string(),
            side: Side::Yes,
            outcome_label: "Yes".to_string(),
            signed_shares: shares,
            tick,
            tx_hash: tx.to_string(),
            reason: "COPY_TRADE".to_string(),
            source_tick: Some(tick),
            latency_ms: Some(12),
            token_id: Some(token.to_string()),
            market_type: MarketType::Single,
        }
    }

    fn sell(market: &str, token: &str, shares: f64, tick: u16, tx: &str, reason: &str) -> TradeApply {
        let mut t = buy(market, token, -shares, tick, tx);
        t.reason = reason.to_string();
        t
    }

    #[test]
    fn buy_debits_balance_and_opens_position() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        assert!(l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap());
        assert!((l.balance() - 995.6).abs() < 1e-9);
        let (_, pos) = l.find_position("m1", Some("t1"), Side::Yes, "Yes").unwrap();
        assert_eq!(pos.entry_tick, 440);
        assert_eq!(pos.size, 10.0);
        assert_eq!(l.trade_events().len(), 1);
    }

    #[test]
    fn scale_in_weights_entry_tick() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap();
        l.apply_trade(&buy("m1", "t1", 20.0, 500, "h2")).unwrap();
        let (_, pos) = l.find_position("m1", Some("t1"), Side::Yes, "Yes").unwrap();
        assert_eq!(pos.size, 30.0);
        // (10 * 0.44 + 20 * 0.50) / 30 = 0.48
        assert_eq!(pos.entry_tick, 480);
    }

    #[test]
    fn duplicate_tx_hash_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        assert!(l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap());
        let balance = l.balance();
        assert!(!l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap());
        assert_eq!(l.balance(), balance);
        assert_eq!(l.trade_events().len(), 1);
    }

    #[test]
    fn orphan_sell_is_dropped_and_marked() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        assert!(!l
            .apply_trade(&sell("m1", "t1", 5.0, 500, "h9", "COPY_TRADER_EVENT|TARGET_SELLOFF"))
            .unwrap());
        assert!(l.is_processed("h9"));
        assert_eq!(l.balance(), 1000.0);
    }

    #[test]
    fn insolvent_buy_is_dropped_and_marked() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        assert!(!l.apply_trade(&buy("m1", "t1", 5000.0, 500, "big")).unwrap());
        assert!(l.is_processed("big"));
        assert_eq!(l.balance(), 1000.0);
        assert!(l.positions().is_empty());
    }

    #[test]
    fn full_sell_realizes_pnl_and_closes() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap();
        l.apply_trade(&buy("m1", "t1", 20.0, 500, "h2")).unwrap();
        assert!(l
            .apply_trade(&sell("m1", "t1", 30.0, 550, "h3", "COPY_TRADER_EVENT|TARGET_SELLOFF"))
            .unwrap());

        assert!(l.positions().is_empty());
        let closed = l.closed_positions();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_tick, 550);
        assert_eq!(closed[0].entry_tick, 480);
        assert_eq!(closed[0].close_trigger, Some(CloseTrigger::CopyTraderEvent));
        assert_eq!(closed[0].close_cause, Some(CloseCause::TargetSelloff));
        // 16.50 - 14.40 = 2.10
        assert!((closed[0].realized_pnl - 2.10).abs() < 1e-9);
        // 1000 - 4.4 - 10.0 + 16.5
        assert!((l.balance() - 1002.1).abs() < 1e-9);
        // BUY + BUY + SELL events
        assert_eq!(l.trade_events().len(), 3);
    }

    #[test]
    fn resolution_sell_emits_no_trade_event() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap();
        l.apply_trade(&sell("m1", "t1", 10.0, 999, "h2", "MARKET_RESOLUTION|WINNER_YES"))
            .unwrap();
        assert_eq!(l.trade_events().len(), 1);
        assert_eq!(l.closed_positions().len(), 1);
    }

    #[test]
    fn balance_is_conserved_across_any_sequence() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        let start = l.balance();
        l.apply_trade(&buy("m1", "t1", 10.0, 400, "a")).unwrap();
        l.apply_trade(&buy("m2", "t2", 5.0, 200, "b")).unwrap();
        l.apply_trade(&sell("m1", "t1", 10.0, 450, "c", "COPY_TRADER_EVENT|TARGET_SELLOFF"))
            .unwrap();

        let notional_buys = 10.0 * 0.4 + 5.0 * 0.2;
        let notional_sells = 10.0 * 0.45;
        assert!((l.balance() - (start - notional_buys + notional_sells)).abs() < 1e-9);
        for (_, pos) in l.positions() {
            assert!(pos.size >= 0.0);
        }
    }

    #[test]
    fn legacy_key_migrates_on_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        // Seed a v1-style ledger keyed by (marketId, side) with no token.
        let seeded = serde_json::json!({
            "balance": 500.0,
            "positions": {
                "m1:YES": {
                    "market_id": "m1",
                    "question": "Will it?",
                    "side": "YES",
                    "size": 10.0,
                    "entry_tick": 300,
                    "invested_usd": 3.0,
                    "current_tick": 300,
                    "state": "SOMETHING_NEW"
                }
            }
        });
        fs::write(&path, serde_json::to_string(&seeded).unwrap()).unwrap();

        let l = Ledger::open(&path, 1000.0);
        // Unknown state coerced to OPEN on load.
        let (key, pos) = l.find_position("m1", Some("t1"), Side::Yes, "Yes").unwrap();
        assert_eq!(key, "m1:YES");
        assert_eq!(pos.state, PositionState::Open);

        l.apply_trade(&buy("m1", "t1", 10.0, 500, "h1")).unwrap();
        let (key, pos) = l.find_position("m1", Some("t1"), Side::Yes, "Yes").unwrap();
        assert_eq!(key, "m1:t1");
        assert_eq!(pos.size, 20.0);
        // (3.0 + 5.0) / 20 = 0.4
        assert_eq!(pos.entry_tick, 400);
    }

    #[test]
    fn real_time_price_updates_by_token_and_by_side() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        l.apply_trade(&buy("m1", "t1", 10.0, 400, "h1")).unwrap();

        l.update_real_time_price("m1", 620, Some("t1")).unwrap();
        let (_, pos) = l.find_position("m1", Some("t1"), Side::Yes, "Yes").unwrap();
        assert_eq!(pos.current_tick, 620);
        assert!((pos.current_value - 6.2).abs() < 1e-9);
        assert!((pos.unrealized_pnl - 2.2).abs() < 1e-9);

        // Legacy NO position derives 1000 - tick.
        let mut legacy = buy("m2", "t9", 10.0, 400, "h2");
        legacy.token_id = None;
        legacy.side = Side::No;
        legacy.outcome_label = "No".to_string();
        l.apply_trade(&legacy).unwrap();
        l.update_real_time_price("m2", 300, None).unwrap();
        let (_, pos) = l.find_position("m2", None, Side::No, "No").unwrap();
        assert_eq!(pos.current_tick, 700);
    }

    #[test]
    fn market_cache_normalizes_second_scale_end_time() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        l.update_market_cache(
            "m1",
            "Will it?",
            "will-it",
            vec!["Yes".into(), "No".into()],
            vec!["t1".into(), "t0".into()],
            Some(1_700_000_000),
        )
        .unwrap();
        assert_eq!(
            l.market_cache("m1").unwrap().end_time_ms,
            Some(1_700_000_000_000)
        );
        assert_eq!(l.market_cache("m1").unwrap().other_token("t1"), Some("t0"));
    }

    #[test]
    fn ledger_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        {
            let l = Ledger::open(&path, 1000.0);
            l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap();
        }
        let l = Ledger::open(&path, 1000.0);
        assert!((l.balance() - 995.6).abs() < 1e-9);
        assert_eq!(l.positions().len(), 1);
        assert!(l.is_processed("h1"));
    }

    #[test]
    fn sell_refused_while_pending_resolution() {
        let dir = TempDir::new().unwrap();
        let l = ledger(&dir);
        l.apply_trade(&buy("m1", "t1", 10.0, 440, "h1")).unwrap();
        let (key, _) = l.find_position("m1", Some("t1"), Side::Yes, "Yes").unwrap();
        l.update_position_state(&key, PositionState::PendingResolution)
            .unwrap();
        assert!(!l
            .apply_trade(&sell("m1", "t1", 10.0, 500, "h2", "COPY_TRADER_EVENT|TARGET_SELLOFF"))
            .unwrap());
        // Refusal is retryable: the hash is NOT consumed.
        assert!(!l.is_processed("h2"));
    }
}
