//! Replication & Lifecycle Engine
//!
//! The control loop that turns observed source-account activity into paper
//! trades and shepherds every position through its lifecycle. One engine
//! task owns all ledger mutation; the dashboard talks to it over a command
//! channel, and a dedicated consumer task funnels streaming book updates
//! through the same ledger write path.
//!
//! Close intents race here: market resolution, user action, copy-sells,
//! guard conditions. The close arbiter serializes them with a numeric
//! priority discipline (1 strongest) and a single-winner `OPEN -> CLOSING`
//! transition that reverts on commit failure so a stronger trigger can
//! retry.

pub mod settings;

pub use settings::{SizingMode, TradeSettings, TradeSettingsPatch};

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, LogCategory, TradeCsvRecord};
use crate::config::Config;
use crate::filter::PositionFilter;
use crate::ledger::{
    CloseCause, CloseTrigger, Ledger, MarketType, PositionState, Side, TradeApply,
};
use crate::lifecycle::{self, LifecycleState, Winner};
use crate::retry::{self, RetryPolicy};
use crate::slippage;
use crate::ticks::{clamp_tick, from_tick, to_tick, MAX_TICK};
use crate::venue::{
    is_no_synonym, is_yes_synonym, ActivityItem, Market, OrderBook, Outcome, StreamKind,
    StreamUpdate, VenueClient,
};

/// Lifecycle sweep cadence, in main-loop ticks.
const LIFECYCLE_SWEEP_EVERY: u64 = 10;
/// Liquidity check cadence, in main-loop ticks.
const LIQUIDITY_CHECK_EVERY: u64 = 5;
/// Streaming subscription refresh cadence.
const SUBSCRIPTION_REFRESH_MS: i64 = 60_000;
/// Closes other than user action and resolution respect this minimum hold.
const MIN_HOLD_MS: i64 = 5_000;
/// How long the max-tick guard waits before re-checking a pinned book.
const MAX_TICK_RECHECK: Duration = Duration::from_secs(30);
/// Sells losing more than this fraction of entry are skipped by the guard.
const SELL_LOSS_CAP: f64 = 0.10;
/// Consecutive empty-bid liquidity checks before warning.
const EMPTY_BID_WARN_STREAK: u8 = 3;
/// Fixed-mode sizing never divides by less than this tick.
const FIXED_SIZING_TICK_FLOOR: u16 = 10;
/// Fallback cursor rewind when not starting from now.
const CURSOR_REWIND_MS: i64 = 10 * 60 * 1000;

// ─────────────────────────────────────────────────────────────────
// Control surface
// ─────────────────────────────────────────────────────────────────

/// Commands queued from the dashboard; the engine drains them every tick so
/// the control plane never blocks on engine suspension points.
#[derive(Debug)]
pub enum EngineCommand {
    CloseAll,
    Close {
        market_id: String,
        side: Side,
        token_id: Option<String>,
        outcome_label: Option<String>,
    },
}

/// Cheap shared handle for the control plane.
#[derive(Clone)]
pub struct EngineHandle {
    pub cmd_tx: mpsc::Sender<EngineCommand>,
    pub running: Arc<AtomicBool>,
    pub shutdown: Arc<AtomicBool>,
}

impl EngineHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip copy-trading on/off; returns the new state.
    pub fn toggle(&self) -> bool {
        let was = self.running.fetch_xor(true, Ordering::SeqCst);
        !was
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

/// Where a subscribed stream token feeds its ticks. Multi-outcome NO legs
/// are tracked through the sibling YES token with inverted pricing.
#[derive(Debug, Clone)]
struct StreamTarget {
    market_id: String,
    /// The position's own token to write against; `None` for legacy
    /// side-keyed positions.
    position_token: Option<String>,
    invert: bool,
}

// ─────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────

pub struct Engine {
    config: Config,
    venue: Arc<VenueClient>,
    ledger: Arc<Ledger>,
    filter: Arc<PositionFilter>,
    audit: Arc<AuditLog>,
    settings: Arc<RwLock<TradeSettings>>,
    settings_path: PathBuf,
    retry_policy: RetryPolicy,
    running: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    cmd_rx: mpsc::Receiver<EngineCommand>,
    update_tx: mpsc::Sender<StreamUpdate>,
    stream_map: Arc<RwLock<HashMap<String, StreamTarget>>>,
    startup_cursor_ms: i64,
    last_subscription_refresh: i64,
    empty_bid_streaks: HashMap<String, u8>,
}

impl Engine {
    /// Build the engine and its control handle. The returned consumer task
    /// input (`update_rx`) is wired internally; callers only keep the
    /// handle.
    pub fn new(
        config: Config,
        venue: Arc<VenueClient>,
        ledger: Arc<Ledger>,
        filter: Arc<PositionFilter>,
        audit: Arc<AuditLog>,
        settings: Arc<RwLock<TradeSettings>>,
    ) -> (Self, EngineHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (update_tx, update_rx) = mpsc::channel(1024);
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(AtomicBool::new(false));

        let stream_map: Arc<RwLock<HashMap<String, StreamTarget>>> =
            Arc::new(RwLock::new(HashMap::new()));
        spawn_stream_consumer(update_rx, Arc::clone(&ledger), Arc::clone(&stream_map));

        let now = Utc::now().timestamp_millis();
        let startup_cursor_ms = if config.start_from_now {
            now
        } else {
            now - CURSOR_REWIND_MS
        };

        let settings_path = config.settings_path();
        let handle = EngineHandle {
            cmd_tx,
            running: Arc::clone(&running),
            shutdown: Arc::clone(&shutdown),
        };
        let engine = Self {
            config,
            venue,
            ledger,
            filter,
            audit,
            settings,
            settings_path,
            retry_policy: RetryPolicy::default(),
            running,
            shutdown,
            cmd_rx,
            update_tx,
            stream_map,
            startup_cursor_ms,
            last_subscription_refresh: 0,
            empty_bid_streaks: HashMap::new(),
        };
        (engine, handle)
    }

    /// Main loop. Returns when shutdown is requested.
    pub async fn run(mut self) {
        self.audit.log(
            LogCategory::Boot,
            &format!("engine starting, source={}", self.config.profile_address),
        );
        info!(source = %self.config.profile_address, "🚀 Copy engine starting");

        if self.config.skip_active_positions {
            self.scan_source_holdings().await;
        }
        self.refresh_subscriptions().await;

        let poll = Duration::from_millis(self.config.poll_interval_ms);
        let mut tick_no: u64 = 0;

        while !self.shutdown.load(Ordering::SeqCst) {
            self.drain_commands().await;

            if self.running.load(Ordering::SeqCst) {
                if let Err(e) = self.poll_once(tick_no).await {
                    error!(error = %e, "Engine tick failed");
                    self.audit
                        .log(LogCategory::Crash, &format!("tick error: {e:#}"));
                }
            }

            tick_no += 1;
            tokio::time::sleep(poll).await;
        }

        self.audit.log(LogCategory::Shutdown, "engine stopping");
        if let Err(e) = self.ledger.save() {
            error!(error = %e, "Final ledger save failed");
        }
        self.venue.unsubscribe().await;
        self.audit.flush();
        info!("Copy engine stopped");
    }

    // ── Startup ─────────────────────────────────────────────────

    /// Blacklist the markets the source account already holds, except those
    /// where the paper ledger also holds a position (scale-in stays
    /// allowed).
    async fn scan_source_holdings(&self) {
        let venue = Arc::clone(&self.venue);
        let address = self.config.profile_address.clone();
        let outcome = retry::run(&self.retry_policy, "source holdings", || {
            let venue = Arc::clone(&venue);
            let address = address.clone();
            async move { venue.get_user_holdings(&address).await }
        })
        .await;

        let Some(holdings) = outcome.into_data() else {
            warn!("Holdings scan failed, blacklist left as persisted");
            return;
        };

        let markets: Vec<String> = holdings
            .into_iter()
            .filter(|h| h.size > 0.0)
            .filter_map(|h| h.condition_id)
            .filter(|id| !self.ledger.has_position_in_market(id))
            .collect();

        self.audit.log(
            LogCategory::Boot,
            &format!("blacklisting {} source-held markets", markets.len()),
        );
        if let Err(e) = self.filter.initialize(markets) {
            warn!(error = %e, "Failed to persist blacklist");
        }
    }

    // ── Control ─────────────────────────────────────────────────

    async fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                EngineCommand::CloseAll => {
                    self.audit.log(LogCategory::Api, "close-all requested");
                    let positions = self.ledger.positions();
                    for (_, pos) in positions {
                        let _ = self
                            .close(
                                &pos.market_id,
                                pos.side,
                                CloseTrigger::UserAction,
                                CloseCause::CloseAll,
                                None,
                                pos.token_id.as_deref(),
                                Some(&pos.outcome_label),
                                None,
                            )
                            .await;
                    }
                }
                EngineCommand::Close {
                    market_id,
                    side,
                    token_id,
                    outcome_label,
                } => {
                    self.audit.log(
                        LogCategory::Api,
                        &format!("manual close requested for {market_id} {side}"),
                    );
                    let _ = self
                        .close(
                            &market_id,
                            side,
                            CloseTrigger::UserAction,
                            CloseCause::UserRequest,
                            None,
                            token_id.as_deref(),
                            outcome_label.as_deref(),
                            None,
                        )
                        .await;
                }
            }
        }
    }

    // ── Main tick ───────────────────────────────────────────────

    async fn poll_once(&mut self, tick_no: u64) -> Result<()> {
        let venue = Arc::clone(&self.venue);
        let address = self.config.profile_address.clone();
        let fetched_at = Utc::now().timestamp_millis();
        let outcome = retry::run(&self.retry_policy, "source activity", || {
            let venue = Arc::clone(&venue);
            let address = address.clone();
            async move { venue.get_user_activity(&address).await }
        })
        .await;

        if let Some(mut activity) = outcome.into_data() {
            // The venue returns newest first; replicate oldest first.
            activity.reverse();
            for item in activity.iter().filter(|i| i.is_trade()) {
                if let Err(e) = self.replicate(item, fetched_at).await {
                    debug!(error = %e, "Replication of one trade failed");
                }
            }
        }

        if tick_no % LIFECYCLE_SWEEP_EVERY == 0 {
            self.lifecycle_sweep().await;
        }
        if tick_no % LIQUIDITY_CHECK_EVERY == 0 {
            self.liquidity_check().await;
        }
        self.rest_price_fallback().await;

        let now = Utc::now().timestamp_millis();
        if now - self.last_subscription_refresh >= SUBSCRIPTION_REFRESH_MS {
            self.refresh_subscriptions().await;
        }
        Ok(())
    }

    // ── Replication ─────────────────────────────────────────────

    async fn replicate(&mut self, item: &ActivityItem, fetched_at: i64) -> Result<()> {
        let Some(tx_hash) = item.tx_hash().map(str::to_string) else {
            return Ok(());
        };
        if item.timestamp_ms() < self.startup_cursor_ms {
            return Ok(());
        }
        if self.ledger.is_processed(&tx_hash) {
            return Ok(());
        }
        let Some(market_id) = item.condition_id.clone() else {
            return Ok(());
        };
        if self.filter.is_blacklisted(&market_id)
            && !self.ledger.has_position_in_market(&market_id)
        {
            debug!(%market_id, "Blacklisted market, not copying");
            return Ok(());
        }

        // Fetch the container once: it yields both the normalized model and
        // the lifecycle classification.
        let venue = Arc::clone(&self.venue);
        let mid = market_id.clone();
        let outcome = retry::run(&self.retry_policy, "market details", || {
            let venue = Arc::clone(&venue);
            let mid = mid.clone();
            async move { venue.get_market_raw(&mid).await }
        })
        .await;
        let Some(Some(raw)) = outcome.into_data() else {
            debug!(%market_id, "No market metadata, skipping trade");
            return Ok(());
        };
        let Some(market) = Market::from_raw(&raw) else {
            debug!(%market_id, "Market failed normalization, skipping trade");
            return Ok(());
        };

        let now = Utc::now().timestamp_millis();
        let assessment = lifecycle::classify(&raw, &market_id, now);
        let market_type = assessment.market_type;

        self.ledger.update_market_cache(
            &market_id,
            &market.question,
            &market.slug,
            market.outcomes.iter().map(|o| o.label.clone()).collect(),
            market.outcomes.iter().map(|o| o.token_id.clone()).collect(),
            market.end_time_ms,
        )?;

        let Some((outcome_leg, side)) = select_outcome(&market, &item.outcome) else {
            debug!(%market_id, outcome = %item.outcome, "Unmappable outcome, skipping");
            return Ok(());
        };
        let token_id = outcome_leg.token_id.clone();
        let outcome_label = outcome_leg.label.clone();
        let is_buy = item.is_buy();

        let book = self.venue.get_order_book(&token_id).await.ok().flatten();
        let Some(mut exec_tick) = execution_tick(book.as_ref(), is_buy, item.price) else {
            debug!(%market_id, "No usable execution price, skipping");
            return Ok(());
        };
        let mut book = book;

        // Max-tick guard: a book pinned at the ceiling usually means the
        // market is decided but unresolved. Wait once, re-check, and skip
        // without consuming the hash so a healthy book later can retry.
        if exec_tick >= MAX_TICK {
            info!(%market_id, "Book pinned at max tick, waiting to re-check");
            tokio::time::sleep(MAX_TICK_RECHECK).await;
            book = self.venue.get_order_book(&token_id).await.ok().flatten();
            match execution_tick(book.as_ref(), is_buy, item.price) {
                Some(t) if t < MAX_TICK => exec_tick = t,
                _ => {
                    self.audit.log(
                        LogCategory::Engine,
                        &format!("max-tick guard skipped {market_id}"),
                    );
                    return Ok(());
                }
            }
        }

        let settings = self.settings.read().unwrap().clone();
        let mut shares = copy_size(
            &settings,
            item.size,
            exec_tick,
            self.config.min_order_size_shares,
        );

        let held = self
            .ledger
            .find_position(&market_id, Some(&token_id), side, &outcome_label);

        if !is_buy {
            let owned = held.as_ref().map(|(_, p)| p.size).unwrap_or(0.0);
            shares = shares.min(owned);
            if shares <= 0.0 {
                debug!(%market_id, "Source sold something we do not hold, skipping");
                return Ok(());
            }
        }

        if self.config.enable_trade_filters && !is_buy {
            if let Some((_, pos)) = &held {
                if sell_loss_exceeds_cap(pos.entry_tick, exec_tick) {
                    self.audit.log(
                        LogCategory::Engine,
                        &format!(
                            "loss guard skipped sell of {market_id} (entry {} exit {})",
                            pos.entry_tick, exec_tick
                        ),
                    );
                    return Ok(());
                }
            }
        }

        if self.config.enable_trade_filters && self.config.expected_edge > 0.0 {
            if let Some(book) = book.as_ref() {
                let notional = shares * from_tick(exec_tick);
                let est = slippage::estimate(
                    book,
                    notional,
                    is_buy,
                    self.config.expected_edge,
                    self.config.delay_penalty(),
                );
                if !est.should_execute {
                    self.audit.log(
                        LogCategory::Engine,
                        &format!("slippage gate skipped {market_id}: {}", est.reason),
                    );
                    return Ok(());
                }
            }
        }

        if is_buy {
            let latency_ms = (Utc::now().timestamp_millis() - fetched_at).max(0);
            let trade = TradeApply {
                market_id: market_id.clone(),
                question: market.question.clone(),
                slug: market.slug.clone(),
                side,
                outcome_label: outcome_label.clone(),
                signed_shares: shares,
                tick: exec_tick,
                tx_hash: tx_hash.clone(),
                reason: "COPY_TRADE".to_string(),
                source_tick: to_tick(item.price),
                latency_ms: Some(latency_ms),
                token_id: Some(token_id.clone()),
                market_type,
            };
            let ledger = Arc::clone(&self.ledger);
            let outcome = retry::run(&self.retry_policy, "ledger buy commit", || {
                let ledger = Arc::clone(&ledger);
                let trade = trade.clone();
                async move { ledger.apply_trade(&trade) }
            })
            .await;

            if outcome.data == Some(true) {
                info!(
                    market_id = %market_id,
                    side = %side,
                    shares = %format!("{shares:.2}"),
                    tick = exec_tick,
                    "📈 Copied buy"
                );
                self.audit.log(
                    LogCategory::Trade,
                    &format!("copied buy {market_id} {side} {shares:.2} @ {exec_tick}"),
                );
                self.audit.trade(&TradeCsvRecord {
                    timestamp: Utc::now().timestamp_millis(),
                    profile_address: self.config.profile_address.clone(),
                    market_question: market.question.clone(),
                    side: "BUY".to_string(),
                    size: shares,
                    price: from_tick(exec_tick),
                    intent: "COPY_TRADE".to_string(),
                });
                self.refresh_subscriptions().await;
            }
        } else {
            self.close(
                &market_id,
                side,
                CloseTrigger::CopyTraderEvent,
                CloseCause::TargetSelloff,
                Some(exec_tick),
                Some(&token_id),
                Some(&outcome_label),
                Some(tx_hash),
            )
            .await?;
        }
        Ok(())
    }

    // ── Close arbiter ───────────────────────────────────────────

    /// Centralized position close. All triggers funnel through here; the
    /// priority gate decides who wins when intents race. Returns whether a
    /// close was committed.
    #[allow(clippy::too_many_arguments)]
    pub async fn close(
        &self,
        market_id: &str,
        side: Side,
        trigger: CloseTrigger,
        cause: CloseCause,
        force_tick: Option<u16>,
        token_id: Option<&str>,
        outcome_label: Option<&str>,
        tx_hash: Option<String>,
    ) -> Result<bool> {
        let label = outcome_label.unwrap_or("");
        let Some((key, pos)) = self.ledger.find_position(market_id, token_id, side, label)
        else {
            debug!(market_id, side = %side, "Close requested for unknown position");
            return Ok(false);
        };

        // Terminal states never mutate; pending positions only resolve.
        let state_ok = match pos.state {
            PositionState::Open | PositionState::Closing => true,
            PositionState::PendingResolution => trigger == CloseTrigger::MarketResolution,
            _ => false,
        };
        if !state_ok {
            debug!(key = %key, state = pos.state.as_str(), trigger = %trigger, "Close ignored by state gate");
            return Ok(false);
        }

        let now = Utc::now().timestamp_millis();
        if trigger != CloseTrigger::UserAction
            && trigger != CloseTrigger::MarketResolution
            && now - pos.last_entry_time < MIN_HOLD_MS
        {
            debug!(key = %key, trigger = %trigger, "Close ignored by minimum hold");
            return Ok(false);
        }

        if let Some(existing) = pos.close_priority {
            if existing < trigger.priority() {
                debug!(
                    key = %key,
                    existing,
                    incoming = trigger.priority(),
                    "Close ignored by priority gate"
                );
                return Ok(false);
            }
        }

        let exit_tick = match force_tick {
            Some(t) => clamp_tick(i64::from(t)),
            None if trigger == CloseTrigger::MarketResolution => {
                resolution_exit_tick(cause, pos.side)
            }
            None => {
                let live = self.venue.get_live_price(market_id).await.ok().flatten();
                match live {
                    Some(price) => match pos.side {
                        Side::Yes => price.best_bid,
                        Side::No => clamp_tick(1000 - i64::from(price.best_ask)),
                    },
                    None => pos.current_tick,
                }
            }
        };

        self.ledger.mark_closing(&key, trigger, cause)?;

        let tx_hash = tx_hash.unwrap_or_else(|| match trigger {
            // Deterministic for resolutions: a re-sweep or crash-replay
            // settles the same position exactly once.
            CloseTrigger::MarketResolution => format!(
                "resolution-{market_id}-{}",
                pos.token_id.as_deref().unwrap_or(side.as_str())
            ),
            _ => format!(
                "close-{}-{market_id}-{}-{now}",
                trigger.as_str(),
                pos.token_id.as_deref().unwrap_or(side.as_str())
            ),
        });

        let trade = TradeApply {
            market_id: market_id.to_string(),
            question: pos.question.clone(),
            slug: pos.slug.clone(),
            side: pos.side,
            outcome_label: pos.outcome_label.clone(),
            signed_shares: -pos.size,
            tick: exit_tick,
            tx_hash,
            reason: format!("{trigger}|{cause}"),
            source_tick: None,
            latency_ms: None,
            token_id: pos.token_id.clone(),
            market_type: pos.market_type,
        };

        let ledger = Arc::clone(&self.ledger);
        let outcome = retry::run(&self.retry_policy, "ledger close commit", || {
            let ledger = Arc::clone(&ledger);
            let trade = trade.clone();
            async move { ledger.apply_trade(&trade) }
        })
        .await;

        if outcome.data != Some(true) {
            // Leave the position retriable by any trigger.
            self.ledger.revert_close(&key)?;
            warn!(key = %key, trigger = %trigger, "Close commit failed, reverted to OPEN");
            return Ok(false);
        }

        info!(
            market_id = %market_id,
            side = %pos.side,
            trigger = %trigger,
            cause = %cause,
            exit_tick,
            "🔒 Position closed"
        );
        self.audit.log(
            LogCategory::Close,
            &format!(
                "closed {market_id} {} via {trigger}|{cause} @ {exit_tick}",
                pos.side
            ),
        );
        if trigger != CloseTrigger::MarketResolution {
            self.audit.trade(&TradeCsvRecord {
                timestamp: Utc::now().timestamp_millis(),
                profile_address: self.config.profile_address.clone(),
                market_question: pos.question.clone(),
                side: "SELL".to_string(),
                size: pos.size,
                price: from_tick(exit_tick),
                intent: format!("{trigger}|{cause}"),
            });
        }
        Ok(true)
    }

    // ── Lifecycle sweep ─────────────────────────────────────────

    async fn lifecycle_sweep(&self) {
        let now = Utc::now().timestamp_millis();
        for (key, pos) in self.ledger.positions() {
            if !matches!(
                pos.state,
                PositionState::Open | PositionState::PendingResolution
            ) {
                continue;
            }

            let venue = Arc::clone(&self.venue);
            let market_id = pos.market_id.clone();
            let outcome = retry::run(&self.retry_policy, "lifecycle container", || {
                let venue = Arc::clone(&venue);
                let market_id = market_id.clone();
                async move { venue.get_market_raw(&market_id).await }
            })
            .await;
            let Some(Some(raw)) = outcome.into_data() else {
                continue;
            };

            let assessment = lifecycle::classify(&raw, &pos.market_id, now);
            match assessment.state {
                LifecycleState::Active => {
                    if pos.state == PositionState::PendingResolution {
                        info!(market_id = %pos.market_id, "Market re-opened for trading");
                        self.audit.log(
                            LogCategory::Lifecycle,
                            &format!("{} re-opened, position back to OPEN", pos.market_id),
                        );
                        let _ = self.ledger.update_position_state(&key, PositionState::Open);
                    }
                }
                LifecycleState::PendingResolution => {
                    if pos.state == PositionState::Open {
                        info!(market_id = %pos.market_id, "Market pending resolution");
                        self.audit.log(
                            LogCategory::Lifecycle,
                            &format!("{} pending resolution", pos.market_id),
                        );
                        let _ = self
                            .ledger
                            .update_position_state(&key, PositionState::PendingResolution);
                    }
                }
                LifecycleState::Closed => {
                    let Some(result) = assessment.result else {
                        debug!(market_id = %pos.market_id, "Resolved without pinned winner yet");
                        continue;
                    };

                    let won = if assessment.market_type == MarketType::Multi {
                        match result.winning_side {
                            Some(winning_side) => winning_side == pos.side,
                            None => continue,
                        }
                    } else if !result.winning_label.is_empty() && !pos.outcome_label.is_empty() {
                        result
                            .winning_label
                            .eq_ignore_ascii_case(&pos.outcome_label)
                    } else {
                        match result.winner {
                            Some(Winner::YesWon) => pos.side == Side::Yes,
                            Some(Winner::NoWon) => pos.side == Side::No,
                            None => continue,
                        }
                    };

                    let cause = settlement_cause(pos.side, won);
                    self.audit.log(
                        LogCategory::Lifecycle,
                        &format!(
                            "{} resolved, position {} {}",
                            pos.market_id,
                            pos.side,
                            if won { "won" } else { "lost" }
                        ),
                    );
                    let _ = self
                        .close(
                            &pos.market_id,
                            pos.side,
                            CloseTrigger::MarketResolution,
                            cause,
                            None,
                            pos.token_id.as_deref(),
                            Some(&pos.outcome_label),
                            None,
                        )
                        .await;
                }
            }
        }
    }

    // ── Liquidity check ─────────────────────────────────────────

    /// Watch for books with no bids under our open positions. Warn after a
    /// streak, but never force a zero-proceed exit; waiting for resolution
    /// dominates dumping into an empty book.
    async fn liquidity_check(&mut self) {
        let now = Utc::now().timestamp_millis();
        for (key, pos) in self.ledger.positions() {
            if pos.state != PositionState::Open {
                continue;
            }
            if let Some(cache) = self.ledger.market_cache(&pos.market_id) {
                if matches!(cache.end_time_ms, Some(end) if now >= end) {
                    continue;
                }
            }
            let Some(token) = pos.token_id.clone() else {
                continue;
            };
            let Ok(Some(book)) = self.venue.get_order_book(&token).await else {
                continue;
            };

            if book.bids.is_empty() {
                let streak = self.empty_bid_streaks.entry(key.clone()).or_insert(0);
                *streak = streak.saturating_add(1);
                if *streak == EMPTY_BID_WARN_STREAK {
                    warn!(
                        market_id = %pos.market_id,
                        side = %pos.side,
                        "No bids for {EMPTY_BID_WARN_STREAK} consecutive checks, holding for resolution"
                    );
                    self.audit.log(
                        LogCategory::Engine,
                        &format!("{} has an empty bid book, holding", pos.market_id),
                    );
                }
            } else {
                self.empty_bid_streaks.remove(&key);
            }
        }
    }

    // ── REST price fallback ─────────────────────────────────────

    /// Keep marks fresh for positions the stream is not covering. Fetches
    /// the YES-leg book and derives the position tick, inverting for
    /// multi-outcome NO legs tracked through the sibling token.
    async fn rest_price_fallback(&self) {
        let now = Utc::now().timestamp_millis();
        for (_, pos) in self.ledger.positions() {
            if !matches!(
                pos.state,
                PositionState::Open | PositionState::PendingResolution
            ) {
                continue;
            }
            let cache_key = pos
                .token_id
                .clone()
                .unwrap_or_else(|| pos.market_id.clone());
            if self.ledger.price_is_fresh(&cache_key, now) {
                continue;
            }

            match &pos.token_id {
                Some(own_token) => {
                    let inverted = pos.market_type == MarketType::Multi && pos.side == Side::No;
                    let fetch_token = if inverted {
                        let Some(other) = self
                            .ledger
                            .market_cache(&pos.market_id)
                            .and_then(|c| c.other_token(own_token).map(str::to_string))
                        else {
                            continue;
                        };
                        other
                    } else {
                        own_token.clone()
                    };

                    let Ok(Some(book)) = self.venue.get_order_book(&fetch_token).await else {
                        continue;
                    };
                    let Some(mid) = book.mid_tick() else {
                        continue;
                    };
                    let tick = if inverted {
                        clamp_tick(1000 - i64::from(mid))
                    } else {
                        mid
                    };
                    let _ = self
                        .ledger
                        .update_real_time_price(&pos.market_id, tick, Some(own_token));
                }
                None => {
                    // Legacy side-keyed position: mark from the YES leg and
                    // let the ledger derive the side-adjusted tick.
                    let Some(cache) = self.ledger.market_cache(&pos.market_id) else {
                        continue;
                    };
                    let yes_token = cache
                        .outcomes
                        .iter()
                        .position(|l| is_yes_synonym(l))
                        .and_then(|i| cache.clob_token_ids.get(i))
                        .or_else(|| cache.clob_token_ids.first());
                    let Some(token) = yes_token else {
                        continue;
                    };
                    let Ok(Some(book)) = self.venue.get_order_book(token).await else {
                        continue;
                    };
                    let Some(mid) = book.mid_tick() else {
                        continue;
                    };
                    let _ = self.ledger.update_real_time_price(&pos.market_id, mid, None);
                }
            }
        }
    }

    // ── Streaming subscription ──────────────────────────────────

    /// Rebuild the streamed token set from current open positions and
    /// re-open the subscription. Multi-outcome NO legs subscribe the
    /// sibling YES token and invert on write-back.
    async fn refresh_subscriptions(&mut self) {
        let mut targets: HashMap<String, StreamTarget> = HashMap::new();
        for (_, pos) in self.ledger.positions() {
            match &pos.token_id {
                Some(own_token) => {
                    let inverted = pos.market_type == MarketType::Multi && pos.side == Side::No;
                    let sub_token = if inverted {
                        match self
                            .ledger
                            .market_cache(&pos.market_id)
                            .and_then(|c| c.other_token(own_token).map(str::to_string))
                        {
                            Some(t) => t,
                            None => continue,
                        }
                    } else {
                        own_token.clone()
                    };
                    targets.insert(
                        sub_token,
                        StreamTarget {
                            market_id: pos.market_id.clone(),
                            position_token: Some(own_token.clone()),
                            invert: inverted,
                        },
                    );
                }
                None => {
                    let Some(cache) = self.ledger.market_cache(&pos.market_id) else {
                        continue;
                    };
                    let yes_token = cache
                        .outcomes
                        .iter()
                        .position(|l| is_yes_synonym(l))
                        .and_then(|i| cache.clob_token_ids.get(i).cloned())
                        .or_else(|| cache.clob_token_ids.first().cloned());
                    if let Some(token) = yes_token {
                        targets.insert(
                            token,
                            StreamTarget {
                                market_id: pos.market_id.clone(),
                                position_token: None,
                                invert: false,
                            },
                        );
                    }
                }
            }
        }

        let tokens: Vec<String> = targets.keys().cloned().collect();
        *self.stream_map.write().unwrap() = targets;
        self.venue
            .subscribe_orderbook(tokens, self.update_tx.clone())
            .await;
        self.last_subscription_refresh = Utc::now().timestamp_millis();
    }

    // ── Settings passthrough ────────────────────────────────────

    pub fn trade_settings(&self) -> TradeSettings {
        self.settings.read().unwrap().clone()
    }

    pub fn set_trade_settings(&self, patch: &TradeSettingsPatch) -> Result<TradeSettings> {
        let mut guard = self.settings.write().unwrap();
        if guard.apply(patch) {
            guard.save(&self.settings_path)?;
        }
        Ok(guard.clone())
    }
}

fn spawn_stream_consumer(
    mut update_rx: mpsc::Receiver<StreamUpdate>,
    ledger: Arc<Ledger>,
    stream_map: Arc<RwLock<HashMap<String, StreamTarget>>>,
) {
    tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            let Some(target) = stream_map.read().unwrap().get(&update.token_id).cloned()
            else {
                continue;
            };
            let mid = match &update.kind {
                StreamKind::Book(book) => match book.mid_tick() {
                    Some(m) => m,
                    None => continue,
                },
                StreamKind::Ticker(t) => *t,
            };
            let tick = if target.invert {
                clamp_tick(1000 - i64::from(mid))
            } else {
                mid
            };
            if let Err(e) = ledger.update_real_time_price(
                &target.market_id,
                tick,
                target.position_token.as_deref(),
            ) {
                warn!(error = %e, "Streaming price write failed");
            }
        }
        debug!("Stream consumer ended");
    });
}

// ─────────────────────────────────────────────────────────────────
// Pure replication helpers
// ─────────────────────────────────────────────────────────────────

/// Map a source outcome string onto one of the market's legs. Exact label
/// match first; binary markets then fall back to the YES/NO synonym tables.
/// The canonical side is NO only for a binary NO-synonym leg; every
/// multi-outcome leg trades as its own YES token.
pub fn select_outcome<'a>(market: &'a Market, raw_outcome: &str) -> Option<(&'a Outcome, Side)> {
    let wanted = raw_outcome.trim();
    let exact = market
        .outcomes
        .iter()
        .find(|o| o.label.eq_ignore_ascii_case(wanted));

    let leg = match exact {
        Some(leg) => leg,
        None if market.is_binary() => {
            if is_yes_synonym(wanted) {
                market
                    .outcomes
                    .iter()
                    .find(|o| is_yes_synonym(&o.label))
                    .or_else(|| market.outcomes.iter().find(|o| !is_no_synonym(&o.label)))?
            } else if is_no_synonym(wanted) {
                market
                    .outcomes
                    .iter()
                    .find(|o| is_no_synonym(&o.label))
                    .or_else(|| market.outcomes.iter().find(|o| !is_yes_synonym(&o.label)))?
            } else {
                return None;
            }
        }
        None => return None,
    };

    let side = if market.is_binary() && is_no_synonym(&leg.label) {
        Side::No
    } else {
        Side::Yes
    };
    Some((leg, side))
}

/// The tick a replicated order is assumed to fill at: best ask on buys,
/// best bid on sells, the source's own price when the book is one-sided.
pub fn execution_tick(book: Option<&OrderBook>, is_buy: bool, source_price: f64) -> Option<u16> {
    if let Some(book) = book {
        if book.has_both_sides() {
            return if is_buy { book.best_ask() } else { book.best_bid() };
        }
    }
    to_tick(source_price)
}

/// Shares to replicate for one source trade.
pub fn copy_size(
    settings: &TradeSettings,
    source_size: f64,
    exec_tick: u16,
    min_order_size_shares: f64,
) -> f64 {
    let raw = match settings.mode {
        SizingMode::Fixed => {
            let price = from_tick(exec_tick.max(FIXED_SIZING_TICK_FLOOR));
            settings.fixed_amount_usd / price
        }
        SizingMode::Percentage => source_size * settings.percentage,
    };
    raw.max(min_order_size_shares)
}

/// Sell loss guard: true when exiting at `exec_tick` gives up more than the
/// cap relative to entry.
pub fn sell_loss_exceeds_cap(entry_tick: u16, exec_tick: u16) -> bool {
    if entry_tick == 0 {
        return false;
    }
    let loss_pct = (f64::from(entry_tick) - f64::from(exec_tick)) / f64::from(entry_tick);
    loss_pct > SELL_LOSS_CAP
}

/// Settlement pricing: winners exit at 999, losers at 1.
pub fn resolution_exit_tick(cause: CloseCause, side: Side) -> u16 {
    let won = matches!(
        (cause, side),
        (CloseCause::WinnerYes, Side::Yes) | (CloseCause::WinnerNo, Side::No)
    );
    if won {
        MAX_TICK
    } else {
        crate::ticks::MIN_TICK
    }
}

/// The cause that makes [`resolution_exit_tick`] pay `side` correctly for a
/// win or a loss.
pub fn settlement_cause(side: Side, won: bool) -> CloseCause {
    match (side, won) {
        (Side::Yes, true) | (Side::No, false) => CloseCause::WinnerYes,
        (Side::No, true) | (Side::Yes, false) => CloseCause::WinnerNo,
    }
}
