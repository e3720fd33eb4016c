//! End-to-end replication scenarios driven through the public engine and
//! ledger APIs: copy-buys, scale-ins, priority-arbitrated closes, and
//! settlement pricing.

use std::fs;
use std::sync::{Arc, RwLock};
use tempfile::TempDir;

use copybot::audit::AuditLog;
use copybot::config::Config;
use copybot::engine::{
    copy_size, execution_tick, select_outcome, settlement_cause, Engine, EngineHandle,
    SizingMode, TradeSettings,
};
use copybot::filter::PositionFilter;
use copybot::ledger::{
    CloseCause, CloseTrigger, Ledger, MarketType, PositionState, Side, TradeApply,
};
use copybot::lifecycle::{classify, LifecycleState};
use copybot::ticks::from_tick;
use copybot::venue::{Market, OrderBook, Outcome, RawBook, RawBookLevel, RawMarket, VenueClient};

fn test_config(dir: &TempDir) -> Config {
    Config {
        profile_address: "0xsource".to_string(),
        poll_interval_ms: 1000,
        port: 0,
        expected_edge: 0.06,
        slippage_delay_penalty: 0.003,
        fixed_copy_pct: 0.10,
        min_order_size_shares: 1.0,
        start_from_now: true,
        enable_trade_filters: true,
        skip_active_positions: false,
        starting_balance: 1000.0,
        debug_logs: false,
        data_dir: dir.path().join("data").to_string_lossy().into_owned(),
        logs_dir: dir.path().join("logs").to_string_lossy().into_owned(),
        data_api_url: String::new(),
        gamma_api_url: String::new(),
        clob_api_url: String::new(),
        ws_market_url: "ws://127.0.0.1:1/ws".to_string(),
    }
}

fn build_engine(dir: &TempDir, ledger: Arc<Ledger>) -> (Engine, EngineHandle) {
    let config = test_config(dir);
    let venue = Arc::new(VenueClient::new(config.venue_urls()));
    let filter = Arc::new(PositionFilter::open(config.blacklist_path()));
    let audit = Arc::new(AuditLog::new(&config.logs_dir));
    let settings = Arc::new(RwLock::new(TradeSettings::default()));
    Engine::new(config, venue, ledger, filter, audit, settings)
}

fn binary_market() -> Market {
    Market {
        market_id: "M".to_string(),
        question: "Will it settle yes?".to_string(),
        slug: "will-it-settle-yes".to_string(),
        end_time_ms: None,
        outcomes: vec![
            Outcome {
                token_id: "t0".to_string(),
                label: "No".to_string(),
                tick_price: None,
            },
            Outcome {
                token_id: "t1".to_string(),
                label: "Yes".to_string(),
                tick_price: None,
            },
        ],
        is_resolved: false,
    }
}

fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBook {
    OrderBook::from_raw(RawBook {
        bids: bids
            .iter()
            .map(|(p, s)| RawBookLevel { price: *p, size: *s })
            .collect(),
        asks: asks
            .iter()
            .map(|(p, s)| RawBookLevel { price: *p, size: *s })
            .collect(),
    })
}

fn settings_pct() -> TradeSettings {
    TradeSettings {
        mode: SizingMode::Percentage,
        percentage: 0.10,
        fixed_amount_usd: 10.0,
    }
}

/// Replicate one source trade against a ledger the way the engine does:
/// outcome mapping, execution pricing, sizing, then commit.
fn copy_buy(
    ledger: &Ledger,
    market: &Market,
    raw_outcome: &str,
    source_size: f64,
    book: &OrderBook,
    tx: &str,
) {
    let (leg, side) = select_outcome(market, raw_outcome).expect("outcome maps");
    let tick = execution_tick(Some(book), true, 0.0).expect("book priced");
    let shares = copy_size(&settings_pct(), source_size, tick, 1.0);
    let applied = ledger
        .apply_trade(&TradeApply {
            market_id: market.market_id.clone(),
            question: market.question.clone(),
            slug: market.slug.clone(),
            side,
            outcome_label: leg.label.clone(),
            signed_shares: shares,
            tick,
            tx_hash: tx.to_string(),
            reason: "COPY_TRADE".to_string(),
            source_tick: None,
            latency_ms: Some(5),
            token_id: Some(leg.token_id.clone()),
            market_type: MarketType::Single,
        })
        .unwrap();
    assert!(applied, "copy buy should commit");
}

/// Age a persisted position past the close arbiter's minimum hold.
fn backdate_entry(dir: &TempDir, key: &str) {
    let path = dir.path().join("data").join("ledger.json");
    let raw = fs::read_to_string(&path).unwrap();
    let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let entry = &mut value["positions"][key]["last_entry_time"];
    *entry = serde_json::json!(entry.as_i64().unwrap_or(0) - 60_000);
    fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
}

#[tokio::test]
async fn scenario_binary_copy_buy() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    let b = book(&[(0.42, 500.0)], &[(0.44, 500.0)]);

    copy_buy(&ledger, &market, "Yes", 100.0, &b, "h1");

    let (key, pos) = ledger
        .find_position("M", Some("t1"), Side::Yes, "Yes")
        .expect("position opened");
    assert_eq!(key, "M:t1");
    assert_eq!(pos.side, Side::Yes);
    assert_eq!(pos.size, 10.0);
    assert_eq!(pos.entry_tick, 440);
    assert!((ledger.balance() - 995.6).abs() < 1e-9);
    let events = ledger.trade_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].direction.as_str(), "BUY");
}

#[tokio::test]
async fn scenario_scale_in_weighted_average() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();

    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");
    copy_buy(&ledger, &market, "Yes", 200.0, &book(&[(0.42, 500.0)], &[(0.50, 500.0)]), "h2");

    let (_, pos) = ledger
        .find_position("M", Some("t1"), Side::Yes, "Yes")
        .unwrap();
    assert_eq!(pos.size, 30.0);
    // toTick((10 * 0.44 + 20 * 0.50) / 30) = toTick(0.48) = 480
    assert_eq!(pos.entry_tick, 480);
}

#[tokio::test]
async fn scenario_copy_sell_closes_with_priority() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");
    copy_buy(&ledger, &market, "Yes", 200.0, &book(&[(0.42, 500.0)], &[(0.50, 500.0)]), "h2");
    backdate_entry(&dir, "M:t1");

    // Reopen the aged ledger and drive the close through the arbiter.
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let (engine, _handle) = build_engine(&dir, Arc::clone(&ledger));

    let sell_book = book(&[(0.55, 1000.0)], &[(0.56, 1000.0)]);
    let exit_tick = execution_tick(Some(&sell_book), false, 0.0).unwrap();
    assert_eq!(exit_tick, 550);

    let closed = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::CopyTraderEvent,
            CloseCause::TargetSelloff,
            Some(exit_tick),
            Some("t1"),
            Some("Yes"),
            Some("h3".to_string()),
        )
        .await
        .unwrap();
    assert!(closed);

    assert!(ledger.positions().is_empty());
    let closed = ledger.closed_positions();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_tick, 550);
    assert_eq!(closed[0].close_trigger, Some(CloseTrigger::CopyTraderEvent));
    assert_eq!(closed[0].close_cause, Some(CloseCause::TargetSelloff));
    // proceeds 30 * 0.55 = 16.50; pnl = 16.50 - 30 * 0.48 = 2.10
    assert!((closed[0].return_usd - 16.50).abs() < 1e-9);
    assert!((closed[0].realized_pnl - 2.10).abs() < 1e-9);
    // One SELL event beyond the two buys.
    assert_eq!(ledger.trade_events().len(), 3);
}

#[tokio::test]
async fn scenario_resolution_pays_yes_winner() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");

    // The venue declares resolution with Yes pinned at 1.
    let container: RawMarket = serde_json::from_str(
        r#"{
            "conditionId": "M",
            "umaResolutionStatus": "resolved",
            "outcomes": "[\"No\",\"Yes\"]",
            "clobTokenIds": "[\"t0\",\"t1\"]",
            "outcomePrices": "[\"0\",\"1\"]"
        }"#,
    )
    .unwrap();
    let assessment = classify(&container, "M", 1_700_000_000_000);
    assert_eq!(assessment.state, LifecycleState::Closed);
    let result = assessment.result.unwrap();
    assert!(result.winning_label.eq_ignore_ascii_case("Yes"));

    let (engine, _handle) = build_engine(&dir, Arc::clone(&ledger));
    let won = result.winning_label.eq_ignore_ascii_case("Yes");
    let cause = settlement_cause(Side::Yes, won);
    assert_eq!(cause, CloseCause::WinnerYes);

    let closed = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::MarketResolution,
            cause,
            None,
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(closed);

    let closed = ledger.closed_positions();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_tick, 999);
    assert_eq!(closed[0].close_trigger, Some(CloseTrigger::MarketResolution));
    // realized = size * (0.999 - entry price)
    let expected = 10.0 * (from_tick(999) - from_tick(440));
    assert!((closed[0].realized_pnl - expected).abs() < 1e-9);
    // Settlements never append SELL events.
    assert_eq!(ledger.trade_events().len(), 1);
}

#[tokio::test]
async fn scenario_resolution_overrides_weaker_close() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");
    backdate_entry(&dir, "M:t1");
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));

    // A copy-trader close (priority 4) is mid-flight.
    let (key, _) = ledger.find_position("M", Some("t1"), Side::Yes, "Yes").unwrap();
    ledger
        .mark_closing(&key, CloseTrigger::CopyTraderEvent, CloseCause::TargetSelloff)
        .unwrap();

    let (engine, _handle) = build_engine(&dir, Arc::clone(&ledger));

    // A weaker trigger must bounce off the recorded priority.
    let bounced = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::Timeout,
            CloseCause::Unknown,
            Some(500),
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(!bounced);

    // Resolution (priority 1) overwrites the pending close.
    let closed = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::MarketResolution,
            CloseCause::WinnerYes,
            None,
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(closed);

    let closed = ledger.closed_positions();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].close_trigger, Some(CloseTrigger::MarketResolution));
    assert_eq!(closed[0].close_cause, Some(CloseCause::WinnerYes));
    assert_eq!(closed[0].exit_tick, 999);
}

#[tokio::test]
async fn settled_positions_are_immutable() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");

    let (key, _) = ledger.find_position("M", Some("t1"), Side::Yes, "Yes").unwrap();
    ledger
        .update_position_state(&key, PositionState::Settled)
        .unwrap();

    let (engine, _handle) = build_engine(&dir, Arc::clone(&ledger));
    for trigger in [
        CloseTrigger::MarketResolution,
        CloseTrigger::UserAction,
        CloseTrigger::CopyTraderEvent,
    ] {
        let closed = engine
            .close(
                "M",
                Side::Yes,
                trigger,
                CloseCause::Unknown,
                Some(500),
                Some("t1"),
                Some("Yes"),
                None,
            )
            .await
            .unwrap();
        assert!(!closed, "{trigger} must not mutate a settled position");
    }
    assert_eq!(ledger.positions().len(), 1);
    assert!(ledger.closed_positions().is_empty());
}

#[tokio::test]
async fn fresh_entries_respect_minimum_hold() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");

    let (engine, _handle) = build_engine(&dir, Arc::clone(&ledger));
    // Guard triggers wait out the hold window...
    let closed = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::SystemGuard,
            CloseCause::Unknown,
            Some(400),
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(!closed);

    // ...but user action is exempt.
    let closed = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::UserAction,
            CloseCause::UserRequest,
            Some(400),
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(closed);
}

#[tokio::test]
async fn resolution_settlement_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let ledger = Arc::new(Ledger::open(dir.path().join("data/ledger.json"), 1000.0));
    let market = binary_market();
    copy_buy(&ledger, &market, "Yes", 100.0, &book(&[(0.42, 500.0)], &[(0.44, 500.0)]), "h1");

    let (engine, _handle) = build_engine(&dir, Arc::clone(&ledger));
    let first = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::MarketResolution,
            CloseCause::WinnerYes,
            None,
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(first);

    // A second sweep of the same resolved market finds nothing to close.
    let second = engine
        .close(
            "M",
            Side::Yes,
            CloseTrigger::MarketResolution,
            CloseCause::WinnerYes,
            None,
            Some("t1"),
            Some("Yes"),
            None,
        )
        .await
        .unwrap();
    assert!(!second);
    assert_eq!(ledger.closed_positions().len(), 1);
    let balance = ledger.balance();
    assert!((balance - (1000.0 - 4.4 + 10.0 * 0.999)).abs() < 1e-9);
}
