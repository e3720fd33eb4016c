//! Configuration
//!
//! Environment-driven runtime configuration, loaded once at bootstrap.
//! Every knob has a validated default; only `PROFILE_ADDRESS` is required.

use anyhow::{bail, Context, Result};
use config::{Config as ConfigSource, Environment};
use serde::Deserialize;

use crate::slippage::validated_delay_penalty;
use crate::venue::VenueUrls;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Source account whose trades are replicated. Required.
    pub profile_address: String,
    /// Main loop cadence.
    pub poll_interval_ms: u64,
    /// Dashboard listen port.
    pub port: u16,
    /// Edge assumed on every copied trade, feeding the slippage gate.
    pub expected_edge: f64,
    /// Delay penalty for the slippage model; out-of-range collapses to the
    /// default at use.
    pub slippage_delay_penalty: f64,
    /// Fraction of the source's size copied in percentage mode.
    pub fixed_copy_pct: f64,
    /// Minimum share count per replicated order.
    pub min_order_size_shares: f64,
    /// Start the activity cursor at boot time instead of 10 minutes back.
    pub start_from_now: bool,
    /// Gate the slippage check and the sell-loss check.
    pub enable_trade_filters: bool,
    /// Scan and blacklist markets the source already holds.
    pub skip_active_positions: bool,
    /// Opening balance for a fresh ledger.
    pub starting_balance: f64,
    pub debug_logs: bool,
    pub data_dir: String,
    pub logs_dir: String,
    pub data_api_url: String,
    pub gamma_api_url: String,
    pub clob_api_url: String,
    pub ws_market_url: String,
}

impl Config {
    /// Build from process environment over defaults.
    pub fn load() -> Result<Self> {
        let source = ConfigSource::builder()
            .set_default("profile_address", "")?
            .set_default("poll_interval_ms", 1000_i64)?
            .set_default("port", 8080_i64)?
            .set_default("expected_edge", 0.06)?
            .set_default("slippage_delay_penalty", 0.003)?
            .set_default("fixed_copy_pct", 0.10)?
            .set_default("min_order_size_shares", 1.0)?
            .set_default("start_from_now", true)?
            .set_default("enable_trade_filters", true)?
            .set_default("skip_active_positions", true)?
            .set_default("starting_balance", 1000.0)?
            .set_default("debug_logs", false)?
            .set_default("data_dir", "data")?
            .set_default("logs_dir", "logs")?
            .set_default("data_api_url", "https://data-api.polymarket.com")?
            .set_default("gamma_api_url", "https://gamma-api.polymarket.com")?
            .set_default("clob_api_url", "https://clob.polymarket.com")?
            .set_default(
                "ws_market_url",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            )?
            .add_source(Environment::default().try_parsing(true))
            .build()
            .context("assemble configuration")?;

        let cfg: Config = source.try_deserialize().context("parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.profile_address.trim().is_empty() {
            bail!("PROFILE_ADDRESS is required");
        }
        if self.poll_interval_ms == 0 {
            bail!("POLL_INTERVAL_MS must be positive");
        }
        if !(0.0..=1.0).contains(&self.fixed_copy_pct) || self.fixed_copy_pct == 0.0 {
            bail!("FIXED_COPY_PCT must be in (0, 1]");
        }
        if !self.expected_edge.is_finite() || self.expected_edge < 0.0 {
            bail!("EXPECTED_EDGE must be non-negative");
        }
        Ok(())
    }

    /// The slippage delay penalty, collapsed into its valid band.
    pub fn delay_penalty(&self) -> f64 {
        validated_delay_penalty(self.slippage_delay_penalty)
    }

    pub fn venue_urls(&self) -> VenueUrls {
        VenueUrls {
            data_api: self.data_api_url.clone(),
            gamma_api: self.gamma_api_url.clone(),
            clob_api: self.clob_api_url.clone(),
            ws_market: self.ws_market_url.clone(),
        }
    }

    pub fn ledger_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("ledger.json")
    }

    pub fn blacklist_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.data_dir).join("positions_log.json")
    }

    pub fn settings_path(&self) -> std::path::PathBuf {
        std::path::PathBuf::from("trade_settings.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            profile_address: "0xabc".to_string(),
            poll_interval_ms: 1000,
            port: 8080,
            expected_edge: 0.06,
            slippage_delay_penalty: 0.003,
            fixed_copy_pct: 0.10,
            min_order_size_shares: 1.0,
            start_from_now: true,
            enable_trade_filters: true,
            skip_active_positions: true,
            starting_balance: 1000.0,
            debug_logs: false,
            data_dir: "data".to_string(),
            logs_dir: "logs".to_string(),
            data_api_url: String::new(),
            gamma_api_url: String::new(),
            clob_api_url: String::new(),
            ws_market_url: String::new(),
        }
    }

    #[test]
    fn validation_rejects_missing_address() {
        let mut cfg = base();
        cfg.profile_address = "  ".to_string();
        assert!(cfg.validate().is_err());
        assert!(base().validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_copy_pct() {
        let mut cfg = base();
        cfg.fixed_copy_pct = 1.5;
        assert!(cfg.validate().is_err());
        cfg.fixed_copy_pct = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_band_delay_penalty_collapses() {
        let mut cfg = base();
        cfg.slippage_delay_penalty = 0.9;
        assert_eq!(cfg.delay_penalty(), 0.003);
    }
}
