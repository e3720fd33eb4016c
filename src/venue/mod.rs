//! Venue Client
//!
//! Typed access to the venue's three API surfaces: the data API (source
//! activity, holdings, profiles), the gamma API (market metadata), and the
//! CLOB (order books, streaming book updates). One instance is built at
//! bootstrap and shared behind an `Arc`.
//!
//! Every call is best-effort: transient failures surface as `Err` for the
//! caller's retry wrapper, and "the venue has nothing for this id" surfaces
//! as `Ok(None)`.

pub mod types;
pub mod websocket;

pub use types::*;
pub use websocket::MarketFeed;

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call timeouts. Books are hot-path and fail fast; metadata can wait.
const BOOK_TIMEOUT: Duration = Duration::from_secs(3);
const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint roots for one venue deployment.
#[derive(Debug, Clone)]
pub struct VenueUrls {
    pub data_api: String,
    pub gamma_api: String,
    pub clob_api: String,
    pub ws_market: String,
}

impl Default for VenueUrls {
    fn default() -> Self {
        Self {
            data_api: "https://data-api.polymarket.com".to_string(),
            gamma_api: "https://gamma-api.polymarket.com".to_string(),
            clob_api: "https://clob.polymarket.com".to_string(),
            ws_market: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
        }
    }
}

struct FeedHandle {
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Shared venue client. Holds at most one live streaming subscription; a
/// new subscription tears down the previous one.
pub struct VenueClient {
    http: reqwest::Client,
    urls: VenueUrls,
    feed: Mutex<Option<FeedHandle>>,
}

impl VenueClient {
    pub fn new(urls: VenueUrls) -> Self {
        let http = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self {
            http,
            urls,
            feed: Mutex::new(None),
        }
    }

    fn trim(base: &str) -> &str {
        base.trim_end_matches('/')
    }

    // ── Data API ────────────────────────────────────────────────

    /// Recent activity of the source account, newest first as the venue
    /// returns it.
    pub async fn get_user_activity(&self, address: &str) -> Result<Vec<ActivityItem>> {
        let url = format!(
            "{}/activity?user={address}&limit=10",
            Self::trim(&self.urls.data_api)
        );
        self.get_json(&url, METADATA_TIMEOUT, "activity").await
    }

    /// Current holdings of the source account (for the blacklist scan).
    pub async fn get_user_holdings(&self, address: &str) -> Result<Vec<SourceHolding>> {
        let url = format!(
            "{}/positions?user={address}&size_min=1",
            Self::trim(&self.urls.data_api)
        );
        self.get_json(&url, METADATA_TIMEOUT, "holdings").await
    }

    pub async fn get_user_profile(&self, address: &str) -> Result<SourceProfile> {
        let url = format!("{}/users/{address}", Self::trim(&self.urls.data_api));
        self.get_json(&url, METADATA_TIMEOUT, "profile").await
    }

    // ── Gamma API ───────────────────────────────────────────────

    /// Fetch the raw gamma payload for a market. Primary lookup by id; a
    /// not-found falls back to the `condition_ids=` filter, which is how the
    /// venue indexes children of multi-outcome events.
    pub async fn get_market_raw(&self, market_id: &str) -> Result<Option<RawMarket>> {
        let direct = format!("{}/markets/{market_id}", Self::trim(&self.urls.gamma_api));
        match self.get_json_opt::<RawMarket>(&direct, METADATA_TIMEOUT, "market").await? {
            Some(raw) => Ok(Some(raw)),
            None => {
                let filtered = format!(
                    "{}/markets?condition_ids={market_id}",
                    Self::trim(&self.urls.gamma_api)
                );
                let list: Vec<RawMarket> = self
                    .get_json(&filtered, METADATA_TIMEOUT, "market-by-condition")
                    .await?;
                Ok(list.into_iter().next())
            }
        }
    }

    /// Normalized market details: outcomes aligned with token ids, venue
    /// ordering preserved. `Ok(None)` when the venue has no such market or
    /// the payload cannot be normalized.
    pub async fn get_market_details(&self, market_id: &str) -> Result<Option<Market>> {
        let Some(raw) = self.get_market_raw(market_id).await? else {
            return Ok(None);
        };
        let market = Market::from_raw(&raw);
        if market.is_none() {
            debug!(market_id, "Gamma payload missing outcome tokens, skipping");
        }
        Ok(market)
    }

    // ── CLOB ────────────────────────────────────────────────────

    /// Order book for one outcome token, normalized (bids descending, asks
    /// ascending, junk levels dropped).
    pub async fn get_order_book(&self, token_id: &str) -> Result<Option<OrderBook>> {
        let url = format!(
            "{}/book?token_id={token_id}",
            Self::trim(&self.urls.clob_api)
        );
        let raw = self.get_json_opt::<RawBook>(&url, BOOK_TIMEOUT, "book").await?;
        Ok(raw.map(OrderBook::from_raw))
    }

    /// Top-of-book for a market, derived from the YES-leg book. `Ok(None)`
    /// when either side of the book is empty.
    pub async fn get_live_price(&self, market_id: &str) -> Result<Option<LivePrice>> {
        let Some(market) = self.get_market_details(market_id).await? else {
            return Ok(None);
        };
        let Some(leg) = yes_leg(&market) else {
            return Ok(None);
        };
        let Some(book) = self.get_order_book(&leg.token_id).await? else {
            return Ok(None);
        };
        Ok(LivePrice::from_book(&book))
    }

    // ── Streaming ───────────────────────────────────────────────

    /// Open a streaming book subscription over `token_ids`, forwarding
    /// decoded updates into `update_tx`. Any prior subscription is torn
    /// down first.
    pub async fn subscribe_orderbook(
        &self,
        token_ids: Vec<String>,
        update_tx: mpsc::Sender<StreamUpdate>,
    ) {
        let mut guard = self.feed.lock().await;
        if let Some(prev) = guard.take() {
            let _ = prev.shutdown_tx.send(()).await;
            prev.task.abort();
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let feed = MarketFeed::new(&self.urls.ws_market, token_ids.clone(), update_tx);
        let task = tokio::spawn(async move {
            if let Err(e) = feed.run(shutdown_rx).await {
                warn!(error = %e, "Market feed task ended with error");
            }
        });
        info!(tokens = token_ids.len(), "Streaming subscription refreshed");
        *guard = Some(FeedHandle { shutdown_tx, task });
    }

    /// Tear down the streaming subscription, if any.
    pub async fn unsubscribe(&self) {
        let mut guard = self.feed.lock().await;
        if let Some(prev) = guard.take() {
            let _ = prev.shutdown_tx.send(()).await;
            prev.task.abort();
        }
    }

    // ── Plumbing ────────────────────────────────────────────────

    async fn get_json<T: serde::de::DeserializeOwned + Default>(
        &self,
        url: &str,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        match self.get_json_opt(url, timeout, what).await? {
            Some(v) => Ok(v),
            None => Ok(T::default()),
        }
    }

    async fn get_json_opt<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        timeout: Duration,
        what: &str,
    ) -> Result<Option<T>> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                // Aborted (timed-out) requests and network failures log
                // differently; both keep the source error for retry
                // classification.
                if e.is_timeout() {
                    debug!(what, url, "Venue request timed out");
                } else {
                    debug!(what, url, error = %e, "Venue request failed");
                }
                anyhow::Error::new(e).context(format!("fetch {what}"))
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() {
            let err = response.error_for_status().unwrap_err();
            return Err(anyhow::Error::new(err).context(format!("venue 5xx for {what}")));
        }
        if !status.is_success() {
            anyhow::bail!("venue returned {status} for {what}");
        }
        let body = response
            .json::<T>()
            .await
            .with_context(|| format!("parse {what} response"))?;
        Ok(Some(body))
    }
}

/// The YES leg of a market: label-matched first (robust to the venue's
/// inconsistent outcome ordering), falling back to "whichever leg is not
/// NO", then to the first outcome.
pub fn yes_leg(market: &Market) -> Option<&Outcome> {
    market
        .outcomes
        .iter()
        .find(|o| is_yes_synonym(&o.label))
        .or_else(|| {
            if market.is_binary() {
                market.outcomes.iter().find(|o| !is_no_synonym(&o.label))
            } else {
                None
            }
        })
        .or_else(|| market.outcomes.first())
}

/// Labels treated as the YES leg of a binary market.
pub fn is_yes_synonym(label: &str) -> bool {
    matches!(
        label.trim().to_ascii_uppercase().as_str(),
        "YES" | "1" | "TRUE" | "UP" | "PASS"
    )
}

/// Labels treated as the NO leg of a binary market.
pub fn is_no_synonym(label: &str) -> bool {
    matches!(
        label.trim().to_ascii_uppercase().as_str(),
        "NO" | "0" | "FALSE" | "DOWN" | "FAIL"
    )
}
