//! Market Feed WebSocket
//!
//! Streams order-book updates from the venue's market channel for a fixed
//! token set. One connection per subscription; the owning client tears the
//! task down and opens a fresh feed when the token set changes.
//!
//! The wire is lenient: a frame may be a flat list of updates, an object
//! with `data: [...]`, or an object with `price_changes: [...]`. Entries
//! carry `asset_id` or `token_id`, and either full `bids`/`asks` arrays or a
//! single `price`. All shapes decode into [`StreamUpdate`].

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};
use tracing::{debug, info, warn};

use super::types::{flexible_f64, OrderBook, RawBook, StreamKind, StreamUpdate};
use crate::ticks::to_tick;

const FEED_WATCHDOG_SILENCE_SECS: u64 = 20;
const FEED_WATCHDOG_TICK_SECS: u64 = 5;
const FEED_PING_INTERVAL_SECS: u64 = 10;
const FEED_MAX_BACKOFF_MS: u64 = 60_000;

/// Reconnect schedule: 1s, 2s, 4s, ... capped at one minute, wobbled by up
/// to a fifth of the base in either direction so a restarted fleet of feeds
/// does not stampede the venue in lockstep.
fn reconnect_delay(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(6);
    let base_ms = (1_000u64 << doublings).min(FEED_MAX_BACKOFF_MS);

    // Sub-second clock noise is jitter enough for this purpose.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let span = base_ms / 5;
    let offset = (nanos % (2 * span + 1)) as i64 - span as i64;
    Duration::from_millis(base_ms.saturating_add_signed(offset).max(250))
}

/// Streaming book subscription over one token set.
pub struct MarketFeed {
    url: String,
    token_ids: Vec<String>,
    update_tx: mpsc::Sender<StreamUpdate>,
}

impl MarketFeed {
    pub fn new(url: &str, token_ids: Vec<String>, update_tx: mpsc::Sender<StreamUpdate>) -> Self {
        Self {
            url: url.to_string(),
            token_ids,
            update_tx,
        }
    }

    /// Connect, subscribe, and pump updates until `shutdown_rx` fires.
    /// Reconnects forever with capped exponential backoff + jitter; a silence
    /// watchdog forces a reconnect when the venue goes quiet.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        if self.token_ids.is_empty() {
            info!("Market feed started with no tokens, idling until shutdown");
            let _ = shutdown_rx.recv().await;
            return Ok(());
        }

        let mut reconnect_attempt: u32 = 0;
        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Market feed shutdown requested");
                return Ok(());
            }

            info!(
                attempt = reconnect_attempt + 1,
                tokens = self.token_ids.len(),
                "Connecting to market feed: {}",
                self.url
            );

            let (ws_stream, _) = match connect_async(&self.url).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "Failed to connect market feed");
                    reconnect_attempt = reconnect_attempt.saturating_add(1);
                    tokio::time::sleep(reconnect_delay(reconnect_attempt)).await;
                    continue;
                }
            };

            info!("Connected to market feed");
            reconnect_attempt = 0;
            let (mut write, mut read) = ws_stream.split();

            let sub = json!({
                "type": "market",
                "assets_ids": self.token_ids,
                "channel": "book",
            });
            if let Err(e) = write.send(TungsteniteMessage::Text(sub.to_string())).await {
                warn!(error = %e, "Failed to send market subscription");
                reconnect_attempt = reconnect_attempt.saturating_add(1);
                tokio::time::sleep(reconnect_delay(reconnect_attempt)).await;
                continue;
            }

            let mut ping_interval =
                tokio::time::interval(Duration::from_secs(FEED_PING_INTERVAL_SECS));
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut watchdog_interval =
                tokio::time::interval(Duration::from_secs(FEED_WATCHDOG_TICK_SECS));
            watchdog_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let mut last_useful_message = Instant::now();
            let reconnect_reason: &'static str = loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(TungsteniteMessage::Text(text))) => {
                                let updates = decode_stream_frame(&text);
                                if !updates.is_empty() {
                                    last_useful_message = Instant::now();
                                }
                                for update in updates {
                                    if self.update_tx.send(update).await.is_err() {
                                        info!("Market feed consumer dropped, stopping");
                                        return Ok(());
                                    }
                                }
                            }
                            Some(Ok(TungsteniteMessage::Ping(data))) => {
                                let _ = write.send(TungsteniteMessage::Pong(data)).await;
                            }
                            Some(Ok(TungsteniteMessage::Pong(_))) => {
                                last_useful_message = Instant::now();
                            }
                            Some(Ok(TungsteniteMessage::Close(_))) => {
                                info!("Market feed closed by server");
                                break "remote_close";
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Market feed stream error");
                                break "stream_error";
                            }
                            None => break "stream_ended",
                            _ => {}
                        }
                    }

                    _ = ping_interval.tick() => {
                        if write.send(TungsteniteMessage::Ping(Vec::new())).await.is_err() {
                            break "ping_send_failed";
                        }
                    }

                    _ = watchdog_interval.tick() => {
                        if last_useful_message.elapsed().as_secs() >= FEED_WATCHDOG_SILENCE_SECS {
                            warn!(
                                silence_secs = FEED_WATCHDOG_SILENCE_SECS,
                                "Market feed watchdog timeout, reconnecting"
                            );
                            let _ = write.send(TungsteniteMessage::Close(None)).await;
                            break "watchdog_timeout";
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        info!("Shutting down market feed");
                        let _ = write.send(TungsteniteMessage::Close(None)).await;
                        return Ok(());
                    }
                }
            };

            reconnect_attempt = reconnect_attempt.saturating_add(1);
            let delay = reconnect_delay(reconnect_attempt);
            warn!(
                reason = reconnect_reason,
                attempt = reconnect_attempt,
                delay_ms = delay.as_millis() as u64,
                "Market feed reconnect scheduled"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Decode one websocket frame into zero or more updates. Accepts a flat
/// list, `{data: [...]}`, or `{price_changes: [...]}`; a bare object is
/// treated as a single-entry list.
pub fn decode_stream_frame(text: &str) -> Vec<StreamUpdate> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "Undecodable market feed frame");
            return Vec::new();
        }
    };

    let entries: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("data") {
                items.iter().collect()
            } else if let Some(Value::Array(items)) = map.get("price_changes") {
                items.iter().collect()
            } else {
                vec![&value]
            }
        }
        _ => return Vec::new(),
    };

    entries.iter().filter_map(|e| decode_entry(e)).collect()
}

fn decode_entry(entry: &Value) -> Option<StreamUpdate> {
    let token_id = entry
        .get("asset_id")
        .or_else(|| entry.get("token_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())?
        .to_string();

    // Full-book shape wins; a bare price is a ticker update.
    if entry.get("bids").is_some() || entry.get("asks").is_some() {
        let raw: RawBook = serde_json::from_value(entry.clone()).unwrap_or_default();
        let book = OrderBook::from_raw(raw);
        if book.mid_tick().is_some() {
            return Some(StreamUpdate {
                token_id,
                kind: StreamKind::Book(book),
            });
        }
        return None;
    }

    let price = entry.get("price").and_then(flexible_f64)?;
    let tick = to_tick(price)?;
    Some(StreamUpdate {
        token_id,
        kind: StreamKind::Ticker(tick),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_list_frame() {
        let frame = r#"[
            {"asset_id":"t1","price":"0.44","side":"BUY"},
            {"token_id":"t2","price":0.56}
        ]"#;
        let updates = decode_stream_frame(frame);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].token_id, "t1");
        assert!(matches!(updates[0].kind, StreamKind::Ticker(440)));
        assert!(matches!(updates[1].kind, StreamKind::Ticker(560)));
    }

    #[test]
    fn decodes_data_wrapper_frame() {
        let frame = r#"{"data":[{"asset_id":"t1","bids":[{"price":"0.42","size":"10"}],"asks":[{"price":"0.44","size":"5"}]}]}"#;
        let updates = decode_stream_frame(frame);
        assert_eq!(updates.len(), 1);
        match &updates[0].kind {
            StreamKind::Book(book) => {
                assert_eq!(book.best_bid(), Some(420));
                assert_eq!(book.best_ask(), Some(440));
            }
            other => panic!("expected book update, got {other:?}"),
        }
    }

    #[test]
    fn decodes_price_changes_frame() {
        let frame = r#"{"price_changes":[{"asset_id":"t1","price":"0.61","side":"SELL"}]}"#;
        let updates = decode_stream_frame(frame);
        assert_eq!(updates.len(), 1);
        assert!(matches!(updates[0].kind, StreamKind::Ticker(610)));
    }

    #[test]
    fn drops_entries_without_token() {
        let updates = decode_stream_frame(r#"[{"price":"0.50"}]"#);
        assert!(updates.is_empty());
        assert!(decode_stream_frame("not json").is_empty());
    }

    #[test]
    fn reconnect_delay_doubles_then_caps() {
        let within = |attempt: u32, base_ms: u64| {
            let got = reconnect_delay(attempt).as_millis() as u64;
            let span = base_ms / 5;
            assert!(
                (base_ms - span..=base_ms + span).contains(&got),
                "attempt {attempt}: {got}ms outside {base_ms}±{span}ms"
            );
        };
        within(1, 1_000);
        within(2, 2_000);
        within(4, 8_000);
        // Past the cap the base stops growing.
        within(7, 60_000);
        within(40, 60_000);
    }
}
