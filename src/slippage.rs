//! Slippage Estimator
//!
//! Decides whether a replicated trade is worth executing against the current
//! book. The cost model decomposes into three parts: the quoted spread, the
//! market impact of our notional against near-touch depth, and a fixed
//! delay penalty covering the observation-to-fill lag. A trade executes only
//! when the summed cost stays inside the edge we expect to capture.

use serde::Serialize;

use crate::ticks::from_tick;
use crate::venue::OrderBook;

/// Spread wider than this fraction of mid marks a dead market; nothing
/// executes there regardless of edge.
pub const SPREAD_HARD_CAP: f64 = 0.15;

/// Valid range for the delay penalty; anything else collapses to the default.
pub const DELAY_PENALTY_MIN: f64 = 0.002;
pub const DELAY_PENALTY_MAX: f64 = 0.005;
pub const DELAY_PENALTY_DEFAULT: f64 = 0.003;

/// Fraction of the expected edge we are willing to spend on execution cost
/// beyond the unavoidable spread.
const EDGE_BUDGET_FRACTION: f64 = 0.4;

/// Depth window around the touch that counts as fillable: asks within +1%
/// of best ask on buys, bids within -1% of best bid on sells.
const DEPTH_WINDOW: f64 = 0.01;

/// Decomposed execution-cost estimate and the resulting decision.
#[derive(Debug, Clone, Serialize)]
pub struct SlippageEstimate {
    /// (ask - bid) / mid.
    pub spread: f64,
    /// USD depth within the near-touch window on the taking side.
    pub depth_usd: f64,
    /// notional / depth; infinite when the window is empty.
    pub impact: f64,
    pub delay_penalty: f64,
    pub total_slippage: f64,
    pub threshold: f64,
    pub should_execute: bool,
    pub reason: String,
}

impl SlippageEstimate {
    fn reject(spread: f64, depth_usd: f64, impact: f64, delay: f64, reason: String) -> Self {
        Self {
            spread,
            depth_usd,
            impact,
            delay_penalty: delay,
            total_slippage: spread + impact + delay,
            threshold: 0.0,
            should_execute: false,
            reason,
        }
    }
}

/// Clamp an operator-supplied delay penalty into its valid band; anything
/// out of range (or non-finite) collapses to the default.
pub fn validated_delay_penalty(raw: f64) -> f64 {
    if raw.is_finite() && (DELAY_PENALTY_MIN..=DELAY_PENALTY_MAX).contains(&raw) {
        raw
    } else {
        DELAY_PENALTY_DEFAULT
    }
}

/// Estimate execution cost for taking `notional_usd` out of `book`.
pub fn estimate(
    book: &OrderBook,
    notional_usd: f64,
    is_buy: bool,
    expected_edge: f64,
    delay_penalty: f64,
) -> SlippageEstimate {
    let delay = validated_delay_penalty(delay_penalty);

    let (Some(best_bid), Some(best_ask)) = (book.best_bid(), book.best_ask()) else {
        return SlippageEstimate::reject(
            f64::INFINITY,
            0.0,
            f64::INFINITY,
            delay,
            "one-sided or empty book".to_string(),
        );
    };

    let mid = (f64::from(best_bid) + f64::from(best_ask)) / 2.0;
    let spread = (f64::from(best_ask) - f64::from(best_bid)) / mid;

    if spread > SPREAD_HARD_CAP {
        return SlippageEstimate::reject(
            spread,
            0.0,
            0.0,
            delay,
            format!("spread {:.1}% exceeds hard cap", spread * 100.0),
        );
    }

    let depth_usd = if is_buy {
        let limit = (f64::from(best_ask) * (1.0 + DEPTH_WINDOW)).floor() as i64;
        book.asks
            .iter()
            .filter(|l| i64::from(l.tick) <= limit)
            .map(|l| from_tick(l.tick) * l.size)
            .sum::<f64>()
    } else {
        let limit = (f64::from(best_bid) * (1.0 - DEPTH_WINDOW)).floor() as i64;
        book.bids
            .iter()
            .filter(|l| i64::from(l.tick) >= limit)
            .map(|l| from_tick(l.tick) * l.size)
            .sum::<f64>()
    };

    let impact = if depth_usd > 0.0 {
        notional_usd / depth_usd
    } else {
        f64::INFINITY
    };

    let total_slippage = spread + impact + delay;
    let threshold = spread + EDGE_BUDGET_FRACTION * expected_edge;
    let should_execute = total_slippage.is_finite() && total_slippage <= threshold;

    let reason = if should_execute {
        format!(
            "total {:.2}% within threshold {:.2}%",
            total_slippage * 100.0,
            threshold * 100.0
        )
    } else if !total_slippage.is_finite() {
        "no depth inside the fill window".to_string()
    } else {
        format!(
            "total {:.2}% exceeds threshold {:.2}%",
            total_slippage * 100.0,
            threshold * 100.0
        )
    };

    SlippageEstimate {
        spread,
        depth_usd,
        impact,
        delay_penalty: delay,
        total_slippage,
        threshold,
        should_execute,
        reason,
    }
}
