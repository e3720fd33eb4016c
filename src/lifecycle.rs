//! Market Lifecycle Classifier
//!
//! Pure classification of a venue event container against a target market:
//! single vs multi-outcome, active vs pending-resolution vs closed, and
//! winner extraction once prices pin to a resolved outcome.
//!
//! Single and multi markets signal "no longer trading" differently: a
//! standalone binary market runs to its end date, while the venue toggles
//! `acceptingOrders` per child of a multi-outcome event at different times,
//! so child end dates are ignored there.

use crate::ledger::{MarketType, Side};
use crate::venue::RawMarket;

/// Lifecycle state of the target market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    PendingResolution,
    Closed,
}

/// Which binary leg won, mapped from the winning outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    YesWon,
    NoWon,
}

/// Winner details extracted from a resolved child market.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub winning_index: usize,
    pub winning_label: String,
    /// Label-mapped winner; absent when the label names neither leg.
    pub winner: Option<Winner>,
    /// For multi-outcome children: the side that won within that child.
    pub winning_side: Option<Side>,
}

/// Classifier output for one container + target pair.
#[derive(Debug, Clone)]
pub struct MarketAssessment {
    pub market_type: MarketType,
    pub state: LifecycleState,
    pub result: Option<ResolutionResult>,
}

impl MarketAssessment {
    fn active(market_type: MarketType) -> Self {
        Self {
            market_type,
            state: LifecycleState::Active,
            result: None,
        }
    }
}

/// Outcome prices at or above this are treated as the declared winner.
const WINNER_PRICE_FLOOR: f64 = 0.99;

/// Classify the target market inside its event container.
///
/// `now_ms` is injected rather than read from the clock so the function
/// stays deterministic.
pub fn classify(container: &RawMarket, target_market_id: &str, now_ms: i64) -> MarketAssessment {
    let children: Vec<&RawMarket> = container
        .events
        .iter()
        .flat_map(|e| e.markets.iter())
        .collect();

    if children.len() > 1 {
        let Some(child) = children.iter().find(|m| m.matches_id(target_market_id)) else {
            return MarketAssessment::active(MarketType::Multi);
        };
        let state = if is_uma_resolved(child) {
            LifecycleState::Closed
        } else if child.accepting_orders == Some(false) {
            LifecycleState::PendingResolution
        } else {
            LifecycleState::Active
        };
        let result = if state == LifecycleState::Closed {
            extract_winner(child, true)
        } else {
            None
        };
        return MarketAssessment {
            market_type: MarketType::Multi,
            state,
            result,
        };
    }

    let child = children.first().copied().unwrap_or(container);
    let state = if is_uma_resolved(child) {
        LifecycleState::Closed
    } else if child
        .end_date_ms()
        .map(|end| now_ms >= end)
        .unwrap_or(false)
    {
        LifecycleState::PendingResolution
    } else {
        LifecycleState::Active
    };
    let result = if state == LifecycleState::Closed {
        extract_winner(child, false)
    } else {
        None
    };
    MarketAssessment {
        market_type: MarketType::Single,
        state,
        result,
    }
}

fn is_uma_resolved(market: &RawMarket) -> bool {
    matches!(&market.uma_resolution_status, Some(s) if s.eq_ignore_ascii_case("resolved"))
}

fn extract_winner(market: &RawMarket, multi_child: bool) -> Option<ResolutionResult> {
    let prices = market.outcome_prices_f64();
    let (winning_index, _) = prices
        .iter()
        .enumerate()
        .find(|(_, p)| **p >= WINNER_PRICE_FLOOR)?;

    let winning_label = market
        .outcomes
        .get(winning_index)
        .cloned()
        .unwrap_or_default();
    let upper = winning_label.to_ascii_uppercase();
    let winner = if upper.contains("YES") || upper.contains("UP") {
        Some(Winner::YesWon)
    } else if upper.contains("NO") || upper.contains("DOWN") {
        Some(Winner::NoWon)
    } else {
        None
    };
    let winning_side = if multi_child {
        match winner {
            Some(Winner::YesWon) => Some(Side::Yes),
            Some(Winner::NoWon) => Some(Side::No),
            None => None,
        }
    } else {
        None
    };

    Some(ResolutionResult {
        winning_index,
        winning_label,
        winner,
        winning_side,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::RawEvent;

    fn single(uma: Option<&str>, end_date: Option<&str>, prices: &[&str]) -> RawMarket {
        RawMarket {
            condition_id: Some("m1".to_string()),
            uma_resolution_status: uma.map(String::from),
            end_date: end_date.map(String::from),
            outcomes: vec!["No".to_string(), "Yes".to_string()],
            outcome_prices: prices.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        }
    }

    fn multi(children: Vec<RawMarket>) -> RawMarket {
        RawMarket {
            condition_id: Some("parent".to_string()),
            events: vec![RawEvent {
                id: None,
                title: None,
                markets: children,
            }],
            ..Default::default()
        }
    }

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn single_active_before_end_date() {
        let m = single(None, Some("2099-01-01T00:00:00Z"), &[]);
        let a = classify(&m, "m1", NOW);
        assert_eq!(a.market_type, MarketType::Single);
        assert_eq!(a.state, LifecycleState::Active);
        assert!(a.result.is_none());
    }

    #[test]
    fn single_pending_after_end_date() {
        let m = single(None, Some("2020-01-01T00:00:00Z"), &[]);
        let a = classify(&m, "m1", NOW);
        assert_eq!(a.state, LifecycleState::PendingResolution);
    }

    #[test]
    fn single_closed_with_yes_winner() {
        let m = single(Some("resolved"), Some("2020-01-01T00:00:00Z"), &["0", "1"]);
        let a = classify(&m, "m1", NOW);
        assert_eq!(a.state, LifecycleState::Closed);
        let r = a.result.unwrap();
        assert_eq!(r.winning_index, 1);
        assert_eq!(r.winner, Some(Winner::YesWon));
        assert_eq!(r.winning_label, "Yes");
        // winning_side is a multi-child concept
        assert!(r.winning_side.is_none());
    }

    #[test]
    fn multi_uses_accepting_orders_not_end_date() {
        let mut child_a = single(None, Some("2020-01-01T00:00:00Z"), &[]);
        child_a.condition_id = Some("child-a".to_string());
        child_a.accepting_orders = Some(true);
        let mut child_b = single(None, None, &[]);
        child_b.condition_id = Some("child-b".to_string());
        child_b.accepting_orders = Some(false);

        let container = multi(vec![child_a, child_b]);
        // Past end date but still accepting: active.
        let a = classify(&container, "child-a", NOW);
        assert_eq!(a.market_type, MarketType::Multi);
        assert_eq!(a.state, LifecycleState::Active);
        // Not accepting orders: pending.
        let b = classify(&container, "child-b", NOW);
        assert_eq!(b.state, LifecycleState::PendingResolution);
    }

    #[test]
    fn multi_child_winner_carries_winning_side() {
        let mut child = single(Some("resolved"), None, &["1", "0"]);
        child.condition_id = Some("child-a".to_string());
        let mut other = single(None, None, &[]);
        other.condition_id = Some("child-b".to_string());

        let container = multi(vec![child, other]);
        let a = classify(&container, "child-a", NOW);
        assert_eq!(a.state, LifecycleState::Closed);
        let r = a.result.unwrap();
        assert_eq!(r.winner, Some(Winner::NoWon));
        assert_eq!(r.winning_side, Some(Side::No));
    }

    #[test]
    fn multi_without_target_match_is_active() {
        let mut child = single(Some("resolved"), None, &["1", "0"]);
        child.condition_id = Some("child-a".to_string());
        let mut other = single(None, None, &[]);
        other.condition_id = Some("child-b".to_string());

        let container = multi(vec![child, other]);
        let a = classify(&container, "unknown-child", NOW);
        assert_eq!(a.market_type, MarketType::Multi);
        assert_eq!(a.state, LifecycleState::Active);
        assert!(a.result.is_none());
    }

    #[test]
    fn winner_requires_pinned_price() {
        let m = single(Some("resolved"), None, &["0.60", "0.40"]);
        let a = classify(&m, "m1", NOW);
        assert_eq!(a.state, LifecycleState::Closed);
        assert!(a.result.is_none());
    }
}
