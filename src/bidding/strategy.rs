//! Bid strategy evaluator.
//!
//! Pure ranking function: (bids, weights, porter metadata) → scores with a
//! per-criterion breakdown. All criteria are normalized to 0–100 over the
//! current bid set, so scores are only comparable within one evaluation.

use crate::bidding::models::{Bid, PorterMetadata, StrategyWeights};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ABSENT_SCORE: f64 = 50.0;

/// Evaluator input; independent of persistence so previews can inject
/// hypothetical bids.
#[derive(Debug, Clone)]
pub struct BidInput {
    pub bid_id: String,
    pub porter_id: String,
    pub amount_cents: i64,
    pub eta_minutes: i64,
    pub placed_at: DateTime<Utc>,
    pub metadata: PorterMetadata,
}

impl From<&Bid> for BidInput {
    fn from(bid: &Bid) -> Self {
        Self {
            bid_id: bid.id.clone(),
            porter_id: bid.porter_id.clone(),
            amount_cents: bid.amount_cents,
            eta_minutes: bid.eta_minutes,
            placed_at: bid.placed_at,
            metadata: bid.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub price_score: f64,
    pub eta_score: f64,
    pub rating_score: f64,
    pub reliability_score: f64,
    pub distance_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredBid {
    pub bid_id: String,
    pub porter_id: String,
    pub amount_cents: i64,
    pub eta_minutes: i64,
    pub score: f64,
    /// 1-based ordinal by score descending; the tie-break order is total.
    pub rank: u32,
    pub breakdown: ScoreBreakdown,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Linear inverse over the set's range; everyone gets 100 when min == max.
fn inverse_range_score(value: f64, min: f64, max: f64) -> f64 {
    if (max - min).abs() < f64::EPSILON {
        return 100.0;
    }
    (max - value) / (max - min) * 100.0
}

fn breakdown_for(bid: &BidInput, min_amount: f64, max_amount: f64, min_eta: f64, max_eta: f64) -> ScoreBreakdown {
    ScoreBreakdown {
        price_score: inverse_range_score(bid.amount_cents as f64, min_amount, max_amount),
        eta_score: inverse_range_score(bid.eta_minutes as f64, min_eta, max_eta),
        rating_score: bid
            .metadata
            .rating
            .map(|r| (r / 5.0) * 100.0)
            .unwrap_or(ABSENT_SCORE),
        reliability_score: bid.metadata.reliability.unwrap_or(ABSENT_SCORE),
        distance_score: bid
            .metadata
            .distance_meters
            .map(|m| (100.0 - m / 100.0).max(0.0))
            .unwrap_or(ABSENT_SCORE),
    }
}

fn composite(breakdown: &ScoreBreakdown, weights: &StrategyWeights) -> f64 {
    round2(
        weights.price_weight * breakdown.price_score
            + weights.eta_weight * breakdown.eta_score
            + weights.rating_weight * breakdown.rating_score
            + weights.reliability_weight * breakdown.reliability_score
            + weights.distance_weight * breakdown.distance_score,
    )
}

/// Deterministic, total ordering: score desc, then price asc, then ETA asc,
/// then placement time asc, then bid id lexicographic.
fn rank_order(a: &ScoredBid, a_placed: DateTime<Utc>, b: &ScoredBid, b_placed: DateTime<Utc>) -> std::cmp::Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.amount_cents.cmp(&b.amount_cents))
        .then_with(|| a.eta_minutes.cmp(&b.eta_minutes))
        .then_with(|| a_placed.cmp(&b_placed))
        .then_with(|| a.bid_id.cmp(&b.bid_id))
}

/// Rank a bid set under (defensively renormalized) strategy weights.
pub fn evaluate(bids: &[BidInput], weights: &StrategyWeights) -> Vec<ScoredBid> {
    if bids.is_empty() {
        return Vec::new();
    }
    let weights = weights.normalized();

    let amounts: Vec<f64> = bids.iter().map(|b| b.amount_cents as f64).collect();
    let etas: Vec<f64> = bids.iter().map(|b| b.eta_minutes as f64).collect();
    let min_amount = amounts.iter().copied().fold(f64::INFINITY, f64::min);
    let max_amount = amounts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min_eta = etas.iter().copied().fold(f64::INFINITY, f64::min);
    let max_eta = etas.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut scored: Vec<(ScoredBid, DateTime<Utc>)> = bids
        .iter()
        .map(|bid| {
            let breakdown = breakdown_for(bid, min_amount, max_amount, min_eta, max_eta);
            (
                ScoredBid {
                    bid_id: bid.bid_id.clone(),
                    porter_id: bid.porter_id.clone(),
                    amount_cents: bid.amount_cents,
                    eta_minutes: bid.eta_minutes,
                    score: composite(&breakdown, &weights),
                    rank: 0,
                    breakdown,
                },
                bid.placed_at,
            )
        })
        .collect();

    scored.sort_by(|(a, a_placed), (b, b_placed)| rank_order(a, *a_placed, b, *b_placed));
    for (position, (bid, _)) in scored.iter_mut().enumerate() {
        bid.rank = position as u32 + 1;
    }
    scored.into_iter().map(|(bid, _)| bid).collect()
}

/// Insert a hypothetical bid into an existing set and return its rank and
/// score without mutating anything.
pub fn preview(existing: &[BidInput], candidate: BidInput, weights: &StrategyWeights) -> (u32, f64) {
    let candidate_id = candidate.bid_id.clone();
    let mut all = existing.to_vec();
    all.push(candidate);
    let ranked = evaluate(&all, weights);
    ranked
        .into_iter()
        .find(|s| s.bid_id == candidate_id)
        .map(|s| (s.rank, s.score))
        .expect("candidate is always present in its own evaluation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bid(id: &str, amount: i64, eta: i64, placed_s: i64) -> BidInput {
        BidInput {
            bid_id: id.to_string(),
            porter_id: format!("porter-{id}"),
            amount_cents: amount,
            eta_minutes: eta,
            placed_at: Utc.timestamp_opt(1_700_000_000 + placed_s, 0).unwrap(),
            metadata: PorterMetadata::default(),
        }
    }

    fn with_meta(mut input: BidInput, rating: f64, reliability: f64, distance: f64) -> BidInput {
        input.metadata = PorterMetadata {
            rating: Some(rating),
            reliability: Some(reliability),
            distance_meters: Some(distance),
        };
        input
    }

    #[test]
    fn test_price_range_normalization() {
        let bids = vec![bid("a", 5000, 30, 0), bid("b", 10000, 30, 1)];
        let ranked = evaluate(&bids, &StrategyWeights::balanced());
        let a = ranked.iter().find(|s| s.bid_id == "a").unwrap();
        let b = ranked.iter().find(|s| s.bid_id == "b").unwrap();
        assert_eq!(a.breakdown.price_score, 100.0);
        assert_eq!(b.breakdown.price_score, 0.0);
        assert_eq!(a.rank, 1);
        assert_eq!(b.rank, 2);
    }

    #[test]
    fn test_equal_amounts_all_score_100() {
        let bids = vec![bid("a", 8000, 20, 0), bid("b", 8000, 40, 1)];
        let ranked = evaluate(&bids, &StrategyWeights::balanced());
        for scored in &ranked {
            assert_eq!(scored.breakdown.price_score, 100.0);
        }
        // faster ETA wins
        assert_eq!(ranked[0].bid_id, "a");
    }

    #[test]
    fn test_absent_metadata_defaults_to_50() {
        let bids = vec![bid("a", 5000, 30, 0)];
        let ranked = evaluate(&bids, &StrategyWeights::balanced());
        assert_eq!(ranked[0].breakdown.rating_score, ABSENT_SCORE);
        assert_eq!(ranked[0].breakdown.reliability_score, ABSENT_SCORE);
        assert_eq!(ranked[0].breakdown.distance_score, ABSENT_SCORE);
    }

    #[test]
    fn test_metadata_scores() {
        let bids = vec![with_meta(bid("a", 5000, 30, 0), 4.5, 80.0, 2000.0)];
        let ranked = evaluate(&bids, &StrategyWeights::balanced());
        let breakdown = &ranked[0].breakdown;
        assert!((breakdown.rating_score - 90.0).abs() < 1e-9);
        assert!((breakdown.reliability_score - 80.0).abs() < 1e-9);
        assert!((breakdown.distance_score - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_distance_clamps_at_zero() {
        let bids = vec![with_meta(bid("a", 5000, 30, 0), 5.0, 100.0, 50_000.0)];
        let ranked = evaluate(&bids, &StrategyWeights::balanced());
        assert_eq!(ranked[0].breakdown.distance_score, 0.0);
    }

    #[test]
    fn test_tie_breaks_are_total() {
        // identical price/ETA/metadata: earlier placement wins, then id
        let bids = vec![bid("b", 5000, 30, 5), bid("a", 5000, 30, 5), bid("c", 5000, 30, 0)];
        let ranked = evaluate(&bids, &StrategyWeights::balanced());
        assert_eq!(ranked[0].bid_id, "c"); // earliest
        assert_eq!(ranked[1].bid_id, "a"); // same instant, id order
        assert_eq!(ranked[2].bid_id, "b");
    }

    #[test]
    fn test_scores_round_to_two_decimals() {
        let bids = vec![bid("a", 5000, 30, 0), bid("b", 5001, 31, 1), bid("c", 5003, 33, 2)];
        for scored in evaluate(&bids, &StrategyWeights::balanced()) {
            let scaled = scored.score * 100.0;
            assert!((scaled - scaled.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_skewed_weights_are_renormalized() {
        // weights sum to 2.0; renormalization keeps scores within 0..=100
        let skewed = StrategyWeights {
            price_weight: 1.0,
            eta_weight: 1.0,
            rating_weight: 0.0,
            reliability_weight: 0.0,
            distance_weight: 0.0,
        };
        let bids = vec![bid("a", 5000, 10, 0), bid("b", 9000, 50, 1)];
        let ranked = evaluate(&bids, &skewed);
        assert!(ranked.iter().all(|s| (0.0..=100.0).contains(&s.score)));
        assert_eq!(ranked[0].bid_id, "a");
        assert_eq!(ranked[0].score, 100.0);
    }

    #[test]
    fn test_preview_does_not_mutate() {
        let existing = vec![bid("a", 10000, 30, 0), bid("b", 12000, 25, 1)];
        let (rank, score) = preview(
            &existing,
            bid("candidate", 9000, 20, 2),
            &StrategyWeights::balanced(),
        );
        assert_eq!(rank, 1);
        assert!(score > 0.0);
        assert_eq!(existing.len(), 2);
    }

    #[test]
    fn test_empty_set() {
        assert!(evaluate(&[], &StrategyWeights::balanced()).is_empty());
    }
}
