//! Bidding domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindowStatus {
    Open,
    Closed,
    Cancelled,
}

impl WindowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowStatus::Open => "OPEN",
            WindowStatus::Closed => "CLOSED",
            WindowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OPEN" => Some(WindowStatus::Open),
            "CLOSED" => Some(WindowStatus::Closed),
            "CANCELLED" => Some(WindowStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WindowStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BidStatus {
    Placed,
    Accepted,
    Cancelled,
    Expired,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Placed => "PLACED",
            BidStatus::Accepted => "ACCEPTED",
            BidStatus::Cancelled => "CANCELLED",
            BidStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLACED" => Some(BidStatus::Placed),
            "ACCEPTED" => Some(BidStatus::Accepted),
            "CANCELLED" => Some(BidStatus::Cancelled),
            "EXPIRED" => Some(BidStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BidStatus::Placed)
    }
}

/// Optional predicate restricting which porters may bid on a window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PorterFilter {
    #[serde(default)]
    pub min_rating: Option<f64>,
    #[serde(default)]
    pub verified_only: bool,
    #[serde(default)]
    pub allowed_porter_ids: Option<Vec<String>>,
}

/// One auction. A window may cover a bundle of orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiddingWindow {
    pub id: String,
    pub order_ids: Vec<String>,
    pub status: WindowStatus,
    pub strategy_id: String,
    pub minimum_bid_cents: i64,
    pub reserve_price_cents: Option<i64>,
    pub porter_filter: Option<PorterFilter>,
    pub max_bids_per_porter: u32,
    pub open_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub correlation_id: String,
}

impl BiddingWindow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Porter-supplied scoring metadata attached at placement time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PorterMetadata {
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub reliability: Option<f64>,
    #[serde(default)]
    pub distance_meters: Option<f64>,
}

impl PorterMetadata {
    pub fn is_empty(&self) -> bool {
        self.rating.is_none() && self.reliability.is_none() && self.distance_meters.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub id: String,
    pub window_id: String,
    pub porter_id: String,
    pub amount_cents: i64,
    pub eta_minutes: i64,
    pub status: BidStatus,
    pub placed_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub cancel_reason: Option<String>,
    pub accepted_by: Option<String>,
    #[serde(default)]
    pub metadata: PorterMetadata,
    pub correlation_id: String,
}

impl Bid {
    /// The timestamp matching the terminal status, if terminal.
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            BidStatus::Placed => None,
            BidStatus::Accepted => self.accepted_at,
            BidStatus::Cancelled => self.cancelled_at,
            BidStatus::Expired => self.expired_at,
        }
    }
}

/// Parameter vector of a strategy. All weights in [0, 1], summing to 1
/// within ±0.01 at creation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyWeights {
    pub price_weight: f64,
    pub eta_weight: f64,
    pub rating_weight: f64,
    pub reliability_weight: f64,
    pub distance_weight: f64,
}

pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

impl StrategyWeights {
    pub fn balanced() -> Self {
        Self {
            price_weight: 0.30,
            eta_weight: 0.25,
            rating_weight: 0.20,
            reliability_weight: 0.15,
            distance_weight: 0.10,
        }
    }

    pub fn sum(&self) -> f64 {
        self.price_weight
            + self.eta_weight
            + self.rating_weight
            + self.reliability_weight
            + self.distance_weight
    }

    pub fn validate(&self) -> Result<(), String> {
        let all = [
            ("priceWeight", self.price_weight),
            ("etaWeight", self.eta_weight),
            ("ratingWeight", self.rating_weight),
            ("reliabilityWeight", self.reliability_weight),
            ("distanceWeight", self.distance_weight),
        ];
        for (name, w) in all {
            if !(0.0..=1.0).contains(&w) {
                return Err(format!("{name} must be within [0, 1], got {w}"));
            }
        }
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(format!("weights must sum to 1.0 (±0.01), got {sum:.4}"));
        }
        Ok(())
    }

    /// Rescale so the weights sum to exactly 1. A row edited out-of-band can
    /// therefore never push composite scores off the weight simplex.
    pub fn normalized(&self) -> Self {
        let sum = self.sum();
        if sum <= f64::EPSILON {
            return Self::balanced();
        }
        Self {
            price_weight: self.price_weight / sum,
            eta_weight: self.eta_weight / sum,
            rating_weight: self.rating_weight / sum,
            reliability_weight: self.reliability_weight / sum,
            distance_weight: self.distance_weight / sum,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidStrategy {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub weights: StrategyWeights,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditKind {
    Placed,
    Accepted,
    Cancelled,
    Expired,
    Evaluated,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Placed => "PLACED",
            AuditKind::Accepted => "ACCEPTED",
            AuditKind::Cancelled => "CANCELLED",
            AuditKind::Expired => "EXPIRED",
            AuditKind::Evaluated => "EVALUATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLACED" => Some(AuditKind::Placed),
            "ACCEPTED" => Some(AuditKind::Accepted),
            "CANCELLED" => Some(AuditKind::Cancelled),
            "EXPIRED" => Some(AuditKind::Expired),
            "EVALUATED" => Some(AuditKind::Evaluated),
            _ => None,
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidAuditEvent {
    pub id: i64,
    pub bid_id: String,
    pub kind: AuditKind,
    pub payload: serde_json::Value,
    pub actor: String,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_validation() {
        assert!(StrategyWeights::balanced().validate().is_ok());

        let drifted = StrategyWeights {
            price_weight: 0.301,
            eta_weight: 0.25,
            rating_weight: 0.20,
            reliability_weight: 0.15,
            distance_weight: 0.10,
        };
        // within tolerance
        assert!(drifted.validate().is_ok());

        let broken = StrategyWeights {
            price_weight: 0.9,
            eta_weight: 0.9,
            rating_weight: 0.0,
            reliability_weight: 0.0,
            distance_weight: 0.0,
        };
        assert!(broken.validate().is_err());

        let out_of_range = StrategyWeights {
            price_weight: 1.2,
            eta_weight: -0.2,
            rating_weight: 0.0,
            reliability_weight: 0.0,
            distance_weight: 0.0,
        };
        assert!(out_of_range.validate().is_err());
    }

    #[test]
    fn test_normalized_rescales_drift() {
        let drifted = StrategyWeights {
            price_weight: 0.6,
            eta_weight: 0.6,
            rating_weight: 0.0,
            reliability_weight: 0.0,
            distance_weight: 0.0,
        };
        let normalized = drifted.normalized();
        assert!((normalized.sum() - 1.0).abs() < 1e-9);
        assert!((normalized.price_weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_status_round_trips() {
        for status in [
            BidStatus::Placed,
            BidStatus::Accepted,
            BidStatus::Cancelled,
            BidStatus::Expired,
        ] {
            assert_eq!(BidStatus::parse(status.as_str()), Some(status));
        }
        assert!(BidStatus::parse("bogus").is_none());
        assert!(BidStatus::Placed.is_terminal() == false);
        assert!(BidStatus::Expired.is_terminal());
    }
}
