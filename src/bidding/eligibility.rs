//! Porter eligibility checks.
//!
//! Placement consults the porter profile service: role, verification state,
//! suspension, and the window's optional filter predicate. The HTTP client is
//! the production implementation; a permissive stub backs tests and
//! deployments without a profile service configured.

use crate::bidding::error::BidError;
use crate::bidding::models::BiddingWindow;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait PorterEligibility: Send + Sync {
    /// Ok(()) when the porter may bid on this window.
    async fn check(&self, porter_id: &str, window: &BiddingWindow) -> Result<(), BidError>;
}

/// Profile shape returned by the porter service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PorterProfile {
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub rating: Option<f64>,
}

fn apply_filter(profile: &PorterProfile, window: &BiddingWindow) -> Result<(), BidError> {
    if profile.role != "PORTER" {
        return Err(BidError::PorterIneligible);
    }
    if profile.suspended {
        return Err(BidError::PorterIneligible);
    }
    let Some(filter) = &window.porter_filter else {
        return Ok(());
    };
    if filter.verified_only && !profile.verified {
        return Err(BidError::PorterIneligible);
    }
    if let Some(min_rating) = filter.min_rating {
        if profile.rating.unwrap_or(0.0) < min_rating {
            return Err(BidError::PorterIneligible);
        }
    }
    if let Some(allowed) = &filter.allowed_porter_ids {
        if !allowed.iter().any(|id| id == &profile.id) {
            return Err(BidError::PorterIneligible);
        }
    }
    Ok(())
}

pub struct HttpEligibility {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEligibility {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PorterEligibility for HttpEligibility {
    async fn check(&self, porter_id: &str, window: &BiddingWindow) -> Result<(), BidError> {
        let url = format!("{}/porters/{}/profile", self.base_url, porter_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| BidError::Upstream(format!("porter profile service: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BidError::PorterIneligible);
        }
        if !response.status().is_success() {
            return Err(BidError::Upstream(format!(
                "porter profile service returned {}",
                response.status()
            )));
        }
        let profile: PorterProfile = response
            .json()
            .await
            .map_err(|e| BidError::Upstream(format!("porter profile decode: {e}")))?;
        debug!(porter = porter_id, verified = profile.verified, "eligibility check");
        apply_filter(&profile, window)
    }
}

/// Allows every porter; still honors the window's explicit allow-list so
/// filtered windows behave sensibly without a profile service.
pub struct AllowAllEligibility;

#[async_trait]
impl PorterEligibility for AllowAllEligibility {
    async fn check(&self, porter_id: &str, window: &BiddingWindow) -> Result<(), BidError> {
        if let Some(filter) = &window.porter_filter {
            if let Some(allowed) = &filter.allowed_porter_ids {
                if !allowed.iter().any(|id| id == porter_id) {
                    return Err(BidError::PorterIneligible);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidding::models::{PorterFilter, WindowStatus};
    use chrono::Utc;

    fn window_with_filter(filter: Option<PorterFilter>) -> BiddingWindow {
        BiddingWindow {
            id: "w-1".into(),
            order_ids: vec!["o-1".into()],
            status: WindowStatus::Open,
            strategy_id: "balanced-v1".into(),
            minimum_bid_cents: 0,
            reserve_price_cents: None,
            porter_filter: filter,
            max_bids_per_porter: 3,
            open_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(300),
            closed_at: None,
            created_by: "u-1".into(),
            correlation_id: "c-1".into(),
        }
    }

    fn profile(verified: bool, rating: Option<f64>) -> PorterProfile {
        PorterProfile {
            id: "p-1".into(),
            role: "PORTER".into(),
            verified,
            suspended: false,
            rating,
        }
    }

    #[test]
    fn test_filter_verified_only() {
        let window = window_with_filter(Some(PorterFilter {
            verified_only: true,
            ..Default::default()
        }));
        assert!(apply_filter(&profile(true, None), &window).is_ok());
        assert!(apply_filter(&profile(false, None), &window).is_err());
    }

    #[test]
    fn test_filter_min_rating() {
        let window = window_with_filter(Some(PorterFilter {
            min_rating: Some(4.0),
            ..Default::default()
        }));
        assert!(apply_filter(&profile(true, Some(4.5)), &window).is_ok());
        assert!(apply_filter(&profile(true, Some(3.0)), &window).is_err());
        // unrated porters fail a rating floor
        assert!(apply_filter(&profile(true, None), &window).is_err());
    }

    #[test]
    fn test_suspended_and_wrong_role_rejected() {
        let window = window_with_filter(None);
        let mut suspended = profile(true, None);
        suspended.suspended = true;
        assert!(apply_filter(&suspended, &window).is_err());

        let mut customer = profile(true, None);
        customer.role = "CUSTOMER".into();
        assert!(apply_filter(&customer, &window).is_err());
    }

    #[tokio::test]
    async fn test_allow_all_honors_allow_list() {
        let open = window_with_filter(None);
        assert!(AllowAllEligibility.check("p-1", &open).await.is_ok());

        let restricted = window_with_filter(Some(PorterFilter {
            allowed_porter_ids: Some(vec!["p-2".into()]),
            ..Default::default()
        }));
        assert!(AllowAllEligibility.check("p-1", &restricted).await.is_err());
        assert!(AllowAllEligibility.check("p-2", &restricted).await.is_ok());
    }
}
