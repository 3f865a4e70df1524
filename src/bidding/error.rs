//! Bidding error sum type.
//!
//! Business failures are values, not exceptions: every operation returns
//! `Result<T, BidError>` and the RPC layer translates variants to its wire
//! format. Retry guidance follows the taxonomy: validation/state errors are
//! final, `ConcurrentAccept` may be retried after backoff, `Upstream` is
//! retried at the adapter boundary before it ever reaches here.

use crate::store::{LockError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BidError {
    // validation
    #[error("{0}")]
    Validation(String),
    #[error("bid amount is below the window minimum")]
    BidTooLow,

    // authorization
    #[error("operation not permitted for this principal")]
    Forbidden,
    #[error("porter is not eligible for this window")]
    PorterIneligible,

    // state
    #[error("bidding window not found")]
    WindowNotFound,
    #[error("bidding window is not open")]
    WindowNotOpen,
    #[error("bidding window has expired")]
    WindowExpired,
    #[error("strategy is missing or inactive")]
    StrategyInactive,
    #[error("porter reached the bid limit for this window")]
    PorterLimit,
    #[error("bid not found")]
    BidNotFound,
    #[error("bid belongs to a different window")]
    BidWrongWindow,
    #[error("bid is not in PLACED state")]
    BidNotPlaced,
    #[error("bid is already terminal")]
    BidTerminal,

    // concurrency
    #[error("another accept is in flight for this window")]
    ConcurrentAccept,

    // downstream
    #[error("upstream dependency unavailable: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BidError {
    /// Stable machine-readable code for the RPC surface and audit payloads.
    pub fn code(&self) -> &'static str {
        match self {
            BidError::Validation(_) => "VALIDATION",
            BidError::BidTooLow => "BID_TOO_LOW",
            BidError::Forbidden => "FORBIDDEN",
            BidError::PorterIneligible => "PORTER_INELIGIBLE",
            BidError::WindowNotFound => "WINDOW_NOT_FOUND",
            BidError::WindowNotOpen => "WINDOW_NOT_OPEN",
            BidError::WindowExpired => "WINDOW_EXPIRED",
            BidError::StrategyInactive => "STRATEGY_INACTIVE",
            BidError::PorterLimit => "PORTER_LIMIT",
            BidError::BidNotFound => "BID_NOT_FOUND",
            BidError::BidWrongWindow => "BID_WRONG_WINDOW",
            BidError::BidNotPlaced => "BID_NOT_PLACED",
            BidError::BidTerminal => "BID_TERMINAL",
            BidError::ConcurrentAccept => "CONCURRENT_ACCEPT",
            BidError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            BidError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<StoreError> for BidError {
    fn from(value: StoreError) -> Self {
        BidError::Upstream(value.to_string())
    }
}

impl From<LockError> for BidError {
    fn from(value: LockError) -> Self {
        match value {
            LockError::Contended => BidError::ConcurrentAccept,
            LockError::Store(e) => BidError::Upstream(e.to_string()),
        }
    }
}

impl From<rusqlite::Error> for BidError {
    fn from(value: rusqlite::Error) -> Self {
        BidError::Internal(anyhow::Error::new(value).context("bidding database error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(BidError::BidTooLow.code(), "BID_TOO_LOW");
        assert_eq!(BidError::ConcurrentAccept.code(), "CONCURRENT_ACCEPT");
        assert_eq!(
            BidError::Upstream("redis".into()).code(),
            "UPSTREAM_UNAVAILABLE"
        );
    }

    #[test]
    fn test_lock_contention_maps_to_concurrent_accept() {
        let err: BidError = LockError::Contended.into();
        assert!(matches!(err, BidError::ConcurrentAccept));
    }
}
