//! Bidding engine.
//!
//! Time-bounded auctions: porters place competing bids on customer orders, a
//! weighted multi-criteria strategy ranks them, exactly one bid is accepted
//! per window, and unaccepted bids expire atomically with window closure.

pub mod api;
pub mod db;
pub mod eligibility;
pub mod error;
pub mod models;
pub mod reactor;
pub mod reaper;
pub mod strategy;
pub mod windows;

pub use db::BiddingDb;
pub use eligibility::{AllowAllEligibility, HttpEligibility, PorterEligibility};
pub use error::BidError;
pub use models::{
    Bid, BidAuditEvent, BidStatus, BidStrategy, BiddingWindow, PorterFilter, PorterMetadata,
    StrategyWeights, WindowStatus,
};
pub use reactor::DomainEventReactor;
pub use reaper::ExpiryReaper;
pub use windows::BidWindowManager;
