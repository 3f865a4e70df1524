//! Bidding window lifecycle.
//!
//! Open, place, accept, cancel, close. Winner selection is serialized per
//! window by the distributed `accept:<windowId>` lock; everything the accept
//! touches moves in one database transaction, so concurrent accepts see
//! exactly one winner and the rest surface `CONCURRENT_ACCEPT` or a state
//! error.

use crate::bidding::db::{AcceptResult, BiddingDb, BiddingStatistics, CloseResult};
use crate::bidding::eligibility::PorterEligibility;
use crate::bidding::error::BidError;
use crate::bidding::models::{
    Bid, BidStatus, BidStrategy, BiddingWindow, PorterFilter, PorterMetadata, WindowStatus,
};
use crate::bidding::strategy::{self, BidInput};
use crate::config::BiddingConfig;
use crate::eventlog::{publish_event, EventLog};
use crate::events::{DomainEvent, EventEnvelope, WindowConfigPayload, WindowOutcome};
use crate::store::{DistributedLock, EphemeralStore};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIN_WINDOW_DURATION_SEC: u64 = 10;
const MAX_WINDOW_DURATION_SEC: u64 = 3600;
const MIN_ETA_MINUTES: i64 = 1;
const MAX_ETA_MINUTES: i64 = 480;
const CACHE_GRACE_SEC: u64 = 60;

#[derive(Debug, Clone)]
pub struct OpenWindowParams {
    pub order_ids: Vec<String>,
    pub duration_sec: u64,
    pub strategy_id: String,
    pub minimum_bid_cents: i64,
    pub reserve_price_cents: Option<i64>,
    pub porter_filter: Option<PorterFilter>,
    pub created_by: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone)]
pub struct PlaceBidParams {
    pub window_id: String,
    pub porter_id: String,
    pub amount_cents: i64,
    pub eta_minutes: i64,
    pub metadata: PorterMetadata,
    pub idempotency_key: String,
    pub correlation_id: String,
}

/// Placement result plus best-effort UI feedback. The rank is tentative: it
/// is computed outside any lock and may be stale by the time it renders.
#[derive(Debug)]
pub struct PlaceBidOutcome {
    pub bid: Bid,
    pub idempotent_replay: bool,
    pub top_bid_cents: Option<i64>,
    pub tentative_rank: Option<u32>,
}

pub struct BidWindowManager {
    db: Arc<BiddingDb>,
    store: Arc<dyn EphemeralStore>,
    log: Arc<dyn EventLog>,
    lock: DistributedLock,
    eligibility: Arc<dyn PorterEligibility>,
    config: BiddingConfig,
}

impl BidWindowManager {
    pub fn new(
        db: Arc<BiddingDb>,
        store: Arc<dyn EphemeralStore>,
        log: Arc<dyn EventLog>,
        eligibility: Arc<dyn PorterEligibility>,
        config: BiddingConfig,
    ) -> Self {
        let lock = DistributedLock::new(store.clone());
        Self {
            db,
            store,
            log,
            lock,
            eligibility,
            config,
        }
    }

    pub fn db(&self) -> &Arc<BiddingDb> {
        &self.db
    }

    fn cache_key(window_id: &str) -> String {
        format!("window:{window_id}")
    }

    fn accept_lock_key(window_id: &str) -> String {
        format!("accept:{window_id}")
    }

    async fn cache_window(&self, window: &BiddingWindow) {
        let remaining = (window.expires_at - Utc::now()).num_seconds().max(0) as u64;
        let ttl = Duration::from_secs(remaining + CACHE_GRACE_SEC);
        if let Ok(json) = serde_json::to_string(window) {
            if let Err(e) = self.store.set_ex(&Self::cache_key(&window.id), &json, ttl).await {
                debug!(window = %window.id, error = %e, "window cache write failed");
            }
        }
    }

    async fn drop_cached_window(&self, window_id: &str) {
        if let Err(e) = self.store.del(&Self::cache_key(window_id)).await {
            debug!(window = window_id, error = %e, "window cache delete failed");
        }
    }

    /// Cache first, then the store of record.
    async fn load_window(&self, window_id: &str) -> Result<BiddingWindow, BidError> {
        if let Ok(Some(json)) = self.store.get(&Self::cache_key(window_id)).await {
            if let Ok(window) = serde_json::from_str::<BiddingWindow>(&json) {
                return Ok(window);
            }
        }
        let window = self
            .db
            .get_window(window_id)?
            .ok_or(BidError::WindowNotFound)?;
        if window.status == WindowStatus::Open {
            self.cache_window(&window).await;
        }
        Ok(window)
    }

    async fn emit(&self, event: DomainEvent, correlation_id: &str) {
        let envelope = EventEnvelope::new(event, correlation_id);
        if let Err(e) = publish_event(self.log.as_ref(), &envelope).await {
            warn!(
                event_type = envelope.type_name(),
                correlation_id,
                error = %e,
                "domain event publish failed"
            );
        }
    }

    fn active_strategy(&self, strategy_id: &str) -> Result<BidStrategy, BidError> {
        let strategy = self
            .db
            .get_strategy(strategy_id)?
            .ok_or(BidError::StrategyInactive)?;
        if !strategy.active {
            return Err(BidError::StrategyInactive);
        }
        Ok(strategy)
    }

    // ----- operations -----

    pub async fn open_window(&self, params: OpenWindowParams) -> Result<BiddingWindow, BidError> {
        if params.order_ids.is_empty() {
            return Err(BidError::Validation("orderIds must be non-empty".into()));
        }
        if !(MIN_WINDOW_DURATION_SEC..=MAX_WINDOW_DURATION_SEC).contains(&params.duration_sec) {
            return Err(BidError::Validation(format!(
                "durationSec must be within [{MIN_WINDOW_DURATION_SEC}, {MAX_WINDOW_DURATION_SEC}]"
            )));
        }
        if params.minimum_bid_cents < 0 {
            return Err(BidError::Validation(
                "minimumBidCents must be non-negative".into(),
            ));
        }
        let strategy = self.active_strategy(&params.strategy_id)?;

        let now = Utc::now();
        let window = BiddingWindow {
            id: Uuid::new_v4().to_string(),
            order_ids: params.order_ids,
            status: WindowStatus::Open,
            strategy_id: strategy.id.clone(),
            minimum_bid_cents: params.minimum_bid_cents,
            reserve_price_cents: params.reserve_price_cents,
            porter_filter: params.porter_filter,
            max_bids_per_porter: self.config.max_bids_per_porter,
            open_at: now,
            expires_at: now + ChronoDuration::seconds(params.duration_sec as i64),
            closed_at: None,
            created_by: params.created_by,
            correlation_id: params.correlation_id,
        };
        self.db.insert_window(&window)?;
        self.cache_window(&window).await;
        metrics::increment_gauge!("bidding_active_windows", 1.0);
        metrics::counter!("bidding_windows_opened_total", 1);

        self.emit(
            DomainEvent::BidWindowOpened {
                window_id: window.id.clone(),
                order_ids: window.order_ids.clone(),
                expires_at: window.expires_at,
                strategy_id: window.strategy_id.clone(),
                configuration: WindowConfigPayload {
                    minimum_bid_cents: window.minimum_bid_cents,
                    reserve_price_cents: window.reserve_price_cents,
                    max_bids_per_porter: window.max_bids_per_porter,
                },
            },
            &window.correlation_id,
        )
        .await;

        info!(
            window = %window.id,
            orders = window.order_ids.len(),
            duration_sec = params.duration_sec,
            "bidding window opened"
        );
        Ok(window)
    }

    pub async fn place_bid(&self, params: PlaceBidParams) -> Result<PlaceBidOutcome, BidError> {
        // idempotency: a repeated key returns the original with no side effects
        if let Some(existing) = self.db.find_bid_by_idempotency_key(&params.idempotency_key)? {
            return Ok(PlaceBidOutcome {
                bid: existing,
                idempotent_replay: true,
                top_bid_cents: None,
                tentative_rank: None,
            });
        }

        if params.amount_cents < 0 {
            return Err(BidError::Validation("amountCents must be non-negative".into()));
        }
        if !(MIN_ETA_MINUTES..=MAX_ETA_MINUTES).contains(&params.eta_minutes) {
            return Err(BidError::Validation(format!(
                "etaMinutes must be within [{MIN_ETA_MINUTES}, {MAX_ETA_MINUTES}]"
            )));
        }

        let window = self.load_window(&params.window_id).await?;
        if window.status != WindowStatus::Open {
            return Err(BidError::WindowNotOpen);
        }
        let now = Utc::now();
        if window.is_expired(now) {
            return Err(BidError::WindowExpired);
        }
        if params.amount_cents < window.minimum_bid_cents {
            return Err(BidError::BidTooLow);
        }
        let live = self.db.count_live_bids(&window.id, &params.porter_id)?;
        if live >= window.max_bids_per_porter {
            return Err(BidError::PorterLimit);
        }
        self.eligibility.check(&params.porter_id, &window).await?;

        let bid = Bid {
            id: Uuid::new_v4().to_string(),
            window_id: window.id.clone(),
            porter_id: params.porter_id.clone(),
            amount_cents: params.amount_cents,
            eta_minutes: params.eta_minutes,
            status: BidStatus::Placed,
            placed_at: now,
            accepted_at: None,
            cancelled_at: None,
            expired_at: None,
            idempotency_key: params.idempotency_key.clone(),
            cancel_reason: None,
            accepted_by: None,
            metadata: params.metadata,
            correlation_id: params.correlation_id,
        };
        let inserted = self.db.insert_bid(&bid)?;
        let bid = if inserted {
            bid
        } else {
            // lost the UNIQUE race on the idempotency key; return the winner
            return Ok(PlaceBidOutcome {
                bid: self
                    .db
                    .find_bid_by_idempotency_key(&params.idempotency_key)?
                    .ok_or_else(|| {
                        BidError::Internal(anyhow::anyhow!(
                            "idempotency key vanished between insert and lookup"
                        ))
                    })?,
                idempotent_replay: true,
                top_bid_cents: None,
                tentative_rank: None,
            });
        };

        metrics::counter!("bids_placed_total", 1);
        let total = self.db.count_bids(&window.id)?;
        if total == 1 {
            let to_first = (now - window.open_at).num_milliseconds().max(0) as f64 / 1000.0;
            metrics::histogram!("bidding_time_to_first_bid_seconds", to_first);
        }

        self.emit(
            DomainEvent::BidPlaced {
                bid_id: bid.id.clone(),
                window_id: window.id.clone(),
                porter_id: bid.porter_id.clone(),
                amount_cents: bid.amount_cents,
                eta_minutes: bid.eta_minutes,
                placed_at: bid.placed_at,
            },
            &window.correlation_id,
        )
        .await;

        // best-effort feedback, not serialized with other placements
        let (top_bid_cents, tentative_rank) = self.rank_feedback(&window, &bid).await;

        Ok(PlaceBidOutcome {
            bid,
            idempotent_replay: false,
            top_bid_cents,
            tentative_rank,
        })
    }

    async fn rank_feedback(&self, window: &BiddingWindow, bid: &Bid) -> (Option<i64>, Option<u32>) {
        let strategy = match self.active_strategy(&window.strategy_id) {
            Ok(s) => s,
            Err(_) => return (None, None),
        };
        let placed = match self.db.placed_bids_for_window(&window.id) {
            Ok(bids) => bids,
            Err(_) => return (None, None),
        };
        let inputs: Vec<BidInput> = placed.iter().map(BidInput::from).collect();
        let ranked = strategy::evaluate(&inputs, &strategy.weights);
        let top_amount = ranked.first().map(|s| s.amount_cents);
        let own = ranked.iter().find(|s| s.bid_id == bid.id);
        if let Some(scored) = own {
            let _ = self.db.append_audit(
                &bid.id,
                crate::bidding::models::AuditKind::Evaluated,
                serde_json::json!({ "rank": scored.rank, "score": scored.score }),
                "system",
                &bid.correlation_id,
            );
        }
        (top_amount, own.map(|s| s.rank))
    }

    /// The critical race-safe operation.
    pub async fn accept_bid(
        &self,
        window_id: &str,
        bid_id: &str,
        accepted_by: &str,
        correlation_id: &str,
    ) -> Result<AcceptResult, BidError> {
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_sec.max(1));
        let result = self
            .lock
            .with_lock(&Self::accept_lock_key(window_id), lock_ttl, || async {
                self.db.accept_bid(window_id, bid_id, accepted_by, correlation_id)
            })
            .await?;
        let accepted = result?;

        self.drop_cached_window(window_id).await;
        metrics::decrement_gauge!("bidding_active_windows", 1.0);
        metrics::counter!("bids_accepted_total", 1);
        let open_to_accept = (Utc::now() - accepted.window.open_at)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        metrics::histogram!("bidding_open_to_accept_seconds", open_to_accept);

        let correlation = accepted.window.correlation_id.clone();
        self.emit(
            DomainEvent::BidAccepted {
                bid_id: accepted.bid.id.clone(),
                window_id: accepted.window.id.clone(),
                porter_id: accepted.bid.porter_id.clone(),
                amount_cents: accepted.bid.amount_cents,
                accepted_at: accepted.bid.accepted_at.unwrap_or_else(Utc::now),
                accepted_by: accepted_by.to_string(),
            },
            &correlation,
        )
        .await;
        // dispatcher-facing enrichment; exactly one per window over its
        // lifetime because the accept transaction commits at most once
        self.emit(
            DomainEvent::BidWinnerSelected {
                window_id: accepted.window.id.clone(),
                bid_id: accepted.bid.id.clone(),
                order_ids: accepted.window.order_ids.clone(),
                winner_porter_id: accepted.bid.porter_id.clone(),
                winning_amount_cents: accepted.bid.amount_cents,
            },
            &correlation,
        )
        .await;

        info!(
            window = window_id,
            bid = bid_id,
            porter = %accepted.bid.porter_id,
            expired_siblings = accepted.expired_bids.len(),
            "bid accepted, window closed"
        );
        Ok(accepted)
    }

    pub async fn cancel_bid(
        &self,
        bid_id: &str,
        reason: &str,
        actor: &str,
        correlation_id: &str,
    ) -> Result<Bid, BidError> {
        let bid = self.db.cancel_bid(bid_id, reason, actor, correlation_id)?;
        metrics::counter!("bids_cancelled_total", 1);
        self.emit(
            DomainEvent::BidCancelled {
                bid_id: bid.id.clone(),
                window_id: bid.window_id.clone(),
                porter_id: bid.porter_id.clone(),
                reason: reason.to_string(),
            },
            &bid.correlation_id,
        )
        .await;
        Ok(bid)
    }

    /// Explicit close (admin RPC). Emits only `BidClosed`; the reaper's
    /// expiry path wraps this with `BidExpired`.
    pub async fn close_window(&self, window_id: &str) -> Result<CloseResult, BidError> {
        let closed = self.db.close_window(window_id)?;
        self.finish_closed_window(&closed).await;
        self.emit(
            DomainEvent::BidClosed {
                window_id: closed.window.id.clone(),
                order_ids: closed.window.order_ids.clone(),
                outcome: closed.outcome,
            },
            &closed.window.correlation_id,
        )
        .await;
        Ok(closed)
    }

    /// Close under the window's accept lock. Used by the reactor when an
    /// `OrderAssigned` arrives for an order that is still being auctioned, so
    /// the forced close serializes with any in-flight `accept_bid`.
    pub async fn close_window_locked(&self, window_id: &str) -> Result<CloseResult, BidError> {
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_sec.max(1));
        let result = self
            .lock
            .with_lock(&Self::accept_lock_key(window_id), lock_ttl, || async {
                self.db.close_window(window_id)
            })
            .await?;
        let closed = result?;
        self.finish_closed_window(&closed).await;
        self.emit(
            DomainEvent::BidClosed {
                window_id: closed.window.id.clone(),
                order_ids: closed.window.order_ids.clone(),
                outcome: closed.outcome,
            },
            &closed.window.correlation_id,
        )
        .await;
        Ok(closed)
    }

    /// Cancel an open window because its order was cancelled externally.
    pub async fn cancel_window(
        &self,
        window_id: &str,
        reason: &str,
    ) -> Result<bool, BidError> {
        let Some(cancelled) = self.db.cancel_window(window_id, reason)? else {
            return Ok(false);
        };
        self.drop_cached_window(window_id).await;
        metrics::decrement_gauge!("bidding_active_windows", 1.0);

        for bid in &cancelled.cancelled_bids {
            metrics::counter!("bids_cancelled_total", 1);
            self.emit(
                DomainEvent::BidCancelled {
                    bid_id: bid.id.clone(),
                    window_id: window_id.to_string(),
                    porter_id: bid.porter_id.clone(),
                    reason: reason.to_string(),
                },
                &cancelled.window.correlation_id,
            )
            .await;
        }
        self.emit(
            DomainEvent::BidClosed {
                window_id: window_id.to_string(),
                order_ids: cancelled.window.order_ids.clone(),
                outcome: WindowOutcome::Cancelled,
            },
            &cancelled.window.correlation_id,
        )
        .await;
        Ok(true)
    }

    /// Cancel every PLACED bid held by a suspended porter.
    pub async fn cancel_porter_bids(
        &self,
        porter_id: &str,
        reason: &str,
        correlation_id: &str,
    ) -> Result<Vec<Bid>, BidError> {
        let cancelled = self
            .db
            .cancel_bids_for_porter(porter_id, reason, correlation_id)?;
        for bid in &cancelled {
            metrics::counter!("bids_cancelled_total", 1);
            self.emit(
                DomainEvent::BidCancelled {
                    bid_id: bid.id.clone(),
                    window_id: bid.window_id.clone(),
                    porter_id: bid.porter_id.clone(),
                    reason: reason.to_string(),
                },
                &bid.correlation_id,
            )
            .await;
        }
        Ok(cancelled)
    }

    /// Deadline expiry: the close-and-expire transaction plus the
    /// `BidExpired` / `BidClosed` pair.
    pub async fn expire_window(&self, window_id: &str) -> Result<CloseResult, BidError> {
        let closed = self.db.close_window(window_id)?;
        self.finish_closed_window(&closed).await;
        let correlation = closed.window.correlation_id.clone();
        self.emit(
            DomainEvent::BidExpired {
                window_id: closed.window.id.clone(),
                order_ids: closed.window.order_ids.clone(),
                total_bids: closed.total_bids,
                expired_at: closed.window.closed_at.unwrap_or_else(Utc::now),
            },
            &correlation,
        )
        .await;
        self.emit(
            DomainEvent::BidClosed {
                window_id: closed.window.id.clone(),
                order_ids: closed.window.order_ids.clone(),
                outcome: closed.outcome,
            },
            &correlation,
        )
        .await;
        metrics::counter!("bidding_windows_expired_total", 1);
        Ok(closed)
    }

    async fn finish_closed_window(&self, closed: &CloseResult) {
        self.drop_cached_window(&closed.window.id).await;
        metrics::decrement_gauge!("bidding_active_windows", 1.0);
        for _ in &closed.expired_bids {
            metrics::counter!("bids_expired_total", 1);
        }
    }

    pub async fn preview_bid(
        &self,
        window_id: &str,
        amount_cents: i64,
        eta_minutes: i64,
        metadata: PorterMetadata,
    ) -> Result<(u32, f64), BidError> {
        let window = self.load_window(window_id).await?;
        if window.status != WindowStatus::Open {
            return Err(BidError::WindowNotOpen);
        }
        let strategy = self.active_strategy(&window.strategy_id)?;
        let placed = self.db.placed_bids_for_window(&window.id)?;
        let inputs: Vec<BidInput> = placed.iter().map(BidInput::from).collect();
        let candidate = BidInput {
            bid_id: "preview".to_string(),
            porter_id: "preview".to_string(),
            amount_cents,
            eta_minutes,
            placed_at: Utc::now(),
            metadata,
        };
        Ok(strategy::preview(&inputs, candidate, &strategy.weights))
    }

    pub async fn get_window(&self, window_id: &str) -> Result<BiddingWindow, BidError> {
        self.load_window(window_id).await
    }

    pub fn get_bid(&self, bid_id: &str) -> Result<Option<Bid>, BidError> {
        self.db.get_bid(bid_id)
    }

    pub fn active_bids_for_order(
        &self,
        order_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Bid>, u64), BidError> {
        self.db.active_bids_for_order(order_id, page, page_size)
    }

    pub fn bids_for_porter(
        &self,
        porter_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Bid>, u64), BidError> {
        self.db.bids_for_porter(porter_id, page, page_size)
    }

    pub fn statistics(&self) -> Result<BiddingStatistics, BidError> {
        self.db.statistics()
    }

    pub fn list_strategies(&self) -> Result<Vec<BidStrategy>, BidError> {
        self.db.list_strategies()
    }

    pub fn create_strategy(&self, strategy: &BidStrategy) -> Result<(), BidError> {
        self.db.insert_strategy(strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidding::eligibility::AllowAllEligibility;
    use crate::eventlog::MemoryEventLog;
    use crate::events::topics;
    use crate::store::MemoryStore;

    fn manager() -> (BidWindowManager, Arc<MemoryEventLog>, Arc<MemoryStore>) {
        let db = Arc::new(BiddingDb::open_in_memory().unwrap());
        db.seed_default_strategy("balanced-v1").unwrap();
        let store = Arc::new(MemoryStore::new());
        let log = Arc::new(MemoryEventLog::new());
        let config = BiddingConfig::default();
        let manager = BidWindowManager::new(
            db,
            store.clone(),
            log.clone(),
            Arc::new(AllowAllEligibility),
            config,
        );
        (manager, log, store)
    }

    fn open_params(corr: &str) -> OpenWindowParams {
        OpenWindowParams {
            order_ids: vec!["o-1".to_string()],
            duration_sec: 300,
            strategy_id: "balanced-v1".to_string(),
            minimum_bid_cents: 5000,
            reserve_price_cents: None,
            porter_filter: None,
            created_by: "u-1".to_string(),
            correlation_id: corr.to_string(),
        }
    }

    fn place_params(window_id: &str, porter: &str, amount: i64, key: &str) -> PlaceBidParams {
        PlaceBidParams {
            window_id: window_id.to_string(),
            porter_id: porter.to_string(),
            amount_cents: amount,
            eta_minutes: 30,
            metadata: PorterMetadata::default(),
            idempotency_key: key.to_string(),
            correlation_id: format!("corr-{key}"),
        }
    }

    #[tokio::test]
    async fn test_open_validates_inputs() {
        let (manager, _, _) = manager();

        let mut no_orders = open_params("c");
        no_orders.order_ids.clear();
        assert!(matches!(
            manager.open_window(no_orders).await.unwrap_err(),
            BidError::Validation(_)
        ));

        let mut too_short = open_params("c");
        too_short.duration_sec = 5;
        assert!(matches!(
            manager.open_window(too_short).await.unwrap_err(),
            BidError::Validation(_)
        ));

        let mut bad_strategy = open_params("c");
        bad_strategy.strategy_id = "nope".to_string();
        assert!(matches!(
            manager.open_window(bad_strategy).await.unwrap_err(),
            BidError::StrategyInactive
        ));
    }

    #[tokio::test]
    async fn test_happy_path_event_order() {
        let (manager, log, _) = manager();
        let window = manager.open_window(open_params("corr-e1")).await.unwrap();

        let first = manager
            .place_bid(place_params(&window.id, "p-1", 10_000, "k1"))
            .await
            .unwrap();
        manager
            .place_bid(place_params(&window.id, "p-2", 12_000, "k2"))
            .await
            .unwrap();

        let accepted = manager
            .accept_bid(&window.id, &first.bid.id, "u-1", "corr-accept")
            .await
            .unwrap();
        assert_eq!(accepted.bid.status, BidStatus::Accepted);
        assert_eq!(accepted.expired_bids.len(), 1);
        assert_eq!(accepted.window.status, WindowStatus::Closed);

        let emitted: Vec<&'static str> = log
            .published_for(topics::BIDDING, "corr-e1")
            .iter()
            .map(|e| e.type_name())
            .collect();
        assert_eq!(
            emitted,
            vec![
                "BidWindowOpened",
                "BidPlaced",
                "BidPlaced",
                "BidAccepted",
                "BidWinnerSelected"
            ]
        );
        assert_eq!(log.count_of(topics::BIDDING, "BidWinnerSelected"), 1);
    }

    #[tokio::test]
    async fn test_place_idempotency() {
        let (manager, log, _) = manager();
        let window = manager.open_window(open_params("corr")).await.unwrap();

        let first = manager
            .place_bid(place_params(&window.id, "p-1", 10_000, "k1"))
            .await
            .unwrap();
        assert!(!first.idempotent_replay);

        let replay = manager
            .place_bid(place_params(&window.id, "p-1", 10_000, "k1"))
            .await
            .unwrap();
        assert!(replay.idempotent_replay);
        assert_eq!(replay.bid.id, first.bid.id);
        assert_eq!(log.count_of(topics::BIDDING, "BidPlaced"), 1);
    }

    #[tokio::test]
    async fn test_minimum_bid_enforced() {
        let (manager, _, _) = manager();
        let window = manager.open_window(open_params("corr")).await.unwrap();
        let err = manager
            .place_bid(place_params(&window.id, "p-1", 4_999, "k1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BidError::BidTooLow));
    }

    #[tokio::test]
    async fn test_porter_limit() {
        let (manager, _, _) = manager();
        let window = manager.open_window(open_params("corr")).await.unwrap();
        for i in 0..3 {
            manager
                .place_bid(place_params(&window.id, "p-1", 10_000 + i, &format!("k{i}")))
                .await
                .unwrap();
        }
        let err = manager
            .place_bid(place_params(&window.id, "p-1", 20_000, "k-extra"))
            .await
            .unwrap_err();
        assert!(matches!(err, BidError::PorterLimit));
    }

    #[tokio::test]
    async fn test_eta_bounds() {
        let (manager, _, _) = manager();
        let window = manager.open_window(open_params("corr")).await.unwrap();
        let mut params = place_params(&window.id, "p-1", 10_000, "k1");
        params.eta_minutes = 0;
        assert!(matches!(
            manager.place_bid(params).await.unwrap_err(),
            BidError::Validation(_)
        ));
        let mut params = place_params(&window.id, "p-1", 10_000, "k2");
        params.eta_minutes = 481;
        assert!(matches!(
            manager.place_bid(params).await.unwrap_err(),
            BidError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_rank_feedback_on_placement() {
        let (manager, _, _) = manager();
        let window = manager.open_window(open_params("corr")).await.unwrap();
        manager
            .place_bid(place_params(&window.id, "p-1", 12_000, "k1"))
            .await
            .unwrap();
        let better = manager
            .place_bid(place_params(&window.id, "p-2", 9_000, "k2"))
            .await
            .unwrap();
        assert_eq!(better.tentative_rank, Some(1));
        assert_eq!(better.top_bid_cents, Some(9_000));
    }

    #[tokio::test]
    async fn test_concurrent_accept_single_winner() {
        let (manager, log, _) = manager();
        let manager = Arc::new(manager);
        let window = manager.open_window(open_params("corr-race")).await.unwrap();
        let b1 = manager
            .place_bid(place_params(&window.id, "p-1", 10_000, "k1"))
            .await
            .unwrap()
            .bid;
        let b2 = manager
            .place_bid(place_params(&window.id, "p-2", 12_000, "k2"))
            .await
            .unwrap()
            .bid;

        let mut handles = Vec::new();
        for bid_id in [b1.id.clone(), b2.id.clone()] {
            let manager = manager.clone();
            let window_id = window.id.clone();
            handles.push(tokio::spawn(async move {
                manager.accept_bid(&window_id, &bid_id, "u-1", "corr").await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(e) => assert!(
                    matches!(
                        e,
                        BidError::ConcurrentAccept
                            | BidError::WindowNotOpen
                            | BidError::BidNotPlaced
                    ),
                    "unexpected loser error: {e:?}"
                ),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(log.count_of(topics::BIDDING, "BidWinnerSelected"), 1);
    }

    #[tokio::test]
    async fn test_expire_window_emits_pair() {
        let (manager, log, _) = manager();
        let window = manager.open_window(open_params("corr-exp")).await.unwrap();
        let closed = manager.expire_window(&window.id).await.unwrap();
        assert_eq!(closed.outcome, WindowOutcome::NoBids);

        let emitted: Vec<&'static str> = log
            .published_for(topics::BIDDING, "corr-exp")
            .iter()
            .map(|e| e.type_name())
            .collect();
        assert_eq!(emitted, vec!["BidWindowOpened", "BidExpired", "BidClosed"]);
    }

    #[tokio::test]
    async fn test_preview_leaves_no_trace() {
        let (manager, _, _) = manager();
        let window = manager.open_window(open_params("corr")).await.unwrap();
        manager
            .place_bid(place_params(&window.id, "p-1", 10_000, "k1"))
            .await
            .unwrap();

        let (rank, score) = manager
            .preview_bid(&window.id, 8_000, 20, PorterMetadata::default())
            .await
            .unwrap();
        assert_eq!(rank, 1);
        assert!(score > 0.0);

        let (bids, total) = manager.active_bids_for_order("o-1", 1, 10).unwrap();
        assert_eq!(total, 1);
        assert_eq!(bids.len(), 1);
    }
}
