//! Bidding RPC surface.
//!
//! JSON-over-HTTP operations mirroring the engine's public contract. The
//! bearer middleware attaches the [`Principal`]; handlers enforce role rules
//! (customer/admin open and accept, porters place and cancel their own,
//! admins close and read statistics) and translate [`BidError`] variants to
//! the wire format.

use crate::auth::{Principal, Role};
use crate::bidding::db::BiddingStatistics;
use crate::bidding::error::BidError;
use crate::bidding::models::{
    Bid, BidAuditEvent, BidStrategy, BiddingWindow, PorterFilter, PorterMetadata, StrategyWeights,
};
use crate::bidding::windows::{BidWindowManager, OpenWindowParams, PlaceBidParams};
use crate::config::BiddingConfig;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct BiddingApiState {
    pub manager: Arc<BidWindowManager>,
    pub defaults: BiddingConfig,
}

pub fn router(state: BiddingApiState) -> Router {
    Router::new()
        .route("/rpc/bidding.openWindow", post(open_window))
        .route("/rpc/bidding.placeBid", post(place_bid))
        .route("/rpc/bidding.acceptBid", post(accept_bid))
        .route("/rpc/bidding.cancelBid", post(cancel_bid))
        .route("/rpc/bidding.closeWindow", post(close_window))
        .route("/rpc/bidding.previewBidOutcome", post(preview_bid))
        .route("/rpc/bidding.window/:id", get(get_window))
        .route("/rpc/bidding.activeBidsForOrder", get(active_bids_for_order))
        .route("/rpc/bidding.myBids", get(my_bids))
        .route("/rpc/bidding.statistics", get(statistics))
        .route("/rpc/bidding.strategies", get(list_strategies).post(create_strategy))
        .route("/rpc/bidding.audit/:bidId", get(bid_audit))
        .with_state(state)
}

/// [`BidError`] → wire format.
pub struct ApiError(BidError);

impl From<BidError> for ApiError {
    fn from(value: BidError) -> Self {
        Self(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BidError::Validation(_) | BidError::BidTooLow => StatusCode::BAD_REQUEST,
            BidError::Forbidden | BidError::PorterIneligible => StatusCode::FORBIDDEN,
            BidError::WindowNotFound | BidError::BidNotFound => StatusCode::NOT_FOUND,
            BidError::WindowNotOpen
            | BidError::WindowExpired
            | BidError::StrategyInactive
            | BidError::PorterLimit
            | BidError::BidWrongWindow
            | BidError::BidNotPlaced
            | BidError::BidTerminal
            | BidError::ConcurrentAccept => StatusCode::CONFLICT,
            BidError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            BidError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // retry guidance: only lock contention is worth retrying
        let retryable = matches!(self.0, BidError::ConcurrentAccept | BidError::Upstream(_));
        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
            "retryable": retryable,
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn require(principal: &Principal, allowed: &[Role]) -> Result<(), ApiError> {
    if allowed.contains(&principal.role) {
        Ok(())
    } else {
        Err(BidError::Forbidden.into())
    }
}

fn correlation_or_new(correlation_id: Option<String>) -> String {
    correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string())
}

// ----- openWindow -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenWindowRequest {
    pub order_ids: Vec<String>,
    pub duration_sec: Option<u64>,
    pub strategy_id: Option<String>,
    pub minimum_bid_cents: Option<i64>,
    pub reserve_price_cents: Option<i64>,
    pub porter_filters: Option<PorterFilter>,
    pub correlation_id: Option<String>,
}

async fn open_window(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<OpenWindowRequest>,
) -> ApiResult<BiddingWindow> {
    require(&principal, &[Role::Customer, Role::Admin])?;
    let window = state
        .manager
        .open_window(OpenWindowParams {
            order_ids: req.order_ids,
            duration_sec: req
                .duration_sec
                .unwrap_or(state.defaults.default_window_duration_sec),
            strategy_id: req
                .strategy_id
                .unwrap_or_else(|| state.defaults.default_strategy_id.clone()),
            minimum_bid_cents: req
                .minimum_bid_cents
                .unwrap_or(state.defaults.default_min_bid_cents),
            reserve_price_cents: req.reserve_price_cents,
            porter_filter: req.porter_filters,
            created_by: principal.user_id,
            correlation_id: correlation_or_new(req.correlation_id),
        })
        .await?;
    Ok(Json(window))
}

// ----- placeBid -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBidRequest {
    pub window_id: String,
    pub amount_cents: i64,
    pub eta_minutes: i64,
    pub metadata: Option<PorterMetadata>,
    pub idempotency_key: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBidResponse {
    pub bid: Bid,
    pub idempotent_replay: bool,
    /// Best-effort UI feedback; not serialized with competing placements.
    pub top_bid_cents: Option<i64>,
    pub tentative_rank: Option<u32>,
}

async fn place_bid(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<PlaceBidRequest>,
) -> ApiResult<PlaceBidResponse> {
    require(&principal, &[Role::Porter])?;
    if req.idempotency_key.trim().is_empty() {
        return Err(BidError::Validation("idempotencyKey must be non-empty".into()).into());
    }
    let outcome = state
        .manager
        .place_bid(PlaceBidParams {
            window_id: req.window_id,
            porter_id: principal.user_id,
            amount_cents: req.amount_cents,
            eta_minutes: req.eta_minutes,
            metadata: req.metadata.unwrap_or_default(),
            idempotency_key: req.idempotency_key,
            correlation_id: correlation_or_new(req.correlation_id),
        })
        .await?;
    Ok(Json(PlaceBidResponse {
        bid: outcome.bid,
        idempotent_replay: outcome.idempotent_replay,
        top_bid_cents: outcome.top_bid_cents,
        tentative_rank: outcome.tentative_rank,
    }))
}

// ----- acceptBid -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBidRequest {
    pub window_id: String,
    pub bid_id: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptBidResponse {
    pub window: BiddingWindow,
    pub bid: Bid,
    pub expired_bid_count: usize,
}

async fn accept_bid(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AcceptBidRequest>,
) -> ApiResult<AcceptBidResponse> {
    require(&principal, &[Role::Customer, Role::Admin])?;
    let correlation = correlation_or_new(req.correlation_id);
    let result = state
        .manager
        .accept_bid(&req.window_id, &req.bid_id, &principal.user_id, &correlation)
        .await?;
    Ok(Json(AcceptBidResponse {
        window: result.window,
        bid: result.bid,
        expired_bid_count: result.expired_bids.len(),
    }))
}

// ----- cancelBid -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBidRequest {
    pub bid_id: String,
    pub reason: Option<String>,
    pub correlation_id: Option<String>,
}

async fn cancel_bid(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CancelBidRequest>,
) -> ApiResult<Bid> {
    let bid = state
        .manager
        .get_bid(&req.bid_id)?
        .ok_or(BidError::BidNotFound)?;
    // porters cancel their own bids; admins may cancel any
    let owns = principal.role == Role::Porter && bid.porter_id == principal.user_id;
    if !owns && principal.role != Role::Admin {
        return Err(BidError::Forbidden.into());
    }
    let reason = req.reason.unwrap_or_else(|| "cancelled by porter".to_string());
    let cancelled = state
        .manager
        .cancel_bid(
            &req.bid_id,
            &reason,
            &principal.user_id,
            &correlation_or_new(req.correlation_id),
        )
        .await?;
    Ok(Json(cancelled))
}

// ----- closeWindow -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseWindowRequest {
    pub window_id: String,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseWindowResponse {
    pub window: BiddingWindow,
    pub outcome: crate::events::WindowOutcome,
    pub expired_bid_count: usize,
}

async fn close_window(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CloseWindowRequest>,
) -> ApiResult<CloseWindowResponse> {
    require(&principal, &[Role::Admin])?;
    let result = state.manager.close_window(&req.window_id).await?;
    Ok(Json(CloseWindowResponse {
        window: result.window,
        outcome: result.outcome,
        expired_bid_count: result.expired_bids.len(),
    }))
}

// ----- previewBidOutcome -----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBidRequest {
    pub window_id: String,
    pub amount_cents: i64,
    pub eta_minutes: i64,
    pub metadata: Option<PorterMetadata>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewBidResponse {
    pub rank: u32,
    pub score: f64,
}

async fn preview_bid(
    State(state): State<BiddingApiState>,
    Extension(_principal): Extension<Principal>,
    Json(req): Json<PreviewBidRequest>,
) -> ApiResult<PreviewBidResponse> {
    let (rank, score) = state
        .manager
        .preview_bid(
            &req.window_id,
            req.amount_cents,
            req.eta_minutes,
            req.metadata.unwrap_or_default(),
        )
        .await?;
    Ok(Json(PreviewBidResponse { rank, score }))
}

// ----- reads -----

async fn get_window(
    State(state): State<BiddingApiState>,
    Extension(_principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<BiddingWindow> {
    Ok(Json(state.manager.get_window(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub order_id: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}
fn default_page_size() -> u32 {
    20
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPage {
    pub bids: Vec<Bid>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

async fn active_bids_for_order(
    State(state): State<BiddingApiState>,
    Extension(_principal): Extension<Principal>,
    Query(query): Query<PageQuery>,
) -> ApiResult<BidPage> {
    let order_id = query
        .order_id
        .ok_or_else(|| BidError::Validation("orderId is required".into()))?;
    let page_size = query.page_size.clamp(1, 200);
    let (bids, total) =
        state
            .manager
            .active_bids_for_order(&order_id, query.page.max(1), page_size)?;
    Ok(Json(BidPage {
        bids,
        total,
        page: query.page.max(1),
        page_size,
    }))
}

async fn my_bids(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<PageQuery>,
) -> ApiResult<BidPage> {
    require(&principal, &[Role::Porter])?;
    let page_size = query.page_size.clamp(1, 200);
    let (bids, total) =
        state
            .manager
            .bids_for_porter(&principal.user_id, query.page.max(1), page_size)?;
    Ok(Json(BidPage {
        bids,
        total,
        page: query.page.max(1),
        page_size,
    }))
}

async fn statistics(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<BiddingStatistics> {
    require(&principal, &[Role::Admin])?;
    Ok(Json(state.manager.statistics()?))
}

// ----- strategies -----

async fn list_strategies(
    State(state): State<BiddingApiState>,
    Extension(_principal): Extension<Principal>,
) -> ApiResult<Vec<BidStrategy>> {
    Ok(Json(state.manager.list_strategies()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateStrategyRequest {
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    #[serde(flatten)]
    pub weights: StrategyWeights,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

async fn create_strategy(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateStrategyRequest>,
) -> ApiResult<BidStrategy> {
    require(&principal, &[Role::Admin])?;
    let strategy = BidStrategy {
        id: req.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        name: req.name,
        description: req.description,
        weights: req.weights,
        active: req.active,
    };
    state.manager.create_strategy(&strategy)?;
    Ok(Json(strategy))
}

async fn bid_audit(
    State(state): State<BiddingApiState>,
    Extension(principal): Extension<Principal>,
    Path(bid_id): Path<String>,
) -> ApiResult<Vec<BidAuditEvent>> {
    require(&principal, &[Role::Admin])?;
    state
        .manager
        .get_bid(&bid_id)?
        .ok_or(BidError::BidNotFound)?;
    Ok(Json(state.manager.db().audit_for_bid(&bid_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (BidError::BidTooLow, StatusCode::BAD_REQUEST),
            (BidError::Forbidden, StatusCode::FORBIDDEN),
            (BidError::WindowNotFound, StatusCode::NOT_FOUND),
            (BidError::WindowNotOpen, StatusCode::CONFLICT),
            (BidError::ConcurrentAccept, StatusCode::CONFLICT),
            (
                BidError::Upstream("store".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_open_request_accepts_minimal_body() {
        let req: OpenWindowRequest =
            serde_json::from_str(r#"{"orderIds": ["o-1"]}"#).unwrap();
        assert_eq!(req.order_ids, vec!["o-1"]);
        assert!(req.duration_sec.is_none());
        assert!(req.porter_filters.is_none());
    }

    #[test]
    fn test_strategy_request_flattens_weights() {
        let req: CreateStrategyRequest = serde_json::from_str(
            r#"{
                "name": "price heavy",
                "priceWeight": 0.6,
                "etaWeight": 0.2,
                "ratingWeight": 0.1,
                "reliabilityWeight": 0.05,
                "distanceWeight": 0.05
            }"#,
        )
        .unwrap();
        assert!(req.active);
        assert!((req.weights.price_weight - 0.6).abs() < 1e-9);
        assert!(req.weights.validate().is_ok());
    }
}
