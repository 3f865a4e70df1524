//! Liveness, readiness, and metrics endpoints.
//!
//! `/health` answers as long as the process serves requests. `/ready` probes
//! the real dependencies: the ephemeral store (write/read round trip), the
//! event log, and — on the bidding service — the database. `/metrics` renders
//! the prometheus registry.

use crate::bidding::BiddingDb;
use crate::eventlog::EventLog;
use crate::store::EphemeralStore;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone)]
pub struct HealthState {
    pub store: Arc<dyn EphemeralStore>,
    pub log: Arc<dyn EventLog>,
    /// Present on the bidding service only.
    pub db: Option<Arc<BiddingDb>>,
    pub prometheus: PrometheusHandle,
    pub service: &'static str,
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": state.service,
    }))
}

async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    let store_ok = probe_store(state.store.as_ref()).await;
    let log_ok = state.log.ready().await;
    let db_ok = state
        .db
        .as_ref()
        .map(|db| db.statistics().is_ok())
        .unwrap_or(true);

    let all_ok = store_ok && log_ok && db_ok;
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "ready": all_ok,
            "store": store_ok,
            "eventLog": log_ok,
            "database": db_ok,
        })),
    )
}

async fn probe_store(store: &dyn EphemeralStore) -> bool {
    let key = format!("ready_probe:{}", Uuid::new_v4());
    if store
        .set_ex(&key, "1", Duration::from_secs(5))
        .await
        .is_err()
    {
        return false;
    }
    matches!(store.get(&key).await, Ok(Some(_)))
}

async fn render_metrics(State(state): State<HealthState>) -> impl IntoResponse {
    state.prometheus.render()
}
