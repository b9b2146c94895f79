use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use http::HeaderMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::*;
use crate::error::AppResult;
use crate::ledger::{LedgerStore, SettlementStore};
use crate::reconcile::{CheckFilter, ConsistencyReconciler, ReconcileReport};
use crate::webhook::WebhookIngestionGate;

/// Header carrying `t=<unix>,v1=<hex hmac>`
pub const SIGNATURE_HEADER: &str = "processor-signature";

const DEFAULT_FAILED_LIMIT: i64 = 100;
const MAX_FAILED_LIMIT: i64 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SettlementStore>,
    pub gate: Arc<WebhookIngestionGate>,
    pub reconciler: Arc<ConsistencyReconciler>,
}

/// POST /api/v1/webhooks/processor
///
/// Authentication and parse failures are rejected; everything else is acknowledged
/// with 200 so the processor stops redelivering, failures included.
pub async fn processor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<WebhookAck>> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if signature.is_none() {
        warn!("Webhook rejected: missing {} header", SIGNATURE_HEADER);
    }

    let outcome = state.gate.ingest(&body, signature).await?;
    Ok(Json(WebhookAck::from(&outcome)))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            warn!("Health check: store unavailable: {}", e);
            false
        }
    };

    Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" }.to_string(),
        timestamp: Utc::now(),
        database,
    })
}

/// GET /api/v1/admin/webhook-events/failed
pub async fn list_failed_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<FailedEventsQuery>,
) -> AppResult<Json<FailedEventsResponse>> {
    let limit = query.limit.unwrap_or(DEFAULT_FAILED_LIMIT).clamp(1, MAX_FAILED_LIMIT);
    let events: Vec<FailedEventView> = state
        .store
        .failed_webhook_events(limit)
        .await?
        .into_iter()
        .map(FailedEventView::from)
        .collect();

    info!("Listing {} failed webhook events", events.len());
    Ok(Json(FailedEventsResponse {
        count: events.len(),
        events,
    }))
}

/// POST /api/v1/admin/reconcile/check
pub async fn reconcile_check(
    State(state): State<AppState>,
    request: Option<Json<ReconcileCheckRequest>>,
) -> AppResult<Json<ReconcileReport>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    let report = state
        .reconciler
        .check(&CheckFilter::only(request.categories))
        .await?;
    Ok(Json(report))
}
