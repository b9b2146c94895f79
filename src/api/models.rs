use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::models::WebhookEvent;
use crate::reconcile::IssueCategory;
use crate::webhook::IngestOutcome;

// ========== REQUEST MODELS ==========

/// Query for the failed webhook listing
#[derive(Debug, Deserialize)]
pub struct FailedEventsQuery {
    pub limit: Option<i64>,
}

/// On-demand consistency check; no categories means all of them
#[derive(Debug, Default, Deserialize)]
pub struct ReconcileCheckRequest {
    #[serde(default)]
    pub categories: Vec<IssueCategory>,
}

// ========== RESPONSE MODELS ==========

/// Acknowledgement returned to the processor for every accepted delivery
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&IngestOutcome> for WebhookAck {
    fn from(outcome: &IngestOutcome) -> Self {
        Self {
            received: true,
            outcome: outcome.label(),
            error: match outcome {
                IngestOutcome::Failed { error } => Some(error.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub database: bool,
}

/// Failed webhook record as shown to operators
#[derive(Debug, Serialize)]
pub struct FailedEventView {
    pub external_event_id: String,
    pub event_type: String,
    pub attempts: i32,
    pub processing_error: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl From<WebhookEvent> for FailedEventView {
    fn from(event: WebhookEvent) -> Self {
        Self {
            external_event_id: event.external_event_id,
            event_type: event.event_type,
            attempts: event.attempts,
            processing_error: event.processing_error,
            received_at: event.received_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailedEventsResponse {
    pub count: usize,
    pub events: Vec<FailedEventView>,
}
