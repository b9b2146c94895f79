use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use super::event::ProcessorEvent;
use super::router::{EventRouter, HandlerOutcome};
use super::signature::WebhookVerifier;
use crate::error::{AppError, AppResult};
use crate::ledger::models::WebhookEvent;
use crate::ledger::{LedgerStore, SettlementStore, WebhookClaim};
use crate::notifications::{spawn_operator_alert, Notifier};

/// Result of one webhook delivery. All variants are acknowledged with HTTP 200.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Processed { result: HandlerOutcome },
    /// Event id already processed successfully
    Duplicate,
    /// Handler error, stored on the event record for operators
    Failed { error: String },
}

impl IngestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IngestOutcome::Processed {
                result: HandlerOutcome::Ignored,
            } => "ignored",
            IngestOutcome::Processed { .. } => "processed",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Failed { .. } => "failed",
        }
    }
}

/// Webhook ingestion gate: authenticate, deduplicate, persist, dispatch
pub struct WebhookIngestionGate {
    verifier: WebhookVerifier,
    store: Arc<dyn SettlementStore>,
    router: Arc<EventRouter>,
    notifier: Arc<dyn Notifier>,
}

impl WebhookIngestionGate {
    pub fn new(
        verifier: WebhookVerifier,
        store: Arc<dyn SettlementStore>,
        router: Arc<EventRouter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            verifier,
            store,
            router,
            notifier,
        }
    }

    /// Ingest one delivery.
    ///
    /// Authentication and parse failures return an error and touch nothing.
    /// Handler failures are recorded on the event and returned as `Failed`.
    #[instrument(skip_all, fields(payload_len = payload.len()))]
    pub async fn ingest(&self, payload: &[u8], signature_header: Option<&str>) -> AppResult<IngestOutcome> {
        let header = signature_header.ok_or(AppError::Unauthorized)?;
        self.verifier.verify(payload, header)?;

        let (event, raw) = ProcessorEvent::parse_with_snapshot(payload)?;

        let record = WebhookEvent::received(&event.id, &event.event_type, raw);
        match self.store.claim_webhook_event(record).await? {
            WebhookClaim::AlreadyProcessed(_) => {
                info!("Duplicate webhook {} ({}), skipping", event.id, event.event_type);
                return Ok(IngestOutcome::Duplicate);
            }
            WebhookClaim::Retry(existing) => {
                info!(
                    "Reprocessing webhook {} (attempt {}, last error: {})",
                    existing.external_event_id,
                    existing.attempts,
                    existing.processing_error.as_deref().unwrap_or("none")
                );
            }
            WebhookClaim::Fresh(_) => {
                debug!("Webhook {} ({}) recorded", event.id, event.event_type);
            }
        }

        match self.router.dispatch(&event).await {
            Ok(result) => {
                self.store.mark_webhook_processed(&event.id).await?;
                info!("Webhook {} ({}) processed: {:?}", event.id, event.event_type, result);
                Ok(IngestOutcome::Processed { result })
            }
            Err(e) => {
                let message = e.to_string();
                self.store.record_webhook_error(&event.id, &message).await?;
                error!(
                    alert = true,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %message,
                    "Webhook processing failed"
                );
                spawn_operator_alert(
                    self.notifier.clone(),
                    format!("Webhook {} failed", event.event_type),
                    format!("event {}: {}", event.id, message),
                );
                Ok(IngestOutcome::Failed { error: message })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::Fixture;
    use crate::ledger::models::*;
    use crate::ledger::AccountDirectory;
    use crate::webhook::event::EventKind;
    use crate::webhook::router::EventHandler;
    use crate::webhook::signature::DEFAULT_TOLERANCE_SECS;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SECRET: &str = "whsec_gate_test";

    fn gate_for(fx: &Fixture, router: EventRouter) -> WebhookIngestionGate {
        WebhookIngestionGate::new(
            WebhookVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS),
            fx.ledger.clone(),
            Arc::new(router),
            fx.notifier.clone(),
        )
    }

    fn default_gate(fx: &Fixture) -> WebhookIngestionGate {
        gate_for(fx, EventRouter::with_default_handlers(fx.ctx.clone()))
    }

    fn body(id: &str, kind: &str, object: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": id,
            "type": kind,
            "created": Utc::now().timestamp(),
            "data": {"object": object},
        }))
        .unwrap()
    }

    fn sign(payload: &[u8]) -> String {
        WebhookVerifier::new(SECRET, DEFAULT_TOLERANCE_SECS)
            .sign(payload, Utc::now().timestamp())
            .unwrap()
    }

    async fn settle_spawned() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_bad_signature_touches_nothing() {
        let fx = Fixture::new().await;
        let gate = default_gate(&fx);
        let payload = body("evt_1", "payment_intent.succeeded", json!({"id": "pi_1"}));

        let forged = WebhookVerifier::new("whsec_other", DEFAULT_TOLERANCE_SECS)
            .sign(&payload, Utc::now().timestamp())
            .unwrap();
        let err = gate.ingest(&payload, Some(&forged)).await.unwrap_err();
        assert!(err.is_authentication());

        let err = gate.ingest(&payload, None).await.unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));

        assert!(fx.ledger.webhook_event("evt_1").await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let fx = Fixture::new().await;
        let gate = default_gate(&fx);
        let payload = b"{\"id\": \"evt_1\", \"type\": ".to_vec();
        let err = gate.ingest(&payload, Some(&sign(&payload))).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_charge_scenario_with_redelivery() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_500").await;
        let gate = default_gate(&fx);
        let payload = body("evt_charge", "payment_intent.succeeded", json!({"id": "pi_500", "amount": 50000}));
        let header = sign(&payload);

        let first = gate.ingest(&payload, Some(&header)).await.unwrap();
        assert_eq!(
            first,
            IngestOutcome::Processed {
                result: HandlerOutcome::Applied
            }
        );
        let paid_at = fx.milestone().await.paid_at;

        let second = gate.ingest(&payload, Some(&header)).await.unwrap();
        assert_eq!(second, IngestOutcome::Duplicate);

        assert_eq!(fx.payment(payment.id).await.status, PaymentStatus::Completed);
        let rows = fx.rows(payment.id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, TransactionKind::Charge);
        assert_eq!(rows[0].status, TransactionStatus::Succeeded);
        assert_eq!(rows[0].amount, dec!(500));

        let milestone = fx.milestone().await;
        assert_eq!(milestone.status, MilestoneStatus::Paid);
        assert_eq!(milestone.paid_at, paid_at);

        let record = fx.ledger.webhook_event("evt_charge").await.unwrap();
        assert!(record.processed);
        assert_eq!(record.attempts, 1);

        settle_spawned().await;
        let notices = fx.notifier.notices.lock().await;
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, fx.freelancer_id);
    }

    #[tokio::test]
    async fn test_withdrawal_failure_scenario() {
        let fx = Fixture::new().await;
        fx.fund_escrow(dec!(1000)).await;
        let payment = fx
            .ctx
            .escrow
            .request_withdrawal(fx.freelancer_id, dec!(500), "usd", WithdrawalRail::Transfer("tr_w1".into()))
            .await
            .unwrap();
        assert_eq!(fx.account().await.balance, dec!(500));

        let gate = default_gate(&fx);
        let payload = body(
            "evt_tf",
            "transfer.failed",
            json!({"id": "tr_w1", "failure_code": "account_closed", "failure_message": "Bank account closed"}),
        );
        let header = sign(&payload);

        assert_eq!(
            gate.ingest(&payload, Some(&header)).await.unwrap(),
            IngestOutcome::Processed {
                result: HandlerOutcome::Applied
            }
        );
        assert_eq!(gate.ingest(&payload, Some(&header)).await.unwrap(), IngestOutcome::Duplicate);

        let account = fx
            .ledger
            .find_escrow_account_by_user(fx.freelancer_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, dec!(1000));
        assert_eq!(fx.payment(payment.id).await.status, PaymentStatus::Failed);

        let rows = fx.rows(payment.id).await;
        assert_eq!(rows.len(), 2);
        let compensating: Vec<_> = rows
            .iter()
            .filter(|t| t.status == TransactionStatus::Failed)
            .collect();
        assert_eq!(compensating.len(), 1);
        assert_eq!(compensating[0].escrow_effect, EscrowEffect::Credit);
        let debit = rows.iter().find(|t| t.escrow_effect == EscrowEffect::Debit).unwrap();
        assert_eq!(debit.status, TransactionStatus::Succeeded);
        assert_eq!(debit.amount, dec!(500));
    }

    struct FlakyHandler {
        healthy: AtomicBool,
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        async fn handle(&self, _event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(HandlerOutcome::Applied)
            } else {
                Err(AppError::Internal("ledger unavailable".into()))
            }
        }
    }

    #[tokio::test]
    async fn test_handler_failure_is_recorded_and_retried() {
        let fx = Fixture::new().await;
        let flaky = Arc::new(FlakyHandler {
            healthy: AtomicBool::new(false),
        });
        let mut router = EventRouter::new();
        router.register(EventKind::TransferPaid, flaky.clone());
        let gate = gate_for(&fx, router);

        let payload = body("evt_flaky", "transfer.paid", json!({"id": "tr_x"}));
        let header = sign(&payload);

        let outcome = gate.ingest(&payload, Some(&header)).await.unwrap();
        assert_eq!(outcome.label(), "failed");

        let record = fx.ledger.webhook_event("evt_flaky").await.unwrap();
        assert!(!record.processed);
        assert!(record
            .processing_error
            .as_deref()
            .unwrap()
            .contains("ledger unavailable"));

        settle_spawned().await;
        assert_eq!(fx.notifier.alerts.lock().await.len(), 1);

        flaky.healthy.store(true, Ordering::SeqCst);
        let outcome = gate.ingest(&payload, Some(&header)).await.unwrap();
        assert_eq!(outcome.label(), "processed");

        let record = fx.ledger.webhook_event("evt_flaky").await.unwrap();
        assert!(record.processed);
        assert_eq!(record.attempts, 2);
        assert!(record.processing_error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_acknowledged() {
        let fx = Fixture::new().await;
        let gate = default_gate(&fx);
        let payload = body("evt_other", "customer.created", json!({"id": "cus_1"}));

        let outcome = gate.ingest(&payload, Some(&sign(&payload))).await.unwrap();
        assert_eq!(outcome.label(), "ignored");
        assert!(fx.ledger.webhook_event("evt_other").await.unwrap().processed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_redelivery_applies_once() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_race").await;
        let gate = Arc::new(default_gate(&fx));
        let payload = body("evt_race", "payment_intent.succeeded", json!({"id": "pi_race"}));
        let header = sign(&payload);

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let gate = gate.clone();
            let payload = payload.clone();
            let header = header.clone();
            tasks.push(tokio::spawn(async move { gate.ingest(&payload, Some(&header)).await }));
        }
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_ne!(outcome.label(), "failed");
        }

        assert_eq!(fx.rows(payment.id).await.len(), 1);
        assert_eq!(fx.milestone().await.status, MilestoneStatus::Paid);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_transfer_created_opens_one_row() {
        let fx = Fixture::new().await;
        let payment = fx.transfer_payment("tr_race").await;
        let gate = Arc::new(default_gate(&fx));
        let payload = body("evt_tr_race", "transfer.created", json!({"id": "tr_race"}));
        let header = sign(&payload);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let payload = payload.clone();
            let header = header.clone();
            tasks.push(tokio::spawn(async move { gate.ingest(&payload, Some(&header)).await }));
        }
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            assert_ne!(outcome.label(), "failed");
        }

        let rows = fx.rows(payment.id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Pending);

        let record = fx.ledger.webhook_event("evt_tr_race").await.unwrap();
        assert!(record.processed);
        assert!(record.processing_error.is_none());

        // the paid event settles the single pending row
        let paid = body("evt_tr_paid", "transfer.paid", json!({"id": "tr_race"}));
        gate.ingest(&paid, Some(&sign(&paid))).await.unwrap();
        let rows = fx.rows(payment.id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Succeeded);
    }
}
