use async_trait::async_trait;
use tracing::{info, warn};

use super::{failure_metadata, replay_or_err, HandlerContext};
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::{LedgerStore, LedgerWrite, UnitOfWork};
use crate::notifications::{spawn_payment_notice, PaymentNotice};
use crate::webhook::event::{ChargeObject, ProcessorEvent};
use crate::webhook::router::{EventHandler, HandlerOutcome};

fn has_succeeded_charge(rows: &[Transaction]) -> bool {
    rows.iter()
        .any(|t| t.kind == TransactionKind::Charge && t.status == TransactionStatus::Succeeded)
}

fn latest_charge_failed(rows: &[Transaction]) -> bool {
    rows.iter()
        .rev()
        .find(|t| t.kind == TransactionKind::Charge)
        .map(|t| t.status == TransactionStatus::Failed)
        .unwrap_or(false)
}

/// `payment_intent.succeeded`: complete the payment, record the charge, pay the milestone
pub struct ChargeSucceededHandler {
    ctx: HandlerContext,
}

impl ChargeSucceededHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for ChargeSucceededHandler {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let charge: ChargeObject = event.object()?;

        let Some(payment) = self.ctx.store.find_payment_by_charge_intent(&charge.id).await? else {
            warn!("No payment found for charge intent {}", charge.id);
            return Ok(HandlerOutcome::TargetNotFound);
        };

        let rows = self.ctx.store.transactions_for_payment(payment.id).await?;
        if has_succeeded_charge(&rows) {
            info!("Charge {} already recorded for payment {}", charge.id, payment.id);
            return Ok(HandlerOutcome::AlreadyApplied);
        }

        let mut unit = UnitOfWork::new();
        unit.push(LedgerWrite::SetPaymentStatus {
            payment_id: payment.id,
            expected: payment.status,
            status: PaymentStatus::Completed,
        })
        .push(LedgerWrite::AppendTransaction(
            Transaction::new(&payment, TransactionKind::Charge, TransactionStatus::Succeeded)
                .with_external_id(charge.id.as_str())
                .with_metadata(serde_json::json!({ "event_id": event.id })),
        ));
        let milestone_paid = self.ctx.milestones.stage_paid(&payment, &mut unit).await?;

        if let Err(e) = self.ctx.store.commit(unit).await {
            return replay_or_err(&self.ctx, payment.id, e, has_succeeded_charge).await;
        }

        info!(
            "Payment {} completed by charge {} (milestone paid: {})",
            payment.id, charge.id, milestone_paid
        );

        if let (Some(contract_id), Some(milestone_id)) = (payment.contract_id, payment.milestone_id) {
            spawn_payment_notice(
                self.ctx.notifier.clone(),
                payment.payee_id,
                PaymentNotice::MilestoneFunded {
                    contract_id,
                    milestone_id,
                    amount: payment.amount,
                    currency: payment.currency.clone(),
                },
            );
        }
        Ok(HandlerOutcome::Applied)
    }
}

/// `payment_intent.payment_failed`: fail the payment and record why. The milestone is untouched.
pub struct ChargeFailedHandler {
    ctx: HandlerContext,
}

impl ChargeFailedHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for ChargeFailedHandler {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let charge: ChargeObject = event.object()?;

        let Some(payment) = self.ctx.store.find_payment_by_charge_intent(&charge.id).await? else {
            warn!("No payment found for charge intent {}", charge.id);
            return Ok(HandlerOutcome::TargetNotFound);
        };

        if payment.status == PaymentStatus::Completed {
            warn!(
                "Late failure for charge {} after payment {} completed, ignoring",
                charge.id, payment.id
            );
            return Ok(HandlerOutcome::AlreadyApplied);
        }

        let rows = self.ctx.store.transactions_for_payment(payment.id).await?;
        if payment.status == PaymentStatus::Failed && latest_charge_failed(&rows) {
            info!("Charge failure {} already recorded for payment {}", charge.id, payment.id);
            return Ok(HandlerOutcome::AlreadyApplied);
        }

        let error = charge.last_payment_error.clone().unwrap_or_default();
        let metadata = failure_metadata(
            &event.id,
            &charge.id,
            error.code.as_deref(),
            error.message.as_deref(),
        );

        let mut unit = UnitOfWork::new();
        unit.push(LedgerWrite::SetPaymentStatus {
            payment_id: payment.id,
            expected: payment.status,
            status: PaymentStatus::Failed,
        })
        .push(LedgerWrite::AppendTransaction(
            Transaction::new(&payment, TransactionKind::Charge, TransactionStatus::Failed)
                .with_external_id(charge.id.as_str())
                .with_metadata(metadata),
        ));

        if let Err(e) = self.ctx.store.commit(unit).await {
            return replay_or_err(&self.ctx, payment.id, e, |rows| {
                has_succeeded_charge(rows) || latest_charge_failed(rows)
            })
            .await;
        }

        warn!(
            "Payment {} failed: {}",
            payment.id,
            error.code.as_deref().unwrap_or("unknown")
        );
        spawn_payment_notice(
            self.ctx.notifier.clone(),
            payment.payer_id,
            PaymentNotice::ChargeFailed {
                payment_id: payment.id,
                reason: error
                    .message
                    .or(error.code)
                    .unwrap_or_else(|| "payment failed".to_string()),
            },
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{event, Fixture};
    use crate::webhook::event::EventKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_charge_succeeded_completes_payment_and_pays_milestone() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_500").await;
        let handler = ChargeSucceededHandler::new(fx.ctx.clone());
        let evt = event("evt_1", EventKind::ChargeSucceeded, json!({"id": "pi_500"}));

        assert_eq!(handler.handle(&evt).await.unwrap(), HandlerOutcome::Applied);

        assert_eq!(fx.payment(payment.id).await.status, PaymentStatus::Completed);
        let rows = fx.rows(payment.id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].external_id.as_deref(), Some("pi_500"));
        let milestone = fx.milestone().await;
        assert_eq!(milestone.status, MilestoneStatus::Paid);
        assert!(milestone.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_charge_succeeded_replay_is_noop() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_500").await;
        let handler = ChargeSucceededHandler::new(fx.ctx.clone());

        handler
            .handle(&event("evt_1", EventKind::ChargeSucceeded, json!({"id": "pi_500"})))
            .await
            .unwrap();
        let paid_at = fx.milestone().await.paid_at;

        // the processor may also send the outcome under a fresh event id
        let outcome = handler
            .handle(&event("evt_2", EventKind::ChargeSucceeded, json!({"id": "pi_500"})))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::AlreadyApplied);
        assert_eq!(fx.rows(payment.id).await.len(), 1);
        assert_eq!(fx.milestone().await.paid_at, paid_at);
    }

    #[tokio::test]
    async fn test_charge_for_unknown_intent_is_target_not_found() {
        let fx = Fixture::new().await;
        let handler = ChargeSucceededHandler::new(fx.ctx.clone());
        let outcome = handler
            .handle(&event("evt_1", EventKind::ChargeSucceeded, json!({"id": "pi_missing"})))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::TargetNotFound);
    }

    #[tokio::test]
    async fn test_charge_failed_records_failure_and_leaves_milestone() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_bad").await;
        let handler = ChargeFailedHandler::new(fx.ctx.clone());
        let evt = event(
            "evt_f1",
            EventKind::ChargeFailed,
            json!({"id": "pi_bad", "last_payment_error": {"code": "card_declined", "message": "Your card was declined."}}),
        );

        assert_eq!(handler.handle(&evt).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(handler.handle(&evt).await.unwrap(), HandlerOutcome::AlreadyApplied);

        assert_eq!(fx.payment(payment.id).await.status, PaymentStatus::Failed);
        let rows = fx.rows(payment.id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TransactionStatus::Failed);
        assert_eq!(rows[0].metadata["failure_code"], "card_declined");
        assert_eq!(fx.milestone().await.status, MilestoneStatus::Submitted);
    }

    #[tokio::test]
    async fn test_failure_after_success_is_ignored() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_late").await;
        ChargeSucceededHandler::new(fx.ctx.clone())
            .handle(&event("evt_ok", EventKind::ChargeSucceeded, json!({"id": "pi_late"})))
            .await
            .unwrap();

        let outcome = ChargeFailedHandler::new(fx.ctx.clone())
            .handle(&event("evt_late", EventKind::ChargeFailed, json!({"id": "pi_late"})))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::AlreadyApplied);
        assert_eq!(fx.payment(payment.id).await.status, PaymentStatus::Completed);
        assert_eq!(fx.rows(payment.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_success_after_failure_completes_payment() {
        let fx = Fixture::new().await;
        let payment = fx.charge_payment("pi_retry").await;
        ChargeFailedHandler::new(fx.ctx.clone())
            .handle(&event("evt_f", EventKind::ChargeFailed, json!({"id": "pi_retry"})))
            .await
            .unwrap();
        ChargeSucceededHandler::new(fx.ctx.clone())
            .handle(&event("evt_s", EventKind::ChargeSucceeded, json!({"id": "pi_retry"})))
            .await
            .unwrap();

        assert_eq!(fx.payment(payment.id).await.status, PaymentStatus::Completed);
        assert_eq!(fx.rows(payment.id).await.len(), 2);
        assert_eq!(fx.milestone().await.status, MilestoneStatus::Paid);
    }
}
