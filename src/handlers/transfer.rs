use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{failure_metadata, replay_or_err, HandlerContext};
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::{LedgerStore, LedgerWrite, UnitOfWork};
use crate::notifications::{spawn_operator_alert, spawn_payment_notice, PaymentNotice};
use crate::webhook::event::{MovementObject, ProcessorEvent};
use crate::webhook::router::{EventHandler, HandlerOutcome};

/// Processor rail a movement settles on. Transfers and payouts share one lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rail {
    Transfer,
    Payout,
}

impl Rail {
    fn kind(&self) -> TransactionKind {
        match self {
            Rail::Transfer => TransactionKind::Transfer,
            Rail::Payout => TransactionKind::Payout,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Rail::Transfer => "transfer",
            Rail::Payout => "payout",
        }
    }

    async fn find_payment(&self, ctx: &HandlerContext, object_id: &str) -> AppResult<Option<Payment>> {
        match self {
            Rail::Transfer => ctx.store.find_payment_by_transfer(object_id).await,
            Rail::Payout => ctx.store.find_payment_by_payout(object_id).await,
        }
    }

    /// Processor-side rows on this rail. Escrow debits for withdrawals are excluded.
    fn entries<'a>(&self, rows: &'a [Transaction]) -> impl Iterator<Item = &'a Transaction> {
        let kind = self.kind();
        rows.iter().filter(move |t| t.is_processor_entry(kind))
    }

    fn has_terminal_entry(&self, rows: &[Transaction]) -> bool {
        self.entries(rows).any(|t| t.status.is_terminal())
    }
}

/// Load the payment and its ledger for a movement event. The inner `Err`
/// carries the outcome to report when the event needs no writes.
async fn load(
    ctx: &HandlerContext,
    rail: Rail,
    movement: &MovementObject,
) -> AppResult<Result<(Payment, Vec<Transaction>), HandlerOutcome>> {
    let Some(payment) = rail.find_payment(ctx, &movement.id).await? else {
        warn!("No payment found for {} {}", rail.label(), movement.id);
        return Ok(Err(HandlerOutcome::TargetNotFound));
    };
    let rows = ctx.store.transactions_for_payment(payment.id).await?;
    if rail.has_terminal_entry(&rows) {
        info!(
            "{} {} already settled for payment {}",
            rail.label(),
            movement.id,
            payment.id
        );
        return Ok(Err(HandlerOutcome::AlreadyApplied));
    }
    Ok(Ok((payment, rows)))
}

/// Settle the pending row for this rail, or append a terminal one when the
/// created event never arrived.
#[allow(clippy::too_many_arguments)]
fn settle_or_append(
    unit: &mut UnitOfWork,
    rail: Rail,
    payment: &Payment,
    rows: &[Transaction],
    movement: &MovementObject,
    status: TransactionStatus,
    metadata: serde_json::Value,
    escrow_effect: EscrowEffect,
) {
    match rail.entries(rows).find(|t| t.status == TransactionStatus::Pending) {
        Some(pending) => {
            unit.push(LedgerWrite::SettleTransaction {
                transaction_id: pending.id,
                status,
                metadata,
                escrow_effect,
            });
        }
        None => {
            unit.push(LedgerWrite::AppendTransaction(
                Transaction::new(payment, rail.kind(), status)
                    .for_movement(&movement.id)
                    .with_metadata(metadata)
                    .with_escrow_effect(escrow_effect),
            ));
        }
    }
}

/// `transfer.created`: open a pending transfer row
pub struct TransferCreatedHandler {
    ctx: HandlerContext,
}

impl TransferCreatedHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for TransferCreatedHandler {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let movement: MovementObject = event.object()?;
        let rail = Rail::Transfer;

        let Some(payment) = rail.find_payment(&self.ctx, &movement.id).await? else {
            warn!("No payment found for transfer {}", movement.id);
            return Ok(HandlerOutcome::TargetNotFound);
        };

        let rows = self.ctx.store.transactions_for_payment(payment.id).await?;
        if rail.entries(&rows).next().is_some() {
            info!("Transfer {} already tracked for payment {}", movement.id, payment.id);
            return Ok(HandlerOutcome::AlreadyApplied);
        }

        let pending = Transaction::new(&payment, TransactionKind::Transfer, TransactionStatus::Pending)
            .for_movement(&movement.id)
            .with_metadata(serde_json::json!({
                "event_id": event.id,
                "destination": movement.destination,
            }));
        let committed = self
            .ctx
            .store
            .commit(UnitOfWork::single(LedgerWrite::AppendTransaction(pending)))
            .await;
        if let Err(e) = committed {
            return replay_or_err(&self.ctx, payment.id, e, |rows| rail.entries(rows).next().is_some()).await;
        }

        info!("Transfer {} pending for payment {}", movement.id, payment.id);
        Ok(HandlerOutcome::Applied)
    }
}

/// `transfer.paid` / `payout.paid`: settle the movement and complete the payment
pub struct MovementPaidHandler {
    ctx: HandlerContext,
    rail: Rail,
}

impl MovementPaidHandler {
    pub fn new(ctx: HandlerContext, rail: Rail) -> Self {
        Self { ctx, rail }
    }
}

#[async_trait]
impl EventHandler for MovementPaidHandler {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let movement: MovementObject = event.object()?;
        let (payment, rows) = match load(&self.ctx, self.rail, &movement).await? {
            Ok(loaded) => loaded,
            Err(outcome) => return Ok(outcome),
        };

        let metadata = serde_json::json!({
            "event_id": event.id,
            "processor_object_id": movement.id,
        });

        let mut unit = UnitOfWork::new();
        settle_or_append(
            &mut unit,
            self.rail,
            &payment,
            &rows,
            &movement,
            TransactionStatus::Succeeded,
            metadata,
            EscrowEffect::Neutral,
        );
        unit.push(LedgerWrite::SetPaymentStatus {
            payment_id: payment.id,
            expected: payment.status,
            status: PaymentStatus::Completed,
        });

        let rail = self.rail;
        if let Err(e) = self.ctx.store.commit(unit).await {
            return replay_or_err(&self.ctx, payment.id, e, |rows| rail.has_terminal_entry(rows)).await;
        }

        info!("{} {} paid, payment {} completed", rail.label(), movement.id, payment.id);
        spawn_payment_notice(
            self.ctx.notifier.clone(),
            payment.payee_id,
            PaymentNotice::TransferCompleted {
                payment_id: payment.id,
                amount: payment.amount,
                currency: payment.currency.clone(),
            },
        );
        Ok(HandlerOutcome::Applied)
    }
}

/// `transfer.failed` / `payout.failed`: fail the movement; withdrawals get their escrow back
pub struct MovementFailedHandler {
    ctx: HandlerContext,
    rail: Rail,
}

impl MovementFailedHandler {
    pub fn new(ctx: HandlerContext, rail: Rail) -> Self {
        Self { ctx, rail }
    }
}

#[async_trait]
impl EventHandler for MovementFailedHandler {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let movement: MovementObject = event.object()?;
        let (payment, rows) = match load(&self.ctx, self.rail, &movement).await? {
            Ok(loaded) => loaded,
            Err(outcome) => return Ok(outcome),
        };

        let compensate = payment.kind == PaymentKind::Withdrawal;
        let effect = if compensate {
            EscrowEffect::Credit
        } else {
            EscrowEffect::Neutral
        };
        let metadata = failure_metadata(
            &event.id,
            &movement.id,
            movement.failure_code.as_deref(),
            movement.failure_message.as_deref(),
        );

        let mut unit = UnitOfWork::new();
        settle_or_append(
            &mut unit,
            self.rail,
            &payment,
            &rows,
            &movement,
            TransactionStatus::Failed,
            metadata,
            effect,
        );
        unit.push(LedgerWrite::SetPaymentStatus {
            payment_id: payment.id,
            expected: payment.status,
            status: PaymentStatus::Failed,
        });

        let committed = if compensate {
            self.ctx
                .escrow
                .commit_with_adjustment(unit, payment.payee_id, payment.amount)
                .await
                .map(|_| ())
        } else {
            self.ctx.store.commit(unit).await
        };

        let rail = self.rail;
        if let Err(e) = committed {
            return replay_or_err(&self.ctx, payment.id, e, |rows| rail.has_terminal_entry(rows)).await;
        }

        let code = movement.failure_code.as_deref().unwrap_or("unknown");
        if compensate {
            warn!(
                "{} {} failed ({}), returned {} {} to escrow for {}",
                rail.label(),
                movement.id,
                code,
                payment.amount,
                payment.currency,
                payment.payee_id
            );
            spawn_payment_notice(
                self.ctx.notifier.clone(),
                payment.payee_id,
                PaymentNotice::WithdrawalReturned {
                    payment_id: payment.id,
                    amount: payment.amount,
                    currency: payment.currency.clone(),
                },
            );
        } else {
            error!(
                alert = true,
                "{} {} for payment {} failed ({})",
                rail.label(),
                movement.id,
                payment.id,
                code
            );
            spawn_operator_alert(
                self.ctx.notifier.clone(),
                format!("{} failed", rail.label()),
                format!("{} {} for payment {} failed: {}", rail.label(), movement.id, payment.id, code),
            );
        }
        Ok(HandlerOutcome::Applied)
    }
}
