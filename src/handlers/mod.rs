pub mod account;
pub mod charge;
pub mod transfer;

use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::escrow::EscrowBalanceManager;
use crate::ledger::models::Transaction;
use crate::ledger::{LedgerStore, SettlementStore};
use crate::milestone::MilestoneSynchronizer;
use crate::notifications::Notifier;
use crate::webhook::router::HandlerOutcome;

pub use account::AccountUpdatedHandler;
pub use charge::{ChargeFailedHandler, ChargeSucceededHandler};
pub use transfer::{MovementFailedHandler, MovementPaidHandler, Rail, TransferCreatedHandler};

/// Collaborators shared by every event handler
#[derive(Clone)]
pub struct HandlerContext {
    pub store: Arc<dyn SettlementStore>,
    pub escrow: Arc<EscrowBalanceManager>,
    pub milestones: MilestoneSynchronizer,
    pub notifier: Arc<dyn Notifier>,
}

impl HandlerContext {
    pub fn new(store: Arc<dyn SettlementStore>, notifier: Arc<dyn Notifier>, max_retries: u32) -> Self {
        Self {
            escrow: Arc::new(EscrowBalanceManager::new(store.clone(), max_retries)),
            milestones: MilestoneSynchronizer::new(store.clone()),
            store,
            notifier,
        }
    }
}

/// After a lost compare-and-set, re-read the ledger: when a concurrent delivery
/// already recorded the outcome this event is a replay, otherwise the error stands.
pub(crate) async fn replay_or_err<F>(
    ctx: &HandlerContext,
    payment_id: Uuid,
    err: AppError,
    applied: F,
) -> AppResult<HandlerOutcome>
where
    F: Fn(&[Transaction]) -> bool,
{
    match err {
        AppError::InvalidTransition { .. } | AppError::LedgerImmutable(_) => {
            let rows = ctx.store.transactions_for_payment(payment_id).await?;
            if applied(&rows) {
                info!("Payment {} was settled by a concurrent delivery", payment_id);
                Ok(HandlerOutcome::AlreadyApplied)
            } else {
                Err(err)
            }
        }
        other => Err(other),
    }
}

/// Failure details stored on failed ledger rows
pub(crate) fn failure_metadata(
    event_id: &str,
    object_id: &str,
    code: Option<&str>,
    message: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "event_id": event_id,
        "processor_object_id": object_id,
        "failure_code": code,
        "failure_message": message,
    })
}
