use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::models::*;
use crate::error::{AppError, AppResult};

/// One mutation inside a unit of work. Every guarded variant carries the state
/// the planner observed, so a concurrent writer makes the whole unit fail.
#[derive(Debug, Clone)]
pub enum LedgerWrite {
    InsertPayment(Payment),
    SetPaymentStatus {
        payment_id: Uuid,
        expected: PaymentStatus,
        status: PaymentStatus,
    },
    AppendTransaction(Transaction),
    /// pending → succeeded|failed; terminal rows never change
    SettleTransaction {
        transaction_id: Uuid,
        status: TransactionStatus,
        metadata: serde_json::Value,
        escrow_effect: EscrowEffect,
    },
    /// Only emitted by the escrow balance manager
    AdjustBalance {
        user_id: Uuid,
        delta: Decimal,
        expected_version: i64,
    },
    SetMilestoneStatus {
        contract_id: Uuid,
        milestone_id: Uuid,
        expected: MilestoneStatus,
        status: MilestoneStatus,
        paid_at: Option<DateTime<Utc>>,
    },
}

/// A set of writes the store applies atomically: all land or none do.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    writes: Vec<LedgerWrite>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(write: LedgerWrite) -> Self {
        Self {
            writes: vec![write],
        }
    }

    pub fn push(&mut self, write: LedgerWrite) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn writes(&self) -> &[LedgerWrite] {
        &self.writes
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// True when the unit appends or settles at least one ledger row
    pub fn has_ledger_write(&self) -> bool {
        self.writes.iter().any(|w| {
            matches!(
                w,
                LedgerWrite::AppendTransaction(_) | LedgerWrite::SettleTransaction { .. }
            )
        })
    }

    fn has_escrow_entry(&self, effect: EscrowEffect) -> bool {
        self.writes.iter().any(|w| match w {
            LedgerWrite::AppendTransaction(tx) => tx.escrow_effect == effect,
            LedgerWrite::SettleTransaction { escrow_effect, .. } => *escrow_effect == effect,
            _ => false,
        })
    }

    fn has_succeeded_charge(&self) -> bool {
        self.writes.iter().any(|w| {
            matches!(
                w,
                LedgerWrite::AppendTransaction(tx)
                    if tx.kind == TransactionKind::Charge
                        && tx.status == TransactionStatus::Succeeded
            )
        })
    }

    /// Structural invariants every backend checks before touching storage
    pub fn validate(&self) -> AppResult<()> {
        for write in &self.writes {
            match write {
                LedgerWrite::InsertPayment(payment) => {
                    if payment.amount <= Decimal::ZERO {
                        return Err(AppError::InvariantViolation(format!(
                            "payment {} must have a positive amount",
                            payment.id
                        )));
                    }
                    if !payment.external_ids_consistent() {
                        return Err(AppError::InvariantViolation(format!(
                            "payment {} carries processor ids that do not match its kind",
                            payment.id
                        )));
                    }
                }
                LedgerWrite::SetPaymentStatus { payment_id, .. } => {
                    if !self.has_ledger_write() {
                        return Err(AppError::InvariantViolation(format!(
                            "payment {} status change without a ledger entry",
                            payment_id
                        )));
                    }
                }
                LedgerWrite::AppendTransaction(tx) => {
                    if tx.amount <= Decimal::ZERO {
                        return Err(AppError::InvariantViolation(format!(
                            "transaction {} must have a positive amount",
                            tx.id
                        )));
                    }
                }
                LedgerWrite::SettleTransaction {
                    transaction_id,
                    status,
                    ..
                } => {
                    if !status.is_terminal() {
                        return Err(AppError::InvalidTransition {
                            entity: format!("transaction {}", transaction_id),
                            from: TransactionStatus::Pending.to_string(),
                            to: status.to_string(),
                        });
                    }
                }
                LedgerWrite::AdjustBalance { user_id, delta, .. } => {
                    let effect = if *delta > Decimal::ZERO {
                        EscrowEffect::Credit
                    } else if *delta < Decimal::ZERO {
                        EscrowEffect::Debit
                    } else {
                        return Err(AppError::InvariantViolation(format!(
                            "zero balance adjustment for {}",
                            user_id
                        )));
                    };
                    if !self.has_escrow_entry(effect) {
                        return Err(AppError::InvariantViolation(format!(
                            "balance change for {} without a paired {:?} ledger entry",
                            user_id, effect
                        )));
                    }
                }
                LedgerWrite::SetMilestoneStatus {
                    milestone_id,
                    status,
                    ..
                } => {
                    if *status == MilestoneStatus::Paid && !self.has_succeeded_charge() {
                        return Err(AppError::InvariantViolation(format!(
                            "milestone {} cannot be paid without a succeeded charge",
                            milestone_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Result of the atomic insert-if-absent on the webhook event log
#[derive(Debug, Clone)]
pub enum WebhookClaim {
    /// First delivery; the record was just persisted
    Fresh(WebhookEvent),
    /// Seen before but never processed successfully; attempts was incremented
    Retry(WebhookEvent),
    AlreadyProcessed(WebhookEvent),
}

/// Ledger persistence - the source of truth for all money movement
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn find_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>>;

    async fn find_payment_by_charge_intent(&self, intent_id: &str) -> AppResult<Option<Payment>>;

    async fn find_payment_by_transfer(&self, transfer_id: &str) -> AppResult<Option<Payment>>;

    async fn find_payment_by_payout(&self, payout_id: &str) -> AppResult<Option<Payment>>;

    /// Ledger rows for a payment, oldest first
    async fn transactions_for_payment(&self, payment_id: Uuid) -> AppResult<Vec<Transaction>>;

    /// Apply every write or none of them
    async fn commit(&self, unit: UnitOfWork) -> AppResult<()>;

    /// Insert-if-absent; returns the existing account when the user already has one
    async fn create_escrow_account(&self, account: EscrowAccount) -> AppResult<EscrowAccount>;

    async fn update_escrow_account_state(
        &self,
        user_id: Uuid,
        status: AccountStatus,
        verification_status: VerificationStatus,
    ) -> AppResult<()>;

    async fn claim_webhook_event(&self, event: WebhookEvent) -> AppResult<WebhookClaim>;

    async fn mark_webhook_processed(&self, external_event_id: &str) -> AppResult<()>;

    async fn record_webhook_error(&self, external_event_id: &str, error: &str) -> AppResult<()>;

    /// Unprocessed events that carry a processing error, newest first
    async fn failed_webhook_events(&self, limit: i64) -> AppResult<Vec<WebhookEvent>>;

    async fn ping(&self) -> AppResult<()>;
}

/// Escrow account lookups offered to the handlers
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn find_escrow_account_by_external_id(
        &self,
        external_account_id: &str,
    ) -> AppResult<Option<EscrowAccount>>;

    async fn find_escrow_account_by_user(&self, user_id: Uuid) -> AppResult<Option<EscrowAccount>>;
}

/// Contract aggregate collaborator
#[async_trait]
pub trait ContractDirectory: Send + Sync {
    async fn find_contract(&self, contract_id: Uuid) -> AppResult<Option<Contract>>;

    async fn find_milestone(&self, contract_id: Uuid, milestone_id: Uuid) -> AppResult<Option<Milestone>>;

    /// Forward-only status change. `paid` is rejected here: it is only reachable
    /// through a unit of work that also records the succeeded charge.
    async fn set_milestone_status(
        &self,
        contract_id: Uuid,
        milestone_id: Uuid,
        status: MilestoneStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<()>;
}

/// Full-table reads and aggregate repairs used by the reconciler
#[async_trait]
pub trait ReconcileStore: Send + Sync {
    async fn list_contracts(&self) -> AppResult<Vec<Contract>>;

    async fn list_users(&self) -> AppResult<Vec<UserProfile>>;

    async fn list_reviews(&self) -> AppResult<Vec<Review>>;

    async fn list_payments(&self) -> AppResult<Vec<Payment>>;

    async fn list_transactions(&self) -> AppResult<Vec<Transaction>>;

    async fn list_escrow_accounts(&self) -> AppResult<Vec<EscrowAccount>>;

    async fn set_contract_total(&self, contract_id: Uuid, total_amount: Decimal) -> AppResult<()>;

    async fn set_user_rating(&self, user_id: Uuid, average: Decimal, count: i32) -> AppResult<()>;
}

/// Everything the engine needs from one backend
pub trait SettlementStore: LedgerStore + AccountDirectory + ContractDirectory + ReconcileStore {}

impl<T> SettlementStore for T where T: LedgerStore + AccountDirectory + ContractDirectory + ReconcileStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payment() -> Payment {
        Payment::charge(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            dec!(500),
            "usd",
            "pi_test",
        )
    }

    #[test]
    fn test_status_change_requires_ledger_write() {
        let p = payment();
        let unit = UnitOfWork::single(LedgerWrite::SetPaymentStatus {
            payment_id: p.id,
            expected: PaymentStatus::Pending,
            status: PaymentStatus::Completed,
        });
        assert!(matches!(unit.validate(), Err(AppError::InvariantViolation(_))));

        let mut unit = unit.clone();
        unit.push(LedgerWrite::AppendTransaction(Transaction::new(
            &p,
            TransactionKind::Charge,
            TransactionStatus::Succeeded,
        )));
        assert!(unit.validate().is_ok());
    }

    #[test]
    fn test_balance_change_requires_matching_entry() {
        let p = payment();
        let user_id = Uuid::new_v4();
        let mut unit = UnitOfWork::new();
        unit.push(LedgerWrite::AppendTransaction(
            Transaction::new(&p, TransactionKind::Refund, TransactionStatus::Succeeded)
                .with_escrow_effect(EscrowEffect::Debit),
        ))
        .push(LedgerWrite::AdjustBalance {
            user_id,
            delta: dec!(25),
            expected_version: 0,
        });
        // a credit paired with a debit entry is rejected
        assert!(unit.validate().is_err());

        let mut unit = UnitOfWork::new();
        unit.push(LedgerWrite::AppendTransaction(
            Transaction::new(&p, TransactionKind::Refund, TransactionStatus::Succeeded)
                .with_escrow_effect(EscrowEffect::Credit),
        ))
        .push(LedgerWrite::AdjustBalance {
            user_id,
            delta: dec!(25),
            expected_version: 0,
        });
        assert!(unit.validate().is_ok());
    }

    #[test]
    fn test_paid_milestone_requires_succeeded_charge() {
        let unit = UnitOfWork::single(LedgerWrite::SetMilestoneStatus {
            contract_id: Uuid::new_v4(),
            milestone_id: Uuid::new_v4(),
            expected: MilestoneStatus::Submitted,
            status: MilestoneStatus::Paid,
            paid_at: Some(Utc::now()),
        });
        assert!(matches!(unit.validate(), Err(AppError::InvariantViolation(_))));
    }

    #[test]
    fn test_settle_must_target_terminal_status() {
        let unit = UnitOfWork::single(LedgerWrite::SettleTransaction {
            transaction_id: Uuid::new_v4(),
            status: TransactionStatus::Pending,
            metadata: serde_json::json!({}),
            escrow_effect: EscrowEffect::Neutral,
        });
        assert!(matches!(unit.validate(), Err(AppError::InvalidTransition { .. })));
    }
}
