use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Default)]
struct LedgerState {
    payments: HashMap<Uuid, Payment>,
    // insertion order doubles as created_at order
    transactions: Vec<Transaction>,
    // keyed by user_id
    accounts: HashMap<Uuid, EscrowAccount>,
    webhook_events: HashMap<String, WebhookEvent>,
    contracts: HashMap<Uuid, Contract>,
    users: HashMap<Uuid, UserProfile>,
    reviews: Vec<Review>,
}

impl LedgerState {
    fn apply(&mut self, write: &LedgerWrite) -> AppResult<()> {
        match write {
            LedgerWrite::InsertPayment(payment) => {
                if self.payments.contains_key(&payment.id) {
                    return Err(AppError::InvariantViolation(format!(
                        "payment {} already exists",
                        payment.id
                    )));
                }
                let clash = self.payments.values().any(|p| {
                    (payment.charge_intent_id.is_some() && p.charge_intent_id == payment.charge_intent_id)
                        || (payment.transfer_id.is_some() && p.transfer_id == payment.transfer_id)
                        || (payment.payout_id.is_some() && p.payout_id == payment.payout_id)
                });
                if clash {
                    return Err(AppError::InvariantViolation(format!(
                        "payment {} reuses a processor identifier",
                        payment.id
                    )));
                }
                self.payments.insert(payment.id, payment.clone());
            }
            LedgerWrite::SetPaymentStatus {
                payment_id,
                expected,
                status,
            } => {
                let payment = self
                    .payments
                    .get_mut(payment_id)
                    .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;
                if payment.status != *expected {
                    return Err(AppError::InvalidTransition {
                        entity: format!("payment {}", payment_id),
                        from: payment.status.to_string(),
                        to: status.to_string(),
                    });
                }
                payment.status = *status;
                payment.updated_at = Utc::now();
            }
            LedgerWrite::AppendTransaction(tx) => {
                if !self.payments.contains_key(&tx.payment_id) {
                    return Err(AppError::InvariantViolation(format!(
                        "transaction {} references unknown payment {}",
                        tx.id, tx.payment_id
                    )));
                }
                if let Some(existing) = self
                    .transactions
                    .iter()
                    .find(|t| t.id == tx.id || t.same_movement(tx))
                {
                    return Err(AppError::LedgerImmutable(existing.id));
                }
                self.transactions.push(tx.clone());
            }
            LedgerWrite::SettleTransaction {
                transaction_id,
                status,
                metadata,
                escrow_effect,
            } => {
                let tx = self
                    .transactions
                    .iter_mut()
                    .find(|t| t.id == *transaction_id)
                    .ok_or_else(|| AppError::NotFound(format!("transaction {}", transaction_id)))?;
                if tx.status.is_terminal() {
                    return Err(AppError::LedgerImmutable(tx.id));
                }
                tx.status = *status;
                tx.metadata = metadata.clone();
                tx.escrow_effect = *escrow_effect;
            }
            LedgerWrite::AdjustBalance {
                user_id,
                delta,
                expected_version,
            } => {
                let account = self
                    .accounts
                    .get_mut(user_id)
                    .ok_or_else(|| AppError::NotFound(format!("escrow account for user {}", user_id)))?;
                if account.version != *expected_version {
                    return Err(AppError::VersionConflict {
                        user_id: *user_id,
                        expected: *expected_version,
                    });
                }
                let next = account.balance + *delta;
                if next < Decimal::ZERO {
                    return Err(AppError::InsufficientFunds {
                        user_id: *user_id,
                        balance: account.balance.to_string(),
                        requested: (-*delta).to_string(),
                    });
                }
                account.balance = next;
                account.version += 1;
                account.updated_at = Utc::now();
            }
            LedgerWrite::SetMilestoneStatus {
                contract_id,
                milestone_id,
                expected,
                status,
                paid_at,
            } => {
                let milestone = self.milestone_mut(*contract_id, *milestone_id)?;
                if milestone.status != *expected || !expected.can_transition_to(*status) {
                    return Err(AppError::InvalidTransition {
                        entity: format!("milestone {}", milestone_id),
                        from: milestone.status.to_string(),
                        to: status.to_string(),
                    });
                }
                milestone.status = *status;
                if paid_at.is_some() {
                    milestone.paid_at = *paid_at;
                }
            }
        }
        Ok(())
    }

    fn milestone_mut(&mut self, contract_id: Uuid, milestone_id: Uuid) -> AppResult<&mut Milestone> {
        self.contracts
            .get_mut(&contract_id)
            .and_then(|c| c.milestones.iter_mut().find(|m| m.id == milestone_id))
            .ok_or_else(|| AppError::NotFound(format!("milestone {} on contract {}", milestone_id, contract_id)))
    }
}

/// In-memory settlement store for tests and local runs.
///
/// Every method takes the single state lock, so a commit is validated
/// against a staged copy and swapped in only when all writes apply.
#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    // Fixture loaders. These bypass unit-of-work validation on purpose so
    // drifted data can be staged for the reconciler.

    pub async fn insert_contract(&self, contract: Contract) {
        self.state.write().await.contracts.insert(contract.id, contract);
    }

    pub async fn insert_user(&self, user: UserProfile) {
        self.state.write().await.users.insert(user.id, user);
    }

    pub async fn insert_review(&self, review: Review) {
        self.state.write().await.reviews.push(review);
    }

    pub async fn insert_payment(&self, payment: Payment) {
        self.state.write().await.payments.insert(payment.id, payment);
    }

    pub async fn insert_transaction(&self, tx: Transaction) {
        self.state.write().await.transactions.push(tx);
    }

    pub async fn insert_escrow_account(&self, account: EscrowAccount) {
        self.state.write().await.accounts.insert(account.user_id, account);
    }

    pub async fn webhook_event(&self, external_event_id: &str) -> Option<WebhookEvent> {
        self.state.read().await.webhook_events.get(external_event_id).cloned()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn find_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&payment_id).cloned())
    }

    async fn find_payment_by_charge_intent(&self, intent_id: &str) -> AppResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.charge_intent_id.as_deref() == Some(intent_id))
            .cloned())
    }

    async fn find_payment_by_transfer(&self, transfer_id: &str) -> AppResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.transfer_id.as_deref() == Some(transfer_id))
            .cloned())
    }

    async fn find_payment_by_payout(&self, payout_id: &str) -> AppResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.payout_id.as_deref() == Some(payout_id))
            .cloned())
    }

    async fn transactions_for_payment(&self, payment_id: Uuid) -> AppResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn commit(&self, unit: UnitOfWork) -> AppResult<()> {
        unit.validate()?;

        let mut state = self.state.write().await;
        let mut staged = state.clone();
        for write in unit.writes() {
            staged.apply(write)?;
        }
        *state = staged;
        Ok(())
    }

    async fn create_escrow_account(&self, account: EscrowAccount) -> AppResult<EscrowAccount> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.accounts.get(&account.user_id) {
            return Ok(existing.clone());
        }
        if state
            .accounts
            .values()
            .any(|a| a.external_account_id == account.external_account_id)
        {
            return Err(AppError::InvalidInput(format!(
                "external account {} is already linked",
                account.external_account_id
            )));
        }
        state.accounts.insert(account.user_id, account.clone());
        Ok(account)
    }

    async fn update_escrow_account_state(
        &self,
        user_id: Uuid,
        status: AccountStatus,
        verification_status: VerificationStatus,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let account = state
            .accounts
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(format!("escrow account for user {}", user_id)))?;
        account.status = status;
        account.verification_status = verification_status;
        account.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_webhook_event(&self, event: WebhookEvent) -> AppResult<WebhookClaim> {
        let mut state = self.state.write().await;
        match state.webhook_events.get_mut(&event.external_event_id) {
            None => {
                state
                    .webhook_events
                    .insert(event.external_event_id.clone(), event.clone());
                Ok(WebhookClaim::Fresh(event))
            }
            Some(existing) if existing.processed => Ok(WebhookClaim::AlreadyProcessed(existing.clone())),
            Some(existing) => {
                existing.attempts += 1;
                Ok(WebhookClaim::Retry(existing.clone()))
            }
        }
    }

    async fn mark_webhook_processed(&self, external_event_id: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        let event = state
            .webhook_events
            .get_mut(external_event_id)
            .ok_or_else(|| AppError::NotFound(format!("webhook event {}", external_event_id)))?;
        event.processed = true;
        event.processed_at = Some(Utc::now());
        event.processing_error = None;
        Ok(())
    }

    async fn record_webhook_error(&self, external_event_id: &str, error: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        let event = state
            .webhook_events
            .get_mut(external_event_id)
            .ok_or_else(|| AppError::NotFound(format!("webhook event {}", external_event_id)))?;
        // a concurrent delivery may have finished the event meanwhile
        if !event.processed {
            event.processing_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn failed_webhook_events(&self, limit: i64) -> AppResult<Vec<WebhookEvent>> {
        let state = self.state.read().await;
        let mut failed: Vec<WebhookEvent> = state
            .webhook_events
            .values()
            .filter(|e| !e.processed && e.processing_error.is_some())
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        failed.truncate(limit.max(0) as usize);
        Ok(failed)
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for InMemoryLedger {
    async fn find_escrow_account_by_external_id(
        &self,
        external_account_id: &str,
    ) -> AppResult<Option<EscrowAccount>> {
        let state = self.state.read().await;
        Ok(state
            .accounts
            .values()
            .find(|a| a.external_account_id == external_account_id)
            .cloned())
    }

    async fn find_escrow_account_by_user(&self, user_id: Uuid) -> AppResult<Option<EscrowAccount>> {
        Ok(self.state.read().await.accounts.get(&user_id).cloned())
    }
}

#[async_trait]
impl ContractDirectory for InMemoryLedger {
    async fn find_contract(&self, contract_id: Uuid) -> AppResult<Option<Contract>> {
        Ok(self.state.read().await.contracts.get(&contract_id).cloned())
    }

    async fn find_milestone(&self, contract_id: Uuid, milestone_id: Uuid) -> AppResult<Option<Milestone>> {
        let state = self.state.read().await;
        Ok(state
            .contracts
            .get(&contract_id)
            .and_then(|c| c.milestone(milestone_id))
            .cloned())
    }

    async fn set_milestone_status(
        &self,
        contract_id: Uuid,
        milestone_id: Uuid,
        status: MilestoneStatus,
        paid_at: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        if status == MilestoneStatus::Paid {
            return Err(AppError::InvariantViolation(format!(
                "milestone {} can only be paid together with its charge",
                milestone_id
            )));
        }
        let mut state = self.state.write().await;
        let milestone = state.milestone_mut(contract_id, milestone_id)?;
        if !milestone.status.can_transition_to(status) {
            return Err(AppError::InvalidTransition {
                entity: format!("milestone {}", milestone_id),
                from: milestone.status.to_string(),
                to: status.to_string(),
            });
        }
        milestone.status = status;
        milestone.paid_at = paid_at;
        Ok(())
    }
}

#[async_trait]
impl ReconcileStore for InMemoryLedger {
    async fn list_contracts(&self) -> AppResult<Vec<Contract>> {
        Ok(self.state.read().await.contracts.values().cloned().collect())
    }

    async fn list_users(&self) -> AppResult<Vec<UserProfile>> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn list_reviews(&self) -> AppResult<Vec<Review>> {
        Ok(self.state.read().await.reviews.clone())
    }

    async fn list_payments(&self) -> AppResult<Vec<Payment>> {
        Ok(self.state.read().await.payments.values().cloned().collect())
    }

    async fn list_transactions(&self) -> AppResult<Vec<Transaction>> {
        Ok(self.state.read().await.transactions.clone())
    }

    async fn list_escrow_accounts(&self) -> AppResult<Vec<EscrowAccount>> {
        Ok(self.state.read().await.accounts.values().cloned().collect())
    }

    async fn set_contract_total(&self, contract_id: Uuid, total_amount: Decimal) -> AppResult<()> {
        let mut state = self.state.write().await;
        let contract = state
            .contracts
            .get_mut(&contract_id)
            .ok_or_else(|| AppError::NotFound(format!("contract {}", contract_id)))?;
        contract.total_amount = total_amount;
        contract.updated_at = Utc::now();
        Ok(())
    }

    async fn set_user_rating(&self, user_id: Uuid, average: Decimal, count: i32) -> AppResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?;
        user.rating_average = average;
        user.rating_count = count;
        Ok(())
    }
}
