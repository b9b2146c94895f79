use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::{AccountDirectory, LedgerStore, LedgerWrite, SettlementStore, UnitOfWork};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Escrow balance manager - the only component that changes an escrow balance.
///
/// INVARIANTS:
/// - every balance change commits together with a ledger row marked with the same escrow effect
/// - a balance never goes below zero
/// - writers to one account serialize on the account version; different accounts never contend
pub struct EscrowBalanceManager {
    store: Arc<dyn SettlementStore>,
    max_retries: u32,
}

impl EscrowBalanceManager {
    pub fn new(store: Arc<dyn SettlementStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Register the payout-capable account for a user. Returns the existing account on repeat calls.
    pub async fn open_account(&self, user_id: Uuid, external_account_id: &str) -> AppResult<EscrowAccount> {
        let account = self
            .store
            .create_escrow_account(EscrowAccount::open(user_id, external_account_id))
            .await?;
        info!("Escrow account {} ready for user {}", account.id, user_id);
        Ok(account)
    }

    pub async fn balance(&self, user_id: Uuid) -> AppResult<Decimal> {
        Ok(self.account(user_id).await?.balance)
    }

    /// Take `amount` out of escrow together with its ledger entry
    pub async fn debit(&self, user_id: Uuid, amount: Decimal, entry: Transaction) -> AppResult<Decimal> {
        Self::check_entry(amount, &entry)?;
        let unit = UnitOfWork::single(LedgerWrite::AppendTransaction(
            entry.with_escrow_effect(EscrowEffect::Debit),
        ));
        self.commit_with_adjustment(unit, user_id, -amount).await
    }

    /// Put `amount` into escrow together with its ledger entry
    pub async fn credit(&self, user_id: Uuid, amount: Decimal, entry: Transaction) -> AppResult<Decimal> {
        Self::check_entry(amount, &entry)?;
        let unit = UnitOfWork::single(LedgerWrite::AppendTransaction(
            entry.with_escrow_effect(EscrowEffect::Credit),
        ));
        self.commit_with_adjustment(unit, user_id, amount).await
    }

    /// Commit `unit` with a balance change of `delta` appended. Returns the new balance.
    ///
    /// The account version read here is the guard; a concurrent writer makes the
    /// commit fail with `VersionConflict` and the whole unit is re-planned.
    #[instrument(skip(self, unit), fields(writes = unit.writes().len()))]
    pub async fn commit_with_adjustment(
        &self,
        unit: UnitOfWork,
        user_id: Uuid,
        delta: Decimal,
    ) -> AppResult<Decimal> {
        if !unit.has_ledger_write() {
            return Err(AppError::InvariantViolation(format!(
                "balance change for {} without a ledger entry",
                user_id
            )));
        }
        if delta.is_zero() {
            return Err(AppError::InvalidInput("balance adjustment must be non-zero".into()));
        }

        let mut attempt = 0;
        loop {
            let account = self.account(user_id).await?;
            let next = account.balance + delta;
            if next < Decimal::ZERO {
                return Err(AppError::InsufficientFunds {
                    user_id,
                    balance: account.balance.to_string(),
                    requested: (-delta).to_string(),
                });
            }

            let mut staged = unit.clone();
            staged.push(LedgerWrite::AdjustBalance {
                user_id,
                delta,
                expected_version: account.version,
            });

            match self.store.commit(staged).await {
                Ok(()) => {
                    debug!(%user_id, %delta, balance = %next, "Escrow balance updated");
                    return Ok(next);
                }
                Err(AppError::VersionConflict { .. }) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(%user_id, attempt, "Escrow account changed concurrently, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a withdrawal payment and debit escrow for it in one unit.
    ///
    /// The payment stays pending until the processor reports the transfer or payout outcome.
    pub async fn request_withdrawal(
        &self,
        user_id: Uuid,
        amount: Decimal,
        currency: &str,
        rail: WithdrawalRail,
    ) -> AppResult<Payment> {
        let amount = round_money(amount);
        if amount <= Decimal::ZERO {
            return Err(AppError::InvalidInput("withdrawal amount must be positive".into()));
        }
        let account = self.account(user_id).await?;
        if account.status == AccountStatus::Suspended {
            return Err(AppError::InvalidInput(format!("escrow account for {} is suspended", user_id)));
        }

        let payment = Payment::withdrawal(user_id, amount, currency, &rail);
        let debit = Transaction::new(&payment, TransactionKind::Payout, TransactionStatus::Succeeded)
            .with_escrow_effect(EscrowEffect::Debit)
            .with_metadata(serde_json::json!({ "withdrawal": rail }));

        let mut unit = UnitOfWork::new();
        unit.push(LedgerWrite::InsertPayment(payment.clone()))
            .push(LedgerWrite::AppendTransaction(debit));

        let balance = self.commit_with_adjustment(unit, user_id, -amount).await?;
        info!(
            "Withdrawal {} of {} {} requested by {}, escrow balance now {}",
            payment.id, amount, payment.currency, user_id, balance
        );
        Ok(payment)
    }

    async fn account(&self, user_id: Uuid) -> AppResult<EscrowAccount> {
        self.store
            .find_escrow_account_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("escrow account for user {}", user_id)))
    }

    fn check_entry(amount: Decimal, entry: &Transaction) -> AppResult<()> {
        if amount <= Decimal::ZERO {
            return Err(AppError::InvalidInput("escrow amount must be positive".into()));
        }
        if entry.amount != amount {
            return Err(AppError::InvalidInput(format!(
                "ledger entry amount {} does not match escrow amount {}",
                entry.amount, amount
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{InMemoryLedger, ReconcileStore};
    use rust_decimal_macros::dec;

    async fn setup(balance: Decimal) -> (Arc<InMemoryLedger>, EscrowBalanceManager, Uuid) {
        let ledger = Arc::new(InMemoryLedger::new());
        let user_id = Uuid::new_v4();
        let mut account = EscrowAccount::open(user_id, "acct_payee");
        account.balance = balance;
        account.status = AccountStatus::Active;
        ledger.insert_escrow_account(account).await;
        let manager = EscrowBalanceManager::new(ledger.clone(), DEFAULT_MAX_RETRIES);
        (ledger, manager, user_id)
    }

    #[tokio::test]
    async fn test_overdraft_rejected_and_balance_unchanged() {
        let (ledger, manager, user_id) = setup(dec!(100)).await;

        let err = manager
            .request_withdrawal(user_id, dec!(100.01), "usd", WithdrawalRail::Payout("po_1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InsufficientFunds { .. }));

        assert_eq!(manager.balance(user_id).await.unwrap(), dec!(100));
        assert!(ledger.list_payments().await.unwrap().is_empty());
        assert!(ledger.list_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_withdrawal_writes_payment_debit_and_balance_together() {
        let (ledger, manager, user_id) = setup(dec!(1000)).await;

        let payment = manager
            .request_withdrawal(user_id, dec!(500), "USD", WithdrawalRail::Transfer("tr_9".into()))
            .await
            .unwrap();

        assert_eq!(payment.kind, PaymentKind::Withdrawal);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.transfer_id.as_deref(), Some("tr_9"));
        assert_eq!(manager.balance(user_id).await.unwrap(), dec!(500));

        let rows = ledger.transactions_for_payment(payment.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, TransactionKind::Payout);
        assert_eq!(rows[0].status, TransactionStatus::Succeeded);
        assert_eq!(rows[0].escrow_effect, EscrowEffect::Debit);
        assert_eq!(rows[0].amount, dec!(500));
    }

    #[tokio::test]
    async fn test_credit_pairs_with_ledger_entry() {
        let (ledger, manager, user_id) = setup(dec!(0)).await;
        let payment = Payment::withdrawal(user_id, dec!(25), "usd", &WithdrawalRail::Payout("po_2".into()));
        ledger.insert_payment(payment.clone()).await;

        let entry = Transaction::new(&payment, TransactionKind::Refund, TransactionStatus::Succeeded);
        let balance = manager.credit(user_id, dec!(25), entry).await.unwrap();
        assert_eq!(balance, dec!(25));

        let rows = ledger.transactions_for_payment(payment.id).await.unwrap();
        assert_eq!(rows[0].escrow_effect, EscrowEffect::Credit);

        let mismatched = Transaction::new(&payment, TransactionKind::Refund, TransactionStatus::Succeeded);
        assert!(matches!(
            manager.debit(user_id, dec!(5), mismatched).await,
            Err(AppError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_adjustment_requires_ledger_write() {
        let (_ledger, manager, user_id) = setup(dec!(10)).await;
        let err = manager
            .commit_with_adjustment(UnitOfWork::new(), user_id, dec!(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvariantViolation(_)));
        assert_eq!(manager.balance(user_id).await.unwrap(), dec!(10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let ledger = Arc::new(InMemoryLedger::new());
        let user_id = Uuid::new_v4();
        let mut account = EscrowAccount::open(user_id, "acct_busy");
        account.balance = dec!(100);
        ledger.insert_escrow_account(account).await;
        // enough retries for every writer to get through
        let manager = Arc::new(EscrowBalanceManager::new(ledger.clone(), 16));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager
                    .request_withdrawal(user_id, dec!(20), "usd", WithdrawalRail::Payout(format!("po_{}", i)))
                    .await
            }));
        }

        let mut succeeded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(AppError::InsufficientFunds { .. }) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(succeeded, 5);
        assert_eq!(manager.balance(user_id).await.unwrap(), dec!(0));
        assert_eq!(ledger.list_transactions().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_open_account_twice_returns_same_account() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manager = EscrowBalanceManager::new(ledger, DEFAULT_MAX_RETRIES);
        let user_id = Uuid::new_v4();
        let first = manager.open_account(user_id, "acct_x").await.unwrap();
        let second = manager.open_account(user_id, "acct_x").await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.balance, Decimal::ZERO);
    }
}
