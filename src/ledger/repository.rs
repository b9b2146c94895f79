use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{postgres::PgRow, FromRow, PgPool, Postgres, Row};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::*;
use crate::error::{AppError, AppResult};

type DbTx<'c> = sqlx::Transaction<'c, Postgres>;

const PAYMENT_COLUMNS: &str = "id, contract_id, milestone_id, payer_id, payee_id, amount, currency, kind, \
     charge_intent_id, transfer_id, payout_id, status, created_at, updated_at";

const TRANSACTION_COLUMNS: &str =
    "id, payment_id, kind, amount, currency, status, external_id, escrow_effect, metadata, created_at";

const ACCOUNT_COLUMNS: &str = "id, user_id, balance, status, verification_status, external_account_id, \
     version, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, external_event_id, event_type, payload, processed, processing_error, \
     attempts, received_at, processed_at";

const MILESTONE_COLUMNS: &str = "id, contract_id, title, amount, status, paid_at";

/// Postgres `unique_violation`
const UNIQUE_VIOLATION: &str = "23505";

/// Contract header row; milestones are loaded separately
struct ContractRow {
    id: Uuid,
    client_id: Uuid,
    freelancer_id: Uuid,
    total_amount: Decimal,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ContractRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            client_id: row.try_get("client_id")?,
            freelancer_id: row.try_get("freelancer_id")?,
            total_amount: row.try_get("total_amount")?,
            currency: row.try_get("currency")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl ContractRow {
    fn into_contract(self, milestones: Vec<Milestone>) -> Contract {
        Contract {
            id: self.id,
            client_id: self.client_id,
            freelancer_id: self.freelancer_id,
            total_amount: self.total_amount,
            currency: self.currency,
            milestones,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Postgres ledger repository - THE source of truth for all settlement state
pub struct PgLedgerRepository {
    pub pool: PgPool,
}

impl PgLedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_payment_by(&self, column: &str, value: &str) -> AppResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE {} = $1", PAYMENT_COLUMNS, column);
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    // ========== UNIT OF WORK ==========

    async fn apply(tx: &mut DbTx<'_>, write: &LedgerWrite) -> AppResult<()> {
        match write {
            LedgerWrite::InsertPayment(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO payments (id, contract_id, milestone_id, payer_id, payee_id, amount, currency,
                                          kind, charge_intent_id, transfer_id, payout_id, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                    "#,
                )
                .bind(p.id)
                .bind(p.contract_id)
                .bind(p.milestone_id)
                .bind(p.payer_id)
                .bind(p.payee_id)
                .bind(p.amount)
                .bind(&p.currency)
                .bind(p.kind)
                .bind(&p.charge_intent_id)
                .bind(&p.transfer_id)
                .bind(&p.payout_id)
                .bind(p.status)
                .bind(p.created_at)
                .bind(p.updated_at)
                .execute(&mut **tx)
                .await?;
            }
            LedgerWrite::SetPaymentStatus {
                payment_id,
                expected,
                status,
            } => {
                let result = sqlx::query(
                    r#"
                    UPDATE payments
                    SET status = $3, updated_at = NOW()
                    WHERE id = $1 AND status = $2
                    "#,
                )
                .bind(payment_id)
                .bind(expected)
                .bind(status)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    let current: Option<PaymentStatus> =
                        sqlx::query_scalar("SELECT status FROM payments WHERE id = $1")
                            .bind(payment_id)
                            .fetch_optional(&mut **tx)
                            .await?;
                    return Err(match current {
                        Some(current) => AppError::InvalidTransition {
                            entity: format!("payment {}", payment_id),
                            from: current.to_string(),
                            to: status.to_string(),
                        },
                        None => AppError::NotFound(format!("payment {}", payment_id)),
                    });
                }
            }
            LedgerWrite::AppendTransaction(t) => {
                sqlx::query(
                    r#"
                    INSERT INTO transactions (id, payment_id, kind, amount, currency, status,
                                              external_id, escrow_effect, metadata, created_at)
                    SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
                    WHERE EXISTS (SELECT 1 FROM payments WHERE id = $2)
                    "#,
                )
                .bind(t.id)
                .bind(t.payment_id)
                .bind(t.kind)
                .bind(t.amount)
                .bind(&t.currency)
                .bind(t.status)
                .bind(&t.external_id)
                .bind(t.escrow_effect)
                .bind(&t.metadata)
                .bind(t.created_at)
                .execute(&mut **tx)
                .await
                .and_then(|r| {
                    if r.rows_affected() == 1 {
                        Ok(())
                    } else {
                        Err(sqlx::Error::RowNotFound)
                    }
                })
                .map_err(|e| match e {
                    sqlx::Error::RowNotFound => AppError::InvariantViolation(format!(
                        "transaction {} references unknown payment {}",
                        t.id, t.payment_id
                    )),
                    // primary key or idx_transactions_movement: the movement is already recorded
                    sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                        AppError::LedgerImmutable(t.id)
                    }
                    other => other.into(),
                })?;
            }
            LedgerWrite::SettleTransaction {
                transaction_id,
                status,
                metadata,
                escrow_effect,
            } => {
                let result = sqlx::query(
                    r#"
                    UPDATE transactions
                    SET status = $2, metadata = $3, escrow_effect = $4
                    WHERE id = $1 AND status = 'pending'
                    "#,
                )
                .bind(transaction_id)
                .bind(status)
                .bind(metadata)
                .bind(escrow_effect)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    let exists: Option<Uuid> = sqlx::query_scalar("SELECT id FROM transactions WHERE id = $1")
                        .bind(transaction_id)
                        .fetch_optional(&mut **tx)
                        .await?;
                    return Err(match exists {
                        Some(id) => AppError::LedgerImmutable(id),
                        None => AppError::NotFound(format!("transaction {}", transaction_id)),
                    });
                }
            }
            LedgerWrite::AdjustBalance {
                user_id,
                delta,
                expected_version,
            } => {
                // Lock the row so the balance check and update see the same value
                let row = sqlx::query(
                    r#"
                    SELECT balance, version FROM escrow_accounts
                    WHERE user_id = $1
                    FOR UPDATE
                    "#,
                )
                .bind(user_id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("escrow account for user {}", user_id)))?;

                let balance: Decimal = row.try_get("balance")?;
                let version: i64 = row.try_get("version")?;

                if version != *expected_version {
                    return Err(AppError::VersionConflict {
                        user_id: *user_id,
                        expected: *expected_version,
                    });
                }
                if balance + *delta < Decimal::ZERO {
                    return Err(AppError::InsufficientFunds {
                        user_id: *user_id,
                        balance: balance.to_string(),
                        requested: (-*delta).to_string(),
                    });
                }

                sqlx::query(
                    r#"
                    UPDATE escrow_accounts
                    SET balance = balance + $2, version = version + 1, updated_at = NOW()
                    WHERE user_id = $1 AND version = $3
                    "#,
                )
                .bind(user_id)
                .bind(delta)
                .bind(expected_version)
                .execute(&mut **tx)
                .await?;
            }
            LedgerWrite::SetMilestoneStatus {
                contract_id,
                milestone_id,
                expected,
                status,
                paid_at,
            } => {
                if !expected.can_transition_to(*status) {
                    return Err(AppError::InvalidTransition {
                        entity: format!("milestone {}", milestone_id),
                        from: expected.to_string(),
                        to: status.to_string(),
                    });
                }
                let result = sqlx::query(
                    r#"
                    UPDATE contract_milestones
                    SET status = $4, paid_at = COALESCE($5, paid_at)
                    WHERE contract_id = $1 AND id = $2 AND status = $3
                    "#,
                )
                .bind(contract_id)
                .bind(milestone_id)
                .bind(expected)
                .bind(status)
                .bind(paid_at)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(AppError::InvalidTransition {
                        entity: format!("milestone {}", milestone_id),
                        from: expected.to_string(),
                        to: status.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn milestones_for(&self, contract_ids: &[Uuid]) -> AppResult<HashMap<Uuid, Vec<Milestone>>> {
        let sql = format!(
            "SELECT {} FROM contract_milestones WHERE contract_id = ANY($1) ORDER BY position, id",
            MILESTONE_COLUMNS
        );
        let milestones = sqlx::query_as::<_, Milestone>(&sql)
            .bind(contract_ids)
            .fetch_all(&self.pool)
            .await?;

        let mut grouped: HashMap<Uuid, Vec<Milestone>> = HashMap::new();
        for milestone in milestones {
            grouped.entry(milestone.contract_id).or_default().push(milestone);
        }
        Ok(grouped)
    }
}

#[async_trait]
impl LedgerStore for PgLedgerRepository {
    async fn find_payment(&self, payment_id: Uuid) -> AppResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let payment = sqlx::query_as::<_, Payment>(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(payment)
    }

    async fn find_payment_by_charge_intent(&self, intent_id: &str) -> AppResult<Option<Payment>> {
        self.find_payment_by("charge_intent_id", intent_id).await
    }

    async fn find_payment_by_transfer(&self, transfer_id: &str) -> AppResult<Option<Payment>> {
        self.find_payment_by("transfer_id", transfer_id).await
    }

    async fn find_payment_by_payout(&self, payout_id: &str) -> AppResult<Option<Payment>> {
        self.find_payment_by("payout_id", payout_id).await
    }

    async fn transactions_for_payment(&self, payment_id: Uuid) -> AppResult<Vec<Transaction>> {
        let sql = format!(
            "SELECT {} FROM transactions WHERE payment_id = $1 ORDER BY created_at, id",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, Transaction>(&sql)
            .bind(payment_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn commit(&self, unit: UnitOfWork) -> AppResult<()> {
        unit.validate()?;

        // Dropping the transaction on an early return rolls it back
        let mut tx = self.pool.begin().await?;
        for write in unit.writes() {
            Self::apply(&mut tx, write).await?;
        }
        tx.commit().await?;

        debug!(writes = unit.writes().len(), "Committed unit of work");
        Ok(())
    }

    async fn create_escrow_account(&self, account: EscrowAccount) -> AppResult<EscrowAccount> {
        let sql = format!(
            r#"
            INSERT INTO escrow_accounts (id, user_id, balance, status, verification_status,
                                         external_account_id, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING {}
            "#,
            ACCOUNT_COLUMNS
        );
        let inserted = sqlx::query_as::<_, EscrowAccount>(&sql)
            .bind(account.id)
            .bind(account.user_id)
            .bind(account.balance)
            .bind(account.status)
            .bind(account.verification_status)
            .bind(&account.external_account_id)
            .bind(account.version)
            .bind(account.created_at)
            .bind(account.updated_at)
            .fetch_optional(&self.pool)
            .await?;

        match inserted {
            Some(account) => Ok(account),
            None => self
                .find_escrow_account_by_user(account.user_id)
                .await?
                .ok_or_else(|| AppError::Internal(format!("escrow account for {} vanished", account.user_id))),
        }
    }

    async fn update_escrow_account_state(
        &self,
        user_id: Uuid,
        status: AccountStatus,
        verification_status: VerificationStatus,
    ) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE escrow_accounts
            SET status = $2, verification_status = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(verification_status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("escrow account for user {}", user_id)));
        }
        Ok(())
    }

    async fn claim_webhook_event(&self, event: WebhookEvent) -> AppResult<WebhookClaim> {
        let insert = format!(
            r#"
            INSERT INTO webhook_events (id, external_event_id, event_type, payload, processed, attempts, received_at)
            VALUES ($1, $2, $3, $4, FALSE, 1, $5)
            ON CONFLICT (external_event_id) DO NOTHING
            RETURNING {}
            "#,
            EVENT_COLUMNS
        );
        let fresh = sqlx::query_as::<_, WebhookEvent>(&insert)
            .bind(event.id)
            .bind(&event.external_event_id)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.received_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(fresh) = fresh {
            return Ok(WebhookClaim::Fresh(fresh));
        }

        let retry = format!(
            r#"
            UPDATE webhook_events
            SET attempts = attempts + 1
            WHERE external_event_id = $1 AND processed = FALSE
            RETURNING {}
            "#,
            EVENT_COLUMNS
        );
        let retried = sqlx::query_as::<_, WebhookEvent>(&retry)
            .bind(&event.external_event_id)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(retried) = retried {
            return Ok(WebhookClaim::Retry(retried));
        }

        let select = format!("SELECT {} FROM webhook_events WHERE external_event_id = $1", EVENT_COLUMNS);
        let existing = sqlx::query_as::<_, WebhookEvent>(&select)
            .bind(&event.external_event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(WebhookClaim::AlreadyProcessed(existing))
    }

    async fn mark_webhook_processed(&self, external_event_id: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processed = TRUE, processed_at = NOW(), processing_error = NULL
            WHERE external_event_id = $1
            "#,
        )
        .bind(external_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_webhook_error(&self, external_event_id: &str, error: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_error = $2
            WHERE external_event_id = $1 AND processed = FALSE
            "#,
        )
        .bind(external_event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn failed_webhook_events(&self, limit: i64) -> AppResult<Vec<WebhookEvent>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_events
            WHERE processed = FALSE AND processing_error IS NOT NULL
            ORDER BY received_at DESC
            LIMIT $1
            "#,
            EVENT_COLUMNS
        );
        let events = sqlx::query_as::<_, WebhookEvent>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    async fn ping(&self) -> AppResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountDirectory for PgLedgerRepository {
    async fn find_escrow_account_by_external_id(
        &self,
        external_account_id: &str,
    ) -> AppResult<Option<EscrowAccount>> {
        let sql = format!(
            "SELECT {} FROM escrow_accounts WHERE external_account_id = $1",
            ACCOUNT_COLUMNS
        );
        let account = sqlx::query_as::<_, EscrowAccount>(&sql)
            .bind(external_account_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }

    async fn find_escrow_account_by_user(&self, user_id: Uuid) -> AppResult<Option<EscrowAccount>> {
        let sql = format!("SELECT {} FROM escrow_accounts WHERE user_id = $1", ACCOUNT_COLUMNS);
        let account = sqlx::query_as::<_, EscrowAccount>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(account)
    }
}

#[async_trait]
impl ContractDirectory for PgLedgerRepository {
    async fn find_contract(&self, contract_id: Uuid) -> AppResult<Option<Contract>> {
        let row = sqlx::query_as::<_, ContractRow>(
            r#"
            SELECT id, client_id, freelancer_id, total_amount, currency, created_at, updated_at
            FROM contracts
            WHERE id = $1
            "#,
        )
        .bind(contract_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut milestones = self.milestones_for(&[contract_id]).await?;
        let milestones = milestones.remove(&contract_id).unwrap_or_default();
        Ok(Some(row.into_contract(milestones)))
    }

    async fn find_milestone(&self, contract_id: Uuid, milestone_id: Uuid) -> AppResult<Option<Milestone>> {
        let sql = format!(
            "SELECT {} FROM contract_milestones WHERE contract_id = $1 AND id = $2",
            MILESTONE_COLUMNS
        );
        let milestone = sqlx::query_as::<_, Milestone>(&sql)
            .bind(contract_id)
            .bind(milestone_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(milestone)
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
        let current = self
            .find_milestone(contract_id, milestone_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("milestone {} on contract {}", milestone_id, contract_id)))?;

        let mut tx = self.pool.begin().await?;
        Self::apply(
            &mut tx,
            &LedgerWrite::SetMilestoneStatus {
                contract_id,
                milestone_id,
                expected: current.status,
                status,
                paid_at,
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ReconcileStore for PgLedgerRepository {
    async fn list_contracts(&self) -> AppResult<Vec<Contract>> {
        let rows = sqlx::query_as::<_, ContractRow>(
            r#"
            SELECT id, client_id, freelancer_id, total_amount, currency, created_at, updated_at
            FROM contracts
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut milestones = self.milestones_for(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let own = milestones.remove(&row.id).unwrap_or_default();
                row.into_contract(own)
            })
            .collect())
    }

    async fn list_users(&self) -> AppResult<Vec<UserProfile>> {
        let users = sqlx::query_as::<_, UserProfile>(
            "SELECT id, display_name, rating_average, rating_count FROM users",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }

    async fn list_reviews(&self) -> AppResult<Vec<Review>> {
        let reviews = sqlx::query_as::<_, Review>(
            "SELECT id, contract_id, reviewer_id, reviewee_id, rating FROM reviews",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(reviews)
    }

    async fn list_payments(&self) -> AppResult<Vec<Payment>> {
        let sql = format!("SELECT {} FROM payments ORDER BY created_at", PAYMENT_COLUMNS);
        let payments = sqlx::query_as::<_, Payment>(&sql).fetch_all(&self.pool).await?;
        Ok(payments)
    }

    async fn list_transactions(&self) -> AppResult<Vec<Transaction>> {
        let sql = format!("SELECT {} FROM transactions ORDER BY created_at, id", TRANSACTION_COLUMNS);
        let rows = sqlx::query_as::<_, Transaction>(&sql).fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn list_escrow_accounts(&self) -> AppResult<Vec<EscrowAccount>> {
        let sql = format!("SELECT {} FROM escrow_accounts", ACCOUNT_COLUMNS);
        let accounts = sqlx::query_as::<_, EscrowAccount>(&sql).fetch_all(&self.pool).await?;
        Ok(accounts)
    }

    async fn set_contract_total(&self, contract_id: Uuid, total_amount: Decimal) -> AppResult<()> {
        sqlx::query("UPDATE contracts SET total_amount = $2, updated_at = NOW() WHERE id = $1")
            .bind(contract_id)
            .bind(total_amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_user_rating(&self, user_id: Uuid, average: Decimal, count: i32) -> AppResult<()> {
        sqlx::query("UPDATE users SET rating_average = $2, rating_count = $3 WHERE id = $1")
            .bind(user_id)
            .bind(average)
            .bind(count)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
