// Consistency reconciliation over cached aggregates, references and the ledger
pub mod report;
pub mod scheduler;

use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::AppResult;
use crate::ledger::models::{round_money, EscrowEffect, MilestoneStatus, TransactionKind, TransactionStatus};
use crate::ledger::{LedgerStore, ReconcileStore, SettlementStore};

pub use report::{
    Correction, IssueCategory, IssueType, ReconcileIssue, ReconcileReport, ReconcileSummary, ReportMode, Severity,
};
pub use scheduler::{ReconcileFrequency, ReconcileScheduleConfig, ReconcileScheduler};

/// Upper bound on failed webhook records pulled into one report
const FAILED_WEBHOOK_SCAN_LIMIT: i64 = 10_000;

/// Which categories a check runs. Empty means all of them.
#[derive(Debug, Clone, Default)]
pub struct CheckFilter {
    categories: Vec<IssueCategory>,
}

impl CheckFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(categories: impl IntoIterator<Item = IssueCategory>) -> Self {
        let mut selected: Vec<IssueCategory> = Vec::new();
        for category in categories {
            if !selected.contains(&category) {
                selected.push(category);
            }
        }
        Self { categories: selected }
    }

    pub fn selected(&self) -> Vec<IssueCategory> {
        if self.categories.is_empty() {
            IssueCategory::ALL.to_vec()
        } else {
            self.categories.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    DryRun,
    Apply,
}

/// Consistency reconciler - detects drift between cached values, references and the ledger
pub struct ConsistencyReconciler {
    store: Arc<dyn SettlementStore>,
    failed_scan_limit: i64,
}

impl ConsistencyReconciler {
    pub fn new(store: Arc<dyn SettlementStore>) -> Self {
        Self {
            store,
            failed_scan_limit: FAILED_WEBHOOK_SCAN_LIMIT,
        }
    }

    pub fn with_failed_scan_limit(mut self, limit: i64) -> Self {
        self.failed_scan_limit = limit.max(1);
        self
    }

    /// Read-only report over the selected categories
    #[instrument(skip(self))]
    pub async fn check(&self, filter: &CheckFilter) -> AppResult<ReconcileReport> {
        let categories = filter.selected();
        let (issues, notes) = self.collect(&categories).await?;
        let report = ReconcileReport::new(ReportMode::Check, categories, issues).with_notes(notes);
        info!(
            "Consistency check found {} issues ({} auto-fixable)",
            report.summary.issues_found, report.summary.auto_fixable
        );
        Ok(report)
    }

    /// Check every category, then apply the auto-fixable corrections unless `DryRun`
    #[instrument(skip(self))]
    pub async fn fix(&self, mode: FixMode) -> AppResult<ReconcileReport> {
        let categories = IssueCategory::ALL.to_vec();
        let (issues, notes) = self.collect(&categories).await?;
        let report_mode = match mode {
            FixMode::DryRun => ReportMode::DryRun,
            FixMode::Apply => ReportMode::Apply,
        };
        let mut report = ReconcileReport::new(report_mode, categories, issues).with_notes(notes);

        if mode == FixMode::DryRun {
            for issue in report.issues.iter().filter(|i| i.can_auto_fix) {
                info!(
                    "[dry-run] would fix {} {} {:?}: {} -> {}",
                    issue.entity, issue.entity_id, issue.issue_type, issue.actual, issue.expected
                );
            }
            return Ok(report);
        }

        let mut fixed = 0;
        for issue in &report.issues {
            let Some(correction) = &issue.correction else {
                continue;
            };
            match self.apply(correction).await {
                Ok(()) => {
                    fixed += 1;
                    info!(
                        "Fixed {} {} {:?}: before {} after {}",
                        issue.entity, issue.entity_id, issue.issue_type, issue.actual, issue.expected
                    );
                }
                Err(e) => error!("Failed to fix {} {}: {}", issue.entity, issue.entity_id, e),
            }
        }
        report.record_fixed(fixed);

        info!(
            "Reconciliation applied {} fixes, {} issues unresolved",
            report.summary.issues_fixed, report.summary.unresolved
        );
        Ok(report)
    }

    async fn collect(&self, categories: &[IssueCategory]) -> AppResult<(Vec<ReconcileIssue>, Vec<String>)> {
        let mut issues = Vec::new();
        let mut notes = Vec::new();
        for category in categories {
            let found = match category {
                IssueCategory::Ratings => self.check_ratings().await?,
                IssueCategory::ContractTotals => self.check_contract_totals().await?,
                IssueCategory::ReferentialIntegrity => self.check_references().await?,
                IssueCategory::Ledger => self.check_ledger(&mut notes).await?,
            };
            if !found.is_empty() {
                warn!("{} {} issues", found.len(), category);
            }
            issues.extend(found);
        }
        Ok((issues, notes))
    }

    async fn apply(&self, correction: &Correction) -> AppResult<()> {
        match correction {
            Correction::UserRating {
                user_id,
                average,
                count,
            } => self.store.set_user_rating(*user_id, *average, *count).await,
            Correction::ContractTotal {
                contract_id,
                total_amount,
            } => self.store.set_contract_total(*contract_id, *total_amount).await,
        }
    }

    async fn check_ratings(&self) -> AppResult<Vec<ReconcileIssue>> {
        let users = self.store.list_users().await?;
        let reviews = self.store.list_reviews().await?;

        let mut totals: HashMap<Uuid, (Decimal, i32)> = HashMap::new();
        for review in &reviews {
            let entry = totals.entry(review.reviewee_id).or_insert((Decimal::ZERO, 0));
            entry.0 += Decimal::from(review.rating);
            entry.1 += 1;
        }

        let mut issues = Vec::new();
        for user in users {
            let (sum, count) = totals.get(&user.id).copied().unwrap_or((Decimal::ZERO, 0));
            let average = if count == 0 {
                Decimal::ZERO
            } else {
                round_money(sum / Decimal::from(count))
            };

            if user.rating_average != average || user.rating_count != count {
                issues.push(
                    ReconcileIssue::manual(
                        IssueCategory::Ratings,
                        "user",
                        user.id,
                        IssueType::RatingMismatch,
                        Severity::Medium,
                        json!({ "average": average, "count": count }),
                        json!({ "average": user.rating_average, "count": user.rating_count }),
                    )
                    .fixable_with(Correction::UserRating {
                        user_id: user.id,
                        average,
                        count,
                    }),
                );
            }
        }
        Ok(issues)
    }

    async fn check_contract_totals(&self) -> AppResult<Vec<ReconcileIssue>> {
        let mut issues = Vec::new();
        for contract in self.store.list_contracts().await? {
            let sum = contract.milestone_sum();
            if contract.total_amount != sum {
                issues.push(
                    ReconcileIssue::manual(
                        IssueCategory::ContractTotals,
                        "contract",
                        contract.id,
                        IssueType::ContractTotalMismatch,
                        Severity::High,
                        json!(sum),
                        json!(contract.total_amount),
                    )
                    .fixable_with(Correction::ContractTotal {
                        contract_id: contract.id,
                        total_amount: sum,
                    }),
                );
            }
        }
        Ok(issues)
    }

    async fn check_references(&self) -> AppResult<Vec<ReconcileIssue>> {
        let contracts: HashMap<Uuid, _> = self
            .store
            .list_contracts()
            .await?
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        let users: HashSet<Uuid> = self.store.list_users().await?.into_iter().map(|u| u.id).collect();
        let payments = self.store.list_payments().await?;
        let transactions = self.store.list_transactions().await?;

        let category = IssueCategory::ReferentialIntegrity;
        let mut issues = Vec::new();

        for payment in &payments {
            if let Some(contract_id) = payment.contract_id {
                match contracts.get(&contract_id) {
                    None => issues.push(ReconcileIssue::manual(
                        category,
                        "payment",
                        payment.id,
                        IssueType::MissingContract,
                        Severity::Critical,
                        json!(contract_id),
                        json!(null),
                    )),
                    Some(contract) => {
                        if let Some(milestone_id) = payment.milestone_id {
                            if contract.milestone(milestone_id).is_none() {
                                issues.push(ReconcileIssue::manual(
                                    category,
                                    "payment",
                                    payment.id,
                                    IssueType::MissingMilestone,
                                    Severity::High,
                                    json!(milestone_id),
                                    json!(null),
                                ));
                            }
                        }
                    }
                }
            }

            let mut parties = vec![("payer", payment.payer_id)];
            if payment.payee_id != payment.payer_id {
                parties.push(("payee", payment.payee_id));
            }
            for (role, user_id) in parties {
                if !users.contains(&user_id) {
                    issues.push(ReconcileIssue::manual(
                        category,
                        "payment",
                        payment.id,
                        IssueType::MissingUser,
                        Severity::High,
                        json!({ "role": role, "userId": user_id }),
                        json!(null),
                    ));
                }
            }
        }

        let payment_ids: HashSet<Uuid> = payments.iter().map(|p| p.id).collect();
        let charged: HashSet<Uuid> = transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Charge && t.status == TransactionStatus::Succeeded)
            .map(|t| t.payment_id)
            .collect();
        let charged_milestones: HashSet<(Uuid, Uuid)> = payments
            .iter()
            .filter(|p| charged.contains(&p.id))
            .filter_map(|p| Some((p.contract_id?, p.milestone_id?)))
            .collect();

        for contract in contracts.values() {
            for milestone in &contract.milestones {
                if milestone.status == MilestoneStatus::Paid
                    && !charged_milestones.contains(&(contract.id, milestone.id))
                {
                    issues.push(ReconcileIssue::manual(
                        category,
                        "milestone",
                        milestone.id,
                        IssueType::PaidWithoutCharge,
                        Severity::Critical,
                        json!("succeeded charge"),
                        json!(null),
                    ));
                }
            }
        }

        for transaction in &transactions {
            if !payment_ids.contains(&transaction.payment_id) {
                issues.push(ReconcileIssue::manual(
                    category,
                    "transaction",
                    transaction.id,
                    IssueType::OrphanTransaction,
                    Severity::Critical,
                    json!(transaction.payment_id),
                    json!(null),
                ));
            }
        }

        Ok(issues)
    }

    /// Escrow balance each payee should hold: credit-effect rows minus debit-effect rows
    async fn ledger_balances(&self) -> AppResult<HashMap<Uuid, Decimal>> {
        let payees: HashMap<Uuid, Uuid> = self
            .store
            .list_payments()
            .await?
            .into_iter()
            .map(|p| (p.id, p.payee_id))
            .collect();

        let mut balances: HashMap<Uuid, Decimal> = HashMap::new();
        for tx in self.store.list_transactions().await? {
            let delta = match tx.escrow_effect {
                EscrowEffect::Credit => tx.amount,
                EscrowEffect::Debit => -tx.amount,
                EscrowEffect::Neutral => continue,
            };
            // orphans are reported under referential_integrity
            if let Some(payee_id) = payees.get(&tx.payment_id) {
                *balances.entry(*payee_id).or_insert(Decimal::ZERO) += delta;
            }
        }
        Ok(balances)
    }

    async fn check_ledger(&self, notes: &mut Vec<String>) -> AppResult<Vec<ReconcileIssue>> {
        let mut issues = Vec::new();
        let expected_balances = self.ledger_balances().await?;

        for account in self.store.list_escrow_accounts().await? {
            if account.balance < Decimal::ZERO {
                issues.push(ReconcileIssue::manual(
                    IssueCategory::Ledger,
                    "escrow_account",
                    account.id,
                    IssueType::NegativeBalance,
                    Severity::Critical,
                    json!(">= 0"),
                    json!(account.balance),
                ));
            }

            let expected = expected_balances
                .get(&account.user_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            if account.balance != expected {
                issues.push(ReconcileIssue::manual(
                    IssueCategory::Ledger,
                    "escrow_account",
                    account.id,
                    IssueType::EscrowBalanceMismatch,
                    Severity::Critical,
                    json!(expected),
                    json!(account.balance),
                ));
            }
        }

        // one extra row tells a full page from a truncated one
        let mut failed = self
            .store
            .failed_webhook_events(self.failed_scan_limit.saturating_add(1))
            .await?;
        if failed.len() as i64 > self.failed_scan_limit {
            failed.truncate(self.failed_scan_limit as usize);
            warn!(
                "More than {} failed webhook events, report lists the newest only",
                self.failed_scan_limit
            );
            notes.push(format!(
                "failed webhook scan stopped at {} events; older failures are not counted",
                self.failed_scan_limit
            ));
        }

        for event in failed {
            issues.push(ReconcileIssue::manual(
                IssueCategory::Ledger,
                "webhook_event",
                &event.external_event_id,
                IssueType::WebhookProcessingFailed,
                Severity::Medium,
                json!("processed"),
                json!({
                    "eventType": event.event_type,
                    "attempts": event.attempts,
                    "error": event.processing_error,
                }),
            ));
        }

        Ok(issues)
    }
}
