use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Check categories the reconciler knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum IssueCategory {
    Ratings,
    ContractTotals,
    ReferentialIntegrity,
    Ledger,
}

impl IssueCategory {
    pub const ALL: [IssueCategory; 4] = [
        IssueCategory::Ratings,
        IssueCategory::ContractTotals,
        IssueCategory::ReferentialIntegrity,
        IssueCategory::Ledger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCategory::Ratings => "ratings",
            IssueCategory::ContractTotals => "contract_totals",
            IssueCategory::ReferentialIntegrity => "referential_integrity",
            IssueCategory::Ledger => "ledger",
        }
    }
}

impl fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IssueType {
    RatingMismatch,
    ContractTotalMismatch,
    MissingContract,
    MissingMilestone,
    MissingUser,
    PaidWithoutCharge,
    OrphanTransaction,
    NegativeBalance,
    EscrowBalanceMismatch,
    WebhookProcessingFailed,
}

/// Correction applied for an auto-fixable issue
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    UserRating {
        user_id: Uuid,
        average: Decimal,
        count: i32,
    },
    ContractTotal {
        contract_id: Uuid,
        total_amount: Decimal,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileIssue {
    pub category: IssueCategory,
    pub entity: String,
    pub entity_id: String,
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub expected: serde_json::Value,
    pub actual: serde_json::Value,
    pub can_auto_fix: bool,
    #[serde(skip)]
    pub correction: Option<Correction>,
}

impl ReconcileIssue {
    /// Issue that needs an operator
    pub fn manual(
        category: IssueCategory,
        entity: &str,
        entity_id: impl ToString,
        issue_type: IssueType,
        severity: Severity,
        expected: serde_json::Value,
        actual: serde_json::Value,
    ) -> Self {
        Self {
            category,
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            issue_type,
            severity,
            expected,
            actual,
            can_auto_fix: false,
            correction: None,
        }
    }

    pub fn fixable_with(mut self, correction: Correction) -> Self {
        self.can_auto_fix = true;
        self.correction = Some(correction);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    Check,
    DryRun,
    Apply,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub issues_found: usize,
    pub auto_fixable: usize,
    pub issues_fixed: usize,
    pub unresolved: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub generated_at: DateTime<Utc>,
    pub mode: ReportMode,
    pub categories: Vec<IssueCategory>,
    pub issues: Vec<ReconcileIssue>,
    pub summary: ReconcileSummary,
    /// Scan limits hit while collecting; counts may be incomplete when present
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ReconcileReport {
    pub fn new(mode: ReportMode, categories: Vec<IssueCategory>, mut issues: Vec<ReconcileIssue>) -> Self {
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        let summary = ReconcileSummary {
            issues_found: issues.len(),
            auto_fixable: issues.iter().filter(|i| i.can_auto_fix).count(),
            issues_fixed: 0,
            unresolved: issues.len(),
        };
        Self {
            generated_at: Utc::now(),
            mode,
            categories,
            issues,
            summary,
            notes: Vec::new(),
        }
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    pub fn record_fixed(&mut self, fixed: usize) {
        self.summary.issues_fixed = fixed;
        self.summary.unresolved = self.summary.issues_found.saturating_sub(fixed);
    }

    pub fn has_unresolved(&self) -> bool {
        self.summary.unresolved > 0
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_issue_serializes_camel_case() {
        let issue = ReconcileIssue::manual(
            IssueCategory::ContractTotals,
            "contract",
            Uuid::nil(),
            IssueType::ContractTotalMismatch,
            Severity::High,
            json!("500.00"),
            json!("450.00"),
        )
        .fixable_with(Correction::ContractTotal {
            contract_id: Uuid::nil(),
            total_amount: Decimal::new(50000, 2),
        });

        let value = serde_json::to_value(&issue).unwrap();
        assert_eq!(value["entityId"], Uuid::nil().to_string());
        assert_eq!(value["type"], "ContractTotalMismatch");
        assert_eq!(value["severity"], "high");
        assert_eq!(value["canAutoFix"], true);
        assert!(value.get("correction").is_none());
    }

    #[test]
    fn test_summary_counts() {
        let fixable = ReconcileIssue::manual(
            IssueCategory::Ratings,
            "user",
            "u1",
            IssueType::RatingMismatch,
            Severity::Medium,
            json!(null),
            json!(null),
        )
        .fixable_with(Correction::UserRating {
            user_id: Uuid::nil(),
            average: Decimal::ZERO,
            count: 0,
        });
        let manual = ReconcileIssue::manual(
            IssueCategory::Ledger,
            "escrow_account",
            "a1",
            IssueType::NegativeBalance,
            Severity::Critical,
            json!(null),
            json!(null),
        );

        let mut report = ReconcileReport::new(ReportMode::Apply, IssueCategory::ALL.to_vec(), vec![fixable, manual]);
        assert_eq!(report.issues[0].severity, Severity::Critical);
        report.record_fixed(1);

        let summary = serde_json::to_value(&report.summary).unwrap();
        assert_eq!(summary, json!({"issuesFound": 2, "autoFixable": 1, "issuesFixed": 1, "unresolved": 1}));
        assert!(report.has_unresolved());
        assert!(serde_json::to_value(&report).unwrap().get("notes").is_none());

        let noted = report.with_notes(vec!["scan truncated".into()]);
        assert_eq!(serde_json::to_value(&noted).unwrap()["notes"], json!(["scan truncated"]));
    }
}
