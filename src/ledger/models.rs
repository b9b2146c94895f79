use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// Round to the two decimal places the ledger stores, half away from zero like NUMERIC.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// What a payment moves money for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentKind {
    Charge,
    Transfer,
    Withdrawal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Charge,
    Transfer,
    Payout,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    /// Terminal rows are immutable
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Marks ledger rows that were written together with an escrow balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "escrow_effect", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EscrowEffect {
    Neutral,
    Debit,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "account_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Pending,
    Active,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "verification_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    Unverified,
    Pending,
    Verified,
}

/// Milestone lifecycle. Ordered: a milestone only ever moves to a higher rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "milestone_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Submitted,
    Approved,
    Paid,
}

impl MilestoneStatus {
    fn rank(&self) -> u8 {
        match self {
            MilestoneStatus::Pending => 0,
            MilestoneStatus::InProgress => 1,
            MilestoneStatus::Submitted => 2,
            MilestoneStatus::Approved => 3,
            MilestoneStatus::Paid => 4,
        }
    }

    /// Forward-only state machine: pending → in_progress → submitted → approved → paid
    pub fn can_transition_to(&self, next: MilestoneStatus) -> bool {
        next.rank() > self.rank()
    }

    /// States from which a successful charge may mark the milestone paid
    pub fn is_payable(&self) -> bool {
        matches!(
            self,
            MilestoneStatus::InProgress | MilestoneStatus::Submitted | MilestoneStatus::Approved
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in_progress",
            MilestoneStatus::Submitted => "submitted",
            MilestoneStatus::Approved => "approved",
            MilestoneStatus::Paid => "paid",
        }
    }
}

impl fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment entity - one funds-movement intent
///
/// INVARIANT: status only changes in the same unit of work as a ledger write
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    /// None for escrow withdrawals, which are not tied to a contract
    pub contract_id: Option<Uuid>,
    pub milestone_id: Option<Uuid>,
    pub payer_id: Uuid,
    pub payee_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub kind: PaymentKind,
    pub charge_intent_id: Option<String>,
    pub transfer_id: Option<String>,
    pub payout_id: Option<String>,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    fn base(
        kind: PaymentKind,
        contract_id: Option<Uuid>,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: Decimal,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            contract_id,
            milestone_id: None,
            payer_id,
            payee_id,
            amount: round_money(amount),
            currency: currency.to_lowercase(),
            kind,
            charge_intent_id: None,
            transfer_id: None,
            payout_id: None,
            status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Milestone funding charge
    pub fn charge(
        contract_id: Uuid,
        milestone_id: Uuid,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: Decimal,
        currency: &str,
        charge_intent_id: &str,
    ) -> Self {
        let mut payment = Self::base(PaymentKind::Charge, Some(contract_id), payer_id, payee_id, amount, currency);
        payment.milestone_id = Some(milestone_id);
        payment.charge_intent_id = Some(charge_intent_id.to_string());
        payment
    }

    /// Platform-to-payee transfer of released milestone funds
    pub fn transfer(
        contract_id: Uuid,
        milestone_id: Option<Uuid>,
        payer_id: Uuid,
        payee_id: Uuid,
        amount: Decimal,
        currency: &str,
        transfer_id: &str,
    ) -> Self {
        let mut payment = Self::base(PaymentKind::Transfer, Some(contract_id), payer_id, payee_id, amount, currency);
        payment.milestone_id = milestone_id;
        payment.transfer_id = Some(transfer_id.to_string());
        payment
    }

    /// Escrow withdrawal, settled on the given rail
    pub fn withdrawal(
        payee_id: Uuid,
        amount: Decimal,
        currency: &str,
        rail: &WithdrawalRail,
    ) -> Self {
        let mut payment = Self::base(PaymentKind::Withdrawal, None, payee_id, payee_id, amount, currency);
        match rail {
            WithdrawalRail::Transfer(id) => payment.transfer_id = Some(id.clone()),
            WithdrawalRail::Payout(id) => payment.payout_id = Some(id.clone()),
        }
        payment
    }

    /// At most one processor identifier per kind, and only the ones that kind uses
    pub fn external_ids_consistent(&self) -> bool {
        let charge = self.charge_intent_id.is_some();
        let transfer = self.transfer_id.is_some();
        let payout = self.payout_id.is_some();
        match self.kind {
            PaymentKind::Charge => !transfer && !payout,
            PaymentKind::Transfer => !charge && !payout,
            PaymentKind::Withdrawal => !charge && !(transfer && payout),
        }
    }
}

/// Processor rail a withdrawal is settled on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rail", content = "id", rename_all = "lowercase")]
pub enum WithdrawalRail {
    Transfer(String),
    Payout(String),
}

/// Ledger entry - append-only source of truth for money movement
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub currency: String,
    pub status: TransactionStatus,
    pub external_id: Option<String>,
    pub escrow_effect: EscrowEffect,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(payment: &Payment, kind: TransactionKind, status: TransactionStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            kind,
            amount: payment.amount,
            currency: payment.currency.clone(),
            status,
            external_id: None,
            escrow_effect: EscrowEffect::Neutral,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Movement entry keyed by the processor object. The row id is derived from
    /// payment, kind and object, so a second append of the same movement collides
    /// with the first instead of adding a row.
    pub fn for_movement(mut self, object_id: &str) -> Self {
        self.id = Self::movement_entry_id(self.payment_id, self.kind, object_id);
        self.external_id = Some(object_id.to_string());
        self
    }

    pub fn movement_entry_id(payment_id: Uuid, kind: TransactionKind, object_id: &str) -> Uuid {
        let name = format!("{}:{:?}:{}", payment_id, kind, object_id);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }

    /// Same movement as `other`: the partial unique index on transactions
    pub fn same_movement(&self, other: &Transaction) -> bool {
        self.is_movement()
            && other.is_movement()
            && self.payment_id == other.payment_id
            && self.kind == other.kind
            && self.external_id.is_some()
            && self.external_id == other.external_id
    }

    fn is_movement(&self) -> bool {
        matches!(self.kind, TransactionKind::Transfer | TransactionKind::Payout)
            && self.escrow_effect != EscrowEffect::Debit
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_escrow_effect(mut self, effect: EscrowEffect) -> Self {
        self.escrow_effect = effect;
        self
    }

    /// Rows written by the processor-facing handlers, as opposed to escrow debits
    pub fn is_processor_entry(&self, kind: TransactionKind) -> bool {
        self.kind == kind && self.escrow_effect != EscrowEffect::Debit
    }
}

/// Escrow balance for one payee
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EscrowAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance: Decimal,
    pub status: AccountStatus,
    pub verification_status: VerificationStatus,
    pub external_account_id: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowAccount {
    pub fn open(user_id: Uuid, external_account_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            balance: Decimal::ZERO,
            status: AccountStatus::Pending,
            verification_status: VerificationStatus::Unverified,
            external_account_id: external_account_id.to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Ingestion record for every processor delivery
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub external_event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub attempts: i32,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn received(external_event_id: &str, event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_event_id: external_event_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            processed: false,
            processing_error: None,
            attempts: 1,
            received_at: Utc::now(),
            processed_at: None,
        }
    }
}

/// Contract milestone, owned by the contract aggregate
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Milestone {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub title: String,
    pub amount: Decimal,
    pub status: MilestoneStatus,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Contract aggregate; `total_amount` is a cached sum of milestone amounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: Uuid,
    pub client_id: Uuid,
    pub freelancer_id: Uuid,
    pub total_amount: Decimal,
    pub currency: String,
    pub milestones: Vec<Milestone>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn milestone(&self, milestone_id: Uuid) -> Option<&Milestone> {
        self.milestones.iter().find(|m| m.id == milestone_id)
    }

    pub fn milestone_sum(&self) -> Decimal {
        self.milestones.iter().map(|m| m.amount).sum()
    }
}

/// Rating aggregates cached on the user profile
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    pub rating_average: Decimal,
    pub rating_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Review {
    pub id: Uuid,
    pub contract_id: Uuid,
    pub reviewer_id: Uuid,
    pub reviewee_id: Uuid,
    pub rating: i16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_milestone_transitions_are_forward_only() {
        assert!(MilestoneStatus::Pending.can_transition_to(MilestoneStatus::InProgress));
        assert!(MilestoneStatus::Approved.can_transition_to(MilestoneStatus::Paid));
        assert!(MilestoneStatus::InProgress.can_transition_to(MilestoneStatus::Paid));

        assert!(!MilestoneStatus::Paid.can_transition_to(MilestoneStatus::Paid));
        assert!(!MilestoneStatus::Submitted.can_transition_to(MilestoneStatus::InProgress));
    }

    #[test]
    fn test_payable_states() {
        assert!(!MilestoneStatus::Pending.is_payable());
        assert!(MilestoneStatus::InProgress.is_payable());
        assert!(MilestoneStatus::Submitted.is_payable());
        assert!(MilestoneStatus::Approved.is_payable());
        assert!(!MilestoneStatus::Paid.is_payable());
    }

    #[test]
    fn test_terminal_transaction_status() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Succeeded.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
    }

    #[test]
    fn test_external_id_consistency() {
        let contract = Uuid::new_v4();
        let user = Uuid::new_v4();
        let mut charge = Payment::charge(contract, Uuid::new_v4(), user, user, dec!(10), "USD", "pi_1");
        assert!(charge.external_ids_consistent());
        assert_eq!(charge.currency, "usd");

        charge.transfer_id = Some("tr_1".into());
        assert!(!charge.external_ids_consistent());

        let mut withdrawal = Payment::withdrawal(
            user,
            dec!(10),
            "usd",
            &WithdrawalRail::Payout("po_1".into()),
        );
        assert!(withdrawal.external_ids_consistent());
        withdrawal.transfer_id = Some("tr_1".into());
        assert!(!withdrawal.external_ids_consistent());
    }

    #[test]
    fn test_contract_milestone_sum() {
        let contract_id = Uuid::new_v4();
        let milestone = |amount| Milestone {
            id: Uuid::new_v4(),
            contract_id,
            title: "m".into(),
            amount,
            status: MilestoneStatus::Pending,
            paid_at: None,
        };
        let contract = Contract {
            id: contract_id,
            client_id: Uuid::new_v4(),
            freelancer_id: Uuid::new_v4(),
            total_amount: dec!(0),
            currency: "usd".into(),
            milestones: vec![milestone(dec!(250.50)), milestone(dec!(249.50))],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(contract.milestone_sum(), dec!(500.00));
    }

    #[test]
    fn test_round_money() {
        assert_eq!(round_money(dec!(10.005)), dec!(10.01));
        assert_eq!(round_money(dec!(3.333)), dec!(3.33));
    }
}
