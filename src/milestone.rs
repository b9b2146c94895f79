use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::ledger::models::{MilestoneStatus, Payment};
use crate::ledger::{ContractDirectory, LedgerWrite, SettlementStore, UnitOfWork};

/// Projects charge outcomes onto contract milestones
#[derive(Clone)]
pub struct MilestoneSynchronizer {
    contracts: Arc<dyn SettlementStore>,
}

impl MilestoneSynchronizer {
    pub fn new(contracts: Arc<dyn SettlementStore>) -> Self {
        Self { contracts }
    }

    /// Stage `milestone -> paid` into `unit` when the payment's milestone is payable.
    ///
    /// Returns false when nothing was staged. The staged write is guarded on the
    /// status observed here, so a concurrent change fails the whole unit.
    pub async fn stage_paid(&self, payment: &Payment, unit: &mut UnitOfWork) -> AppResult<bool> {
        let (Some(contract_id), Some(milestone_id)) = (payment.contract_id, payment.milestone_id) else {
            return Ok(false);
        };

        let Some(milestone) = self.contracts.find_milestone(contract_id, milestone_id).await? else {
            warn!(
                "Milestone {} on contract {} not found for payment {}, skipping",
                milestone_id, contract_id, payment.id
            );
            return Ok(false);
        };

        if !milestone.status.is_payable() {
            if milestone.status == MilestoneStatus::Paid {
                info!("Milestone {} already paid", milestone_id);
            } else {
                warn!(
                    "Milestone {} is {} and cannot be marked paid by payment {}",
                    milestone_id, milestone.status, payment.id
                );
            }
            return Ok(false);
        }

        unit.push(LedgerWrite::SetMilestoneStatus {
            contract_id,
            milestone_id,
            expected: milestone.status,
            status: MilestoneStatus::Paid,
            paid_at: Some(Utc::now()),
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::*;
    use crate::ledger::InMemoryLedger;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    async fn contract_with(status: MilestoneStatus) -> (Arc<InMemoryLedger>, Payment) {
        let ledger = Arc::new(InMemoryLedger::new());
        let contract_id = Uuid::new_v4();
        let milestone = Milestone {
            id: Uuid::new_v4(),
            contract_id,
            title: "Design".into(),
            amount: dec!(500),
            status,
            paid_at: None,
        };
        let payment = Payment::charge(
            contract_id,
            milestone.id,
            Uuid::new_v4(),
            Uuid::new_v4(),
            dec!(500),
            "usd",
            "pi_1",
        );
        ledger
            .insert_contract(Contract {
                id: contract_id,
                client_id: payment.payer_id,
                freelancer_id: payment.payee_id,
                total_amount: dec!(500),
                currency: "usd".into(),
                milestones: vec![milestone],
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .await;
        (ledger, payment)
    }

    #[tokio::test]
    async fn test_stages_paid_from_payable_state() {
        let (ledger, payment) = contract_with(MilestoneStatus::Submitted).await;
        let sync = MilestoneSynchronizer::new(ledger);
        let mut unit = UnitOfWork::new();

        assert!(sync.stage_paid(&payment, &mut unit).await.unwrap());
        assert!(matches!(
            unit.writes()[0],
            LedgerWrite::SetMilestoneStatus {
                expected: MilestoneStatus::Submitted,
                status: MilestoneStatus::Paid,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_skips_unpayable_and_paid_milestones() {
        for status in [MilestoneStatus::Pending, MilestoneStatus::Paid] {
            let (ledger, payment) = contract_with(status).await;
            let sync = MilestoneSynchronizer::new(ledger);
            let mut unit = UnitOfWork::new();
            assert!(!sync.stage_paid(&payment, &mut unit).await.unwrap());
            assert!(unit.is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_milestone_is_skipped() {
        let (ledger, mut payment) = contract_with(MilestoneStatus::Approved).await;
        payment.milestone_id = Some(Uuid::new_v4());
        let sync = MilestoneSynchronizer::new(ledger);
        let mut unit = UnitOfWork::new();
        assert!(!sync.stage_paid(&payment, &mut unit).await.unwrap());
    }
}
