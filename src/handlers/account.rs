use async_trait::async_trait;
use tracing::{info, warn};

use super::HandlerContext;
use crate::error::AppResult;
use crate::ledger::models::{AccountStatus, VerificationStatus};
use crate::ledger::{AccountDirectory, LedgerStore};
use crate::webhook::event::{AccountObject, ProcessorEvent};
use crate::webhook::router::{EventHandler, HandlerOutcome};

/// Capability flags → (status, verification)
pub fn derive_account_state(account: &AccountObject) -> (AccountStatus, VerificationStatus) {
    if account.charges_enabled && account.payouts_enabled {
        (AccountStatus::Active, VerificationStatus::Verified)
    } else if account.details_submitted {
        (AccountStatus::Pending, VerificationStatus::Pending)
    } else {
        (AccountStatus::Pending, VerificationStatus::Unverified)
    }
}

/// `account.updated`: mirror onboarding state onto the escrow account
pub struct AccountUpdatedHandler {
    ctx: HandlerContext,
}

impl AccountUpdatedHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl EventHandler for AccountUpdatedHandler {
    async fn handle(&self, event: &ProcessorEvent) -> AppResult<HandlerOutcome> {
        let object: AccountObject = event.object()?;

        let Some(account) = self
            .ctx
            .store
            .find_escrow_account_by_external_id(&object.id)
            .await?
        else {
            warn!("No escrow account linked to processor account {}", object.id);
            return Ok(HandlerOutcome::TargetNotFound);
        };

        let (mut status, verification) = derive_account_state(&object);
        // suspension is a platform decision the processor cannot lift
        if account.status == AccountStatus::Suspended {
            status = AccountStatus::Suspended;
        }

        if status == account.status && verification == account.verification_status {
            return Ok(HandlerOutcome::AlreadyApplied);
        }

        self.ctx
            .store
            .update_escrow_account_state(account.user_id, status, verification)
            .await?;

        info!(
            "Escrow account {} now {:?}/{:?} (was {:?}/{:?})",
            account.id, status, verification, account.status, account.verification_status
        );
        Ok(HandlerOutcome::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{event, Fixture};
    use crate::ledger::models::EscrowAccount;
    use crate::webhook::event::EventKind;
    use serde_json::json;

    #[test]
    fn test_derive_account_state() {
        let object = |charges, payouts, details| AccountObject {
            id: "acct".into(),
            charges_enabled: charges,
            payouts_enabled: payouts,
            details_submitted: details,
        };
        assert_eq!(
            derive_account_state(&object(true, true, true)),
            (AccountStatus::Active, VerificationStatus::Verified)
        );
        assert_eq!(
            derive_account_state(&object(true, false, true)),
            (AccountStatus::Pending, VerificationStatus::Pending)
        );
        assert_eq!(
            derive_account_state(&object(false, false, false)),
            (AccountStatus::Pending, VerificationStatus::Unverified)
        );
    }

    #[tokio::test]
    async fn test_account_updated_applies_once() {
        let fx = Fixture::new().await;
        fx.ledger
            .insert_escrow_account(EscrowAccount::open(fx.client_id, "acct_new"))
            .await;
        let handler = AccountUpdatedHandler::new(fx.ctx.clone());
        let evt = event(
            "evt_a",
            EventKind::AccountUpdated,
            json!({"id": "acct_new", "charges_enabled": true, "payouts_enabled": true, "details_submitted": true}),
        );

        assert_eq!(handler.handle(&evt).await.unwrap(), HandlerOutcome::Applied);
        assert_eq!(handler.handle(&evt).await.unwrap(), HandlerOutcome::AlreadyApplied);
    }

    #[tokio::test]
    async fn test_suspended_account_stays_suspended() {
        let fx = Fixture::new().await;
        let mut account = fx.account().await;
        account.status = AccountStatus::Suspended;
        account.verification_status = VerificationStatus::Pending;
        fx.ledger.insert_escrow_account(account).await;

        let outcome = AccountUpdatedHandler::new(fx.ctx.clone())
            .handle(&event(
                "evt_s",
                EventKind::AccountUpdated,
                json!({"id": "acct_freelancer", "charges_enabled": true, "payouts_enabled": true}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Applied);

        let account = fx.account().await;
        assert_eq!(account.status, AccountStatus::Suspended);
        assert_eq!(account.verification_status, VerificationStatus::Verified);
    }

    #[tokio::test]
    async fn test_unknown_account_is_target_not_found() {
        let fx = Fixture::new().await;
        let outcome = AccountUpdatedHandler::new(fx.ctx.clone())
            .handle(&event("evt_x", EventKind::AccountUpdated, json!({"id": "acct_ghost"})))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::TargetNotFound);
    }
}
