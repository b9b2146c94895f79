// Notifications
//
// Payment notices go to the affected user, operator alerts go to the ops inbox.
// Email is sent through Resend; without credentials everything lands in the log.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// User-facing notice emitted after a settlement outcome
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentNotice {
    MilestoneFunded {
        contract_id: Uuid,
        milestone_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    ChargeFailed {
        payment_id: Uuid,
        reason: String,
    },
    TransferCompleted {
        payment_id: Uuid,
        amount: Decimal,
        currency: String,
    },
    /// A withdrawal failed downstream and the amount was returned to escrow
    WithdrawalReturned {
        payment_id: Uuid,
        amount: Decimal,
        currency: String,
    },
}

impl PaymentNotice {
    pub fn subject(&self) -> &'static str {
        match self {
            PaymentNotice::MilestoneFunded { .. } => "Milestone funded",
            PaymentNotice::ChargeFailed { .. } => "Payment failed",
            PaymentNotice::TransferCompleted { .. } => "Funds transferred",
            PaymentNotice::WithdrawalReturned { .. } => "Withdrawal returned to escrow",
        }
    }
}

/// Fire-and-forget side effects. Failures are logged, never propagated into settlement.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn payment_notice(&self, user_id: Uuid, notice: PaymentNotice) -> AppResult<()>;

    async fn operator_alert(&self, subject: &str, body: &str) -> AppResult<()>;
}

/// Send a payment notice on a detached task
pub fn spawn_payment_notice(notifier: Arc<dyn Notifier>, user_id: Uuid, notice: PaymentNotice) {
    tokio::spawn(async move {
        if let Err(e) = notifier.payment_notice(user_id, notice).await {
            warn!("Failed to deliver payment notice to {}: {}", user_id, e);
        }
    });
}

/// Raise an operator alert on a detached task
pub fn spawn_operator_alert(notifier: Arc<dyn Notifier>, subject: String, body: String) {
    tokio::spawn(async move {
        if let Err(e) = notifier.operator_alert(&subject, &body).await {
            error!("Failed to deliver operator alert '{}': {}", subject, e);
        }
    });
}

/// Log-only notifier
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn payment_notice(&self, user_id: Uuid, notice: PaymentNotice) -> AppResult<()> {
        info!(%user_id, notice = ?notice, "{}", notice.subject());
        Ok(())
    }

    async fn operator_alert(&self, subject: &str, body: &str) -> AppResult<()> {
        warn!(alert = true, "{}: {}", subject, body);
        Ok(())
    }
}

// ============ EMAIL (RESEND) ============

#[derive(Debug, Serialize)]
struct ResendEmailRequest {
    to: String,
    from: String,
    subject: String,
    html: String,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

/// Resend-backed notifier. Operator alerts are emailed; payment notices are
/// logged because recipient addresses belong to the profile layer.
pub struct ResendNotifier {
    api_key: String,
    from_email: String,
    ops_email: String,
    client: reqwest::Client,
}

impl ResendNotifier {
    pub fn new(api_key: String, from_email: String, ops_email: String) -> Self {
        Self {
            api_key,
            from_email,
            ops_email,
            client: reqwest::Client::new(),
        }
    }

    /// Send email via Resend
    pub async fn send_email(&self, to: &str, subject: &str, html_body: &str) -> AppResult<String> {
        let request = ResendEmailRequest {
            to: to.to_string(),
            from: self.from_email.clone(),
            subject: subject.to_string(),
            html: html_body.to_string(),
        };

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalError(format!("Resend API error: {}", error_text)));
        }

        let result: ResendEmailResponse = response.json().await?;
        info!("Email sent via Resend: {}", result.id);
        Ok(result.id)
    }
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn payment_notice(&self, user_id: Uuid, notice: PaymentNotice) -> AppResult<()> {
        LogNotifier.payment_notice(user_id, notice).await
    }

    async fn operator_alert(&self, subject: &str, body: &str) -> AppResult<()> {
        let html = format!("<h3>{}</h3><pre>{}</pre>", subject, body);
        self.send_email(&self.ops_email, &format!("[settlement] {}", subject), &html)
            .await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_notice_serializes_with_type_tag() {
        let notice = PaymentNotice::WithdrawalReturned {
            payment_id: Uuid::nil(),
            amount: dec!(500.00),
            currency: "usd".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "withdrawal_returned");
        assert_eq!(json["amount"], "500.00");
        assert_eq!(notice.subject(), "Withdrawal returned to escrow");
    }

    #[tokio::test]
    async fn test_log_notifier_never_fails() {
        let notifier = LogNotifier;
        notifier
            .payment_notice(
                Uuid::new_v4(),
                PaymentNotice::ChargeFailed {
                    payment_id: Uuid::new_v4(),
                    reason: "card_declined".into(),
                },
            )
            .await
            .unwrap();
        notifier.operator_alert("webhook failed", "evt_1").await.unwrap();
    }
}
