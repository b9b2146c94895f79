use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, AppResult};

/// Processor event kinds the engine acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ChargeSucceeded,
    ChargeFailed,
    TransferCreated,
    TransferPaid,
    TransferFailed,
    AccountUpdated,
    PayoutPaid,
    PayoutFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ChargeSucceeded,
        EventKind::ChargeFailed,
        EventKind::TransferCreated,
        EventKind::TransferPaid,
        EventKind::TransferFailed,
        EventKind::AccountUpdated,
        EventKind::PayoutPaid,
        EventKind::PayoutFailed,
    ];

    pub fn from_type(event_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == event_type)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChargeSucceeded => "payment_intent.succeeded",
            EventKind::ChargeFailed => "payment_intent.payment_failed",
            EventKind::TransferCreated => "transfer.created",
            EventKind::TransferPaid => "transfer.paid",
            EventKind::TransferFailed => "transfer.failed",
            EventKind::AccountUpdated => "account.updated",
            EventKind::PayoutPaid => "payout.paid",
            EventKind::PayoutFailed => "payout.failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Webhook envelope: `{id, type, created, data: {object}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProcessorEvent {
    pub fn parse(payload: &[u8]) -> AppResult<Self> {
        Ok(Self::parse_with_snapshot(payload)?.0)
    }

    /// Parse the envelope and keep the raw JSON for the ingestion record
    pub fn parse_with_snapshot(payload: &[u8]) -> AppResult<(Self, serde_json::Value)> {
        let malformed = |e: serde_json::Error| AppError::BadRequest(format!("Malformed webhook payload: {}", e));
        let raw: serde_json::Value = serde_json::from_slice(payload).map_err(malformed)?;
        let event = Self::deserialize(&raw).map_err(malformed)?;
        Ok((event, raw))
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_type(&self.event_type)
    }

    /// Decode `data.object` into the shape a handler expects
    pub fn object<T: DeserializeOwned>(&self) -> AppResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            AppError::Serialization(format!("{} object for event {}: {}", self.event_type, self.id, e))
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

/// `payment_intent.*` object
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub last_payment_error: Option<PaymentError>,
}

/// `transfer.*` and `payout.*` object
#[derive(Debug, Clone, Deserialize)]
pub struct MovementObject {
    pub id: String,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// `account.updated` object
#[derive(Debug, Clone, Deserialize)]
pub struct AccountObject {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
}
