use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::error::{AppError, AppResult};

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies processor signatures of the form `t=<unix>,v1=<hex>[,v1=<hex>...]`.
///
/// The signed content is `"{t}.{raw body}"` under HMAC-SHA256 with the shared
/// secret. Any matching `v1` entry is accepted so the processor can roll secrets.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance_secs: i64,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs,
        }
    }

    pub fn verify(&self, payload: &[u8], header: &str) -> AppResult<()> {
        self.verify_at(payload, header, Utc::now().timestamp())
    }

    pub fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> AppResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();

        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            warn!("Missing timestamp in signature header");
            AppError::InvalidSignature("missing timestamp".into())
        })?;
        if candidates.is_empty() {
            warn!("Missing v1 signature in signature header");
            return Err(AppError::InvalidSignature("missing v1 signature".into()));
        }

        // the timestamp is unauthenticated at this point, so no plain subtraction
        let drift = now.abs_diff(timestamp);
        if drift > self.tolerance_secs.unsigned_abs() {
            warn!(timestamp, now, drift, "Webhook timestamp outside tolerance");
            return Err(AppError::InvalidSignature("timestamp outside tolerance".into()));
        }

        let mac = self.mac_for(timestamp, payload)?;
        let matched = candidates.iter().any(|candidate| match hex::decode(candidate) {
            // verify_slice compares in constant time
            Ok(bytes) => mac.clone().verify_slice(&bytes).is_ok(),
            Err(_) => false,
        });

        if !matched {
            warn!("Webhook signature mismatch");
            return Err(AppError::InvalidSignature("signature mismatch".into()));
        }
        Ok(())
    }

    /// Produce a header the verifier accepts. Used by tests and local tooling.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> AppResult<String> {
        let signature = hex::encode(self.mac_for(timestamp, payload)?.finalize().into_bytes());
        Ok(format!("t={},v1={}", timestamp, signature))
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> AppResult<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| AppError::Config("invalid webhook secret".into()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}
