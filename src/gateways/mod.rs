//! Outbound payment provider integrations.
//!
//! Each provider implements [`PaymentGateway`]; the orchestrator only sees
//! the trait plus a coarse error split between transient faults (worth a
//! retry) and rejections (not worth one).

pub mod phonepe;
pub mod razorpay;

use crate::entities::PaymentProvider;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use phonepe::PhonePeGateway;
pub use razorpay::RazorpayGateway;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network fault or provider 5xx. Safe to retry.
    #[error("Transient gateway error: {0}")]
    Transient(String),
    /// Provider 4xx or an explicit decline. Retrying will not help.
    #[error("Gateway rejected the request: {0}")]
    Rejected(String),
    /// Malformed or unverifiable webhook payload.
    #[error("Webhook verification failed: {0}")]
    Signature(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            GatewayError::Transient(err.to_string())
        } else {
            GatewayError::Rejected(err.to_string())
        }
    }

    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if status.is_server_error() {
            GatewayError::Transient(format!("{}: {}", status, body))
        } else {
            GatewayError::Rejected(format!("{}: {}", status, body))
        }
    }
}

/// What the orchestrator hands a gateway to start a payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRequest {
    pub order_id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
}

/// What the orchestrator hands a gateway to refund a captured payment.
#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    pub transaction_id: Uuid,
    pub refund_id: Uuid,
    pub gateway_ref_id: String,
    pub amount: Decimal,
    pub currency: String,
}

/// A gateway's answer, kept verbatim for the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub gateway_ref_id: String,
    pub raw_request: serde_json::Value,
    pub raw_response: serde_json::Value,
}

/// A verified, decoded webhook notification.
#[derive(Debug, Clone)]
pub struct WebhookNotification {
    /// Our transaction id, echoed back by the provider.
    pub transaction_id: Uuid,
    pub gateway_ref_id: Option<String>,
    pub success: bool,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    async fn initiate_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<GatewayResponse, GatewayError>;

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayResponse, GatewayError>;

    /// Recomputes the provider's signature over the raw body and
    /// constant-time-compares it against the supplied headers, then decodes
    /// the notification. Never performs side effects.
    fn verify_webhook(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<WebhookNotification, GatewayError>;
}

/// Looks up the configured gateway for a provider.
#[derive(Clone)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentProvider, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new(gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        Self {
            gateways: gateways.into_iter().map(|g| (g.provider(), g)).collect(),
        }
    }

    pub fn get(&self, provider: PaymentProvider) -> Result<Arc<dyn PaymentGateway>, GatewayError> {
        self.gateways
            .get(&provider)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected(format!("Provider {} not configured", provider)))
    }
}

/// Constant-time byte comparison for signature checks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"abc123", b"abc123"));
        assert!(!constant_time_eq(b"abc123", b"abc124"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(GatewayError::Transient("timeout".into()).is_retryable());
        assert!(!GatewayError::Rejected("card declined".into()).is_retryable());
        assert!(!GatewayError::Signature("bad checksum".into()).is_retryable());
    }
}
