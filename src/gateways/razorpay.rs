//! Razorpay payment gateway integration.
//!
//! API calls authenticate with HTTP basic auth (key id / key secret).
//! Webhooks carry an `X-Razorpay-Signature` header: hex-encoded
//! HMAC-SHA256 of the raw body under the webhook signing secret. Our
//! transaction id rides along in the order `notes` and comes back inside
//! the webhook's payment entity.

use super::{
    constant_time_eq, GatewayError, GatewayResponse, PaymentGateway, PaymentRequest,
    RefundRequest, WebhookNotification,
};
use crate::config::GatewayConfig;
use crate::entities::PaymentProvider;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub struct RazorpayGateway {
    client: reqwest::Client,
    base_url: String,
    key_id: String,
    key_secret: String,
    webhook_secret: String,
}

impl RazorpayGateway {
    pub fn new(client: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            client,
            base_url: config.razorpay_base_url.clone(),
            key_id: config.razorpay_key_id.clone(),
            key_secret: config.razorpay_key_secret.clone(),
            webhook_secret: config.razorpay_webhook_secret.clone(),
        }
    }

    async fn post_authed(&self, path: &str, payload: &Value) -> Result<Value, GatewayError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(payload)
            .send()
            .await
            .map_err(GatewayError::from_reqwest)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(GatewayError::from_reqwest)?;
        if !status.is_success() {
            return Err(GatewayError::from_status(status, &text));
        }

        serde_json::from_str(&text)
            .map_err(|e| GatewayError::Rejected(format!("Unparseable response: {}", e)))
    }
}

fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| GatewayError::Rejected(format!("Amount {} out of range", amount)))
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Razorpay
    }

    async fn initiate_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let payload = json!({
            "amount": to_minor_units(request.amount)?,
            "currency": request.currency,
            "receipt": request.order_id,
            "notes": { "transaction_id": request.transaction_id },
        });
        debug!(transaction_id = %request.transaction_id, "Creating Razorpay order");

        let raw_response = self.post_authed("/orders", &payload).await?;
        let gateway_ref_id = raw_response
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(GatewayResponse {
            gateway_ref_id,
            raw_request: payload,
            raw_response,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayResponse, GatewayError> {
        let payload = json!({
            "amount": to_minor_units(request.amount)?,
            "notes": { "refund_id": request.refund_id },
        });
        debug!(refund_id = %request.refund_id, "Initiating Razorpay refund");

        let path = format!("/payments/{}/refund", request.gateway_ref_id);
        let raw_response = self.post_authed(&path, &payload).await?;
        let gateway_ref_id = raw_response
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(GatewayResponse {
            gateway_ref_id,
            raw_request: payload,
            raw_response,
        })
    }

    fn verify_webhook(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<WebhookNotification, GatewayError> {
        let supplied = headers.get("x-razorpay-signature").ok_or_else(|| {
            GatewayError::Signature("Missing X-Razorpay-Signature header".to_string())
        })?;

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|e| GatewayError::Signature(e.to_string()))?;
        mac.update(body);
        let expected = hex::encode(mac.finalize().into_bytes());
        if !constant_time_eq(expected.as_bytes(), supplied.as_bytes()) {
            warn!("Razorpay webhook signature mismatch");
            return Err(GatewayError::Signature("Signature mismatch".to_string()));
        }

        let payload: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Signature(format!("Unparseable body: {}", e)))?;

        let entity = payload
            .pointer("/payload/payment/entity")
            .ok_or_else(|| GatewayError::Signature("Missing payment entity".to_string()))?;
        let transaction_id = entity
            .pointer("/notes/transaction_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                GatewayError::Signature("Missing transaction_id in notes".to_string())
            })?;
        let gateway_ref_id = entity.get("id").and_then(Value::as_str).map(str::to_string);
        let success = payload.get("event").and_then(Value::as_str) == Some("payment.captured");

        Ok(WebhookNotification {
            transaction_id,
            gateway_ref_id,
            success,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;

    fn gateway() -> RazorpayGateway {
        RazorpayGateway::new(reqwest::Client::new(), &GatewayConfig::for_tests())
    }

    fn sign(gw: &RazorpayGateway, body: &[u8]) -> HashMap<String, String> {
        let mut mac = HmacSha256::new_from_slice(gw.webhook_secret.as_bytes()).unwrap();
        mac.update(body);
        let mut headers = HashMap::new();
        headers.insert(
            "x-razorpay-signature".to_string(),
            hex::encode(mac.finalize().into_bytes()),
        );
        headers
    }

    fn captured_payload(txn_id: Uuid) -> Vec<u8> {
        json!({
            "event": "payment.captured",
            "payload": { "payment": { "entity": {
                "id": "pay_NcXt2Yq9eHw1Za",
                "notes": { "transaction_id": txn_id.to_string() },
            }}}
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn valid_signature_verifies() {
        let gw = gateway();
        let txn_id = Uuid::new_v4();
        let body = captured_payload(txn_id);
        let headers = sign(&gw, &body);

        let note = gw.verify_webhook(&headers, &body).expect("valid webhook");
        assert_eq!(note.transaction_id, txn_id);
        assert_eq!(note.gateway_ref_id.as_deref(), Some("pay_NcXt2Yq9eHw1Za"));
        assert!(note.success);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let gw = gateway();
        let body = captured_payload(Uuid::new_v4());
        let mut headers = HashMap::new();
        headers.insert("x-razorpay-signature".to_string(), "0".repeat(64));

        let err = gw.verify_webhook(&headers, &body).unwrap_err();
        assert!(matches!(err, GatewayError::Signature(_)));
    }

    #[test]
    fn failed_event_decodes_as_unsuccessful() {
        let gw = gateway();
        let txn_id = Uuid::new_v4();
        let body = json!({
            "event": "payment.failed",
            "payload": { "payment": { "entity": {
                "id": "pay_failed01",
                "notes": { "transaction_id": txn_id.to_string() },
            }}}
        })
        .to_string()
        .into_bytes();
        let headers = sign(&gw, &body);

        let note = gw.verify_webhook(&headers, &body).expect("valid webhook");
        assert!(!note.success);
    }
}
