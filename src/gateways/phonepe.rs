//! PhonePe payment gateway integration.
//!
//! PhonePe signs every call with an `X-VERIFY` checksum:
//! `sha256(base64_payload + api_path + salt_key) + "###" + salt_index`.
//! Webhook callbacks carry the same header computed over the base64
//! response body alone, with a JSON envelope `{"response": "<base64>"}`.

use super::{
    constant_time_eq, GatewayError, GatewayResponse, PaymentGateway, PaymentRequest,
    RefundRequest, WebhookNotification,
};
use crate::config::GatewayConfig;
use crate::entities::PaymentProvider;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, warn};
use uuid::Uuid;

const PAY_PATH: &str = "/pg/v1/pay";
const REFUND_PATH: &str = "/pg/v1/refund";

pub struct PhonePeGateway {
    client: reqwest::Client,
    base_url: String,
    merchant_id: String,
    salt_key: String,
    salt_index: u8,
}

impl PhonePeGateway {
    pub fn new(client: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            client,
            base_url: config.phonepe_base_url.clone(),
            merchant_id: config.phonepe_merchant_id.clone(),
            salt_key: config.phonepe_salt_key.clone(),
            salt_index: config.phonepe_salt_index,
        }
    }

    fn checksum(&self, base64_payload: &str, path: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(base64_payload.as_bytes());
        hasher.update(path.as_bytes());
        hasher.update(self.salt_key.as_bytes());
        format!("{}###{}", hex::encode(hasher.finalize()), self.salt_index)
    }

    async fn post_signed(
        &self,
        path: &str,
        payload: &Value,
    ) -> Result<(Value, Value), GatewayError> {
        let encoded = BASE64.encode(payload.to_string());
        let x_verify = self.checksum(&encoded, path);
        let body = json!({ "request": encoded });

        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("X-VERIFY", &x_verify)
            .json(&body)
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

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| GatewayError::Rejected(format!("Unparseable response: {}", e)))?;
        if parsed.get("success").and_then(Value::as_bool) != Some(true) {
            let code = parsed
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN");
            return Err(GatewayError::Rejected(format!(
                "PhonePe declined: {}",
                code
            )));
        }
        Ok((body, parsed))
    }
}

/// Converts a decimal major-unit amount to paise.
fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    (amount * Decimal::from(100))
        .round()
        .to_i64()
        .ok_or_else(|| GatewayError::Rejected(format!("Amount {} out of range", amount)))
}

#[async_trait]
impl PaymentGateway for PhonePeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::PhonePe
    }

    async fn initiate_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let payload = json!({
            "merchantId": self.merchant_id,
            "merchantTransactionId": request.transaction_id,
            "merchantOrderId": request.order_id,
            "amount": to_minor_units(request.amount)?,
            "paymentInstrument": { "type": "PAY_PAGE" },
        });
        debug!(transaction_id = %request.transaction_id, "Initiating PhonePe payment");

        let (raw_request, raw_response) = self.post_signed(PAY_PATH, &payload).await?;
        let gateway_ref_id = raw_response
            .pointer("/data/transactionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(GatewayResponse {
            gateway_ref_id,
            raw_request,
            raw_response,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<GatewayResponse, GatewayError> {
        let payload = json!({
            "merchantId": self.merchant_id,
            "merchantTransactionId": request.refund_id,
            "originalTransactionId": request.gateway_ref_id,
            "amount": to_minor_units(request.amount)?,
        });
        debug!(refund_id = %request.refund_id, "Initiating PhonePe refund");

        let (raw_request, raw_response) = self.post_signed(REFUND_PATH, &payload).await?;
        let gateway_ref_id = raw_response
            .pointer("/data/transactionId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(GatewayResponse {
            gateway_ref_id,
            raw_request,
            raw_response,
        })
    }

    fn verify_webhook(
        &self,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<WebhookNotification, GatewayError> {
        let supplied = headers
            .get("x-verify")
            .ok_or_else(|| GatewayError::Signature("Missing X-VERIFY header".to_string()))?;

        let envelope: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Signature(format!("Unparseable body: {}", e)))?;
        let encoded = envelope
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Signature("Missing response field".to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        hasher.update(self.salt_key.as_bytes());
        let expected = format!("{}###{}", hex::encode(hasher.finalize()), self.salt_index);
        if !constant_time_eq(expected.as_bytes(), supplied.as_bytes()) {
            warn!("PhonePe webhook checksum mismatch");
            return Err(GatewayError::Signature("Checksum mismatch".to_string()));
        }

        let decoded = BASE64
            .decode(encoded)
            .map_err(|e| GatewayError::Signature(format!("Invalid base64 payload: {}", e)))?;
        let payload: Value = serde_json::from_slice(&decoded)
            .map_err(|e| GatewayError::Signature(format!("Unparseable payload: {}", e)))?;

        let transaction_id = payload
            .pointer("/data/merchantTransactionId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| {
                GatewayError::Signature("Missing merchantTransactionId".to_string())
            })?;
        let gateway_ref_id = payload
            .pointer("/data/transactionId")
            .and_then(Value::as_str)
            .map(str::to_string);
        let success = payload.get("code").and_then(Value::as_str) == Some("PAYMENT_SUCCESS");

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

    fn gateway() -> PhonePeGateway {
        PhonePeGateway::new(reqwest::Client::new(), &GatewayConfig::for_tests())
    }

    fn signed_webhook(gw: &PhonePeGateway, payload: &Value) -> (HashMap<String, String>, Vec<u8>) {
        let encoded = BASE64.encode(payload.to_string());
        let mut hasher = Sha256::new();
        hasher.update(encoded.as_bytes());
        hasher.update(gw.salt_key.as_bytes());
        let x_verify = format!("{}###{}", hex::encode(hasher.finalize()), gw.salt_index);
        let mut headers = HashMap::new();
        headers.insert("x-verify".to_string(), x_verify);
        (headers, json!({ "response": encoded }).to_string().into_bytes())
    }

    #[test]
    fn valid_webhook_verifies_and_decodes() {
        let gw = gateway();
        let txn_id = Uuid::new_v4();
        let payload = json!({
            "code": "PAYMENT_SUCCESS",
            "data": {
                "merchantTransactionId": txn_id.to_string(),
                "transactionId": "T2407151234",
            }
        });
        let (headers, body) = signed_webhook(&gw, &payload);

        let note = gw.verify_webhook(&headers, &body).expect("valid webhook");
        assert_eq!(note.transaction_id, txn_id);
        assert_eq!(note.gateway_ref_id.as_deref(), Some("T2407151234"));
        assert!(note.success);
    }

    #[test]
    fn tampered_webhook_is_rejected() {
        let gw = gateway();
        let payload = json!({
            "code": "PAYMENT_SUCCESS",
            "data": { "merchantTransactionId": Uuid::new_v4().to_string() }
        });
        let (headers, _) = signed_webhook(&gw, &payload);
        let other = json!({ "response": BASE64.encode("tampered") })
            .to_string()
            .into_bytes();

        let err = gw.verify_webhook(&headers, &other).unwrap_err();
        assert!(matches!(err, GatewayError::Signature(_)));
    }

    #[test]
    fn failed_payment_decodes_as_unsuccessful() {
        let gw = gateway();
        let txn_id = Uuid::new_v4();
        let payload = json!({
            "code": "PAYMENT_ERROR",
            "data": { "merchantTransactionId": txn_id.to_string() }
        });
        let (headers, body) = signed_webhook(&gw, &payload);

        let note = gw.verify_webhook(&headers, &body).expect("valid webhook");
        assert!(!note.success);
    }

    #[test]
    fn amounts_convert_to_paise() {
        use rust_decimal_macros::dec;
        assert_eq!(to_minor_units(dec!(499.00)).unwrap(), 49900);
        assert_eq!(to_minor_units(dec!(0.50)).unwrap(), 50);
    }
}
