use crate::handlers::common::{created_response, map_service_error, success_response};
use crate::{
    entities::PaymentProvider,
    errors::{ApiError, ServiceError},
    AppState,
};
use axum::{
    body::Bytes,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Creates the router for payment endpoints
pub fn payments_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook/:provider", post(provider_webhook))
        .route("/refunds", post(create_refund))
        .route("/refunds/:id", get(get_refund))
}

#[derive(Debug, Deserialize)]
struct RefundRequestBody {
    transaction_id: Uuid,
    amount: Decimal,
}

/// Provider webhook endpoint.
///
/// Always answers 200 so a failed business outcome can never trigger a
/// provider retry storm; the outcome is logged instead. Only an unknown
/// provider path or a bad signature gets a non-200, which providers treat
/// as a delivery failure worth retrying.
async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(provider) = PaymentProvider::parse(&provider) else {
        return (StatusCode::NOT_FOUND, axum::Json(json!({"error": "unknown provider"})))
            .into_response();
    };

    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    match state
        .services
        .payments
        .process_webhook(provider, &header_map, &body)
        .await
    {
        Ok(outcome) => {
            tracing::info!(
                %provider,
                is_valid = outcome.is_valid,
                processed = outcome.processed,
                "Webhook handled"
            );
            (StatusCode::OK, axum::Json(json!({ "received": true }))).into_response()
        }
        Err(ServiceError::SignatureInvalid) => {
            ServiceError::SignatureInvalid.into_response()
        }
        Err(e) => {
            warn!(%provider, error = %e, "Webhook processing failed");
            (StatusCode::OK, axum::Json(json!({ "received": true }))).into_response()
        }
    }
}

/// Refund part or all of a successful transaction
async fn create_refund(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RefundRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let refund = state
        .services
        .payments
        .refund(payload.transaction_id, payload.amount)
        .await
        .map_err(map_service_error)?;
    Ok(created_response(refund))
}

/// Get refund status
async fn get_refund(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let refund = state
        .services
        .payments
        .get_refund(id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(refund))
}
