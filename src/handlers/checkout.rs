use crate::handlers::common::{
    created_response, map_service_error, ShopperIdentity, IDEMPOTENCY_KEY_HEADER,
};
use crate::{
    errors::ApiError,
    services::checkout::{CheckoutInput, CheckoutResult},
    AppState,
};
use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

/// Creates the router for checkout endpoints
pub fn checkout_routes() -> Router<Arc<AppState>> {
    Router::new().route("/", post(initiate_checkout))
}

/// Initiate checkout for the identity's active cart.
///
/// The `Idempotency-Key` header makes retries safe; a missing header gets a
/// generated key, which keeps single-shot clients working but gives them no
/// replay protection.
async fn initiate_checkout(
    State(state): State<Arc<AppState>>,
    ShopperIdentity(identity): ShopperIdentity,
    headers: HeaderMap,
    Json(payload): Json<CheckoutInput>,
) -> Result<impl IntoResponse, ApiError> {
    let idempotency_key = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(raw) => raw
            .to_str()
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::BadRequest(format!("Invalid {} header", IDEMPOTENCY_KEY_HEADER))
            })?,
        None => Uuid::new_v4().to_string(),
    };

    let result = state
        .services
        .checkout
        .initiate_checkout(identity, &idempotency_key, payload)
        .await
        .map_err(map_service_error)?;

    Ok(match result {
        CheckoutResult::Created(response) => created_response(response),
        CheckoutResult::Replayed { status_code, body } => {
            let status =
                StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK);
            (status, axum::Json(body)).into_response()
        }
    })
}
