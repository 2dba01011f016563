use crate::errors::{ApiError, ServiceError};
use crate::services::carts::CartIdentity;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

pub const CUSTOMER_ID_HEADER: &str = "x-customer-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Standard no content response
pub fn no_content_response() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ApiError> {
    input
        .validate()
        .map_err(|e| ApiError::ValidationError(format!("Validation failed: {}", e)))
}

/// Map service errors to API errors
pub fn map_service_error(err: ServiceError) -> ApiError {
    ApiError::ServiceError(err)
}

/// Who is shopping: an authenticated customer (`X-Customer-Id`) or a guest
/// session (`X-Session-Id`). Customer wins when both are present; a request
/// with neither cannot own a cart.
#[derive(Debug, Clone)]
pub struct ShopperIdentity(pub CartIdentity);

#[async_trait]
impl<S> FromRequestParts<S> for ShopperIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(raw) = parts.headers.get(CUSTOMER_ID_HEADER) {
            let customer_id = raw
                .to_str()
                .ok()
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| {
                    ApiError::BadRequest(format!("Invalid {} header", CUSTOMER_ID_HEADER))
                })?;
            return Ok(ShopperIdentity(CartIdentity::Customer(customer_id)));
        }
        if let Some(raw) = parts.headers.get(SESSION_ID_HEADER) {
            let session_id = raw
                .to_str()
                .ok()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| {
                    ApiError::BadRequest(format!("Invalid {} header", SESSION_ID_HEADER))
                })?;
            return Ok(ShopperIdentity(CartIdentity::Guest(session_id.to_string())));
        }
        Err(ApiError::BadRequest(format!(
            "Either {} or {} header is required",
            CUSTOMER_ID_HEADER, SESSION_ID_HEADER
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn extract(req: Request<()>) -> Result<ShopperIdentity, ApiError> {
        let (mut parts, _) = req.into_parts();
        ShopperIdentity::from_request_parts(&mut parts, &()).await
    }

    #[tokio::test]
    async fn customer_header_wins_over_session() {
        let id = Uuid::new_v4();
        let req = Request::builder()
            .header(CUSTOMER_ID_HEADER, id.to_string())
            .header(SESSION_ID_HEADER, "sess_abc")
            .body(())
            .unwrap();
        let ShopperIdentity(identity) = extract(req).await.expect("extracts");
        assert_eq!(identity, CartIdentity::Customer(id));
    }

    #[tokio::test]
    async fn session_header_yields_guest() {
        let req = Request::builder()
            .header(SESSION_ID_HEADER, "sess_abc")
            .body(())
            .unwrap();
        let ShopperIdentity(identity) = extract(req).await.expect("extracts");
        assert_eq!(identity, CartIdentity::Guest("sess_abc".to_string()));
    }

    #[tokio::test]
    async fn missing_headers_are_rejected() {
        let req = Request::builder().body(()).unwrap();
        assert!(extract(req).await.is_err());
    }
}
