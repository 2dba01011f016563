use crate::handlers::common::{
    map_service_error, no_content_response, success_response, validate_input, ShopperIdentity,
};
use crate::{
    errors::ApiError,
    services::{cart_merge::GuestItemInput, carts::AddItemInput},
    AppState,
};
use axum::{
    extract::{Json, Path, State},
    routing::{delete, get, post, put},
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Creates the router for cart endpoints
pub fn carts_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(get_current_cart))
        .route("/items", post(add_item))
        .route("/merge", post(merge_guest_cart))
        .route("/:id", get(get_cart))
        .route("/:id/items/:item_id", put(update_item))
        .route("/:id/items/:item_id", delete(remove_item))
        .route("/:id/clear", post(clear_cart))
}

#[derive(Debug, Deserialize, Validate)]
struct AddItemRequest {
    variant_id: Uuid,
    #[validate(range(min = 1))]
    quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
struct UpdateQuantityRequest {
    #[validate(range(min = 0))]
    quantity: i32,
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    session_id: String,
    #[serde(default)]
    items: Vec<GuestItemInput>,
}

/// Get the identity's active cart
async fn get_current_cart(
    State(state): State<Arc<AppState>>,
    ShopperIdentity(identity): ShopperIdentity,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart = state
        .services
        .carts
        .find_active_cart(&identity)
        .await
        .map_err(map_service_error)?
        .ok_or_else(|| {
            map_service_error(crate::errors::ServiceError::NotFound(
                "No active cart".to_string(),
            ))
        })?;
    let cart_with_items = state
        .services
        .carts
        .get_cart(cart.id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart_with_items))
}

/// Get cart with items
async fn get_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let cart_with_items = state
        .services
        .carts
        .get_cart(id)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart_with_items))
}

/// Add item to the identity's cart, creating the cart on first add
async fn add_item(
    State(state): State<Arc<AppState>>,
    ShopperIdentity(identity): ShopperIdentity,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .add_item(
            identity,
            AddItemInput {
                variant_id: payload.variant_id,
                quantity: payload.quantity,
            },
        )
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart))
}

/// Update cart item quantity; zero removes the item
async fn update_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
    Json(payload): Json<UpdateQuantityRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    validate_input(&payload)?;

    let cart = state
        .services
        .carts
        .update_item_quantity(cart_id, item_id, payload.quantity)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(cart))
}

/// Remove item from cart
async fn remove_item(
    State(state): State<Arc<AppState>>,
    Path((cart_id, item_id)): Path<(Uuid, Uuid)>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .services
        .carts
        .remove_item(cart_id, item_id)
        .await
        .map_err(map_service_error)?;
    Ok(no_content_response())
}

/// Clear all items from a cart
async fn clear_cart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    state
        .services
        .carts
        .clear_cart(id)
        .await
        .map_err(map_service_error)?;
    Ok(no_content_response())
}

/// Merge a guest session's cart into the authenticated customer's cart
async fn merge_guest_cart(
    State(state): State<Arc<AppState>>,
    ShopperIdentity(identity): ShopperIdentity,
    Json(payload): Json<MergeRequest>,
) -> Result<impl axum::response::IntoResponse, ApiError> {
    let customer_id = match identity {
        crate::services::carts::CartIdentity::Customer(id) => id,
        crate::services::carts::CartIdentity::Guest(_) => {
            return Err(ApiError::BadRequest(
                "Merging requires an authenticated customer".to_string(),
            ))
        }
    };

    let outcome = state
        .services
        .cart_merge
        .merge_guest_cart(customer_id, &payload.session_id, payload.items)
        .await
        .map_err(map_service_error)?;
    Ok(success_response(outcome))
}
