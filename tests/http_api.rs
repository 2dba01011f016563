//! Router-level tests: requests driven through the full axum stack with
//! `tower::ServiceExt::oneshot`, exercising extractors, validation, and the
//! error-to-status mapping end to end.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    response::Response,
};
use common::TestApp;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

use bookshop_api::entities::BookFormat;

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, session: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-session-id", session)
        .body(Body::from(payload.to_string()))
        .expect("build request")
}

#[tokio::test]
async fn health_reports_database_up() {
    let app = TestApp::new().await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
}

#[tokio::test]
async fn add_item_then_fetch_current_cart() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(BookFormat::Paperback, 5, dec!(299.00)).await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/v1/carts/items",
            "sess_http_1",
            &json!({ "variant_id": variant.id, "quantity": 2 }),
        ))
        .await
        .expect("infallible");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["items"][0]["quantity"], 2);

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/v1/carts")
                .header("x-session-id", "sess_http_1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("infallible");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["items"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["cart"]["session_id"], "sess_http_1");
}

#[tokio::test]
async fn request_without_identity_is_rejected() {
    let app = TestApp::new().await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/carts/items")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "variant_id": uuid::Uuid::new_v4(), "quantity": 1 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversell_maps_to_unprocessable_entity() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(BookFormat::Hardcover, 3, dec!(999.00)).await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .oneshot(post_json(
            "/api/v1/carts/items",
            "sess_http_2",
            &json!({ "variant_id": variant.id, "quantity": 10 }),
        ))
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap_or("").contains("available"));
}

#[tokio::test]
async fn removing_item_returns_no_content() {
    let app = TestApp::new().await;
    let variant = app.seed_variant(BookFormat::Paperback, 4, dec!(150.00)).await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .clone()
        .oneshot(post_json(
            "/api/v1/carts/items",
            "sess_http_3",
            &json!({ "variant_id": variant.id, "quantity": 2 }),
        ))
        .await
        .expect("infallible");
    let body = body_json(response).await;
    let cart_id = body["cart"]["id"].as_str().expect("cart id").to_string();
    let item_id = body["items"][0]["id"].as_str().expect("item id").to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/carts/{cart_id}/items/{item_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("infallible");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/carts/{cart_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("infallible");
    let body = body_json(response).await;
    assert_eq!(body["items"].as_array().map(Vec::len), Some(0));

    let reloaded = app.reload_variant(variant.id).await;
    assert_eq!(reloaded.reserved_quantity, 0);
}

#[tokio::test]
async fn unknown_webhook_provider_is_not_found() {
    let app = TestApp::new().await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/payments/webhook/stripe")
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_unauthorized() {
    let app = TestApp::new().await;
    let router = bookshop_api::create_router(app.state.clone());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/payments/webhook/phonepe")
                .header("content-type", "application/json")
                .header("x-verify", "bogus###1")
                .body(Body::from(json!({ "response": "eyJ9" }).to_string()))
                .unwrap(),
        )
        .await
        .expect("infallible");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
