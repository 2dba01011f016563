//! End-to-end checkout: idempotent initiation, webhook settlement, replay
//! safety, and refunds, with the provider mocked at the HTTP boundary.

mod common;

use assert_matches::assert_matches;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bookshop_api::{
    entities::{
        order_item, refund, BookFormat, CartStatus, Order, OrderItem, OrderStatusLog,
        PaymentProvider, PaymentStatus, PaymentTransaction, Refund, RefundStatus,
        TransactionStatus,
    },
    errors::ServiceError,
    services::carts::{AddItemInput, CartIdentity},
    services::checkout::{CheckoutInput, CheckoutResult},
};
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn mock_phonepe_pay(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/pg/v1/pay"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "code": "PAYMENT_INITIATED",
            "data": { "transactionId": "T_PAY_1" }
        })))
        .mount(server)
        .await;
}

async fn mock_phonepe_refund(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/pg/v1/refund"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "code": "PAYMENT_SUCCESS",
            "data": { "transactionId": "T_REFUND_1" }
        })))
        .mount(server)
        .await;
}

/// Builds a signed PhonePe callback for the given transaction, matching
/// the test salt key in `GatewayConfig::for_tests`.
fn signed_phonepe_webhook(
    transaction_id: Uuid,
    success: bool,
) -> (HashMap<String, String>, Vec<u8>) {
    let payload = json!({
        "code": if success { "PAYMENT_SUCCESS" } else { "PAYMENT_ERROR" },
        "data": {
            "merchantTransactionId": transaction_id.to_string(),
            "transactionId": "T_GW_999",
        }
    });
    let encoded = BASE64.encode(payload.to_string());
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    hasher.update(b"test-salt-key");
    let x_verify = format!("{}###1", hex::encode(hasher.finalize()));

    let mut headers = HashMap::new();
    headers.insert("x-verify".to_string(), x_verify);
    (headers, json!({ "response": encoded }).to_string().into_bytes())
}

async fn checkout_app() -> (TestApp, MockServer) {
    let server = MockServer::start().await;
    mock_phonepe_pay(&server).await;
    mock_phonepe_refund(&server).await;
    let app = TestApp::with_gateway_url(&server.uri()).await;
    (app, server)
}

/// Waits until the detached provider call has recorded its outcome, so
/// later assertions cannot race it.
async fn wait_for_initiation(app: &TestApp, transaction_id: Uuid) {
    for _ in 0..200 {
        let transaction = PaymentTransaction::find_by_id(transaction_id)
            .one(&*app.state.db)
            .await
            .expect("query")
            .expect("transaction exists");
        if transaction.raw_response.is_some() || transaction.status != TransactionStatus::Pending {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("provider initiation never recorded");
}

async fn seeded_checkout(app: &TestApp, session: &str, key: &str) -> CheckoutResult {
    let variant = app.seed_variant(BookFormat::Paperback, 10, dec!(500.00)).await;
    app.state
        .services
        .carts
        .add_item(
            CartIdentity::Guest(session.to_string()),
            AddItemInput {
                variant_id: variant.id,
                quantity: 2,
            },
        )
        .await
        .expect("add item");

    let result = app
        .state
        .services
        .checkout
        .initiate_checkout(
            CartIdentity::Guest(session.to_string()),
            key,
            CheckoutInput {
                payment_method: PaymentProvider::PhonePe,
                shipping_address: Some(json!({ "city": "Pune", "pin": "411001" })),
            },
        )
        .await
        .expect("checkout");
    if let CheckoutResult::Created(ref response) = result {
        wait_for_initiation(app, response.transaction_id).await;
    }
    result
}

#[tokio::test]
async fn checkout_snapshots_cart_into_pending_order() {
    let (app, _server) = checkout_app().await;
    let result = seeded_checkout(&app, "sess_c1", "key-c1").await;

    let CheckoutResult::Created(response) = result else {
        panic!("expected fresh checkout");
    };
    assert_eq!(response.payment_status, PaymentStatus::Pending);
    assert_eq!(response.total_amount, dec!(1000.00));
    assert_eq!(response.currency, "INR");

    // The snapshot rows hang off the order satisfying the foreign key.
    let lines = OrderItem::find()
        .filter(order_item::Column::OrderId.eq(response.order_id))
        .all(&*app.state.db)
        .await
        .expect("query");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].quantity, 2);
    assert_eq!(lines[0].line_total, dec!(1000.00));

    let cart = app
        .state
        .services
        .carts
        .get_cart(
            Order::find_by_id(response.order_id)
                .one(&*app.state.db)
                .await
                .expect("query")
                .expect("order exists")
                .cart_id,
        )
        .await
        .expect("load cart");
    assert_eq!(cart.cart.status, CartStatus::Checkout);
}

#[tokio::test]
async fn retried_checkout_replays_without_a_second_transaction() {
    let (app, _server) = checkout_app().await;
    let first = seeded_checkout(&app, "sess_c2", "key-c2").await;
    let CheckoutResult::Created(first_response) = first else {
        panic!("expected fresh checkout");
    };

    let second = app
        .state
        .services
        .checkout
        .initiate_checkout(
            CartIdentity::Guest("sess_c2".to_string()),
            "key-c2",
            CheckoutInput {
                payment_method: PaymentProvider::PhonePe,
                shipping_address: None,
            },
        )
        .await
        .expect("retry");

    let CheckoutResult::Replayed { status_code, body } = second else {
        panic!("expected replay");
    };
    assert_eq!(status_code, 201);
    assert_eq!(
        body["transaction_id"],
        Value::String(first_response.transaction_id.to_string())
    );

    let transactions = PaymentTransaction::find()
        .all(&*app.state.db)
        .await
        .expect("query");
    assert_eq!(transactions.len(), 1);
}

#[tokio::test]
async fn concurrent_same_key_checkouts_create_one_transaction() {
    let (app, _server) = checkout_app().await;
    let variant = app.seed_variant(BookFormat::Paperback, 10, dec!(500.00)).await;
    app.state
        .services
        .carts
        .add_item(
            CartIdentity::Guest("sess_c3".to_string()),
            AddItemInput {
                variant_id: variant.id,
                quantity: 1,
            },
        )
        .await
        .expect("add item");

    let run = || {
        app.state.services.checkout.initiate_checkout(
            CartIdentity::Guest("sess_c3".to_string()),
            "key-c3",
            CheckoutInput {
                payment_method: PaymentProvider::PhonePe,
                shipping_address: None,
            },
        )
    };
    let (a, b) = tokio::join!(run(), run());

    let created = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Ok(CheckoutResult::Created(_))))
        .count();
    assert_eq!(created, 1, "exactly one request wins the key");
    // The loser either replays the stored response or is told to back off.
    for result in [a, b] {
        match result {
            Ok(CheckoutResult::Created(_)) | Ok(CheckoutResult::Replayed { .. }) => {}
            Err(ServiceError::Conflict(_)) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    let transactions = PaymentTransaction::find()
        .all(&*app.state.db)
        .await
        .expect("query");
    assert_eq!(transactions.len(), 1);
}

#[tokio::test]
async fn successful_webhook_settles_order_and_commits_stock() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c4", "key-c4").await
    else {
        panic!("expected fresh checkout");
    };

    let (headers, body) = signed_phonepe_webhook(response.transaction_id, true);
    let outcome = app
        .state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("webhook");
    assert!(outcome.is_valid);
    assert!(outcome.processed);

    let transaction = PaymentTransaction::find_by_id(response.transaction_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("transaction exists");
    assert_eq!(transaction.status, TransactionStatus::Success);
    assert_eq!(transaction.gateway_ref_id.as_deref(), Some("T_GW_999"));

    let order = Order::find_by_id(response.order_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("order exists");
    assert_eq!(order.payment_status, PaymentStatus::Paid);

    // Reservation became a sale: stock down, hold gone, cart closed.
    let cart = app.state.services.carts.get_cart(order.cart_id).await.expect("load");
    assert_eq!(cart.cart.status, CartStatus::Completed);
    let variant_id = cart.items[0].variant_id;
    let variant = app.reload_variant(variant_id).await;
    assert_eq!(variant.stock_quantity, 8);
    assert_eq!(variant.reserved_quantity, 0);
}

#[tokio::test]
async fn webhook_replay_is_a_no_op() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c5", "key-c5").await
    else {
        panic!("expected fresh checkout");
    };

    let (headers, body) = signed_phonepe_webhook(response.transaction_id, true);
    let first = app
        .state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("first delivery");
    assert!(first.processed);

    let replay = app
        .state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("replayed delivery");
    assert!(replay.is_valid);
    assert!(!replay.processed);

    let logs = OrderStatusLog::find()
        .filter(bookshop_api::entities::order_status_log::Column::OrderId.eq(response.order_id))
        .all(&*app.state.db)
        .await
        .expect("query");
    assert_eq!(logs.len(), 1, "replay must not append a second audit entry");

    let variant = {
        let cart_id = Order::find_by_id(response.order_id)
            .one(&*app.state.db)
            .await
            .expect("query")
            .expect("order exists")
            .cart_id;
        let cart = app.state.services.carts.get_cart(cart_id).await.expect("load");
        app.reload_variant(cart.items[0].variant_id).await
    };
    assert_eq!(variant.stock_quantity, 8, "stock must not be decremented twice");
}

#[tokio::test]
async fn tampered_webhook_is_rejected_before_any_state_change() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c6", "key-c6").await
    else {
        panic!("expected fresh checkout");
    };

    let (mut headers, body) = signed_phonepe_webhook(response.transaction_id, true);
    headers.insert("x-verify".to_string(), format!("{}###1", "0".repeat(64)));

    let err = app
        .state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SignatureInvalid);

    let transaction = PaymentTransaction::find_by_id(response.transaction_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("transaction exists");
    assert_eq!(transaction.status, TransactionStatus::Pending);
}

#[tokio::test]
async fn failed_webhook_hands_cart_back_to_the_customer() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c7", "key-c7").await
    else {
        panic!("expected fresh checkout");
    };

    let (headers, body) = signed_phonepe_webhook(response.transaction_id, false);
    let outcome = app
        .state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("webhook");
    assert!(outcome.processed);

    let order = Order::find_by_id(response.order_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("order exists");
    assert_eq!(order.payment_status, PaymentStatus::Failed);

    let cart = app.state.services.carts.get_cart(order.cart_id).await.expect("load");
    assert_eq!(cart.cart.status, CartStatus::Active);
    // Reservations stay held by the returned cart.
    let variant = app.reload_variant(cart.items[0].variant_id).await;
    assert_eq!(variant.reserved_quantity, 2);
    assert_eq!(variant.stock_quantity, 10);
}

#[tokio::test]
async fn full_refund_flips_order_to_refunded_and_blocks_a_second_one() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c8", "key-c8").await
    else {
        panic!("expected fresh checkout");
    };
    let (headers, body) = signed_phonepe_webhook(response.transaction_id, true);
    app.state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("settle");

    let refund = app
        .state
        .services
        .payments
        .refund(response.transaction_id, dec!(1000.00))
        .await
        .expect("refund");
    assert_eq!(refund.status, RefundStatus::Success);
    assert_eq!(refund.gateway_refund_id.as_deref(), Some("T_REFUND_1"));

    let order = Order::find_by_id(response.order_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("order exists");
    assert_eq!(order.payment_status, PaymentStatus::Refunded);

    // The funds are gone; a second full refund must be rejected.
    let err = app
        .state
        .services
        .payments
        .refund(response.transaction_id, dec!(1000.00))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn partial_refunds_accumulate_up_to_the_captured_amount() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c9", "key-c9").await
    else {
        panic!("expected fresh checkout");
    };
    let (headers, body) = signed_phonepe_webhook(response.transaction_id, true);
    app.state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("settle");

    app.state
        .services
        .payments
        .refund(response.transaction_id, dec!(400.00))
        .await
        .expect("first partial refund");

    let order = Order::find_by_id(response.order_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("order exists");
    assert_eq!(
        order.payment_status,
        PaymentStatus::Paid,
        "partial refund keeps the order paid"
    );

    let err = app
        .state
        .services
        .payments
        .refund(response.transaction_id, dec!(700.00))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    let refund = app
        .state
        .services
        .payments
        .refund(response.transaction_id, dec!(600.00))
        .await
        .expect("refund of the exact remainder");
    assert_eq!(refund.status, RefundStatus::Success);

    let order = Order::find_by_id(response.order_id)
        .one(&*app.state.db)
        .await
        .expect("query")
        .expect("order exists");
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn racing_refunds_cannot_exceed_the_captured_amount() {
    let (app, _server) = checkout_app().await;
    let CheckoutResult::Created(response) = seeded_checkout(&app, "sess_c11", "key-c11").await
    else {
        panic!("expected fresh checkout");
    };
    let (headers, body) = signed_phonepe_webhook(response.transaction_id, true);
    app.state
        .services
        .payments
        .process_webhook(PaymentProvider::PhonePe, &headers, &body)
        .await
        .expect("settle");

    // Two refunds of 600 against a 1000 capture: at most one may land.
    let payments = &app.state.services.payments;
    let (first, second) = tokio::join!(
        payments.refund(response.transaction_id, dec!(600.00)),
        payments.refund(response.transaction_id, dec!(600.00)),
    );
    assert_eq!(
        [&first, &second].iter().filter(|r| r.is_ok()).count(),
        1,
        "exactly one of the racing refunds may succeed"
    );

    let refunded: rust_decimal::Decimal = Refund::find()
        .filter(refund::Column::TransactionId.eq(response.transaction_id))
        .filter(refund::Column::Status.ne(RefundStatus::Failed))
        .all(&*app.state.db)
        .await
        .expect("query")
        .iter()
        .map(|r| r.amount)
        .sum();
    assert_eq!(refunded, dec!(600.00));
}

#[tokio::test]
async fn empty_cart_cannot_check_out() {
    let (app, _server) = checkout_app().await;
    let err = app
        .state
        .services
        .checkout
        .initiate_checkout(
            CartIdentity::Guest("sess_c10".to_string()),
            "key-c10",
            CheckoutInput {
                payment_method: PaymentProvider::PhonePe,
                shipping_address: None,
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}
