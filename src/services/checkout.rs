//! Checkout orchestration: cart to order to payment transaction.
//!
//! `initiate_checkout` is idempotent end to end. The client's key is
//! claimed before any state changes; a retried request replays the stored
//! response instead of cutting a second order. The outbound provider call
//! runs detached from the request, so a dropped client connection can never
//! cancel money movement mid-flight.

use crate::{
    circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry},
    config::AppConfig,
    entities::{
        cart, order, order_item, order_status_log, payment_transaction, BookVariant, Cart,
        CartItem, CartStatus, FulfillmentStatus, Order, OrderModel, PaymentProvider,
        PaymentStatus, PaymentTransactionModel, TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{GatewayError, GatewayRegistry, GatewayResponse, PaymentRequest},
    retry::{with_retry, RetryConfig, RetryExhausted},
    services::{
        carts::CartIdentity,
        idempotency::{IdempotencyClaim, IdempotencyService},
    },
};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    ModelTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const CHECKOUT_ROUTE: &str = "POST /api/v1/checkout";

/// Checkout request payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutInput {
    pub payment_method: PaymentProvider,
    #[serde(default)]
    pub shipping_address: Option<serde_json::Value>,
}

/// Identifiers the client needs to track the payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub order_id: Uuid,
    pub order_number: String,
    pub transaction_id: Uuid,
    pub payment_status: PaymentStatus,
    pub total_amount: Decimal,
    pub currency: String,
}

/// Distinguishes a fresh checkout from an idempotent replay.
#[derive(Debug)]
pub enum CheckoutResult {
    Created(CheckoutResponse),
    Replayed {
        status_code: u16,
        body: serde_json::Value,
    },
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    idempotency: IdempotencyService,
    gateways: GatewayRegistry,
    breakers: CircuitBreakerRegistry,
    retry: RetryConfig,
    event_sender: Arc<EventSender>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        idempotency: IdempotencyService,
        gateways: GatewayRegistry,
        breakers: CircuitBreakerRegistry,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            idempotency,
            gateways,
            breakers,
            retry: RetryConfig {
                max_attempts: config.resilience.retry_max_attempts,
                base_delay: std::time::Duration::from_millis(config.resilience.retry_base_delay_ms),
                max_delay: std::time::Duration::from_millis(config.resilience.retry_max_delay_ms),
                exponential_backoff: true,
            },
            event_sender,
        }
    }

    /// Turns the identity's active cart into an Order plus a PENDING
    /// transaction, then kicks off the provider call in the background.
    ///
    /// A retried request with the same idempotency key gets the first
    /// request's stored response; a request whose twin is still executing
    /// gets a 409.
    #[instrument(skip(self, input))]
    pub async fn initiate_checkout(
        &self,
        identity: CartIdentity,
        idempotency_key: &str,
        input: CheckoutInput,
    ) -> Result<CheckoutResult, ServiceError> {
        if idempotency_key.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Idempotency key must not be empty".to_string(),
            ));
        }

        let claim_id = match self.idempotency.claim(idempotency_key, CHECKOUT_ROUTE).await? {
            IdempotencyClaim::Acquired(id) => id,
            IdempotencyClaim::Replay {
                status_code,
                response_body,
            } => {
                info!(idempotency_key, "Replaying stored checkout response");
                return Ok(CheckoutResult::Replayed {
                    status_code,
                    body: response_body,
                });
            }
            IdempotencyClaim::InFlight => {
                return Err(ServiceError::Conflict(
                    "A checkout with this idempotency key is already in progress".to_string(),
                ));
            }
        };

        match self
            .create_order_and_transaction(&identity, idempotency_key, &input)
            .await
        {
            Ok((response, transaction)) => {
                let body = serde_json::to_value(&response).map_err(|e| {
                    ServiceError::InternalError(format!("Response serialization failed: {}", e))
                })?;
                self.idempotency
                    .record_response(&*self.db, claim_id, 201, body)
                    .await?;

                self.spawn_provider_call(transaction);

                self.event_sender
                    .send_or_log(Event::OrderCreated(response.order_id))
                    .await;
                Ok(CheckoutResult::Created(response))
            }
            Err(e) => {
                // Nothing was committed; free the key so the client can
                // retry with the same one.
                if let Err(release_err) = self.idempotency.release(claim_id).await {
                    warn!(error = %release_err, "Failed to release idempotency claim");
                }
                Err(e)
            }
        }
    }

    /// One transaction: snapshot the cart into an immutable Order, move the
    /// cart to CHECKOUT, open the PENDING payment transaction.
    async fn create_order_and_transaction(
        &self,
        identity: &CartIdentity,
        idempotency_key: &str,
        input: &CheckoutInput,
    ) -> Result<(CheckoutResponse, PaymentTransactionModel), ServiceError> {
        let txn = self.db.begin().await?;

        let cart_query = Cart::find().filter(cart::Column::Status.eq(CartStatus::Active));
        let cart_query = match identity {
            CartIdentity::Customer(id) => cart_query.filter(cart::Column::CustomerId.eq(*id)),
            CartIdentity::Guest(sid) => {
                cart_query.filter(cart::Column::SessionId.eq(sid.clone()))
            }
        };
        let cart_model = cart_query
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound("No active cart for identity".to_string()))?;
        if !cart_model.status.can_transition_to(CartStatus::Checkout) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cart {} cannot enter checkout from {:?}",
                cart_model.id, cart_model.status
            )));
        }

        let items = cart_model.find_related(CartItem).all(&txn).await?;
        if items.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let mut total = Decimal::ZERO;

        // Price the lines before any insert; the parent order row must
        // exist before its items to satisfy the foreign key.
        let mut lines = Vec::with_capacity(items.len());
        for item in &items {
            let variant = BookVariant::find_by_id(item.variant_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::InternalError(format!(
                        "Variant {} missing for cart item {}",
                        item.variant_id, item.id
                    ))
                })?;
            let line_total = item.unit_price * Decimal::from(item.quantity);
            total += line_total;
            lines.push((item, variant, line_total));
        }

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            customer_id: Set(cart_model.customer_id),
            cart_id: Set(cart_model.id),
            currency: Set(cart_model.currency.clone()),
            total_amount: Set(total),
            payment_status: Set(PaymentStatus::Pending),
            fulfillment_status: Set(FulfillmentStatus::NotStarted),
            shipping_address: Set(input.shipping_address.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        for (item, variant, line_total) in lines {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(item.variant_id),
                sku: Set(variant.sku),
                title: Set(variant.title),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                line_total: Set(line_total),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        let mut cart_active: cart::ActiveModel = cart_model.clone().into();
        cart_active.status = Set(CartStatus::Checkout);
        cart_active.checkout_started_at = Set(Some(now));
        cart_active.updated_at = Set(now);
        cart_active.update(&txn).await?;

        let transaction = payment_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            provider: Set(input.payment_method),
            amount: Set(total),
            currency: Set(order.currency.clone()),
            status: Set(TransactionStatus::Pending),
            idempotency_key: Set(idempotency_key.to_string()),
            gateway_ref_id: Set(None),
            raw_request: Set(None),
            raw_response: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CheckoutStarted {
                cart_id: cart_model.id,
                order_id: order.id,
            })
            .await;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            transaction_id = %transaction.id,
            %total,
            "Checkout initiated"
        );

        Ok((
            CheckoutResponse {
                order_id: order.id,
                order_number: order.order_number,
                transaction_id: transaction.id,
                payment_status: PaymentStatus::Pending,
                total_amount: total,
                currency: order.currency,
            },
            transaction,
        ))
    }

    /// Runs the provider call on its own task. The HTTP request that
    /// triggered checkout may disconnect; the payment attempt finishes and
    /// records its outcome regardless.
    fn spawn_provider_call(&self, transaction: PaymentTransactionModel) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.call_provider(transaction).await {
                error!(error = %e, "Detached provider call failed");
            }
        });
    }

    /// Calls the provider through its circuit breaker, with bounded retry
    /// for transient faults inside the breaker's timed window. Records the
    /// outcome on the transaction either way.
    async fn call_provider(
        &self,
        transaction: PaymentTransactionModel,
    ) -> Result<(), ServiceError> {
        let gateway = self
            .gateways
            .get(transaction.provider)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let breaker = self.breakers.get(transaction.provider.as_str());

        let request = PaymentRequest {
            order_id: transaction.order_id,
            transaction_id: transaction.id,
            amount: transaction.amount,
            currency: transaction.currency.clone(),
        };

        let result = breaker
            .call(with_retry(&self.retry, GatewayError::is_retryable, || {
                gateway.initiate_payment(&request)
            }))
            .await;

        match result {
            Ok(response) => self.record_initiation(&transaction, response).await,
            Err(e) => {
                let reason = map_gateway_failure(e);
                warn!(
                    transaction_id = %transaction.id,
                    error = %reason,
                    "Payment initiation failed"
                );
                self.fail_initiation(&transaction, &reason).await
            }
        }
    }

    async fn record_initiation(
        &self,
        transaction: &PaymentTransactionModel,
        response: GatewayResponse,
    ) -> Result<(), ServiceError> {
        let mut active: payment_transaction::ActiveModel = transaction.clone().into();
        active.gateway_ref_id = Set(Some(response.gateway_ref_id));
        active.raw_request = Set(Some(response.raw_request));
        active.raw_response = Set(Some(response.raw_response));
        active.updated_at = Set(Utc::now());
        active.update(&*self.db).await?;
        info!(transaction_id = %transaction.id, "Payment initiated at provider");
        Ok(())
    }

    /// A terminal initiation failure fails the transaction and the order,
    /// and hands the cart back so the customer can try again. Reservations
    /// stay held by the live cart.
    async fn fail_initiation(
        &self,
        transaction: &PaymentTransactionModel,
        reason: &ServiceError,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        let mut active: payment_transaction::ActiveModel = transaction.clone().into();
        active.status = Set(TransactionStatus::Failed);
        active.raw_response = Set(Some(json!({ "error": reason.to_string() })));
        active.updated_at = Set(Utc::now());
        active.update(&txn).await?;

        let order = Order::find_by_id(transaction.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!("Order {} vanished", transaction.order_id))
            })?;
        transition_payment_status(&txn, &order, PaymentStatus::Failed, "system").await?;

        if let Some(cart_model) = Cart::find_by_id(order.cart_id).one(&txn).await? {
            if cart_model.status == CartStatus::Checkout {
                let mut cart_active: cart::ActiveModel = cart_model.into();
                cart_active.status = Set(CartStatus::Active);
                cart_active.checkout_started_at = Set(None);
                cart_active.updated_at = Set(Utc::now());
                cart_active.update(&txn).await?;
            }
        }

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentFailed {
                order_id: transaction.order_id,
                transaction_id: transaction.id,
            })
            .await;
        Ok(())
    }
}

/// Validated payment-status transition plus its audit log entry, on the
/// caller's transaction.
pub(crate) async fn transition_payment_status(
    txn: &DatabaseTransaction,
    order: &OrderModel,
    to: PaymentStatus,
    changed_by: &str,
) -> Result<OrderModel, ServiceError> {
    if !order.payment_status.can_transition_to(to) {
        return Err(ServiceError::InvalidStatus(format!(
            "Order {} payment_status cannot go {} -> {}",
            order.id,
            order.payment_status.as_str(),
            to.as_str()
        )));
    }

    order_status_log::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order.id),
        field: Set("payment_status".to_string()),
        from_status: Set(order.payment_status.as_str().to_string()),
        to_status: Set(to.as_str().to_string()),
        changed_by: Set(changed_by.to_string()),
        changed_at: Set(Utc::now()),
    }
    .insert(txn)
    .await?;

    let mut active: order::ActiveModel = order.clone().into();
    active.payment_status = Set(to);
    active.updated_at = Set(Utc::now());
    Ok(active.update(txn).await?)
}

/// Maps a breaker-wrapped gateway failure onto the service error taxonomy.
pub(crate) fn map_gateway_failure(
    err: CircuitBreakerError<RetryExhausted<GatewayError>>,
) -> ServiceError {
    match err {
        CircuitBreakerError::CircuitOpen(_) => ServiceError::CircuitBreakerOpen,
        CircuitBreakerError::Timeout(d) => {
            ServiceError::GatewayTransient(format!("call timed out after {:?}", d))
        }
        CircuitBreakerError::Inner(exhausted) => match exhausted.source {
            GatewayError::Transient(msg) => ServiceError::GatewayTransient(format!(
                "{} ({} attempts)",
                msg, exhausted.attempts
            )),
            GatewayError::Rejected(msg) => ServiceError::GatewayRejected(msg),
            GatewayError::Signature(_) => ServiceError::SignatureInvalid,
        },
    }
}

/// Human-facing order number, e.g. `BK-20260830-4F7C2A`.
fn generate_order_number() -> String {
    let mut rng = rand::thread_rng();
    let suffix: u32 = rng.gen_range(0..0xFFFFFF);
    format!("BK-{}-{:06X}", Utc::now().format("%Y%m%d"), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_numbers_have_expected_shape() {
        let n = generate_order_number();
        assert!(n.starts_with("BK-"));
        assert_eq!(n.len(), "BK-20260830-4F7C2A".len());
    }

    #[test]
    fn gateway_failures_map_to_service_errors() {
        let open = map_gateway_failure(CircuitBreakerError::CircuitOpen("phonepe".to_string()));
        assert!(matches!(open, ServiceError::CircuitBreakerOpen));

        let rejected = map_gateway_failure(CircuitBreakerError::Inner(RetryExhausted {
            attempts: 1,
            source: GatewayError::Rejected("card declined".to_string()),
        }));
        assert!(matches!(rejected, ServiceError::GatewayRejected(_)));

        let transient = map_gateway_failure(CircuitBreakerError::Inner(RetryExhausted {
            attempts: 3,
            source: GatewayError::Transient("connection reset".to_string()),
        }));
        assert!(transient.is_retryable());
    }
}
