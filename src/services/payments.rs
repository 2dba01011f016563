//! Webhook settlement and refunds.
//!
//! Webhooks are the authoritative word on whether money moved. Processing
//! is idempotent by transaction status: a replayed notification for an
//! already-settled transaction verifies fine and then does nothing, so a
//! provider can redeliver as often as it likes.

use crate::{
    circuit_breaker::CircuitBreakerRegistry,
    config::AppConfig,
    entities::{
        cart, payment_transaction, refund, Cart, CartStatus, Order, PaymentProvider,
        PaymentStatus, PaymentTransaction, Refund, RefundModel, RefundStatus, TransactionStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{GatewayError, GatewayRegistry, RefundRequest},
    retry::{with_retry, RetryConfig},
    services::{
        carts::CartService,
        checkout::{map_gateway_failure, transition_payment_status},
    },
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What a webhook delivery amounted to. Returned for logging; the HTTP
/// layer answers 200 regardless.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WebhookOutcome {
    pub is_valid: bool,
    /// False for replays and for notifications about unknown transactions.
    pub processed: bool,
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    gateways: GatewayRegistry,
    breakers: CircuitBreakerRegistry,
    retry: RetryConfig,
    event_sender: Arc<EventSender>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        gateways: GatewayRegistry,
        breakers: CircuitBreakerRegistry,
        config: &AppConfig,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            carts,
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

    /// Verifies and settles a provider notification.
    ///
    /// Signature verification happens before any database read. A valid
    /// notification for a transaction that already reached a terminal
    /// status is acknowledged without re-running side effects.
    #[instrument(skip(self, headers, body))]
    pub async fn process_webhook(
        &self,
        provider: PaymentProvider,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<WebhookOutcome, ServiceError> {
        let gateway = self
            .gateways
            .get(provider)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        let note = match gateway.verify_webhook(headers, body) {
            Ok(note) => note,
            Err(GatewayError::Signature(msg)) => {
                warn!(%provider, reason = %msg, "Webhook rejected");
                return Err(ServiceError::SignatureInvalid);
            }
            Err(e) => return Err(ServiceError::InternalError(e.to_string())),
        };

        let txn = self.db.begin().await?;

        let transaction = PaymentTransaction::find_by_id(note.transaction_id)
            .one(&txn)
            .await?;
        let Some(transaction) = transaction else {
            warn!(
                transaction_id = %note.transaction_id,
                %provider,
                "Webhook references unknown transaction"
            );
            return Ok(WebhookOutcome {
                is_valid: true,
                processed: false,
            });
        };

        if transaction.provider != provider {
            warn!(
                transaction_id = %transaction.id,
                expected = %transaction.provider,
                got = %provider,
                "Webhook provider mismatch"
            );
            return Err(ServiceError::SignatureInvalid);
        }

        if transaction.status.is_terminal() {
            info!(
                transaction_id = %transaction.id,
                status = ?transaction.status,
                "Webhook replay for settled transaction, ignoring"
            );
            return Ok(WebhookOutcome {
                is_valid: true,
                processed: false,
            });
        }

        let order = Order::find_by_id(transaction.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!("Order {} vanished", transaction.order_id))
            })?;
        let changed_by = format!("webhook:{}", provider);
        let now = Utc::now();

        let mut txn_active: payment_transaction::ActiveModel = transaction.clone().into();
        if let Some(ref_id) = note.gateway_ref_id {
            txn_active.gateway_ref_id = Set(Some(ref_id));
        }
        txn_active.updated_at = Set(now);

        if note.success {
            txn_active.status = Set(TransactionStatus::Success);
            txn_active.update(&txn).await?;

            transition_payment_status(&txn, &order, PaymentStatus::Paid, &changed_by).await?;

            // Holds become sales and the cart closes out.
            self.carts.commit_reservations_in(&txn, order.cart_id).await?;
            if let Some(cart_model) = Cart::find_by_id(order.cart_id).one(&txn).await? {
                if cart_model.status == CartStatus::Checkout {
                    let mut cart_active: cart::ActiveModel = cart_model.into();
                    cart_active.status = Set(CartStatus::Completed);
                    cart_active.updated_at = Set(now);
                    cart_active.update(&txn).await?;
                }
            }

            txn.commit().await?;
            self.event_sender
                .send_or_log(Event::PaymentSucceeded {
                    order_id: order.id,
                    transaction_id: transaction.id,
                })
                .await;
            info!(order_id = %order.id, transaction_id = %transaction.id, "Payment settled");
        } else {
            txn_active.status = Set(TransactionStatus::Failed);
            txn_active.update(&txn).await?;

            transition_payment_status(&txn, &order, PaymentStatus::Failed, &changed_by).await?;

            // The cart goes back to the customer; reservations stay held.
            if let Some(cart_model) = Cart::find_by_id(order.cart_id).one(&txn).await? {
                if cart_model.status == CartStatus::Checkout {
                    let mut cart_active: cart::ActiveModel = cart_model.into();
                    cart_active.status = Set(CartStatus::Active);
                    cart_active.checkout_started_at = Set(None);
                    cart_active.updated_at = Set(now);
                    cart_active.update(&txn).await?;
                }
            }

            txn.commit().await?;
            self.event_sender
                .send_or_log(Event::PaymentFailed {
                    order_id: order.id,
                    transaction_id: transaction.id,
                })
                .await;
            info!(order_id = %order.id, transaction_id = %transaction.id, "Payment failed");
        }

        Ok(WebhookOutcome {
            is_valid: true,
            processed: true,
        })
    }

    /// Refunds part or all of a successful transaction.
    ///
    /// The refund amount plus every earlier non-failed refund must fit
    /// within the captured amount. The Refund row is committed INITIATED
    /// before the provider is called, so a crash mid-call leaves an
    /// auditable trace rather than silent money movement.
    #[instrument(skip(self))]
    pub async fn refund(
        &self,
        transaction_id: Uuid,
        amount: Decimal,
    ) -> Result<RefundModel, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Refund amount must be positive".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        // Row lock on the parent serializes concurrent refunds so the
        // balance check below cannot be raced past. SQLite ignores the
        // clause; its writes are serialized anyway.
        let transaction = PaymentTransaction::find_by_id(transaction_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Transaction {} not found", transaction_id))
            })?;
        if transaction.status != TransactionStatus::Success {
            return Err(ServiceError::InvalidOperation(format!(
                "Transaction {} is not refundable (status {:?})",
                transaction_id, transaction.status
            )));
        }
        let gateway_ref_id = transaction.gateway_ref_id.clone().ok_or_else(|| {
            ServiceError::InvalidOperation(format!(
                "Transaction {} has no provider reference",
                transaction_id
            ))
        })?;

        let prior = Refund::find()
            .filter(refund::Column::TransactionId.eq(transaction_id))
            .filter(refund::Column::Status.ne(RefundStatus::Failed))
            .all(&txn)
            .await?;
        let already_refunded: Decimal = prior.iter().map(|r| r.amount).sum();
        if already_refunded + amount > transaction.amount {
            return Err(ServiceError::InvalidOperation(format!(
                "Refund of {} exceeds remaining balance {}",
                amount,
                transaction.amount - already_refunded
            )));
        }

        let now = Utc::now();
        let refund_row = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            transaction_id: Set(transaction_id),
            amount: Set(amount),
            status: Set(RefundStatus::Initiated),
            gateway_refund_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        let gateway = self
            .gateways
            .get(transaction.provider)
            .map_err(|e| ServiceError::InternalError(e.to_string()))?;
        let breaker = self.breakers.get(transaction.provider.as_str());
        let request = RefundRequest {
            transaction_id,
            refund_id: refund_row.id,
            gateway_ref_id,
            amount,
            currency: transaction.currency.clone(),
        };

        let result = breaker
            .call(with_retry(&self.retry, GatewayError::is_retryable, || {
                gateway.refund(&request)
            }))
            .await;

        match result {
            Ok(response) => {
                let txn = self.db.begin().await?;

                let mut active: refund::ActiveModel = refund_row.clone().into();
                active.status = Set(RefundStatus::Success);
                active.gateway_refund_id = Set(Some(response.gateway_ref_id));
                active.updated_at = Set(Utc::now());
                let updated = active.update(&txn).await?;

                // Fully refunded transactions flip the order to REFUNDED.
                if already_refunded + amount == transaction.amount {
                    let order = Order::find_by_id(transaction.order_id)
                        .one(&txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::InternalError(format!(
                                "Order {} vanished",
                                transaction.order_id
                            ))
                        })?;
                    transition_payment_status(&txn, &order, PaymentStatus::Refunded, "system")
                        .await?;
                }

                txn.commit().await?;
                self.event_sender
                    .send_or_log(Event::RefundIssued {
                        transaction_id,
                        refund_id: updated.id,
                    })
                    .await;
                info!(refund_id = %updated.id, %amount, "Refund settled");
                Ok(updated)
            }
            Err(e) => {
                let reason = map_gateway_failure(e);
                let mut active: refund::ActiveModel = refund_row.into();
                active.status = Set(RefundStatus::Failed);
                active.updated_at = Set(Utc::now());
                active.update(&*self.db).await?;
                warn!(%transaction_id, error = %reason, "Refund failed at provider");
                Err(reason)
            }
        }
    }

    /// Refund lookup for status endpoints.
    pub async fn get_refund(&self, refund_id: Uuid) -> Result<RefundModel, ServiceError> {
        Refund::find_by_id(refund_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Refund {} not found", refund_id)))
    }
}
