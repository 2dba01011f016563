//! Cart and stock ledger.
//!
//! Every operation here is transactional, and every change to a variant's
//! `reserved_quantity` is paired 1:1 with a cart-item change inside the same
//! transaction. The availability check and the counter increment are one
//! conditional UPDATE, so two concurrent adds cannot both pass the check and
//! oversubscribe stock.

use crate::{
    config::AppConfig,
    db::transactional,
    entities::{
        book_variant, cart, cart_item, BookVariant, Cart, CartItem, CartModel, CartStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, ModelTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// The identity a cart belongs to: an authenticated customer or an
/// anonymous session. Exactly one, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartIdentity {
    Customer(Uuid),
    Guest(String),
}

/// Input for adding an item to a cart
#[derive(Debug, Deserialize)]
pub struct AddItemInput {
    pub variant_id: Uuid,
    pub quantity: i32,
}

/// Cart with its items
#[derive(Debug, Serialize)]
pub struct CartWithItems {
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
}

/// Result of a stale-cart sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepResult {
    pub abandoned_count: u64,
    pub released_items: u64,
    pub swept_at: DateTime<Utc>,
}

/// Shopping cart service owning the Cart/CartItem aggregates and the
/// stock-reservation counters on book variants.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl CartService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    /// Adds an item to the identity's active cart, creating the cart on the
    /// first add. Physical variants reserve stock atomically; digital
    /// variants skip stock accounting entirely. Repeated adds of the same
    /// variant increment the existing row.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        identity: CartIdentity,
        input: AddItemInput,
    ) -> Result<CartWithItems, ServiceError> {
        if input.quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = self.find_or_create_active_cart_in(&txn, &identity).await?;
        self.add_item_in(&txn, &cart, input.variant_id, input.quantity)
            .await?;
        let items = cart.find_related(CartItem).all(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartItemAdded {
                cart_id: cart.id,
                variant_id: input.variant_id,
            })
            .await;

        info!(
            "Added variant {} x{} to cart {}",
            input.variant_id, input.quantity, cart.id
        );
        Ok(CartWithItems { cart, items })
    }

    /// Changes a cart item's quantity. Positive deltas re-check availability
    /// for the delta only; `new_qty = 0` removes the item and releases its
    /// whole reservation.
    #[instrument(skip(self))]
    pub async fn update_item_quantity(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
        new_qty: i32,
    ) -> Result<CartWithItems, ServiceError> {
        if new_qty < 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must not be negative".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let cart = Cart::find_by_id(cart_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let item = CartItem::find_by_id(item_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {} not found", item_id)))?;
        if item.cart_id != cart_id {
            return Err(ServiceError::InvalidOperation(
                "Item does not belong to this cart".to_string(),
            ));
        }

        let delta = new_qty - item.quantity;
        let variant_id = item.variant_id;

        if new_qty == 0 {
            if item.is_stock_reserved {
                self.release_stock_in(&txn, variant_id, item.quantity).await?;
            }
            item.delete(&txn).await?;
        } else if delta != 0 {
            if item.is_stock_reserved {
                if delta > 0 {
                    self.reserve_stock_in(&txn, variant_id, delta).await?;
                } else {
                    self.release_stock_in(&txn, variant_id, -delta).await?;
                }
            }
            let mut active: cart_item::ActiveModel = item.into();
            active.quantity = Set(new_qty);
            active.updated_at = Set(Utc::now());
            active.update(&txn).await?;
        }

        let items = cart.find_related(CartItem).all(&txn).await?;
        txn.commit().await?;

        if new_qty == 0 {
            self.event_sender
                .send_or_log(Event::CartItemRemoved {
                    cart_id,
                    variant_id,
                })
                .await;
        }

        Ok(CartWithItems { cart, items })
    }

    /// Removes an item, releasing its reservation.
    pub async fn remove_item(
        &self,
        cart_id: Uuid,
        item_id: Uuid,
    ) -> Result<CartWithItems, ServiceError> {
        self.update_item_quantity(cart_id, item_id, 0).await
    }

    /// Deletes every item and releases every reservation. The cart itself
    /// stays active.
    #[instrument(skip(self))]
    pub async fn clear_cart(&self, cart_id: Uuid) -> Result<(), ServiceError> {
        let service = self.clone();
        transactional(&self.db, move |txn| {
            Box::pin(async move {
                let cart = Cart::find_by_id(cart_id)
                    .one(txn)
                    .await?
                    .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
                service.release_all_items_in(txn, &cart).await?;
                Ok(())
            })
        })
        .await?;
        info!("Cleared cart: {}", cart_id);
        Ok(())
    }

    /// Retrieves a cart with all its items.
    pub async fn get_cart(&self, cart_id: Uuid) -> Result<CartWithItems, ServiceError> {
        let cart = Cart::find_by_id(cart_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart {} not found", cart_id)))?;
        let items = cart.find_related(CartItem).all(&*self.db).await?;
        Ok(CartWithItems { cart, items })
    }

    /// Finds the identity's active cart, if any.
    pub async fn find_active_cart(
        &self,
        identity: &CartIdentity,
    ) -> Result<Option<CartModel>, ServiceError> {
        Ok(self
            .active_cart_query(identity)
            .one(&*self.db)
            .await?)
    }

    /// Sweeps expired Active carts: releases every reservation, marks each
    /// cart Abandoned. Run periodically from a background task.
    #[instrument(skip(self))]
    pub async fn expire_stale_carts(&self) -> Result<SweepResult, ServiceError> {
        let now = Utc::now();
        let stale = Cart::find()
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .filter(cart::Column::ExpiresAt.lt(now))
            .all(&*self.db)
            .await?;

        let mut abandoned_count = 0u64;
        let mut released_items = 0u64;

        for stale_cart in stale {
            let txn = self.db.begin().await?;
            match self.abandon_cart_in(&txn, &stale_cart).await {
                Ok(item_count) => {
                    txn.commit().await?;
                    abandoned_count += 1;
                    released_items += item_count;
                    self.event_sender
                        .send_or_log(Event::CartAbandoned(stale_cart.id))
                        .await;
                }
                Err(e) => {
                    warn!(cart_id = %stale_cart.id, error = %e, "Failed to expire cart");
                }
            }
        }

        info!(
            abandoned_count,
            released_items, "Completed stale cart sweep"
        );
        Ok(SweepResult {
            abandoned_count,
            released_items,
            swept_at: now,
        })
    }

    // ---- transaction-scoped primitives, reused by the merge engine and
    // ---- checkout orchestrator to stay on the caller's transaction

    /// Loads the identity's Active cart or creates one. Exactly one Active
    /// cart per identity; the lookup and insert share the transaction.
    pub(crate) async fn find_or_create_active_cart_in(
        &self,
        txn: &DatabaseTransaction,
        identity: &CartIdentity,
    ) -> Result<CartModel, ServiceError> {
        if let Some(existing) = self.active_cart_query(identity).one(txn).await? {
            // A cart in use is not stale; each touch restarts the expiry
            // clock so the sweep cannot reap a mid-session cart.
            let now = Utc::now();
            let mut active: cart::ActiveModel = existing.into();
            active.expires_at = Set(now + Duration::minutes(self.config.cart_expiry_minutes));
            active.updated_at = Set(now);
            return Ok(active.update(txn).await?);
        }

        let (customer_id, session_id) = match identity {
            CartIdentity::Customer(id) => (Some(*id), None),
            CartIdentity::Guest(sid) => {
                if sid.trim().is_empty() {
                    return Err(ServiceError::ValidationError(
                        "Session id must not be empty".to_string(),
                    ));
                }
                (None, Some(sid.clone()))
            }
        };

        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            session_id: Set(session_id),
            currency: Set(self.config.default_currency.clone()),
            status: Set(CartStatus::Active),
            checkout_started_at: Set(None),
            expires_at: Set(now + Duration::minutes(self.config.cart_expiry_minutes)),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let cart = cart.insert(txn).await?;

        self.event_sender.send_or_log(Event::CartCreated(cart.id)).await;
        Ok(cart)
    }

    /// Upserts a cart item and reserves stock for physical variants, all on
    /// the caller's transaction.
    pub(crate) async fn add_item_in(
        &self,
        txn: &DatabaseTransaction,
        cart: &CartModel,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        if cart.status != CartStatus::Active {
            return Err(ServiceError::InvalidOperation(
                "Cart is not active".to_string(),
            ));
        }

        let variant = BookVariant::find_by_id(variant_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Variant {} not found", variant_id)))?;
        if variant.discontinued {
            return Err(ServiceError::NotFound(format!(
                "Variant {} is discontinued",
                variant_id
            )));
        }

        let unit_price = variant.price_in(&cart.currency).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Variant {} has no price in {}",
                variant_id, cart.currency
            ))
        })?;

        let reserves_stock = !variant.format.is_digital();
        if reserves_stock {
            self.reserve_stock_in(txn, variant_id, quantity).await?;
        }

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .filter(cart_item::Column::VariantId.eq(variant_id))
            .one(txn)
            .await?;

        match existing {
            Some(item) => {
                let current = item.quantity;
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(current + quantity);
                active.updated_at = Set(Utc::now());
                active.update(txn).await?;
            }
            None => {
                let now = Utc::now();
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(cart.id),
                    variant_id: Set(variant_id),
                    quantity: Set(quantity),
                    unit_price: Set(unit_price),
                    is_stock_reserved: Set(reserves_stock),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
            }
        }

        Ok(())
    }

    /// Atomically reserves `quantity` units: the availability check and the
    /// counter increment are one conditional UPDATE. Zero rows affected
    /// means the variant is missing or short on stock.
    pub(crate) async fn reserve_stock_in(
        &self,
        conn: &impl ConnectionTrait,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let result = BookVariant::update_many()
            .col_expr(
                book_variant::Column::ReservedQuantity,
                Expr::col(book_variant::Column::ReservedQuantity).add(quantity),
            )
            .col_expr(
                book_variant::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(book_variant::Column::Id.eq(variant_id))
            .filter(
                Expr::col(book_variant::Column::ReservedQuantity)
                    .lte(Expr::col(book_variant::Column::StockQuantity).sub(quantity)),
            )
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            let available = BookVariant::find_by_id(variant_id)
                .one(conn)
                .await?
                .map(|v| v.available())
                .unwrap_or(0);
            return Err(ServiceError::InsufficientStock(format!(
                "requested {}, available {}",
                quantity, available
            )));
        }
        Ok(())
    }

    /// Releases a previously held reservation. Guarded against driving the
    /// counter negative.
    pub(crate) async fn release_stock_in(
        &self,
        conn: &impl ConnectionTrait,
        variant_id: Uuid,
        quantity: i32,
    ) -> Result<(), ServiceError> {
        let result = BookVariant::update_many()
            .col_expr(
                book_variant::Column::ReservedQuantity,
                Expr::col(book_variant::Column::ReservedQuantity).sub(quantity),
            )
            .col_expr(
                book_variant::Column::UpdatedAt,
                Expr::value(Utc::now()),
            )
            .filter(book_variant::Column::Id.eq(variant_id))
            .filter(book_variant::Column::ReservedQuantity.gte(quantity))
            .exec(conn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::InternalError(format!(
                "Reservation release of {} on variant {} found no matching hold",
                quantity, variant_id
            )));
        }
        Ok(())
    }

    /// Converts every reservation held by the cart into a stock decrement
    /// (payment completed: the hold becomes a sale). Item rows stay as order
    /// history; their reservation flags are cleared.
    pub(crate) async fn commit_reservations_in(
        &self,
        txn: &DatabaseTransaction,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        let items = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .filter(cart_item::Column::IsStockReserved.eq(true))
            .all(txn)
            .await?;

        for item in items {
            let result = BookVariant::update_many()
                .col_expr(
                    book_variant::Column::StockQuantity,
                    Expr::col(book_variant::Column::StockQuantity).sub(item.quantity),
                )
                .col_expr(
                    book_variant::Column::ReservedQuantity,
                    Expr::col(book_variant::Column::ReservedQuantity).sub(item.quantity),
                )
                .col_expr(book_variant::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(book_variant::Column::Id.eq(item.variant_id))
                .filter(book_variant::Column::ReservedQuantity.gte(item.quantity))
                .filter(book_variant::Column::StockQuantity.gte(item.quantity))
                .exec(txn)
                .await?;
            if result.rows_affected == 0 {
                return Err(ServiceError::InternalError(format!(
                    "Stock commit of {} on variant {} found no matching hold",
                    item.quantity, item.variant_id
                )));
            }

            let mut active: cart_item::ActiveModel = item.into();
            active.is_stock_reserved = Set(false);
            active.updated_at = Set(Utc::now());
            active.update(txn).await?;
        }
        Ok(())
    }

    /// Deletes the cart's items after releasing their reservations.
    pub(crate) async fn release_all_items_in(
        &self,
        txn: &DatabaseTransaction,
        cart: &CartModel,
    ) -> Result<u64, ServiceError> {
        let items = cart.find_related(CartItem).all(txn).await?;
        let count = items.len() as u64;
        for item in items {
            if item.is_stock_reserved {
                self.release_stock_in(txn, item.variant_id, item.quantity)
                    .await?;
            }
            item.delete(txn).await?;
        }
        Ok(count)
    }

    async fn abandon_cart_in(
        &self,
        txn: &DatabaseTransaction,
        stale_cart: &CartModel,
    ) -> Result<u64, ServiceError> {
        let released = self.release_all_items_in(txn, stale_cart).await?;
        let mut active: cart::ActiveModel = stale_cart.clone().into();
        active.status = Set(CartStatus::Abandoned);
        active.updated_at = Set(Utc::now());
        active.update(txn).await?;
        Ok(released)
    }

    fn active_cart_query(&self, identity: &CartIdentity) -> sea_orm::Select<Cart> {
        let query = Cart::find().filter(cart::Column::Status.eq(CartStatus::Active));
        match identity {
            CartIdentity::Customer(id) => query.filter(cart::Column::CustomerId.eq(*id)),
            CartIdentity::Guest(sid) => query.filter(cart::Column::SessionId.eq(sid.clone())),
        }
    }
}
