//! Guest-cart merge at login.
//!
//! One transaction folds a guest session's locally-cached cart lines into
//! the customer's cart. The merge is best-effort per line: a title that is
//! unavailable or short on stock is reported as a conflict while the rest
//! of the merge proceeds, so a single sold-out book never blocks login.

use crate::{
    entities::{cart, cart_item, BookVariant, Cart, CartItem, CartModel, CartStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    services::carts::{CartIdentity, CartService},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction, EntityTrait,
    ModelTrait, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// One line from the guest's locally-cached cart.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct GuestItemInput {
    pub variant_id: Uuid,
    #[validate(range(min = 1))]
    pub quantity: i32,
    /// Price snapshot the guest saw, in minor currency units. Optional;
    /// when present it is compared against the live price.
    pub local_price_cents: Option<i64>,
}

/// Why a guest line did not merge cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeConflictReason {
    /// Variant deleted or discontinued since the guest added it.
    Unavailable,
    /// Not enough free stock; the line merged up to the available amount,
    /// possibly zero.
    OutOfStock,
    /// Merged in full at the current price, which differs from the guest's
    /// snapshot. Advisory only.
    PriceChanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeConflict {
    pub variant_id: Uuid,
    pub reason: MergeConflictReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Counts only successfully merged quantity.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MergeSummary {
    pub item_count: u32,
    pub total_added: i64,
}

#[derive(Debug, Serialize)]
pub struct MergeOutcome {
    pub cart: CartModel,
    pub items: Vec<cart_item::Model>,
    pub merged: MergeSummary,
    pub conflicts: Vec<MergeConflict>,
}

#[derive(Clone)]
pub struct CartMergeService {
    db: Arc<DatabaseConnection>,
    carts: CartService,
    event_sender: Arc<EventSender>,
}

impl CartMergeService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        carts: CartService,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            carts,
            event_sender,
        }
    }

    /// Merges a guest session's cart lines into the customer's active cart,
    /// creating the customer cart if needed. All reservation adjustments and
    /// the deletion of the server-side guest cart happen in one transaction,
    /// so the guest cart only disappears if the merge commits.
    #[instrument(skip(self, guest_items))]
    pub async fn merge_guest_cart(
        &self,
        customer_id: Uuid,
        session_id: &str,
        guest_items: Vec<GuestItemInput>,
    ) -> Result<MergeOutcome, ServiceError> {
        for item in &guest_items {
            item.validate()?;
        }

        let txn = self.db.begin().await?;

        let customer_cart = self
            .carts
            .find_or_create_active_cart_in(&txn, &CartIdentity::Customer(customer_id))
            .await?;

        // Retire the server-side guest cart first. Releasing its holds
        // before the line-by-line merge means stock the guest already held
        // counts as available for the re-reservation below.
        if let Some(guest_cart) = Cart::find()
            .filter(cart::Column::Status.eq(CartStatus::Active))
            .filter(cart::Column::SessionId.eq(session_id))
            .one(&txn)
            .await?
        {
            self.carts.release_all_items_in(&txn, &guest_cart).await?;
            Cart::delete_by_id(guest_cart.id).exec(&txn).await?;
        }

        let mut merged = MergeSummary::default();
        let mut conflicts = Vec::new();

        for guest_item in &guest_items {
            self.merge_line_in(&txn, &customer_cart, guest_item, &mut merged, &mut conflicts)
                .await?;
        }

        let items = customer_cart.find_related(CartItem).all(&txn).await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CartMerged {
                cart_id: customer_cart.id,
                session_id: session_id.to_string(),
                items_merged: merged.item_count,
            })
            .await;

        info!(
            customer_cart_id = %customer_cart.id,
            item_count = merged.item_count,
            total_added = merged.total_added,
            conflict_count = conflicts.len(),
            "Merged guest cart into customer cart"
        );
        Ok(MergeOutcome {
            cart: customer_cart,
            items,
            merged,
            conflicts,
        })
    }

    /// Merges one guest line. Availability caps the quantity instead of
    /// failing the batch; price drift is reported but never blocks.
    async fn merge_line_in(
        &self,
        txn: &DatabaseTransaction,
        customer_cart: &CartModel,
        guest_item: &GuestItemInput,
        merged: &mut MergeSummary,
        conflicts: &mut Vec<MergeConflict>,
    ) -> Result<(), ServiceError> {
        let variant = BookVariant::find_by_id(guest_item.variant_id)
            .one(txn)
            .await?;
        let variant = match variant {
            Some(v) if !v.discontinued => v,
            _ => {
                conflicts.push(MergeConflict {
                    variant_id: guest_item.variant_id,
                    reason: MergeConflictReason::Unavailable,
                    message: "This title is no longer available".to_string(),
                    details: None,
                });
                return Ok(());
            }
        };

        let current_price = variant.price_in(&customer_cart.currency).ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Variant {} has no price in {}",
                variant.id, customer_cart.currency
            ))
        })?;

        let reserves_stock = !variant.format.is_digital();
        let merge_qty = if reserves_stock {
            let available = variant.available().max(0);
            if available < guest_item.quantity {
                conflicts.push(MergeConflict {
                    variant_id: variant.id,
                    reason: MergeConflictReason::OutOfStock,
                    message: format!(
                        "Only {} of {} requested copies are in stock",
                        available, guest_item.quantity
                    ),
                    details: Some(json!({
                        "requested": guest_item.quantity,
                        "available": available,
                    })),
                });
            }
            available.min(guest_item.quantity)
        } else {
            guest_item.quantity
        };

        if merge_qty == 0 {
            return Ok(());
        }

        if reserves_stock {
            self.carts
                .reserve_stock_in(txn, variant.id, merge_qty)
                .await?;
        }

        let existing = CartItem::find()
            .filter(cart_item::Column::CartId.eq(customer_cart.id))
            .filter(cart_item::Column::VariantId.eq(variant.id))
            .one(txn)
            .await?;

        let now = Utc::now();
        match existing {
            Some(item) => {
                let current = item.quantity;
                let mut active: cart_item::ActiveModel = item.into();
                active.quantity = Set(current + merge_qty);
                active.unit_price = Set(current_price);
                active.updated_at = Set(now);
                active.update(txn).await?;
            }
            None => {
                cart_item::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    cart_id: Set(customer_cart.id),
                    variant_id: Set(variant.id),
                    quantity: Set(merge_qty),
                    unit_price: Set(current_price),
                    is_stock_reserved: Set(reserves_stock),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(txn)
                .await?;
            }
        }

        merged.item_count += 1;
        merged.total_added += merge_qty as i64;

        if let Some(local_cents) = guest_item.local_price_cents {
            let local_price = Decimal::new(local_cents, 2);
            if local_price != current_price {
                conflicts.push(MergeConflict {
                    variant_id: variant.id,
                    reason: MergeConflictReason::PriceChanged,
                    message: "The price has changed since this was added".to_string(),
                    details: Some(json!({
                        "oldPrice": local_price,
                        "newPrice": current_price,
                    })),
                });
            }
        }

        Ok(())
    }
}
