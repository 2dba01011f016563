use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Shopping cart entity.
///
/// A cart belongs to exactly one identity: an authenticated customer
/// (`customer_id`) or an anonymous session (`session_id`), never both and
/// never neither. The service layer enforces the mutual exclusion at
/// creation time.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "carts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(nullable)]
    pub customer_id: Option<Uuid>,
    #[sea_orm(nullable)]
    pub session_id: Option<String>,
    pub currency: String,
    pub status: CartStatus,
    #[sea_orm(nullable)]
    pub checkout_started_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::cart_item::Entity")]
    CartItems,
}

impl Related<super::cart_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CartItems.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Cart lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "checkout")]
    Checkout,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "abandoned")]
    Abandoned,
}

impl CartStatus {
    /// Legal moves: Active -> Checkout | Abandoned, Checkout -> Completed,
    /// Checkout -> Active (abandoned checkout returns to shopping).
    pub fn can_transition_to(self, next: CartStatus) -> bool {
        use CartStatus::*;
        matches!(
            (self, next),
            (Active, Checkout) | (Active, Abandoned) | (Checkout, Completed) | (Checkout, Active)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cart_status_transitions() {
        assert!(CartStatus::Active.can_transition_to(CartStatus::Checkout));
        assert!(CartStatus::Active.can_transition_to(CartStatus::Abandoned));
        assert!(CartStatus::Checkout.can_transition_to(CartStatus::Completed));
        assert!(CartStatus::Checkout.can_transition_to(CartStatus::Active));

        assert!(!CartStatus::Active.can_transition_to(CartStatus::Completed));
        assert!(!CartStatus::Completed.can_transition_to(CartStatus::Active));
        assert!(!CartStatus::Abandoned.can_transition_to(CartStatus::Checkout));
    }
}
