use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cart item entity.
///
/// Unique per `(cart_id, variant_id)`: repeated adds increment `quantity`
/// instead of inserting a second row. `unit_price` is the price snapshot
/// taken when the item was first added.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cart_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub cart_id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub unit_price: Decimal,
    /// Whether this item holds a live reservation on the variant's stock.
    /// Digital variants never reserve.
    pub is_stock_reserved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::cart::Entity",
        from = "Column::CartId",
        to = "super::cart::Column::Id"
    )]
    Cart,
    #[sea_orm(
        belongs_to = "super::book_variant::Entity",
        from = "Column::VariantId",
        to = "super::book_variant::Column::Id"
    )]
    BookVariant,
}

impl Related<super::cart::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Cart.def()
    }
}

impl Related<super::book_variant::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BookVariant.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
