use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Book format variant: a purchasable SKU of a title carrying independent
/// stock and a per-currency price map.
///
/// Owned by the catalog; this service only reads metadata and mutates the
/// `stock_quantity` / `reserved_quantity` counters. Available-to-sell is
/// `stock_quantity - reserved_quantity` and must never go negative.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "book_variants")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub book_id: Uuid,
    pub sku: String,
    pub title: String,
    pub format: BookFormat,
    /// currency code -> amount
    #[sea_orm(column_type = "Json")]
    pub prices: Json,
    pub stock_quantity: i32,
    pub reserved_quantity: i32,
    pub discontinued: bool,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
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

impl Model {
    /// Units still available to sell.
    pub fn available(&self) -> i32 {
        self.stock_quantity - self.reserved_quantity
    }

    /// Price in the given currency, if listed.
    pub fn price_in(&self, currency: &str) -> Option<Decimal> {
        let map: HashMap<String, Decimal> =
            serde_json::from_value(self.prices.clone()).unwrap_or_default();
        map.get(currency).copied()
    }
}

/// Book formats; e-book and audiobook variants carry no physical stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum BookFormat {
    #[sea_orm(string_value = "hardcover")]
    Hardcover,
    #[sea_orm(string_value = "paperback")]
    Paperback,
    #[sea_orm(string_value = "ebook")]
    Ebook,
    #[sea_orm(string_value = "audiobook")]
    Audiobook,
}

impl BookFormat {
    pub fn is_digital(self) -> bool {
        matches!(self, BookFormat::Ebook | BookFormat::Audiobook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn variant(stock: i32, reserved: i32) -> Model {
        Model {
            id: Uuid::new_v4(),
            book_id: Uuid::new_v4(),
            sku: "BK-001-PB".to_string(),
            title: "The Test Book".to_string(),
            format: BookFormat::Paperback,
            prices: json!({"INR": "499.00", "USD": "8.99"}),
            stock_quantity: stock,
            reserved_quantity: reserved,
            discontinued: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn availability_is_stock_minus_reserved() {
        assert_eq!(variant(10, 4).available(), 6);
        assert_eq!(variant(3, 3).available(), 0);
    }

    #[test]
    fn price_lookup_by_currency() {
        let v = variant(1, 0);
        assert_eq!(v.price_in("INR"), Some(dec!(499.00)));
        assert_eq!(v.price_in("USD"), Some(dec!(8.99)));
        assert_eq!(v.price_in("EUR"), None);
    }

    #[test]
    fn digital_formats() {
        assert!(BookFormat::Ebook.is_digital());
        assert!(BookFormat::Audiobook.is_digital());
        assert!(!BookFormat::Paperback.is_digital());
        assert!(!BookFormat::Hardcover.is_digital());
    }
}
