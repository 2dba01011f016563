//! Shared harness for integration tests: an in-memory SQLite database with
//! the full schema, wired into the real service graph. Gateway endpoints
//! point at unroutable addresses unless a test swaps in a mock server.

use bookshop_api::{
    config::{AppConfig, GatewayConfig},
    db,
    entities::{book_variant, BookFormat, BookVariantModel},
    events,
    migrator::Migrator,
    AppState,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use sea_orm_migration::MigratorTrait;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub struct TestApp {
    pub state: Arc<AppState>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::for_tests("sqlite::memory:")).await
    }

    pub async fn with_config(mut cfg: AppConfig) -> Self {
        cfg.gateways = GatewayConfig::for_tests();

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("connect to in-memory sqlite");
        Migrator::up(&pool, None).await.expect("run migrations");

        let (event_sender, _event_task) = events::channel(64);
        let state = Arc::new(AppState::build(
            Arc::new(pool),
            Arc::new(cfg),
            Arc::new(event_sender),
        ));
        Self { state }
    }

    /// Points both gateway integrations at a mock HTTP server.
    pub async fn with_gateway_url(url: &str) -> Self {
        let mut cfg = AppConfig::for_tests("sqlite::memory:");
        let mut gateways = GatewayConfig::for_tests();
        gateways.phonepe_base_url = url.to_string();
        gateways.razorpay_base_url = url.to_string();
        cfg.gateways = gateways;

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("connect to in-memory sqlite");
        Migrator::up(&pool, None).await.expect("run migrations");

        let (event_sender, _event_task) = events::channel(64);
        let state = Arc::new(AppState::build(
            Arc::new(pool),
            Arc::new(cfg),
            Arc::new(event_sender),
        ));
        Self { state }
    }

    /// Inserts a purchasable variant priced in the default currency (INR).
    pub async fn seed_variant(
        &self,
        format: BookFormat,
        stock: i32,
        price: Decimal,
    ) -> BookVariantModel {
        let now = Utc::now();
        let id = Uuid::new_v4();
        book_variant::ActiveModel {
            id: Set(id),
            book_id: Set(Uuid::new_v4()),
            sku: Set(format!("SKU-{}", &id.simple().to_string()[..12])),
            title: Set("The Mahabharata, Vol. 1".to_string()),
            format: Set(format),
            prices: Set(json!({ "INR": price })),
            stock_quantity: Set(stock),
            reserved_quantity: Set(0),
            discontinued: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("insert variant")
    }

    pub async fn reload_variant(&self, id: Uuid) -> BookVariantModel {
        use sea_orm::EntityTrait;
        bookshop_api::entities::BookVariant::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query variant")
            .expect("variant exists")
    }
}
