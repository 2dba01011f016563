//! Bookshop API Library
//!
//! Carts with stock reservation, guest-cart merge at login, and resilient
//! payment-gateway checkout for an online bookshop.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateways;
pub mod handlers;
pub mod migrator;
pub mod retry;
pub mod services;

use axum::Router;
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use gateways::{GatewayRegistry, PaymentGateway, PhonePeGateway, RazorpayGateway};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Services used by the HTTP handlers.
#[derive(Clone)]
pub struct AppServices {
    pub carts: services::CartService,
    pub cart_merge: services::CartMergeService,
    pub checkout: services::CheckoutService,
    pub payments: services::PaymentService,
    pub idempotency: services::IdempotencyService,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub event_sender: Arc<events::EventSender>,
    pub services: AppServices,
}

impl AppState {
    /// Wires the full service graph from a connection, config, and event
    /// channel.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: Arc<config::AppConfig>,
        event_sender: Arc<events::EventSender>,
    ) -> Self {
        let http_client = reqwest::Client::new();
        let gateway_list: Vec<Arc<dyn PaymentGateway>> = vec![
            Arc::new(PhonePeGateway::new(http_client.clone(), &config.gateways)),
            Arc::new(RazorpayGateway::new(http_client, &config.gateways)),
        ];
        let gateways = GatewayRegistry::new(gateway_list);
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: config.resilience.breaker_failure_threshold,
            success_threshold: config.resilience.breaker_success_threshold,
            call_timeout: Duration::from_secs(config.resilience.breaker_call_timeout_secs),
            reset_timeout: Duration::from_secs(config.resilience.breaker_reset_timeout_secs),
        });

        let carts = services::CartService::new(db.clone(), event_sender.clone(), config.clone());
        let cart_merge =
            services::CartMergeService::new(db.clone(), carts.clone(), event_sender.clone());
        let idempotency = services::IdempotencyService::new(db.clone());
        let checkout = services::CheckoutService::new(
            db.clone(),
            idempotency.clone(),
            gateways.clone(),
            breakers.clone(),
            &config,
            event_sender.clone(),
        );
        let payments = services::PaymentService::new(
            db.clone(),
            carts.clone(),
            gateways,
            breakers,
            &config,
            event_sender.clone(),
        );

        Self {
            db,
            config,
            event_sender,
            services: AppServices {
                carts,
                cart_merge,
                checkout,
                payments,
                idempotency,
            },
        }
    }
}

/// Versioned API routes.
pub fn api_v1_routes() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/carts", handlers::carts_routes())
        .nest("/checkout", handlers::checkout_routes())
        .nest("/payments", handlers::payments_routes())
}

/// Builds the complete application router with middleware applied.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_routes())
        .nest("/health", handlers::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
