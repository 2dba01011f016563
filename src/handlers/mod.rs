//! HTTP handlers: thin translation between axum and the service layer.

pub mod carts;
pub mod checkout;
pub mod common;
pub mod health;
pub mod payments;

pub use carts::carts_routes;
pub use checkout::checkout_routes;
pub use health::health_routes;
pub use payments::payments_routes;
