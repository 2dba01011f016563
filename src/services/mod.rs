//! Service layer: the transactional core behind the HTTP handlers.

pub mod cart_merge;
pub mod carts;
pub mod checkout;
pub mod idempotency;
pub mod payments;

pub use cart_merge::CartMergeService;
pub use carts::CartService;
pub use checkout::CheckoutService;
pub use idempotency::IdempotencyService;
pub use payments::PaymentService;
