//! Database entities for the cart-to-order pipeline.

pub mod book_variant;
pub mod cart;
pub mod cart_item;
pub mod idempotency_key;
pub mod order;
pub mod order_item;
pub mod order_status_log;
pub mod payment_transaction;
pub mod refund;

pub use book_variant::{BookFormat, Entity as BookVariant, Model as BookVariantModel};
pub use cart::{CartStatus, Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use idempotency_key::{Entity as IdempotencyKey, Model as IdempotencyKeyModel};
pub use order::{Entity as Order, FulfillmentStatus, Model as OrderModel, PaymentStatus};
pub use order_item::{Entity as OrderItem, Model as OrderItemModel};
pub use order_status_log::{Entity as OrderStatusLog, Model as OrderStatusLogModel};
pub use payment_transaction::{
    Entity as PaymentTransaction, Model as PaymentTransactionModel, PaymentProvider,
    TransactionStatus,
};
pub use refund::{Entity as Refund, Model as RefundModel, RefundStatus};
