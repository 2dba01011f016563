//! Domain events for the cart/checkout pipeline.
//!
//! Events are advisory: failure to deliver one never fails the operation
//! that produced it.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the cart, merge, and checkout services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartCreated(Uuid),
    CartItemAdded { cart_id: Uuid, variant_id: Uuid },
    CartItemRemoved { cart_id: Uuid, variant_id: Uuid },
    CartAbandoned(Uuid),
    CartMerged {
        cart_id: Uuid,
        session_id: String,
        items_merged: u32,
    },
    CheckoutStarted { cart_id: Uuid, order_id: Uuid },
    OrderCreated(Uuid),
    PaymentSucceeded { order_id: Uuid, transaction_id: Uuid },
    PaymentFailed { order_id: Uuid, transaction_id: Uuid },
    RefundIssued { transaction_id: Uuid, refund_id: Uuid },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, logging instead of failing when the channel is closed
    /// or full.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.send(event).await {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Creates an event channel plus a task draining it into the log.
pub fn channel(buffer: usize) -> (EventSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(buffer);
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            info!(?event, "domain event");
        }
    });
    (EventSender::new(tx), handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = EventSender::new(tx);
        // Must not panic or error.
        sender.send_or_log(Event::CartCreated(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn events_round_trip_through_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let id = Uuid::new_v4();
        sender.send_or_log(Event::OrderCreated(id)).await;
        match rx.recv().await {
            Some(Event::OrderCreated(got)) => assert_eq!(got, id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
