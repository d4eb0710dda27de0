use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::MovementReason;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender/receiver pair with the given buffer size.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the channel is closed.
    ///
    /// Events are published after the database commit, so a delivery problem
    /// must never undo or fail the mutation that produced them.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "Dropping domain event");
        }
    }
}

/// Facts published after a cart or inventory transaction commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartUpdated {
        cart_id: Uuid,
        quantity: i64,
        grand_total: Decimal,
    },
    CartCleared(Uuid),
    CouponApplied {
        cart_id: Uuid,
        code: String,
        discount: Decimal,
    },
    StockAdjusted {
        product_id: Uuid,
        variant_id: Uuid,
        delta: i32,
        new_stock: i32,
        reason: MovementReason,
    },
    StocktakePosted {
        session_id: Uuid,
        movements_created: usize,
    },
    OnHandRebuilt {
        variants_scanned: usize,
        variants_changed: usize,
    },
}

impl Event {
    /// Short, stable name for logs and metrics labels.
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartUpdated { .. } => "cart_updated",
            Event::CartCleared(_) => "cart_cleared",
            Event::CouponApplied { .. } => "coupon_applied",
            Event::StockAdjusted { .. } => "stock_adjusted",
            Event::StocktakePosted { .. } => "stocktake_posted",
            Event::OnHandRebuilt { .. } => "on_hand_rebuilt",
        }
    }
}

// Handlers implementing this trait receive every event in publication order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Drains `rx`, logging each event and handing it to every registered handler.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!("Received event: {:?}", event);

        match &event {
            Event::StockAdjusted {
                product_id,
                variant_id,
                delta,
                new_stock,
                reason,
            } => {
                info!(
                    %product_id,
                    %variant_id,
                    delta,
                    new_stock,
                    %reason,
                    "Stock adjusted"
                );
            }
            Event::StocktakePosted {
                session_id,
                movements_created,
            } => {
                info!(%session_id, movements_created, "Stocktake posted");
            }
            Event::OnHandRebuilt {
                variants_scanned,
                variants_changed,
            } => {
                if *variants_changed > 0 {
                    warn!(
                        variants_scanned,
                        variants_changed, "On-hand rebuild corrected ledger drift"
                    );
                } else {
                    info!(variants_scanned, "On-hand rebuild found no drift");
                }
            }
            other => debug!(event = other.name(), "Cart event"),
        }

        for handler in &handlers {
            if let Err(e) = handler.handle_event(&event).await {
                error!(event = event.name(), error = %e, "Event handler failed");
            }
        }
    }

    warn!("Event processing loop has ended");
}
