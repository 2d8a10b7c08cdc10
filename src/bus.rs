//! Typed in-process event bus for cart and wishlist change notifications.
//!
//! Any component can publish and any component can subscribe. Events carry
//! no payload: subscribers re-derive state (re-read the guest cart, call
//! [`CartAggregateStore::refresh`](crate::CartAggregateStore::refresh))
//! instead of trusting data attached to a signal.

use tokio::sync::broadcast;

/// Capacity of the broadcast ring. A subscriber that falls further behind
/// skips ahead; it only ever needs the latest signal anyway.
const BUS_CAPACITY: usize = 64;

/// A change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreEvent {
    /// The authenticated (server-side) cart changed.
    CartUpdated,
    /// The guest cart in local storage changed.
    GuestCartUpdated,
    /// The cart was emptied; badges may show zero without a fetch.
    CartCleared,
    /// The authenticated wishlist changed.
    WishlistUpdated,
    /// The guest wishlist in local storage changed.
    GuestWishlistUpdated,
}

impl StoreEvent {
    /// Stable event name, matching the names used on the storefront pages.
    pub fn name(self) -> &'static str {
        match self {
            Self::CartUpdated => "cart_updated",
            Self::GuestCartUpdated => "guest_cart_updated",
            Self::CartCleared => "cart_clear",
            Self::WishlistUpdated => "wishlist_updated",
            Self::GuestWishlistUpdated => "guest_wishlist_updated",
        }
    }
}

/// Cloneable handle to a shared event bus.
///
/// All clones publish to and subscribe from the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Broadcast `event` to every live subscriber.
    ///
    /// Having no subscribers is not an error.
    pub fn publish(&self, event: StoreEvent) {
        tracing::debug!(event = event.name(), "publishing store event");
        let _ = self.sender.send(event);
    }

    /// Register a new subscriber. Only events published after this call
    /// are observed. Drop the returned value to unsubscribe.
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventBus`] subscription.
///
/// Dropping it releases the subscription immediately.
#[derive(Debug)]
pub struct BusSubscription {
    receiver: broadcast::Receiver<StoreEvent>,
}

impl BusSubscription {
    /// Wait for the next event.
    ///
    /// Returns `None` once every [`EventBus`] handle has been dropped. If
    /// this subscriber lagged behind, the missed events are skipped and the
    /// oldest retained one is returned.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "bus subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next already-published event without waiting.
    pub fn try_recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
