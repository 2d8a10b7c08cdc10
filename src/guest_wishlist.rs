//! Guest wishlist: product ids saved by an anonymous shopper.
//!
//! Persisted under [`GUEST_WISHLIST_KEY`] as a JSON array of product id
//! strings and merged into the account on login.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::bus::{EventBus, StoreEvent};
use crate::storage::KeyValueStorage;

/// Storage key of the guest wishlist.
pub const GUEST_WISHLIST_KEY: &str = "guest_wishlist";

/// Anonymous shopper's wishlist. Same failure policy as the guest cart:
/// unreadable data is an empty list and failed writes are only logged.
#[derive(Clone)]
pub struct GuestWishlist {
    storage: Arc<dyn KeyValueStorage>,
    bus: EventBus,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for GuestWishlist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestWishlist")
            .field("key", &GUEST_WISHLIST_KEY)
            .finish()
    }
}

impl GuestWishlist {
    pub fn new(storage: Arc<dyn KeyValueStorage>, bus: EventBus) -> Self {
        Self {
            storage,
            bus,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Add `product_id` if absent, remove it if present.
    ///
    /// # Returns
    ///
    /// `true` if the product is wishlisted after the call.
    pub fn toggle(&self, product_id: &str) -> bool {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids = self.product_ids();
        let wishlisted = match ids.iter().position(|id| id == product_id) {
            Some(idx) => {
                ids.remove(idx);
                false
            }
            None => {
                ids.push(product_id.to_string());
                true
            }
        };
        self.save(&ids);
        self.bus.publish(StoreEvent::GuestWishlistUpdated);
        wishlisted
    }

    pub fn contains(&self, product_id: &str) -> bool {
        self.product_ids().iter().any(|id| id == product_id)
    }

    /// Saved product ids, oldest first, without duplicates.
    pub fn product_ids(&self) -> Vec<String> {
        let raw = match self.storage.get(GUEST_WISHLIST_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read guest wishlist; treating as empty");
                return Vec::new();
            }
        };
        let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&raw) else {
            tracing::warn!("guest wishlist is not a JSON array; treating as empty");
            return Vec::new();
        };
        let mut ids: Vec<String> = Vec::with_capacity(entries.len());
        for id in entries.iter().filter_map(Value::as_str) {
            if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        ids
    }

    pub fn clear(&self) {
        if let Err(e) = self.storage.remove(GUEST_WISHLIST_KEY) {
            tracing::warn!(error = %e, "failed to clear guest wishlist");
        }
        self.bus.publish(StoreEvent::GuestWishlistUpdated);
    }

    fn save(&self, ids: &[String]) {
        match serde_json::to_string(ids) {
            Ok(json) => {
                if let Err(e) = self.storage.set(GUEST_WISHLIST_KEY, &json) {
                    tracing::warn!(error = %e, "failed to persist guest wishlist");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to encode guest wishlist"),
        }
    }
}
