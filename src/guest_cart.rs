//! Guest cart held in durable local storage.
//!
//! The persisted layout under key [`GUEST_CART_KEY`] is a JSON array of
//! `{ "skuId": string, "quantity": number }`. There is no version field, so
//! reading is defensive: anything that does not look like that shape is
//! dropped instead of failing the caller.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{EventBus, StoreEvent};
use crate::storage::KeyValueStorage;

/// Storage key of the guest cart.
pub const GUEST_CART_KEY: &str = "guest_cart";

/// One guest cart line. Identity is `sku_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLineItem {
    /// Product variant identifier.
    pub sku_id: String,
    /// Unit count, always at least 1.
    pub quantity: u32,
}

impl CartLineItem {
    /// Build a line item.
    pub fn new(sku_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            sku_id: sku_id.into(),
            quantity,
        }
    }
}

struct Inner {
    storage: Arc<dyn KeyValueStorage>,
    bus: EventBus,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

/// Anonymous shopper's cart, persisted synchronously on every mutation.
///
/// This store is the only writer of [`GUEST_CART_KEY`]. Storage failures
/// and corrupted payloads never reach the caller: reads fall back to an
/// empty cart and failed writes are logged.
///
/// `Clone` is cheap; clones share the same storage and lock.
#[derive(Clone)]
pub struct LocalCartStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LocalCartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCartStore")
            .field("key", &GUEST_CART_KEY)
            .finish()
    }
}

impl LocalCartStore {
    /// Create a store over `storage`, publishing change signals on `bus`.
    pub fn new(storage: Arc<dyn KeyValueStorage>, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                bus,
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Add `quantity` units of `sku_id`, merging into an existing line.
    ///
    /// # Returns
    ///
    /// `false` (and no change) if `quantity` is below 1.
    pub fn add_item(&self, sku_id: &str, quantity: i64) -> bool {
        let Some(quantity) = positive_quantity(quantity) else {
            tracing::debug!(sku_id, quantity, "ignoring guest add with quantity < 1");
            return false;
        };
        self.mutate(|items| {
            match items.iter_mut().find(|i| i.sku_id == sku_id) {
                Some(existing) => {
                    existing.quantity = existing.quantity.saturating_add(quantity);
                }
                None => items.push(CartLineItem::new(sku_id, quantity)),
            }
            true
        })
    }

    /// Set the quantity of `sku_id` to an absolute value.
    ///
    /// A `quantity` below 1 removes the line instead.
    ///
    /// # Returns
    ///
    /// `true` if a line was changed or removed, `false` if `sku_id` is not
    /// in the cart.
    pub fn update_item(&self, sku_id: &str, quantity: i64) -> bool {
        let Some(quantity) = positive_quantity(quantity) else {
            return self.remove_item(sku_id);
        };
        self.mutate(|items| match items.iter_mut().find(|i| i.sku_id == sku_id) {
            Some(existing) => {
                existing.quantity = quantity;
                true
            }
            None => false,
        })
    }

    /// Remove the line for `sku_id`.
    ///
    /// # Returns
    ///
    /// `true` if a line was removed. Removing an absent SKU is not an error.
    pub fn remove_item(&self, sku_id: &str) -> bool {
        self.mutate(|items| {
            let before = items.len();
            items.retain(|i| i.sku_id != sku_id);
            items.len() != before
        })
    }

    /// Delete the whole guest cart.
    pub fn clear(&self) {
        let _guard = self.lock();
        if let Err(e) = self.inner.storage.remove(GUEST_CART_KEY) {
            tracing::warn!(error = %e, "failed to clear guest cart");
        }
        self.inner.bus.publish(StoreEvent::GuestCartUpdated);
    }

    /// Current lines, in insertion order.
    pub fn items(&self) -> Vec<CartLineItem> {
        self.load()
    }

    /// Returns `true` if the guest cart holds no lines.
    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    /// Total unit count across all lines. 0 for an empty or corrupted cart.
    pub fn total_count(&self) -> u32 {
        self.load()
            .iter()
            .fold(0u32, |acc, i| acc.saturating_add(i.quantity))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // A panic while holding the lock leaves no partial state behind
        // (storage writes are atomic), so poisoning is safe to ignore.
        self.inner
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Load, apply `f`, and persist if `f` reports a change.
    fn mutate(&self, f: impl FnOnce(&mut Vec<CartLineItem>) -> bool) -> bool {
        let _guard = self.lock();
        let mut items = self.load();
        if !f(&mut items) {
            return false;
        }
        self.save(&items);
        self.inner.bus.publish(StoreEvent::GuestCartUpdated);
        true
    }

    fn load(&self) -> Vec<CartLineItem> {
        match self.inner.storage.get(GUEST_CART_KEY) {
            Ok(Some(raw)) => parse_guest_cart(&raw),
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read guest cart; treating as empty");
                Vec::new()
            }
        }
    }

    fn save(&self, items: &[CartLineItem]) {
        let json = match serde_json::to_string(items) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode guest cart");
                return;
            }
        };
        if let Err(e) = self.inner.storage.set(GUEST_CART_KEY, &json) {
            tracing::warn!(error = %e, "failed to persist guest cart");
        }
    }
}

fn positive_quantity(quantity: i64) -> Option<u32> {
    if quantity < 1 {
        return None;
    }
    Some(u32::try_from(quantity).unwrap_or(u32::MAX))
}

/// Parse a persisted guest cart payload.
///
/// Entries without a string `skuId` or without a positive integral
/// `quantity` are dropped. Duplicate SKUs are folded into one line. A
/// payload that is not a JSON array yields an empty cart.
pub fn parse_guest_cart(raw: &str) -> Vec<CartLineItem> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "guest cart is not valid JSON; treating as empty");
            return Vec::new();
        }
    };
    let Value::Array(entries) = value else {
        tracing::warn!("guest cart is not a JSON array; treating as empty");
        return Vec::new();
    };

    let mut items: Vec<CartLineItem> = Vec::with_capacity(entries.len());
    for entry in &entries {
        let Some(sku_id) = entry.get("skuId").and_then(Value::as_str) else {
            continue;
        };
        let Some(quantity) = entry
            .get("quantity")
            .and_then(json_integer)
            .and_then(positive_quantity)
        else {
            continue;
        };
        match items.iter_mut().find(|i| i.sku_id == sku_id) {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(quantity),
            None => items.push(CartLineItem::new(sku_id, quantity)),
        }
    }
    if items.len() != entries.len() {
        tracing::debug!(
            kept = items.len(),
            total = entries.len(),
            "dropped or folded malformed guest cart entries"
        );
    }
    items
}

/// Accept integral JSON numbers, including `2.0` written by JavaScript.
fn json_integer(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.is_finite())
            .map(|f| f as i64)
    })
}
