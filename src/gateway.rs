//! Cart mutations with transparent guest fallback.
//!
//! Every mutation is first sent to the backend. When the backend answers
//! "not logged in", the same mutation is applied to the guest cart and the
//! call succeeds as if nothing happened: a shopper never sees an error just
//! for being logged out. Every other failure is returned unchanged and
//! nothing is applied anywhere.

use std::sync::Arc;

use crate::aggregate::CartAggregateStore;
use crate::api::{CartApi, CartSummary};
use crate::bus::{EventBus, StoreEvent};
use crate::error::{ApiError, GatewayError};
use crate::guest_cart::LocalCartStore;
use crate::session::{CartSession, CartSource};

/// Where a successful mutation was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub source: CartSource,
}

impl MutationOutcome {
    fn authenticated() -> Self {
        Self {
            source: CartSource::Authenticated,
        }
    }

    fn guest() -> Self {
        Self {
            source: CartSource::Guest,
        }
    }
}

/// Entry point for add/update/remove/clear.
///
/// The gateway issues exactly one backend request per call and never
/// retries: after a transport error the server may or may not have applied
/// the change, and a blind retry could double-count. Retrying is the
/// caller's decision.
///
/// There is no internal queue. Callers serialize mutations (the UI disables
/// the control while one is in flight). If two mutations do overlap, their
/// completions may interleave and the optimistic badge count can diverge
/// from the server until the next refresh settles it.
///
/// `Clone` is cheap.
#[derive(Clone)]
pub struct CartGateway {
    api: Arc<dyn CartApi>,
    local_cart: LocalCartStore,
    aggregate: CartAggregateStore,
    session: CartSession,
    bus: EventBus,
}

impl std::fmt::Debug for CartGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartGateway")
            .field("session", &self.session)
            .finish()
    }
}

impl CartGateway {
    pub fn new(
        api: Arc<dyn CartApi>,
        local_cart: LocalCartStore,
        aggregate: CartAggregateStore,
        session: CartSession,
        bus: EventBus,
    ) -> Self {
        Self {
            api,
            local_cart,
            aggregate,
            session,
            bus,
        }
    }

    /// Add `quantity` units of `sku_id`.
    ///
    /// On backend success the badge is bumped optimistically and then
    /// corrected by a refresh (the server may cap the quantity to stock).
    /// On an auth failure the line goes into the guest cart instead and the
    /// badge is set to the guest cart total.
    ///
    /// # Errors
    ///
    /// * [`GatewayError::InvalidQuantity`] -- `quantity < 1`; nothing sent.
    /// * [`GatewayError::Api`] -- validation, business or transport error,
    ///   passed through verbatim.
    pub async fn add_to_cart(
        &self,
        sku_id: &str,
        quantity: i64,
    ) -> Result<MutationOutcome, GatewayError> {
        let units = positive(quantity)?;
        match self.api.add_item(sku_id, units).await {
            Ok(()) => {
                self.aggregate.increment(units);
                self.settle_authenticated().await;
                tracing::info!(sku_id, quantity = units, "added to account cart");
                Ok(MutationOutcome::authenticated())
            }
            Err(e) if e.is_auth_required() => {
                self.fall_back(&e);
                self.local_cart.add_item(sku_id, quantity);
                // Absolute, so a badge sync reconciling the same event cannot
                // double count.
                self.aggregate.update_count(self.local_cart.total_count());
                tracing::info!(sku_id, quantity = units, "added to guest cart");
                Ok(MutationOutcome::guest())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Set the quantity of an existing line.
    ///
    /// `item_id` is the server cart item id; on the guest path it is the
    /// SKU id, since guest lines have no server id. A `quantity` below 1
    /// removes the line, matching the guest cart's update semantics.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Api`] for every non-auth backend failure.
    pub async fn update_quantity(
        &self,
        item_id: &str,
        quantity: i64,
    ) -> Result<MutationOutcome, GatewayError> {
        let Ok(units) = positive(quantity) else {
            return self.remove_item(item_id).await;
        };
        match self.api.update_item(item_id, units).await {
            Ok(()) => {
                self.settle_authenticated().await;
                Ok(MutationOutcome::authenticated())
            }
            Err(e) if e.is_auth_required() => {
                self.fall_back(&e);
                self.local_cart.update_item(item_id, quantity);
                self.aggregate.update_count(self.local_cart.total_count());
                Ok(MutationOutcome::guest())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a line. Same id rules as [`update_quantity`](Self::update_quantity).
    ///
    /// # Errors
    ///
    /// [`GatewayError::Api`] for every non-auth backend failure.
    pub async fn remove_item(&self, item_id: &str) -> Result<MutationOutcome, GatewayError> {
        match self.api.remove_item(item_id).await {
            Ok(()) => {
                self.settle_authenticated().await;
                Ok(MutationOutcome::authenticated())
            }
            Err(e) if e.is_auth_required() => {
                self.fall_back(&e);
                self.local_cart.remove_item(item_id);
                self.aggregate.update_count(self.local_cart.total_count());
                Ok(MutationOutcome::guest())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Empty the cart and zero the badge.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Api`] for every non-auth backend failure.
    pub async fn clear_cart(&self) -> Result<MutationOutcome, GatewayError> {
        let outcome = match self.api.clear_cart().await {
            Ok(()) => MutationOutcome::authenticated(),
            Err(e) if e.is_auth_required() => {
                self.fall_back(&e);
                self.local_cart.clear();
                MutationOutcome::guest()
            }
            Err(e) => return Err(e.into()),
        };
        self.aggregate.update_count(0);
        self.bus.publish(StoreEvent::CartCleared);
        Ok(outcome)
    }

    /// Fetch the server cart directly, bypassing the cached badge count.
    ///
    /// Checkout must validate against this, never against
    /// [`CartAggregateStore::count`].
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] from `GET /cart` unchanged.
    pub async fn authoritative_cart(&self) -> Result<CartSummary, ApiError> {
        self.api.fetch_cart().await
    }

    async fn settle_authenticated(&self) {
        if let Err(e) = self.aggregate.refresh().await {
            tracing::debug!(error = %e, "post-mutation refresh failed; optimistic count stands");
        }
        self.bus.publish(StoreEvent::CartUpdated);
    }

    fn fall_back(&self, err: &ApiError) {
        tracing::debug!(error = %err, "backend requires login; using guest cart");
        self.session.demote();
    }
}

fn positive(quantity: i64) -> Result<u32, GatewayError> {
    if quantity < 1 {
        return Err(GatewayError::InvalidQuantity(quantity));
    }
    Ok(u32::try_from(quantity).unwrap_or(u32::MAX))
}
