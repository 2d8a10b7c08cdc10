//! Which cart is authoritative right now: the guest cart or the account cart.
//!
//! The answer lives in one place, [`CartSession::source`], and changes only
//! through explicit transitions: [`login`](CartSession::login),
//! [`merge_guest_into_account`](CartSession::merge_guest_into_account),
//! [`logout`](CartSession::logout), and [`demote`](CartSession::demote) when
//! the backend rejects a token that was believed valid.

use std::sync::Arc;

use tokio::sync::watch;

use crate::api::{CartApi, MergeReport};
use crate::auth::BearerToken;
use crate::bus::{EventBus, StoreEvent};
use crate::error::ApiError;
use crate::guest_cart::LocalCartStore;
use crate::guest_wishlist::GuestWishlist;

/// The cart that currently owns the shopper's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CartSource {
    /// Cart lives in local storage ([`LocalCartStore`]).
    Guest,
    /// Cart lives on the backend; the client holds only a cached count.
    Authenticated,
}

struct Inner {
    token: BearerToken,
    source: watch::Sender<CartSource>,
    api: Arc<dyn CartApi>,
    local_cart: LocalCartStore,
    wishlist: GuestWishlist,
    bus: EventBus,
}

/// Session state machine shared by the gateway and the badge sync.
///
/// `Clone` is cheap; clones share the same state.
#[derive(Clone)]
pub struct CartSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CartSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartSession")
            .field("source", &self.source())
            .finish()
    }
}

impl CartSession {
    /// Create a session. It starts `Authenticated` if `token` already holds
    /// a value (e.g. restored from a cookie), `Guest` otherwise.
    pub fn new(
        token: BearerToken,
        api: Arc<dyn CartApi>,
        local_cart: LocalCartStore,
        wishlist: GuestWishlist,
        bus: EventBus,
    ) -> Self {
        let initial = if token.is_present() {
            CartSource::Authenticated
        } else {
            CartSource::Guest
        };
        let (source, _) = watch::channel(initial);
        Self {
            inner: Arc::new(Inner {
                token,
                source,
                api,
                local_cart,
                wishlist,
                bus,
            }),
        }
    }

    pub fn source(&self) -> CartSource {
        *self.inner.source.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.source() == CartSource::Authenticated
    }

    /// Watch source transitions.
    pub fn subscribe(&self) -> watch::Receiver<CartSource> {
        self.inner.source.subscribe()
    }

    /// Store a freshly issued token and switch to the account cart.
    ///
    /// Guest data is left in place; call
    /// [`merge_guest_into_account`](Self::merge_guest_into_account) next.
    pub fn login(&self, token: impl Into<String>) {
        self.inner.token.set(token);
        self.inner.source.send_replace(CartSource::Authenticated);
        tracing::info!("session authenticated");
    }

    /// Fall back to guest mode after the backend reported the session as
    /// unauthenticated (expired or revoked token).
    pub fn demote(&self) {
        let previous = self.inner.source.send_replace(CartSource::Guest);
        if previous == CartSource::Authenticated {
            self.inner.token.clear();
            tracing::warn!("backend rejected session token; continuing as guest");
        }
    }

    /// Log out: forget the token, switch to guest mode, and wipe the guest
    /// cart so stale lines from before login never resurface.
    pub fn logout(&self) {
        self.inner.token.clear();
        self.inner.source.send_replace(CartSource::Guest);
        self.inner.local_cart.clear();
        tracing::info!("session logged out");
    }

    /// Move guest cart and wishlist into the account.
    ///
    /// The guest cart is sent as minimal `{ skuId, quantity }` lines to
    /// `POST /cart/merge` and cleared on success; the guest wishlist goes to
    /// `POST /wishlist/merge` the same way. A failed merge keeps the guest
    /// data so a later call can retry. `CartUpdated` is published either way
    /// so badges re-sync.
    ///
    /// Calling this while in guest mode does nothing.
    ///
    /// # Returns
    ///
    /// The cart merge report (all zeros if the guest cart was empty).
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of a failed cart merge. A failed wishlist
    /// merge is only logged.
    pub async fn merge_guest_into_account(&self) -> Result<MergeReport, ApiError> {
        if !self.is_authenticated() {
            tracing::warn!("merge requested without an authenticated session; skipping");
            return Ok(MergeReport::default());
        }
        let inner = &self.inner;

        let ids = inner.wishlist.product_ids();
        if !ids.is_empty() {
            match inner.api.merge_guest_wishlist(&ids).await {
                Ok(()) => {
                    inner.wishlist.clear();
                    inner.bus.publish(StoreEvent::WishlistUpdated);
                }
                Err(e) => tracing::error!(error = %e, "failed to merge guest wishlist"),
            }
        }

        let items = inner.local_cart.items();
        let result = if items.is_empty() {
            Ok(MergeReport::default())
        } else {
            match inner.api.merge_guest_cart(&items).await {
                Ok(report) => {
                    inner.local_cart.clear();
                    if report.needs_attention() {
                        tracing::warn!(
                            capped = report.capped,
                            failed = report.failed,
                            "some guest cart lines were adjusted during merge"
                        );
                    }
                    Ok(report)
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to merge guest cart");
                    Err(e)
                }
            }
        };

        inner.bus.publish(StoreEvent::CartUpdated);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guest_cart::CartLineItem;
    use crate::storage::MemoryStorage;
    use crate::test_fixtures::MockCartApi;

    struct Fixture {
        api: Arc<MockCartApi>,
        token: BearerToken,
        cart: LocalCartStore,
        wishlist: GuestWishlist,
        bus: EventBus,
        session: CartSession,
    }

    fn fixture(token: &str) -> Fixture {
        let api = MockCartApi::new();
        let bus = EventBus::new();
        let storage = Arc::new(MemoryStorage::new());
        let cart = LocalCartStore::new(storage.clone(), bus.clone());
        let wishlist = GuestWishlist::new(storage, bus.clone());
        let token = BearerToken::new(token);
        let session = CartSession::new(
            token.clone(),
            api.clone(),
            cart.clone(),
            wishlist.clone(),
            bus.clone(),
        );
        Fixture {
            api,
            token,
            cart,
            wishlist,
            bus,
            session,
        }
    }

    #[test]
    fn initial_source_follows_token() {
        assert_eq!(fixture("").session.source(), CartSource::Guest);
        assert_eq!(fixture("tok").session.source(), CartSource::Authenticated);
    }

    #[test]
    fn login_sets_token_and_source() {
        let f = fixture("");
        f.session.login("fresh");
        assert!(f.session.is_authenticated());
        assert_eq!(f.token.header_value().as_deref(), Some("Bearer fresh"));
    }

    #[test]
    fn demote_clears_token_once() {
        let f = fixture("stale");
        f.session.demote();
        assert_eq!(f.session.source(), CartSource::Guest);
        assert!(!f.token.is_present());
    }

    #[test]
    fn logout_wipes_guest_cart() {
        let f = fixture("tok");
        f.cart.add_item("sku-1", 1);
        f.session.logout();
        assert_eq!(f.session.source(), CartSource::Guest);
        assert!(f.cart.is_empty());
        assert!(!f.token.is_present());
    }

    #[tokio::test]
    async fn merge_moves_guest_data_into_account() {
        let f = fixture("");
        f.cart.add_item("sku-1", 2);
        f.cart.add_item("sku-2", 1);
        f.wishlist.toggle("p1");
        f.session.login("tok");
        let mut sub = f.bus.subscribe();

        let report = f
            .session
            .merge_guest_into_account()
            .await
            .expect("merge should succeed");

        assert_eq!(report, MergeReport::default());
        assert_eq!(
            f.api.calls(),
            vec![
                "merge_wishlist p1".to_string(),
                "merge_cart sku-1x2,sku-2x1".to_string()
            ]
        );
        assert!(f.cart.is_empty());
        assert!(f.wishlist.product_ids().is_empty());

        let mut events = Vec::new();
        while let Some(event) = sub.try_recv() {
            events.push(event);
        }
        assert!(events.contains(&StoreEvent::WishlistUpdated));
        assert_eq!(events.last(), Some(&StoreEvent::CartUpdated));
    }

    #[tokio::test]
    async fn failed_cart_merge_keeps_guest_cart() {
        let f = fixture("tok");
        f.cart.add_item("sku-1", 2);
        f.api.fail_next(ApiError::Status {
            status: 500,
            message: "merge exploded".into(),
        });

        let result = f.session.merge_guest_into_account().await;
        assert!(result.is_err());
        assert_eq!(f.cart.items(), vec![CartLineItem::new("sku-1", 2)]);
    }

    #[tokio::test]
    async fn merge_reports_capped_lines() {
        let f = fixture("tok");
        f.cart.add_item("sku-1", 50);
        *f.api.merge_report.lock().unwrap() = MergeReport {
            merged: 1,
            capped: 1,
            failed: 0,
        };

        let report = f.session.merge_guest_into_account().await.expect("merge");
        assert!(report.needs_attention());
        assert!(f.cart.is_empty());
    }

    #[tokio::test]
    async fn merge_in_guest_mode_is_noop() {
        let f = fixture("");
        f.cart.add_item("sku-1", 2);
        let report = f.session.merge_guest_into_account().await.expect("noop");
        assert_eq!(report, MergeReport::default());
        assert!(f.api.calls().is_empty());
        assert_eq!(f.cart.total_count(), 2);
    }
}
