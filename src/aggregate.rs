//! Shared cart badge state: the cached total unit count.
//!
//! The count is derived state. It is recomputed from the backend
//! ([`CartAggregateStore::refresh`]) or from the guest cart
//! ([`CartAggregateStore::update_count`]) at any time, and between those it
//! is nudged optimistically. It must never drive stock decisions; checkout
//! re-reads the server cart instead.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use crate::api::CartApi;
use crate::error::ApiError;

/// Snapshot of the badge state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CartAggregateState {
    /// Total units across all lines (not the number of distinct lines).
    pub count: u32,
    /// `true` while a refresh is in flight.
    pub is_fetching: bool,
}

struct Inner {
    api: Arc<dyn CartApi>,
    state: watch::Sender<CartAggregateState>,
    refreshing: AtomicBool,
}

/// The single per-session source of the cart badge count.
///
/// Every badge reads the same instance; `Clone` is cheap and clones share
/// state. Synchronous updates apply in call order. A refresh that is in
/// flight while optimistic updates happen overwrites them with whatever the
/// server reports when it resolves; that window is accepted.
#[derive(Clone)]
pub struct CartAggregateStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CartAggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartAggregateStore")
            .field("state", &self.state())
            .finish()
    }
}

/// Clears the in-flight markers even if the refresh future is dropped.
struct RefreshGuard<'a> {
    store: &'a CartAggregateStore,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.store
            .inner
            .state
            .send_modify(|s| s.is_fetching = false);
        self.store.inner.refreshing.store(false, Ordering::Release);
    }
}

impl CartAggregateStore {
    /// Create a store with `count = 0`.
    pub fn new(api: Arc<dyn CartApi>) -> Self {
        let (state, _) = watch::channel(CartAggregateState::default());
        Self {
            inner: Arc::new(Inner {
                api,
                state,
                refreshing: AtomicBool::new(false),
            }),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> CartAggregateState {
        *self.inner.state.borrow()
    }

    /// Current unit count.
    pub fn count(&self) -> u32 {
        self.inner.state.borrow().count
    }

    /// Watch for state changes (badges re-render on `changed()`).
    pub fn subscribe(&self) -> watch::Receiver<CartAggregateState> {
        self.inner.state.subscribe()
    }

    /// Optimistically add `amount` units.
    pub fn increment(&self, amount: u32) {
        self.inner
            .state
            .send_modify(|s| s.count = s.count.saturating_add(amount));
    }

    /// Optimistically remove `amount` units, clamping at zero.
    pub fn decrement(&self, amount: u32) {
        self.inner
            .state
            .send_modify(|s| s.count = s.count.saturating_sub(amount));
    }

    /// Set the count to an authoritative value.
    pub fn update_count(&self, count: u32) {
        self.inner.state.send_modify(|s| s.count = count);
    }

    /// Re-read the authoritative count from the backend.
    ///
    /// A refresh started while another is in flight does not issue a
    /// second request; it returns the current (possibly optimistic) count.
    ///
    /// # Returns
    ///
    /// The count after the refresh.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] from `GET /cart`. The previous count is left
    /// untouched on failure.
    pub async fn refresh(&self) -> Result<u32, ApiError> {
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            tracing::debug!("cart refresh already in flight");
            return Ok(self.count());
        }
        let _guard = RefreshGuard { store: self };
        self.inner.state.send_modify(|s| s.is_fetching = true);

        match self.inner.api.fetch_cart().await {
            Ok(summary) => {
                let count = summary.total_units();
                self.update_count(count);
                tracing::debug!(count, "cart count refreshed");
                Ok(count)
            }
            Err(e) => {
                tracing::warn!(error = %e, "cart refresh failed; keeping previous count");
                Err(e)
            }
        }
    }
}
