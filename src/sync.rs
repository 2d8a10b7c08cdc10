//! Background task keeping the cart badge count in step with the active cart.

use tokio::task::JoinHandle;

use crate::aggregate::CartAggregateStore;
use crate::bus::{EventBus, StoreEvent};
use crate::guest_cart::LocalCartStore;
use crate::session::CartSession;

/// Reconciles [`CartAggregateStore`] with whichever cart is active.
///
/// On start, on every cart event, and on every session transition the count
/// is re-derived: from `GET /cart` when authenticated, from the guest cart's
/// unit total otherwise. `CartCleared` zeroes the count without a fetch.
///
/// Dropping the handle stops the task.
pub struct CartBadgeSync {
    aggregate: CartAggregateStore,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for CartBadgeSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartBadgeSync")
            .field("running", &!self.task.is_finished())
            .finish()
    }
}

impl CartBadgeSync {
    /// Subscribe to `bus` and spawn the reconcile loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        aggregate: CartAggregateStore,
        local_cart: LocalCartStore,
        session: CartSession,
        bus: &EventBus,
    ) -> Self {
        // Subscribe before spawning so nothing published after `spawn`
        // returns can be missed.
        let mut events = bus.subscribe();
        let mut source = session.subscribe();
        let task = tokio::spawn({
            let aggregate = aggregate.clone();
            async move {
                reconcile(&aggregate, &local_cart, &session).await;
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(StoreEvent::CartUpdated | StoreEvent::GuestCartUpdated) => {
                                reconcile(&aggregate, &local_cart, &session).await;
                            }
                            Some(StoreEvent::CartCleared) => aggregate.update_count(0),
                            Some(_) => {}
                            None => break,
                        },
                        changed = source.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            reconcile(&aggregate, &local_cart, &session).await;
                        }
                    }
                }
                tracing::debug!("cart badge sync stopped");
            }
        });
        Self { aggregate, task }
    }

    /// Seed the count from a server-rendered value without fetching.
    pub fn hydrate(&self, count: u32) {
        self.aggregate.update_count(count);
    }

    /// Stop the background task.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for CartBadgeSync {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reconcile(aggregate: &CartAggregateStore, local_cart: &LocalCartStore, session: &CartSession) {
    if session.is_authenticated() {
        // Failure is logged by `refresh`; the previous count stands.
        let _ = aggregate.refresh().await;
    } else {
        aggregate.update_count(local_cart.total_count());
    }
}
