//! Per-component live stock value.
//!
//! A [`StockView`] starts from the server-rendered stock level and then
//! follows pushes for one SKU. Mounting joins the product room through the
//! shared [`InventoryChannel`]; unmounting (or dropping) releases everything
//! synchronously, so a view that is gone never receives another update.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::{InventoryChannel, RoomTicket, StockSubscription, ViewId};

/// Display bucket for a stock level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockLevel {
    OutOfStock,
    /// In stock, at or below the low-stock threshold. Carries the count.
    Low(i64),
    InStock,
}

impl StockLevel {
    /// Classify `stock` against `low_threshold`.
    ///
    /// # Examples
    ///
    /// ```
    /// use storefront_cart::StockLevel;
    ///
    /// assert_eq!(StockLevel::classify(0, 5), StockLevel::OutOfStock);
    /// assert_eq!(StockLevel::classify(3, 5), StockLevel::Low(3));
    /// assert_eq!(StockLevel::classify(6, 5), StockLevel::InStock);
    /// ```
    pub fn classify(stock: i64, low_threshold: i64) -> Self {
        if stock <= 0 {
            Self::OutOfStock
        } else if stock <= low_threshold {
            Self::Low(stock)
        } else {
            Self::InStock
        }
    }
}

/// Live stock value for one mounted component.
pub struct StockView {
    view: ViewId,
    sku_id: Option<String>,
    stock: Arc<watch::Sender<i64>>,
    channel: Option<InventoryChannel>,
    subscription: Option<StockSubscription>,
    ticket: Arc<Mutex<Option<RoomTicket>>>,
    rejoin: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for StockView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StockView")
            .field("view", &self.view)
            .field("sku_id", &self.sku_id)
            .field("stock", &self.stock())
            .finish()
    }
}

impl StockView {
    /// Mount a view.
    ///
    /// # Arguments
    ///
    /// * `channel` - The shared inventory channel. Connected on demand.
    /// * `initial_stock` - Server-rendered level, shown until the first push.
    /// * `sku_id` - SKU to follow. `None` mounts a static view: no
    ///   connection, no room, no subscription.
    /// * `product_id` - Room to join. Pushes are only sent to joined rooms,
    ///   so without it the view waits for pushes some sibling's room brings.
    ///
    /// Must be called from within a tokio runtime when `sku_id` is set.
    pub fn mount(
        channel: &InventoryChannel,
        initial_stock: i64,
        sku_id: Option<&str>,
        product_id: Option<&str>,
    ) -> Self {
        let view = ViewId::new();
        let (stock, _) = watch::channel(initial_stock);
        let stock = Arc::new(stock);
        let ticket = Arc::new(Mutex::new(None));

        let Some(sku_id) = sku_id else {
            return Self {
                view,
                sku_id: None,
                stock,
                channel: None,
                subscription: None,
                ticket,
                rejoin: None,
            };
        };

        channel.connect();
        let mut rejoin = None;
        if let Some(product_id) = product_id {
            *lock(&ticket) = Some(channel.join_product(product_id));
            rejoin = Some(tokio::spawn(rejoin_on_reconnect(
                channel.clone(),
                product_id.to_string(),
                ticket.clone(),
            )));
        }
        let subscription = channel.on_stock_update(view, sku_id, {
            let stock = stock.clone();
            move |value| {
                stock.send_replace(value);
            }
        });
        tracing::debug!(view = %view, sku_id, "stock view mounted");

        Self {
            view,
            sku_id: Some(sku_id.to_string()),
            stock,
            channel: Some(channel.clone()),
            subscription: Some(subscription),
            ticket,
            rejoin,
        }
    }

    pub fn view_id(&self) -> ViewId {
        self.view
    }

    /// Current stock: the initial value until the first push, then the
    /// last pushed value.
    pub fn stock(&self) -> i64 {
        *self.stock.borrow()
    }

    pub fn level(&self, low_threshold: i64) -> StockLevel {
        StockLevel::classify(self.stock(), low_threshold)
    }

    /// Watch the stock value.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.stock.subscribe()
    }

    /// Release the subscription and the room. Equivalent to dropping.
    pub fn unmount(self) {}

    fn release(&mut self) {
        if let Some(task) = self.rejoin.take() {
            task.abort();
        }
        self.subscription.take();
        let ticket = lock(&self.ticket).take();
        if let (Some(channel), Some(ticket)) = (&self.channel, ticket) {
            channel.leave_product(ticket);
        }
        if self.sku_id.is_some() {
            tracing::debug!(view = %self.view, "stock view unmounted");
        }
    }
}

impl Drop for StockView {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock(ticket: &Mutex<Option<RoomTicket>>) -> std::sync::MutexGuard<'_, Option<RoomTicket>> {
    ticket.lock().expect("room ticket lock poisoned")
}

/// Re-join `product_id` whenever the channel's room epoch moves past the
/// held ticket.
async fn rejoin_on_reconnect(
    channel: InventoryChannel,
    product_id: String,
    ticket: Arc<Mutex<Option<RoomTicket>>>,
) {
    let mut status = channel.watch_status();
    loop {
        let epoch = status.borrow_and_update().epoch;
        {
            let mut held = lock(&ticket);
            match held.as_ref() {
                Some(current) if current.epoch() != epoch => {
                    *held = Some(channel.join_product(&product_id));
                    tracing::debug!(product_id = %product_id, epoch, "re-joined product room");
                }
                Some(_) => {}
                None => return,
            }
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::channel::{ClientFrame, ConnectionState};
    use crate::config::ChannelConfig;
    use crate::error::ChannelError;
    use crate::test_fixtures::{MockServer, MockTransport, eventually};

    fn channel() -> (
        InventoryChannel,
        Arc<MockTransport>,
        tokio::sync::mpsc::UnboundedReceiver<MockServer>,
    ) {
        let (transport, servers) = MockTransport::new();
        let config = ChannelConfig {
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
        };
        (InventoryChannel::new(transport.clone(), config), transport, servers)
    }

    #[test]
    fn classify_buckets() {
        assert_eq!(StockLevel::classify(-2, 5), StockLevel::OutOfStock);
        assert_eq!(StockLevel::classify(5, 5), StockLevel::Low(5));
        assert_eq!(StockLevel::classify(1, 0), StockLevel::InStock);
    }

    #[tokio::test]
    async fn without_sku_view_is_static() {
        let (channel, transport, _servers) = channel();
        let view = StockView::mount(&channel, 9, None, Some("p1"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(view.stock(), 9);
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert_eq!(transport.opens.load(Ordering::SeqCst), 0);
        assert!(!channel.is_joined("p1"));
    }

    #[tokio::test]
    async fn shows_initial_then_pushed_value() {
        let (channel, _transport, mut servers) = channel();
        let view = StockView::mount(&channel, 10, Some("s1"), Some("p1"));
        assert_eq!(view.stock(), 10);
        assert_eq!(view.level(5), StockLevel::InStock);

        let mut server = servers.recv().await.expect("connected");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));

        let mut rx = view.subscribe();
        server.stock("s1", 2);
        rx.changed().await.expect("pushed");
        assert_eq!(view.stock(), 2);
        assert_eq!(view.level(5), StockLevel::Low(2));
    }

    #[tokio::test]
    async fn sibling_views_share_room_but_not_skus() {
        let (channel, _transport, mut servers) = channel();
        let red = StockView::mount(&channel, 4, Some("red"), Some("p1"));
        let blue = StockView::mount(&channel, 4, Some("blue"), Some("p1"));
        assert_eq!(channel.room_refcount("p1"), 2);

        let mut server = servers.recv().await.expect("connected");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));

        server.stock("red", 0);
        eventually(|| red.stock() == 0).await;
        assert_eq!(blue.stock(), 4);
        assert!(server.drain().is_empty(), "room joined exactly once");
    }

    #[tokio::test]
    async fn unmount_releases_synchronously() {
        let (channel, _transport, mut servers) = channel();
        let first = StockView::mount(&channel, 1, Some("s1"), Some("p1"));
        let second = StockView::mount(&channel, 1, Some("s1"), Some("p1"));
        let mut server = servers.recv().await.expect("connected");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));

        first.unmount();
        assert_eq!(channel.listener_count("s1"), 1);
        assert!(channel.is_joined("p1"));
        assert!(server.drain().is_empty());

        drop(second);
        assert_eq!(channel.listener_count("s1"), 0);
        assert!(!channel.is_joined("p1"));
        assert_eq!(server.next_frame().await, ClientFrame::LeaveProduct("p1".into()));
    }

    #[tokio::test]
    async fn views_rejoin_after_reconnect() {
        let (channel, _transport, mut servers) = channel();
        let a = StockView::mount(&channel, 3, Some("s1"), Some("p1"));
        let _b = StockView::mount(&channel, 3, Some("s2"), Some("p1"));
        let mut server = servers.recv().await.expect("connected");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));

        let _ = server.push.send(Err(ChannelError::Disconnected("reset".into())));
        drop(server);

        let mut server = servers.recv().await.expect("reconnected");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));
        eventually(|| channel.room_refcount("p1") == 2).await;
        assert!(server.drain().is_empty());

        server.stock("s1", 1);
        eventually(|| a.stock() == 1).await;
    }

    #[tokio::test]
    async fn unmount_after_reconnect_leaves_rejoined_room() {
        let (channel, _transport, mut servers) = channel();
        let view = StockView::mount(&channel, 3, Some("s1"), Some("p1"));
        let server = servers.recv().await.expect("connected");
        let _ = server.push.send(Err(ChannelError::Disconnected("reset".into())));
        drop(server);

        let mut server = servers.recv().await.expect("reconnected");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));

        view.unmount();
        assert!(!channel.is_joined("p1"));
        assert_eq!(server.next_frame().await, ClientFrame::LeaveProduct("p1".into()));
    }
}
