//! Live inventory channel: one shared push connection per client.
//!
//! The channel owns a single background connection to the stock namespace
//! and multiplexes it between every mounted [`StockView`](crate::StockView).
//! Views join product rooms and register per-SKU callbacks; the channel
//! keeps reference counts so the server sees exactly one `join_product` per
//! room, no matter how many views share it.
//!
//! The connection loop follows the usual shape: connect, pump frames until
//! the stream ends or errors, then back off exponentially and reconnect.
//! Room membership does not survive a reconnect. Instead the room epoch is
//! bumped and views re-join on their own (see [`ConnectionStatus::epoch`]).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_stream::{Stream, StreamExt};

use crate::config::ChannelConfig;
use crate::error::ChannelError;

/// Lifecycle of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection task is running.
    Disconnected,
    /// Opening the connection, or waiting to retry.
    Connecting,
    /// Frames are flowing.
    Connected,
}

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Room epoch. Bumped whenever server-side room membership is lost
    /// (connection drop or teardown). Tickets from an older epoch are void.
    pub epoch: u64,
}

/// Frame sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientFrame {
    JoinProduct(String),
    LeaveProduct(String),
}

impl ClientFrame {
    /// Encode as a JSON text frame, e.g. `{"event":"join_product","data":"p1"}`.
    pub fn to_json(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Protocol(e.to_string()))
    }
}

/// Frame pushed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// New absolute stock level for one SKU.
    StockUpdated { sku_id: String, stock: i64 },
    /// Catalog-wide stock notification. Payload is passed through untouched.
    GlobalStockUpdated(serde_json::Value),
}

#[derive(Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StockPayload {
    sku_id: String,
    stock: i64,
}

impl ServerFrame {
    /// Decode a JSON text frame.
    ///
    /// # Returns
    ///
    /// `Ok(None)` for a well-formed frame with an event name this client
    /// does not handle.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Protocol`] if the text is not a frame, or a known
    /// event carries a malformed payload.
    pub fn decode(text: &str) -> Result<Option<Self>, ChannelError> {
        let raw: RawFrame =
            serde_json::from_str(text).map_err(|e| ChannelError::Protocol(e.to_string()))?;
        match raw.event.as_str() {
            "stock_updated" => {
                let payload: StockPayload = serde_json::from_value(raw.data)
                    .map_err(|e| ChannelError::Protocol(format!("stock_updated: {e}")))?;
                Ok(Some(Self::StockUpdated {
                    sku_id: payload.sku_id,
                    stock: payload.stock,
                }))
            }
            "global_stock_updated" => Ok(Some(Self::GlobalStockUpdated(raw.data))),
            _ => Ok(None),
        }
    }
}

/// An open connection as seen by the channel.
pub struct StockConnection {
    /// Frames to write. The transport flushes them in order.
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    /// Decoded frames from the server. Ends when the server closes; yields
    /// `Err` when the connection breaks.
    pub inbound: Pin<Box<dyn Stream<Item = Result<ServerFrame, ChannelError>> + Send>>,
}

/// Opens connections to the stock namespace.
#[async_trait]
pub trait StockTransport: Send + Sync {
    /// Open one connection.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Connect`] if the server cannot be reached.
    async fn open(&self) -> Result<StockConnection, ChannelError>;
}

/// Identifies one mounted view. At most one callback per view per SKU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId(uuid::Uuid);

impl ViewId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ViewId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Proof of one reference to a product room.
///
/// Hand it back to [`InventoryChannel::leave_product`]. Not `Clone`, so a
/// reference can be released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct RoomTicket {
    product_id: String,
    epoch: u64,
}

impl RoomTicket {
    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

type StockCallback = Arc<dyn Fn(i64) + Send + Sync>;
type GlobalCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

struct Listener {
    token: u64,
    callback: StockCallback,
}

#[derive(Default)]
struct Shared {
    rooms: HashMap<String, usize>,
    epoch: u64,
    listeners: HashMap<String, HashMap<ViewId, Listener>>,
    global: HashMap<u64, GlobalCallback>,
    next_token: u64,
    /// Writer of the live connection; `None` unless connected.
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Shared {
    fn send(&self, frame: ClientFrame) {
        if let Some(outbound) = &self.outbound
            && outbound.send(frame).is_err()
        {
            tracing::debug!("stock connection writer already closed");
        }
    }
}

struct Inner {
    transport: Arc<dyn StockTransport>,
    config: ChannelConfig,
    shared: Mutex<Shared>,
    status: watch::Sender<ConnectionStatus>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().expect("inventory channel lock poisoned")
    }

    fn set_state(&self, shared: &Shared, state: ConnectionState) {
        self.status.send_replace(ConnectionStatus {
            state,
            epoch: shared.epoch,
        });
    }

    /// Install the writer of a fresh connection and announce rooms joined
    /// while it was being opened.
    fn attach(&self, outbound: mpsc::UnboundedSender<ClientFrame>) {
        let mut shared = self.lock();
        shared.outbound = Some(outbound);
        let rooms: Vec<String> = shared.rooms.keys().cloned().collect();
        for product_id in rooms {
            shared.send(ClientFrame::JoinProduct(product_id));
        }
        self.set_state(&shared, ConnectionState::Connected);
    }

    /// Forget server-side room membership after the connection is gone.
    fn detach(&self, next: ConnectionState) {
        let mut shared = self.lock();
        shared.outbound = None;
        shared.rooms.clear();
        shared.epoch += 1;
        self.set_state(&shared, next);
    }

    fn dispatch(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::StockUpdated { sku_id, stock } => {
                let callbacks: Vec<StockCallback> = {
                    let shared = self.lock();
                    shared
                        .listeners
                        .get(&sku_id)
                        .map(|views| views.values().map(|l| l.callback.clone()).collect())
                        .unwrap_or_default()
                };
                tracing::debug!(sku_id = %sku_id, stock, listeners = callbacks.len(), "stock update");
                for callback in callbacks {
                    callback(stock);
                }
            }
            ServerFrame::GlobalStockUpdated(payload) => {
                let callbacks: Vec<GlobalCallback> = self.lock().global.values().cloned().collect();
                for callback in callbacks {
                    callback(&payload);
                }
            }
        }
    }
}

/// Shared handle to the live inventory connection.
///
/// `Clone` is cheap; all clones drive the same connection. Dropping handles
/// does **not** stop a running connection loop -- call
/// [`teardown`](Self::teardown).
#[derive(Clone)]
pub struct InventoryChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InventoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryChannel")
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl InventoryChannel {
    pub fn new(transport: Arc<dyn StockTransport>, config: ChannelConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            epoch: 0,
        });
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                shared: Mutex::new(Shared::default()),
                status,
            }),
        }
    }

    /// Start the connection loop. Does nothing unless `Disconnected`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut shared = self.inner.lock();
        if shared.task.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.set_state(&shared, ConnectionState::Connecting);
        shared.shutdown_tx = Some(shutdown_tx);
        shared.task = Some(tokio::spawn(run_connection_loop(
            self.inner.clone(),
            shutdown_rx,
        )));
        tracing::debug!("inventory channel connecting");
    }

    /// Stop the connection loop and return to `Disconnected`.
    ///
    /// Room membership is dropped (the epoch is bumped); stock listeners stay
    /// registered so a later [`connect`](Self::connect) resumes delivery once
    /// views re-join. Calling this more than once is safe.
    pub async fn teardown(&self) {
        let (shutdown_tx, task) = {
            let mut shared = self.inner.lock();
            (shared.shutdown_tx.take(), shared.task.take())
        };
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::error!(error = %e, "inventory channel task failed");
        }
        self.inner.detach(ConnectionState::Disconnected);
        tracing::debug!("inventory channel torn down");
    }

    /// Reference a product room. The first reference announces the join to
    /// the server (immediately if connected, otherwise once the connection
    /// opens).
    pub fn join_product(&self, product_id: &str) -> RoomTicket {
        let mut shared = self.inner.lock();
        let count = shared.rooms.entry(product_id.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            shared.send(ClientFrame::JoinProduct(product_id.to_string()));
            tracing::debug!(product_id, "joined product room");
        }
        RoomTicket {
            product_id: product_id.to_string(),
            epoch: shared.epoch,
        }
    }

    /// Release a room reference. The last release sends `leave_product`.
    ///
    /// Tickets issued before the last reconnect are ignored: that membership
    /// is already gone server-side and the room may have been re-joined by
    /// another view since.
    pub fn leave_product(&self, ticket: RoomTicket) {
        let mut shared = self.inner.lock();
        if ticket.epoch != shared.epoch {
            tracing::debug!(product_id = %ticket.product_id, "ignoring stale room ticket");
            return;
        }
        let Some(count) = shared.rooms.get_mut(&ticket.product_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            shared.rooms.remove(&ticket.product_id);
            shared.send(ClientFrame::LeaveProduct(ticket.product_id.clone()));
            tracing::debug!(product_id = %ticket.product_id, "left product room");
        }
    }

    /// Number of live references to a product room.
    pub fn room_refcount(&self, product_id: &str) -> usize {
        self.inner.lock().rooms.get(product_id).copied().unwrap_or(0)
    }

    pub fn is_joined(&self, product_id: &str) -> bool {
        self.room_refcount(product_id) > 0
    }

    /// Deliver stock pushes for `sku_id` to `callback` until the returned
    /// subscription is dropped.
    ///
    /// Registering again for the same `(view, sku_id)` replaces the earlier
    /// callback; dropping the earlier subscription afterwards is harmless.
    pub fn on_stock_update<F>(&self, view: ViewId, sku_id: &str, callback: F) -> StockSubscription
    where
        F: Fn(i64) + Send + Sync + 'static,
    {
        let mut shared = self.inner.lock();
        shared.next_token += 1;
        let token = shared.next_token;
        shared.listeners.entry(sku_id.to_string()).or_default().insert(
            view,
            Listener {
                token,
                callback: Arc::new(callback),
            },
        );
        StockSubscription {
            channel: Arc::downgrade(&self.inner),
            key: SubscriptionKey::Sku {
                sku_id: sku_id.to_string(),
                view,
            },
            token,
        }
    }

    /// Deliver catalog-wide stock notifications to `callback`.
    pub fn on_global_update<F>(&self, callback: F) -> StockSubscription
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let mut shared = self.inner.lock();
        shared.next_token += 1;
        let token = shared.next_token;
        shared.global.insert(token, Arc::new(callback));
        StockSubscription {
            channel: Arc::downgrade(&self.inner),
            key: SubscriptionKey::Global,
            token,
        }
    }

    /// Number of callbacks registered for `sku_id`.
    pub fn listener_count(&self, sku_id: &str) -> usize {
        self.inner
            .lock()
            .listeners
            .get(sku_id)
            .map_or(0, HashMap::len)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}

enum SubscriptionKey {
    Sku { sku_id: String, view: ViewId },
    Global,
}

/// Registration of a stock callback. Dropping it unsubscribes.
pub struct StockSubscription {
    channel: Weak<Inner>,
    key: SubscriptionKey,
    token: u64,
}

impl std::fmt::Debug for StockSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut d = f.debug_struct("StockSubscription");
        if let SubscriptionKey::Sku { sku_id, view } = &self.key {
            d.field("sku_id", sku_id).field("view", view);
        }
        d.finish()
    }
}

impl StockSubscription {
    /// Remove the callback now. Equivalent to dropping.
    pub fn unsubscribe(self) {}
}

impl Drop for StockSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.channel.upgrade() else {
            return;
        };
        let mut shared = inner.lock();
        match &self.key {
            SubscriptionKey::Sku { sku_id, view } => {
                let Some(views) = shared.listeners.get_mut(sku_id) else {
                    return;
                };
                // A newer registration for the same view owns the slot now.
                if views.get(view).is_some_and(|l| l.token == self.token) {
                    views.remove(view);
                }
                if views.is_empty() {
                    shared.listeners.remove(sku_id);
                }
            }
            SubscriptionKey::Global => {
                shared.global.remove(&self.token);
            }
        }
    }
}

/// How a connection ended.
enum StreamOutcome {
    /// The server closed the stream.
    Ended,
    /// Reading failed.
    Error(ChannelError),
}

async fn pump_frames(
    inner: &Inner,
    mut inbound: Pin<Box<dyn Stream<Item = Result<ServerFrame, ChannelError>> + Send>>,
) -> StreamOutcome {
    while let Some(item) = inbound.next().await {
        match item {
            Ok(frame) => inner.dispatch(frame),
            Err(e) => return StreamOutcome::Error(e),
        }
    }
    StreamOutcome::Ended
}

/// Connect, pump frames, and reconnect with exponential backoff until
/// shutdown is signalled.
async fn run_connection_loop(inner: Arc<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let config = inner.config.clone();
    let mut backoff_delay = config.reconnect_base_delay;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let opened = tokio::select! {
            result = inner.transport.open() => result,
            _ = shutdown_rx.changed() => return,
        };

        match opened {
            Ok(connection) => {
                tracing::info!("inventory channel connected");
                backoff_delay = config.reconnect_base_delay;
                inner.attach(connection.outbound);

                let outcome = tokio::select! {
                    outcome = pump_frames(&inner, connection.inbound) => outcome,
                    _ = shutdown_rx.changed() => return,
                };
                inner.detach(ConnectionState::Connecting);
                match outcome {
                    StreamOutcome::Ended => {
                        tracing::warn!("inventory channel closed by server, will reconnect");
                    }
                    StreamOutcome::Error(e) => {
                        tracing::error!(error = %e, "inventory channel: connection lost, will reconnect");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "inventory channel: connect failed, will retry");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff_delay) => {}
            _ = shutdown_rx.changed() => return,
        }
        backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use crate::test_fixtures::{MockServer, MockTransport, eventually};

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            reconnect_base_delay: Duration::from_millis(5),
            reconnect_max_delay: Duration::from_millis(20),
        }
    }

    async fn connected() -> (
        InventoryChannel,
        Arc<MockTransport>,
        mpsc::UnboundedReceiver<MockServer>,
        MockServer,
    ) {
        let (transport, mut servers) = MockTransport::new();
        let channel = InventoryChannel::new(transport.clone(), fast_config());
        channel.connect();
        let server = servers.recv().await.expect("connection opened");
        eventually(|| channel.state() == ConnectionState::Connected).await;
        (channel, transport, servers, server)
    }

    #[test]
    fn client_frames_encode_as_event_envelopes() {
        assert_eq!(
            ClientFrame::JoinProduct("p1".into()).to_json().expect("encode"),
            r#"{"event":"join_product","data":"p1"}"#
        );
        assert_eq!(
            ClientFrame::LeaveProduct("p1".into()).to_json().expect("encode"),
            r#"{"event":"leave_product","data":"p1"}"#
        );
    }

    #[test]
    fn server_frames_decode() {
        let frame = ServerFrame::decode(r#"{"event":"stock_updated","data":{"skuId":"s1","stock":7}}"#)
            .expect("decode");
        assert_eq!(
            frame,
            Some(ServerFrame::StockUpdated {
                sku_id: "s1".into(),
                stock: 7
            })
        );

        let frame = ServerFrame::decode(r#"{"event":"global_stock_updated","data":{"n":1}}"#)
            .expect("decode");
        assert!(matches!(frame, Some(ServerFrame::GlobalStockUpdated(_))));

        assert_eq!(ServerFrame::decode(r#"{"event":"ping"}"#).expect("decode"), None);
        assert!(ServerFrame::decode("not json").is_err());
        assert!(ServerFrame::decode(r#"{"event":"stock_updated","data":{"skuId":"s1"}}"#).is_err());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (channel, transport, _servers, _server) = connected().await;
        channel.connect();
        channel.connect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_joins_one_leave_keeps_room() {
        let (channel, _transport, _servers, mut server) = connected().await;

        let first = channel.join_product("p1");
        let second = channel.join_product("p1");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));
        assert_eq!(channel.room_refcount("p1"), 2);

        channel.leave_product(first);
        assert!(channel.is_joined("p1"));
        assert!(server.drain().is_empty(), "room must stay joined");

        channel.leave_product(second);
        assert_eq!(server.next_frame().await, ClientFrame::LeaveProduct("p1".into()));
        assert!(!channel.is_joined("p1"));
    }

    #[tokio::test]
    async fn joins_before_connection_are_sent_on_open() {
        let (transport, mut servers) = MockTransport::new();
        let channel = InventoryChannel::new(transport, fast_config());
        let _ticket = channel.join_product("p1");
        channel.connect();

        let mut server = servers.recv().await.expect("connection opened");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));
        assert!(server.drain().is_empty(), "join must be sent once");
    }

    #[tokio::test]
    async fn pushes_reach_only_matching_sku() {
        let (channel, _transport, _servers, server) = connected().await;
        let seen = Arc::new(AtomicI64::new(-1));
        let other = Arc::new(AtomicI64::new(-1));
        let _a = channel.on_stock_update(ViewId::new(), "s1", {
            let seen = seen.clone();
            move |stock| seen.store(stock, Ordering::SeqCst)
        });
        let _b = channel.on_stock_update(ViewId::new(), "s2", {
            let other = other.clone();
            move |stock| other.store(stock, Ordering::SeqCst)
        });

        server.stock("s1", 4);
        eventually(|| seen.load(Ordering::SeqCst) == 4).await;
        assert_eq!(other.load(Ordering::SeqCst), -1);
    }

    #[tokio::test]
    async fn pushes_for_one_sku_apply_in_order() {
        let (channel, _transport, _servers, server) = connected().await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let _sub = channel.on_stock_update(ViewId::new(), "s1", {
            let log = log.clone();
            move |stock| log.lock().unwrap().push(stock)
        });

        for stock in [5, 3, 0, 8] {
            server.stock("s1", stock);
        }
        eventually(|| log.lock().unwrap().len() == 4).await;
        assert_eq!(*log.lock().unwrap(), vec![5, 3, 0, 8]);
    }

    #[tokio::test]
    async fn re_registering_replaces_callback() {
        let (channel, _transport, _servers, server) = connected().await;
        let view = ViewId::new();
        let calls = Arc::new(AtomicI64::new(0));

        let old = channel.on_stock_update(view, "s1", {
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(100, Ordering::SeqCst);
            }
        });
        let _new = channel.on_stock_update(view, "s1", {
            let calls = calls.clone();
            move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(channel.listener_count("s1"), 1);

        // Dropping the replaced subscription must not remove the new one.
        drop(old);
        assert_eq!(channel.listener_count("s1"), 1);

        server.stock("s1", 2);
        eventually(|| calls.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn unsubscribe_is_synchronous() {
        let (channel, _transport, _servers, _server) = connected().await;
        let sub = channel.on_stock_update(ViewId::new(), "s1", |_| {});
        assert_eq!(channel.listener_count("s1"), 1);
        sub.unsubscribe();
        assert_eq!(channel.listener_count("s1"), 0);
    }

    #[tokio::test]
    async fn global_updates_fan_out() {
        let (channel, _transport, _servers, server) = connected().await;
        let hits = Arc::new(AtomicI64::new(0));
        let _sub = channel.on_global_update({
            let hits = hits.clone();
            move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }
        });
        let _ = server
            .push
            .send(Ok(ServerFrame::GlobalStockUpdated(serde_json::json!({}))));
        eventually(|| hits.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn drop_clears_rooms_bumps_epoch_and_reconnects() {
        let (channel, transport, mut servers, server) = connected().await;
        let stale = channel.join_product("p1");
        let epoch = channel.status().epoch;

        let _ = server.push.send(Err(ChannelError::Disconnected("reset".into())));
        drop(server);

        let mut server = servers.recv().await.expect("reconnected");
        eventually(|| channel.state() == ConnectionState::Connected).await;
        assert_eq!(channel.status().epoch, epoch + 1);
        assert!(!channel.is_joined("p1"));
        assert_eq!(transport.opens.load(Ordering::SeqCst), 2);

        // A sibling re-joins; the stale ticket must not tear the room down.
        let fresh = channel.join_product("p1");
        assert_eq!(server.next_frame().await, ClientFrame::JoinProduct("p1".into()));
        channel.leave_product(stale);
        assert!(channel.is_joined("p1"));
        assert!(server.drain().is_empty());

        channel.leave_product(fresh);
        assert_eq!(server.next_frame().await, ClientFrame::LeaveProduct("p1".into()));
    }

    #[tokio::test]
    async fn refused_connections_are_retried() {
        let (transport, mut servers) = MockTransport::new();
        transport.refuse.store(2, Ordering::SeqCst);
        let channel = InventoryChannel::new(transport.clone(), fast_config());
        channel.connect();

        let _server = servers.recv().await.expect("third attempt connects");
        assert_eq!(transport.opens.load(Ordering::SeqCst), 3);
        eventually(|| channel.state() == ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn teardown_returns_to_disconnected() {
        let (channel, _transport, _servers, _server) = connected().await;
        let _ticket = channel.join_product("p1");
        let _sub = channel.on_stock_update(ViewId::new(), "s1", |_| {});

        channel.teardown().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
        assert!(!channel.is_joined("p1"));
        assert_eq!(channel.listener_count("s1"), 1, "listeners outlive teardown");

        channel.teardown().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    fn assert_gap(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(5),
            "expected a reconnect gap of about {expected:?}, got {actual:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_backoff_doubles_to_cap_and_resets_after_connect() {
        let (transport, mut servers) = MockTransport::new();
        transport.refuse.store(3, Ordering::SeqCst);
        let channel = InventoryChannel::new(
            transport.clone(),
            ChannelConfig {
                reconnect_base_delay: Duration::from_millis(100),
                reconnect_max_delay: Duration::from_millis(300),
            },
        );
        channel.connect();

        // Three refusals, then the fourth open succeeds.
        let server = servers.recv().await.expect("connection opened");
        assert_eq!(transport.opens.load(Ordering::SeqCst), 4);
        let gaps = transport.open_gaps();
        assert_eq!(gaps.len(), 3);
        assert_gap(gaps[0], 100);
        assert_gap(gaps[1], 200);
        assert_gap(gaps[2], 300);

        // The successful open resets the delay: the next reconnect waits
        // only the base delay.
        drop(server);
        let _server = servers.recv().await.expect("reconnected");
        let gaps = transport.open_gaps();
        assert_eq!(gaps.len(), 4);
        assert_gap(gaps[3], 100);

        channel.teardown().await;
    }
}
