//! In-process stand-ins for the backend API and the live channel transport.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::api::{CartApi, CartSummary, MergeReport};
use crate::channel::{ClientFrame, ServerFrame, StockConnection, StockTransport};
use crate::error::{ApiError, ChannelError};
use crate::guest_cart::CartLineItem;

/// Scriptable [`CartApi`] that keeps a server-side unit total.
#[derive(Default)]
pub(crate) struct MockCartApi {
    /// Units held by the fake server cart.
    pub server_units: AtomicU32,
    /// Errors returned by the next mutating calls, in order.
    pub mutation_errors: Mutex<VecDeque<ApiError>>,
    /// Error returned by every `fetch_cart` while set.
    pub fetch_error: Mutex<Option<ApiError>>,
    /// When set, `fetch_cart` waits for a notification before answering.
    pub fetch_gate: Mutex<Option<Arc<Notify>>>,
    /// Human-readable log of calls, e.g. `"add sku-1 2"`.
    pub calls: Mutex<Vec<String>>,
    pub fetch_calls: AtomicUsize,
    /// Canned merge report.
    pub merge_report: Mutex<MergeReport>,
}

impl MockCartApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, err: ApiError) {
        self.mutation_errors.lock().unwrap().push_back(err);
    }

    pub fn unauthorized() -> ApiError {
        ApiError::Status {
            status: 401,
            message: "Unauthorized".into(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        match self.mutation_errors.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CartApi for MockCartApi {
    async fn add_item(&self, sku_id: &str, quantity: u32) -> Result<(), ApiError> {
        self.record(format!("add {sku_id} {quantity}"))?;
        self.server_units.fetch_add(quantity, Ordering::SeqCst);
        Ok(())
    }

    async fn update_item(&self, item_id: &str, quantity: u32) -> Result<(), ApiError> {
        self.record(format!("update {item_id} {quantity}"))
    }

    async fn remove_item(&self, item_id: &str) -> Result<(), ApiError> {
        self.record(format!("remove {item_id}"))
    }

    async fn fetch_cart(&self) -> Result<CartSummary, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.fetch_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.fetch_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(CartSummary {
            items: Vec::new(),
            total_items: Some(self.server_units.load(Ordering::SeqCst)),
        })
    }

    async fn clear_cart(&self) -> Result<(), ApiError> {
        self.record("clear".to_string())?;
        self.server_units.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn merge_guest_cart(&self, items: &[CartLineItem]) -> Result<MergeReport, ApiError> {
        let lines: Vec<String> = items
            .iter()
            .map(|i| format!("{}x{}", i.sku_id, i.quantity))
            .collect();
        self.record(format!("merge_cart {}", lines.join(",")))?;
        let units: u32 = items.iter().map(|i| i.quantity).sum();
        self.server_units.fetch_add(units, Ordering::SeqCst);
        Ok(*self.merge_report.lock().unwrap())
    }

    async fn merge_guest_wishlist(&self, product_ids: &[String]) -> Result<(), ApiError> {
        self.record(format!("merge_wishlist {}", product_ids.join(",")))
    }
}

type FrameStream = Pin<Box<dyn Stream<Item = Result<ServerFrame, ChannelError>> + Send>>;

/// Server side of one mock connection.
pub(crate) struct MockServer {
    /// Push frames (or a transport error) to the client.
    pub push: mpsc::UnboundedSender<Result<ServerFrame, ChannelError>>,
    /// Frames the client sent.
    pub received: mpsc::UnboundedReceiver<ClientFrame>,
}

impl MockServer {
    pub fn stock(&self, sku_id: &str, stock: i64) {
        let _ = self.push.send(Ok(ServerFrame::StockUpdated {
            sku_id: sku_id.to_string(),
            stock,
        }));
    }

    /// Wait for the next client frame.
    pub async fn next_frame(&mut self) -> ClientFrame {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed")
    }

    /// Drain frames already sent by the client.
    pub fn drain(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.received.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// [`StockTransport`] handing each accepted connection to the test.
pub(crate) struct MockTransport {
    servers: mpsc::UnboundedSender<MockServer>,
    /// Number of upcoming `open` calls that fail.
    pub refuse: AtomicUsize,
    pub opens: AtomicUsize,
    /// Clock reading at every `open` call, refused or not.
    pub open_times: Mutex<Vec<tokio::time::Instant>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockServer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                servers: tx,
                refuse: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                open_times: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Gaps between successive `open` calls.
    pub fn open_gaps(&self) -> Vec<std::time::Duration> {
        let times = self.open_times.lock().expect("open times lock poisoned");
        times.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl StockTransport for MockTransport {
    async fn open(&self) -> Result<StockConnection, ChannelError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_times
            .lock()
            .expect("open times lock poisoned")
            .push(tokio::time::Instant::now());
        let refuse = self.refuse.load(Ordering::SeqCst);
        if refuse > 0 {
            self.refuse.store(refuse - 1, Ordering::SeqCst);
            return Err(ChannelError::Connect("refused".into()));
        }
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let inbound: FrameStream = Box::pin(UnboundedReceiverStream::new(push_rx));
        let _ = self.servers.send(MockServer {
            push: push_tx,
            received: client_rx,
        });
        Ok(StockConnection {
            outbound: client_tx,
            inbound,
        })
    }
}

/// Wait until `check` holds, polling between scheduler turns.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}
