//! Composition root: one [`Storefront`] per client session.
//!
//! Every component that must be shared (event bus, badge count, session
//! state, inventory channel) is created exactly once here and handed out by
//! reference, so two badges can never disagree about which store they read.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::CartAggregateStore;
use crate::api::{CartApi, HttpCartApi, MergeReport};
use crate::auth::BearerToken;
use crate::bus::EventBus;
use crate::channel::{InventoryChannel, StockTransport};
use crate::config::{ChannelConfig, ClientConfig, DEFAULT_LOW_STOCK_THRESHOLD, stock_socket_url};
use crate::error::ApiError;
use crate::gateway::CartGateway;
use crate::guest_cart::LocalCartStore;
use crate::guest_wishlist::GuestWishlist;
use crate::session::CartSession;
use crate::stock_view::StockView;
use crate::storage::{FileStorage, KeyValueStorage};
use crate::sync::CartBadgeSync;
use crate::ws::WsTransport;

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080/api/v1";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Builder for [`Storefront`].
///
/// Every component has a production default (HTTP API, file storage,
/// WebSocket transport); tests swap in their own through
/// [`api`](Self::api), [`storage`](Self::storage) and
/// [`transport`](Self::transport).
pub struct StorefrontBuilder {
    api_base_url: Option<String>,
    storage_dir: Option<PathBuf>,
    request_timeout: Duration,
    token: BearerToken,
    api: Option<Arc<dyn CartApi>>,
    storage: Option<Arc<dyn KeyValueStorage>>,
    transport: Option<Arc<dyn StockTransport>>,
    channel_config: ChannelConfig,
    low_stock_threshold: i64,
    initial_cart_count: Option<u32>,
}

impl StorefrontBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            api_base_url: None,
            storage_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            token: BearerToken::default(),
            api: None,
            storage: None,
            transport: None,
            channel_config: ChannelConfig::default(),
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            initial_cart_count: None,
        }
    }

    /// Create a builder pre-filled from a [`ClientConfig`].
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            api_base_url: Some(config.api_base_url),
            storage_dir: Some(config.storage_dir),
            request_timeout: config.request_timeout,
            channel_config: config.channel,
            low_stock_threshold: config.low_stock_threshold,
            ..Self::new()
        }
    }

    /// Set the backend REST base URL (e.g. `"https://shop.example.com/api/v1"`).
    ///
    /// The inventory socket URL is derived from it.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    /// Directory for the guest cart and wishlist.
    ///
    /// If not set, defaults to a system temp directory.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn storage_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(path.into());
        self
    }

    /// Share a token slot with the host application.
    ///
    /// Writing a new value into the slot (token refresh) is picked up by the
    /// next request. A non-empty token at build time starts the session as
    /// authenticated.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn auth_token(mut self, token: BearerToken) -> Self {
        self.token = token;
        self
    }

    /// Use a custom [`CartApi`] instead of the HTTP client.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn api(mut self, api: Arc<dyn CartApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Use a custom [`KeyValueStorage`] instead of files.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn storage(mut self, storage: Arc<dyn KeyValueStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a custom [`StockTransport`] instead of the WebSocket one.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn transport(mut self, transport: Arc<dyn StockTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn low_stock_threshold(mut self, threshold: i64) -> Self {
        self.low_stock_threshold = threshold;
        self
    }

    /// Seed the badge with a server-rendered count instead of waiting for
    /// the first fetch.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn initial_cart_count(mut self, count: u32) -> Self {
        self.initial_cart_count = Some(count);
        self
    }

    /// Wire every component together and start the badge sync.
    ///
    /// Must be called from within a tokio runtime. Does not open the
    /// inventory connection; the first mounted [`StockView`] does.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the HTTP client cannot be built.
    pub fn build(self) -> Result<Storefront, ApiError> {
        let api_base_url = self
            .api_base_url
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let api: Arc<dyn CartApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpCartApi::new(
                api_base_url.clone(),
                self.token.clone(),
                self.request_timeout,
            )?),
        };
        let storage: Arc<dyn KeyValueStorage> = match self.storage {
            Some(storage) => storage,
            None => {
                let dir = self
                    .storage_dir
                    .unwrap_or_else(|| std::env::temp_dir().join("storefront-cart"));
                Arc::new(FileStorage::new(dir))
            }
        };
        let transport: Arc<dyn StockTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(WsTransport::new(
                stock_socket_url(&api_base_url),
                self.token.clone(),
            )),
        };

        let bus = EventBus::new();
        let local_cart = LocalCartStore::new(storage.clone(), bus.clone());
        let wishlist = GuestWishlist::new(storage, bus.clone());
        let session = CartSession::new(
            self.token.clone(),
            api.clone(),
            local_cart.clone(),
            wishlist.clone(),
            bus.clone(),
        );
        let aggregate = CartAggregateStore::new(api.clone());
        let gateway = CartGateway::new(
            api,
            local_cart.clone(),
            aggregate.clone(),
            session.clone(),
            bus.clone(),
        );
        let channel = InventoryChannel::new(transport, self.channel_config);

        let badge_sync =
            CartBadgeSync::spawn(aggregate.clone(), local_cart.clone(), session.clone(), &bus);
        if let Some(count) = self.initial_cart_count {
            badge_sync.hydrate(count);
        }
        tracing::info!(
            api_base_url = %api_base_url,
            authenticated = session.is_authenticated(),
            "storefront ready"
        );

        Ok(Storefront {
            token: self.token,
            bus,
            local_cart,
            wishlist,
            aggregate,
            session,
            gateway,
            channel,
            badge_sync,
            low_stock_threshold: self.low_stock_threshold,
        })
    }
}

impl Default for StorefrontBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The cart and inventory subsystem for one client session.
pub struct Storefront {
    token: BearerToken,
    bus: EventBus,
    local_cart: LocalCartStore,
    wishlist: GuestWishlist,
    aggregate: CartAggregateStore,
    session: CartSession,
    gateway: CartGateway,
    channel: InventoryChannel,
    badge_sync: CartBadgeSync,
    low_stock_threshold: i64,
}

impl std::fmt::Debug for Storefront {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storefront")
            .field("session", &self.session)
            .field("cart", &self.aggregate)
            .field("channel", &self.channel)
            .finish()
    }
}

impl Storefront {
    pub fn builder() -> StorefrontBuilder {
        StorefrontBuilder::new()
    }

    pub fn token(&self) -> &BearerToken {
        &self.token
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn local_cart(&self) -> &LocalCartStore {
        &self.local_cart
    }

    pub fn wishlist(&self) -> &GuestWishlist {
        &self.wishlist
    }

    /// The shared badge count. Every badge must read this instance.
    pub fn cart(&self) -> &CartAggregateStore {
        &self.aggregate
    }

    pub fn session(&self) -> &CartSession {
        &self.session
    }

    pub fn gateway(&self) -> &CartGateway {
        &self.gateway
    }

    pub fn channel(&self) -> &InventoryChannel {
        &self.channel
    }

    pub fn low_stock_threshold(&self) -> i64 {
        self.low_stock_threshold
    }

    /// Mount a [`StockView`] on the shared channel.
    pub fn stock_view(
        &self,
        initial_stock: i64,
        sku_id: Option<&str>,
        product_id: Option<&str>,
    ) -> StockView {
        StockView::mount(&self.channel, initial_stock, sku_id, product_id)
    }

    /// Log in with a fresh token and move guest data into the account.
    ///
    /// # Errors
    ///
    /// Returns the [`ApiError`] of a failed cart merge. The session stays
    /// authenticated and the guest cart is kept for a later retry.
    pub async fn login(&self, token: impl Into<String>) -> Result<MergeReport, ApiError> {
        self.session.login(token);
        self.session.merge_guest_into_account().await
    }

    /// Forget the token and wipe the guest cart.
    pub fn logout(&self) {
        self.session.logout();
    }

    /// Stop the badge sync and close the inventory connection.
    pub async fn shutdown(&self) {
        self.badge_sync.stop();
        self.channel.teardown().await;
        tracing::info!("storefront shut down");
    }
}
