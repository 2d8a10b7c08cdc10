//! Client configuration: backend endpoint, local storage location, and
//! live channel reconnection tuning.

use std::path::PathBuf;
use std::time::Duration;

/// Default threshold at or below which stock is shown as "low".
pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 5;

/// Reconnection tuning for the [`InventoryChannel`](crate::InventoryChannel).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use storefront_cart::ChannelConfig;
///
/// let config = ChannelConfig {
///     reconnect_base_delay: Duration::from_millis(250),
///     ..ChannelConfig::default()
/// };
/// assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base delay for exponential backoff after a dropped or refused
    /// connection. Doubles on each consecutive failure.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration consumed by [`StorefrontBuilder`](crate::StorefrontBuilder).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the backend REST API, e.g. `http://localhost:8080/api/v1`.
    pub api_base_url: String,
    /// Directory holding guest cart and wishlist files.
    pub storage_dir: PathBuf,
    /// Per-request timeout for backend calls. Transport-owned; the cart
    /// core itself never times out an operation.
    pub request_timeout: Duration,
    /// Live channel reconnection tuning.
    pub channel: ChannelConfig,
    /// Stock at or below this value is classified as low.
    pub low_stock_threshold: i64,
}

impl ClientConfig {
    /// Build a config with defaults for everything but the two locations.
    pub fn new(api_base_url: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            storage_dir: storage_dir.into(),
            request_timeout: Duration::from_secs(15),
            channel: ChannelConfig::default(),
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
        }
    }

    /// WebSocket URL of the inventory namespace for this API.
    pub fn stock_socket_url(&self) -> String {
        stock_socket_url(&self.api_base_url)
    }
}

/// Derive the inventory WebSocket URL from the REST API base URL.
///
/// The socket server lives at the API host root, so any `/api...` path is
/// dropped, the scheme is switched from `http(s)` to `ws(s)`, and the
/// `/stock` namespace is appended.
///
/// # Examples
///
/// ```
/// use storefront_cart::stock_socket_url;
///
/// assert_eq!(
///     stock_socket_url("https://shop.example.com/api/v1"),
///     "wss://shop.example.com/stock"
/// );
/// assert_eq!(stock_socket_url("http://localhost:8080"), "ws://localhost:8080/stock");
/// ```
pub fn stock_socket_url(api_base_url: &str) -> String {
    let base = match api_base_url.find("/api") {
        Some(idx) => &api_base_url[..idx],
        None => api_base_url,
    };
    let base = base.trim_end_matches('/');
    let ws = match base.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => base.to_string(),
    };
    format!("{ws}/stock")
}
