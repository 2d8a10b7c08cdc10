//! Client-side cart and live inventory reconciliation for a storefront.
//!
//! A shopper's cart lives either in local storage (guest) or on the backend
//! (authenticated). [`CartGateway`] routes each mutation to the right one,
//! [`CartAggregateStore`] keeps the single badge count every surface reads,
//! and [`InventoryChannel`] multiplexes one push connection between all
//! mounted [`StockView`]s. [`Storefront`] wires them together.

mod aggregate;
mod api;
mod auth;
mod bus;
mod channel;
mod config;
mod error;
mod gateway;
mod guest_cart;
mod guest_wishlist;
mod session;
mod stock_view;
mod storage;
mod storefront;
mod sync;
mod ws;

#[cfg(test)]
mod test_fixtures;

pub use aggregate::{CartAggregateState, CartAggregateStore};
pub use api::{
    CartApi, CartSummary, HttpCartApi, MergeReport, ServerCartItem, error_message,
    parse_cart_summary, parse_merge_report,
};
pub use auth::BearerToken;
pub use bus::{BusSubscription, EventBus, StoreEvent};
pub use channel::{
    ClientFrame, ConnectionState, ConnectionStatus, InventoryChannel, RoomTicket, ServerFrame,
    StockConnection, StockSubscription, StockTransport, ViewId,
};
pub use config::{ChannelConfig, ClientConfig, DEFAULT_LOW_STOCK_THRESHOLD, stock_socket_url};
pub use error::{ApiError, ChannelError, GatewayError, StorageError};
pub use gateway::{CartGateway, MutationOutcome};
pub use guest_cart::{CartLineItem, GUEST_CART_KEY, LocalCartStore, parse_guest_cart};
pub use guest_wishlist::{GUEST_WISHLIST_KEY, GuestWishlist};
pub use session::{CartSession, CartSource};
pub use stock_view::{StockLevel, StockView};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use storefront::{Storefront, StorefrontBuilder};
pub use sync::CartBadgeSync;
pub use ws::WsTransport;
