//! Backend cart API: the [`CartApi`] seam and its HTTP implementation.
//!
//! [`HttpCartApi`] speaks the storefront REST contract:
//!
//! | Operation                      | Request                        |
//! |--------------------------------|--------------------------------|
//! | [`CartApi::add_item`]          | `POST /cart/items`             |
//! | [`CartApi::update_item`]       | `PATCH /cart/items/{itemId}`   |
//! | [`CartApi::remove_item`]       | `DELETE /cart/items/{itemId}`  |
//! | [`CartApi::fetch_cart`]        | `GET /cart`                    |
//! | [`CartApi::clear_cart`]        | `DELETE /cart`                 |
//! | [`CartApi::merge_guest_cart`]  | `POST /cart/merge`             |
//! | [`CartApi::merge_guest_wishlist`] | `POST /wishlist/merge`      |
//!
//! Successful bodies are wrapped as `{ "data": ... }`. Error bodies carry a
//! `message` field that is surfaced verbatim.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::BearerToken;
use crate::error::ApiError;
use crate::guest_cart::CartLineItem;

/// One line of the authenticated (server-side) cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerCartItem {
    /// Server-assigned cart item id, used by update/remove.
    pub id: String,
    /// Product variant identifier.
    #[serde(default)]
    pub sku_id: String,
    #[serde(default)]
    pub quantity: u32,
}

/// Authoritative cart as returned by `GET /cart`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSummary {
    #[serde(default)]
    pub items: Vec<ServerCartItem>,
    /// Precomputed unit total, when the backend provides one.
    #[serde(default)]
    pub total_items: Option<u32>,
}

impl CartSummary {
    /// Total unit count: the backend's `totalItems` if present, otherwise
    /// the sum of line quantities.
    pub fn total_units(&self) -> u32 {
        self.total_items.unwrap_or_else(|| {
            self.items
                .iter()
                .fold(0u32, |acc, i| acc.saturating_add(i.quantity))
        })
    }
}

/// Outcome of merging a guest cart into an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Lines accepted by the backend.
    pub merged: usize,
    /// Accepted lines whose quantity was reduced to available stock.
    pub capped: usize,
    /// Lines the backend rejected.
    pub failed: usize,
}

impl MergeReport {
    /// Returns `true` if the shopper should be told some lines changed.
    pub fn needs_attention(&self) -> bool {
        self.capped > 0 || self.failed > 0
    }
}

/// Backend cart operations.
///
/// All calls are single attempts: implementations must not retry on their
/// own, since a retried add after an ambiguous failure may double-count.
#[async_trait]
pub trait CartApi: Send + Sync {
    /// Add `quantity` units of `sku_id` to the account cart.
    async fn add_item(&self, sku_id: &str, quantity: u32) -> Result<(), ApiError>;

    /// Set the quantity of the server cart item `item_id`.
    async fn update_item(&self, item_id: &str, quantity: u32) -> Result<(), ApiError>;

    /// Remove the server cart item `item_id`.
    async fn remove_item(&self, item_id: &str) -> Result<(), ApiError>;

    /// Fetch the authoritative cart.
    async fn fetch_cart(&self) -> Result<CartSummary, ApiError>;

    /// Empty the account cart.
    async fn clear_cart(&self) -> Result<(), ApiError>;

    /// Merge guest lines into the account cart.
    async fn merge_guest_cart(&self, items: &[CartLineItem]) -> Result<MergeReport, ApiError>;

    /// Merge guest wishlist product ids into the account wishlist.
    async fn merge_guest_wishlist(&self, product_ids: &[String]) -> Result<(), ApiError>;
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddItemBody<'a> {
    sku_id: &'a str,
    quantity: u32,
}

#[derive(Serialize)]
struct UpdateItemBody {
    quantity: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MergeWishlistBody<'a> {
    product_ids: &'a [String],
}

/// HTTP implementation of [`CartApi`] over `reqwest`.
///
/// `Clone` is cheap: the inner `reqwest::Client` is a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpCartApi {
    client: reqwest::Client,
    base_url: String,
    token: BearerToken,
}

impl HttpCartApi {
    /// Create a client for the API at `base_url`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root, e.g. `"http://localhost:8080/api/v1"`.
    /// * `token` - Shared Bearer token; empty means guest.
    /// * `timeout` - Per-request timeout enforced by the transport.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] if the TLS backend cannot be
    /// initialized.
    pub fn new(
        base_url: impl Into<String>,
        token: BearerToken,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Absolute URL for an API path such as `/cart/items`.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<String, ApiError> {
        let response = self
            .token
            .apply(request)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                message: error_message(&body, status.canonical_reason().unwrap_or("error")),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl CartApi for HttpCartApi {
    async fn add_item(&self, sku_id: &str, quantity: u32) -> Result<(), ApiError> {
        let request = self
            .client
            .post(self.endpoint("/cart/items"))
            .json(&AddItemBody { sku_id, quantity });
        self.send(request).await.map(|_| ())
    }

    async fn update_item(&self, item_id: &str, quantity: u32) -> Result<(), ApiError> {
        let request = self
            .client
            .patch(self.endpoint(&format!("/cart/items/{item_id}")))
            .json(&UpdateItemBody { quantity });
        self.send(request).await.map(|_| ())
    }

    async fn remove_item(&self, item_id: &str) -> Result<(), ApiError> {
        let request = self
            .client
            .delete(self.endpoint(&format!("/cart/items/{item_id}")));
        self.send(request).await.map(|_| ())
    }

    async fn fetch_cart(&self) -> Result<CartSummary, ApiError> {
        let body = self.send(self.client.get(self.endpoint("/cart"))).await?;
        parse_cart_summary(&body)
    }

    async fn clear_cart(&self) -> Result<(), ApiError> {
        let request = self.client.delete(self.endpoint("/cart"));
        self.send(request).await.map(|_| ())
    }

    async fn merge_guest_cart(&self, items: &[CartLineItem]) -> Result<MergeReport, ApiError> {
        let request = self.client.post(self.endpoint("/cart/merge")).json(items);
        let body = self.send(request).await?;
        Ok(parse_merge_report(&body, items.len()))
    }

    async fn merge_guest_wishlist(&self, product_ids: &[String]) -> Result<(), ApiError> {
        let request = self
            .client
            .post(self.endpoint("/wishlist/merge"))
            .json(&MergeWishlistBody { product_ids });
        self.send(request).await.map(|_| ())
    }
}

/// Decode a `GET /cart` body (`{ "data": { items, totalItems } }`).
///
/// # Errors
///
/// Returns [`ApiError::Decode`] if the body is not the expected envelope.
pub fn parse_cart_summary(body: &str) -> Result<CartSummary, ApiError> {
    serde_json::from_str::<Envelope<CartSummary>>(body)
        .map(|e| e.data)
        .map_err(|e| ApiError::Decode(format!("cart summary: {e}")))
}

/// Summarize a `POST /cart/merge` body.
///
/// The per-line results may arrive as a bare array, under `results`, or
/// under `data`; each entry looks like `{ success, data: { capped } }`. A body
/// without recognizable results counts every submitted line as merged,
/// since the request itself succeeded.
pub fn parse_merge_report(body: &str, submitted: usize) -> MergeReport {
    let value: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let results = match &value {
        Value::Array(results) => Some(results),
        Value::Object(map) => ["results", "data"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_array)),
        _ => None,
    };
    let Some(results) = results else {
        return MergeReport {
            merged: submitted,
            ..MergeReport::default()
        };
    };

    let mut report = MergeReport::default();
    for result in results {
        let success = result
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !success {
            report.failed += 1;
            continue;
        }
        report.merged += 1;
        let capped = result
            .get("data")
            .and_then(|d| d.get("capped"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if capped {
            report.capped += 1;
        }
    }
    report
}

/// Extract a human-readable message from an error body.
///
/// Prefers a JSON `message` (string or array of strings), then `error`,
/// then the raw text, then `fallback` for an empty body.
pub fn error_message(body: &str, fallback: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        match map.get("message") {
            Some(Value::String(s)) => return s.clone(),
            Some(Value::Array(parts)) => {
                let joined: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
                if !joined.is_empty() {
                    return joined.join("; ");
                }
            }
            _ => {}
        }
        if let Some(Value::String(s)) = map.get("error") {
            return s.clone();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
