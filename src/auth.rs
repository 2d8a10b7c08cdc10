//! Shared, refreshable Bearer token injected into outgoing requests.

use std::sync::{Arc, RwLock};

/// Bearer token shared between the HTTP client, the live channel transport,
/// and the session.
///
/// The token is read on every outgoing request, so writing a new value
/// (login, token refresh) takes effect on the next call. An empty token
/// means "guest": no `Authorization` header is sent.
///
/// `Clone` is cheap; clones share the same slot.
///
/// # Panics
///
/// Panics if the inner [`RwLock`] is poisoned (a writer panicked while
/// holding it). This is treated as an invariant violation.
#[derive(Debug, Clone, Default)]
pub struct BearerToken {
    token: Arc<RwLock<String>>,
}

impl BearerToken {
    /// Create a token slot holding `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.into())),
        }
    }

    /// Replace the current token.
    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().expect("token RwLock poisoned") = token.into();
    }

    /// Forget the current token (logout).
    pub fn clear(&self) {
        self.token.write().expect("token RwLock poisoned").clear();
    }

    /// Returns `true` if a non-empty token is set.
    pub fn is_present(&self) -> bool {
        !self.token.read().expect("token RwLock poisoned").is_empty()
    }

    /// The `Authorization` header value, or `None` for an empty token.
    pub fn header_value(&self) -> Option<String> {
        let token = self.token.read().expect("token RwLock poisoned");
        if token.is_empty() {
            None
        } else {
            Some(format!("Bearer {token}"))
        }
    }

    /// Attach the `Authorization` header to `request` if a token is set.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.header_value() {
            Some(value) => request.header(reqwest::header::AUTHORIZATION, value),
            None => request,
        }
    }
}
