//! Crate-level error types for backend calls, cart mutations, storage, and
//! the live inventory channel.

/// Error returned by a [`CartApi`](crate::CartApi) call.
///
/// The backend reports failures as an HTTP status plus a message body. The
/// message is kept verbatim because validation errors (e.g. "stock exceeded")
/// are shown to the shopper as-is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The backend answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error message extracted from the response body.
        message: String,
    },

    /// The request never produced a response (DNS, TLS, reset, timeout).
    ///
    /// Whether the server applied the mutation is unknown, so callers must
    /// not retry automatically.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response arrived but its body did not have the expected shape.
    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Returns `true` if this error means "you are not logged in".
    ///
    /// Detection inspects both the status code and the error text, since
    /// some backend paths wrap a 401 inside a generic 4xx/5xx with a message
    /// like "Unauthorized" or "Login required". A `401` in the message only
    /// counts as a standalone token, so ids such as `sku-4010` do not match.
    pub fn is_auth_required(&self) -> bool {
        if let Self::Status { status: 401, .. } = self {
            return true;
        }
        let message = match self {
            Self::Status { message, .. } => message,
            Self::Transport(message) | Self::Decode(message) => message,
        };
        let lower = message.to_lowercase();
        message
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| token == "401")
            || lower.contains("unauthorized")
            || lower.contains("login")
            || lower.contains("authenticated")
    }

    /// Returns `true` for failures where the request outcome is unknown.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Error surfaced by the [`CartGateway`](crate::CartGateway).
///
/// Authentication failures never appear here: they are converted into a
/// successful guest-path mutation. Everything else passes through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Backend rejected the mutation or could not be reached.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Quantity was below 1; nothing was sent.
    #[error("quantity must be at least 1, got {0}")]
    InvalidQuantity(i64),
}

/// Error returned by a [`KeyValueStorage`](crate::KeyValueStorage) backend.
///
/// Never crosses the [`LocalCartStore`](crate::LocalCartStore) boundary: the
/// store logs it and carries on with an empty or unchanged cart.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key contains characters that cannot be mapped to a storage slot.
    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// Error produced by a [`StockTransport`](crate::StockTransport) connection.
///
/// Logged by the channel's connection loop and followed by a reconnect;
/// never delivered to stock view consumers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Could not open the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection broke while reading or writing.
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}
