//! WebSocket transport for the live inventory channel.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::auth::BearerToken;
use crate::channel::{ClientFrame, ServerFrame, StockConnection, StockTransport};
use crate::error::ChannelError;

/// [`StockTransport`] speaking JSON text frames over a WebSocket.
///
/// The bearer token, when present, is sent on the upgrade request. Stock
/// pushes are public, so guests connect without one.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    token: BearerToken,
}

impl WsTransport {
    /// # Arguments
    ///
    /// * `url` - Socket URL, usually from
    ///   [`ClientConfig::stock_socket_url`](crate::ClientConfig::stock_socket_url).
    /// * `token` - Shared token slot, read on every connect.
    pub fn new(url: impl Into<String>, token: BearerToken) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self) -> Result<Request, ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        if let Some(value) = self.token.header_value() {
            let value =
                HeaderValue::from_str(&value).map_err(|e| ChannelError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Ok(request)
    }
}

#[async_trait]
impl StockTransport for WsTransport {
    async fn open(&self) -> Result<StockConnection, ChannelError> {
        let request = self.request()?;
        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, "stock socket open");

        let (mut sink, stream) = socket.split();
        let (outbound, mut frames) = mpsc::unbounded_channel::<ClientFrame>();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let text = match frame.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping unencodable frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    tracing::debug!(error = %e, "stock socket writer stopped");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let inbound = stream.filter_map(|message| async move { decode_message(message) });
        Ok(StockConnection {
            outbound,
            inbound: Box::pin(inbound),
        })
    }
}

/// Map one socket message to a channel item. Control frames and frames
/// this client does not understand yield `None`.
fn decode_message(
    message: Result<Message, WsError>,
) -> Option<Result<ServerFrame, ChannelError>> {
    match message {
        Ok(Message::Text(text)) => match ServerFrame::decode(&text) {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                tracing::debug!(frame = %text, "ignoring unknown stock event");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed stock frame");
                None
            }
        },
        Ok(_) => None,
        Err(e) => Some(Err(ChannelError::Disconnected(e.to_string()))),
    }
}
