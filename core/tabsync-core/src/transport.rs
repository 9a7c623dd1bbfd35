//! Real-time push channel.
//!
//! A [`Transport`] opens one link and hands back a pair of channels: frames to
//! send, and inbound events (frames plus the terminal close/failure). The
//! connection manager owns the lifecycle; a transport never reconnects on its
//! own.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tabsync_protocol::{parse_frame, WireFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::settings::ConnectionSettings;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(WireFrame),
    /// The peer closed the link.
    Closed { reason: Option<String> },
    /// The link broke.
    Failed(String),
}

/// Both halves of an open link. Dropping `outbound` closes the link.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<WireFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, settings: &ConnectionSettings) -> Result<TransportLink>;
}

pub struct WebSocketTransport {
    connect_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, settings: &ConnectionSettings) -> Result<TransportLink> {
        let request = client_request(settings)?;
        let target = request.uri().to_string();

        let (socket, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| {
                    SyncError::ConnectionFailed(format!(
                        "timed out after {:?} connecting to {}",
                        self.connect_timeout, target
                    ))
                })?
                .map_err(|err| SyncError::ConnectionFailed(format!("{}: {}", target, err)))?;
        debug!(url = %target, "WebSocket connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WireFrame>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "Dropping unencodable outbound frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    debug!(error = %err, "WebSocket writer stopped");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let event = match message {
                    Ok(Message::Text(text)) => match parse_frame(&text) {
                        Ok(frame) => TransportEvent::Frame(frame),
                        Err(info) => {
                            debug!(code = %info.code, message = %info.message, "Ignoring malformed push frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(close)) => {
                        let reason = close
                            .map(|close| close.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                        let _ = inbound_tx.send(TransportEvent::Closed { reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(TransportEvent::Failed(err.to_string()));
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportEvent::Closed { reason: None });
        });

        Ok(TransportLink { outbound, inbound })
    }
}

/// Handshake request carrying the bearer token.
fn client_request(settings: &ConnectionSettings) -> Result<Request> {
    let url = settings.socket_url()?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| SyncError::invalid_settings("host", err.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", settings.api_token.trim()))
        .map_err(|err| SyncError::invalid_settings("apiToken", err.to_string()))?;
    request.headers_mut().insert(header::AUTHORIZATION, bearer);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_targets_socket_url_with_bearer() {
        let settings = ConnectionSettings {
            protocol: "https".to_string(),
            host: "canvas.example".to_string(),
            port: 443,
            api_token: "t0ken".to_string(),
            ..ConnectionSettings::default()
        };
        let request = client_request(&settings).unwrap();
        assert_eq!(request.uri().scheme_str(), Some("wss"));
        assert_eq!(request.uri().path(), "/ws");
        assert_eq!(
            request.headers().get(header::AUTHORIZATION).unwrap(),
            "Bearer t0ken"
        );
    }

    #[test]
    fn token_with_control_characters_is_rejected() {
        let settings = ConnectionSettings {
            api_token: "bad\ntoken".to_string(),
            ..ConnectionSettings::default()
        };
        assert!(matches!(
            client_request(&settings),
            Err(SyncError::InvalidSettings { field: "apiToken", .. })
        ));
    }
}
