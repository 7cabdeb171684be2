//! STOMP over WebSocket channel.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use super::{Channel, Connector, Delivery, Endpoint};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::message::InboundMessage;
use crate::stomp::{self, Frame, Incoming, StompCommand};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Install the process-wide rustls crypto provider.
///
/// Both `reqwest` and `tokio-tungstenite` are built without a bundled
/// provider, so this must run before the first TLS handshake.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Opens STOMP sessions over WebSocket.
#[derive(Debug, Clone)]
pub struct StompConnector {
    /// Outgoing heart-beat interval offered in CONNECT, in milliseconds.
    heartbeat_ms: u64,
    /// Bound on WebSocket upgrade plus STOMP handshake.
    handshake_timeout: Duration,
}

impl Default for StompConnector {
    fn default() -> Self {
        Self {
            heartbeat_ms: 10_000,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl StompConnector {
    pub fn new(heartbeat_ms: u64, handshake_timeout: Duration) -> Self {
        Self {
            heartbeat_ms,
            handshake_timeout,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.heartbeat_ms, config.request_timeout())
    }

    async fn handshake(&self, endpoint: &Endpoint) -> Result<StompChannel> {
        install_rustls_provider();

        let mut request = endpoint.url.as_str().into_client_request()?;
        if let Some(token) = &endpoint.credentials.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| SyncError::transport(format!("invalid token header: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }
        let host = request.uri().host().unwrap_or("localhost").to_string();

        let (mut ws, _) = connect_async(request).await?;
        debug!(url = %endpoint.url, "WebSocket established, starting STOMP handshake");

        let heartbeat = format!("{0},{0}", self.heartbeat_ms);
        let mut connect = Frame::new(StompCommand::Connect)
            .header("accept-version", "1.2")
            .header("host", host)
            .header("heart-beat", heartbeat)
            .header("userId", endpoint.credentials.user_id.clone());
        if let Some(token) = &endpoint.credentials.token {
            connect = connect.header("Authorization", format!("Bearer {token}"));
        }
        ws.send(Message::text(connect.encode())).await?;

        let mut pending = VecDeque::new();
        loop {
            let Some(message) = ws.next().await else {
                return Err(SyncError::transport("closed during STOMP handshake"));
            };
            let text = match message? {
                Message::Text(text) => text.as_str().to_owned(),
                Message::Binary(data) => String::from_utf8(data.to_vec())
                    .map_err(|e| SyncError::protocol(format!("non UTF-8 frame: {e}")))?,
                Message::Close(frame) => {
                    return Err(SyncError::transport(format!(
                        "closed during STOMP handshake: {frame:?}"
                    )));
                }
                _ => continue,
            };

            for item in stomp::decode_all(&text)? {
                let Incoming::Frame(frame) = item else {
                    continue;
                };
                match frame.command {
                    StompCommand::Connected => {
                        let heartbeat =
                            stomp::negotiate_heartbeat((self.heartbeat_ms, self.heartbeat_ms), frame.get("heart-beat"));
                        debug!(
                            version = frame.get("version").unwrap_or("?"),
                            heartbeat_ms = heartbeat.map(|d| d.as_millis() as u64),
                            "STOMP session established"
                        );
                        return Ok(StompChannel {
                            ws,
                            subscriptions: Vec::new(),
                            next_subscription: 0,
                            pending,
                            heartbeat,
                        });
                    }
                    StompCommand::Error => return Err(error_frame(&frame)),
                    _ => {
                        if let Some(delivery) = to_delivery(&frame) {
                            pending.push_back(delivery);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Connector for StompConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>> {
        match tokio::time::timeout(self.handshake_timeout, self.handshake(endpoint)).await {
            Ok(Ok(channel)) => Ok(Box::new(channel)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::transport(format!(
                "STOMP handshake timed out after {:?}",
                self.handshake_timeout
            ))),
        }
    }
}

/// An established STOMP session.
pub struct StompChannel {
    ws: WsStream,
    /// `(subscription id, destination)` pairs.
    subscriptions: Vec<(String, String)>,
    next_subscription: u32,
    /// Decoded deliveries not yet handed out; a text message may hold several frames.
    pending: VecDeque<Delivery>,
    heartbeat: Option<Duration>,
}

impl StompChannel {
    async fn send_frame(&mut self, frame: Frame) -> Result<()> {
        self.ws.send(Message::text(frame.encode())).await?;
        Ok(())
    }

    fn ingest(&mut self, text: &str) -> Result<()> {
        for item in stomp::decode_all(text)? {
            match item {
                Incoming::Heartbeat => trace!("Received heart-beat"),
                Incoming::Frame(frame) => match frame.command {
                    StompCommand::Message => {
                        if let Some(delivery) = to_delivery(&frame) {
                            self.pending.push_back(delivery);
                        }
                    }
                    StompCommand::Error => return Err(error_frame(&frame)),
                    StompCommand::Receipt => {
                        trace!(receipt = frame.get("receipt-id").unwrap_or(""), "Receipt")
                    }
                    other => debug!(command = %other, "Ignoring unexpected frame"),
                },
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for StompChannel {
    async fn subscribe(&mut self, destination: &str) -> Result<()> {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        let frame = Frame::new(StompCommand::Subscribe)
            .header("id", id.clone())
            .header("destination", destination)
            .header("ack", "auto");
        self.send_frame(frame).await?;
        debug!(%id, destination, "Subscribed");
        self.subscriptions.push((id, destination.to_string()));
        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<()> {
        let subscriptions = std::mem::take(&mut self.subscriptions);
        for (id, destination) in subscriptions {
            self.send_frame(Frame::new(StompCommand::Unsubscribe).header("id", id))
                .await?;
            trace!(destination, "Unsubscribed");
        }
        Ok(())
    }

    async fn send(&mut self, destination: &str, payload: &str) -> Result<()> {
        let frame = Frame::new(StompCommand::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .with_body(payload);
        self.send_frame(frame).await
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            if let Some(delivery) = self.pending.pop_front() {
                return Some(Ok(delivery));
            }
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            let ingested = match message {
                Message::Text(text) => self.ingest(text.as_str()),
                Message::Binary(data) => match std::str::from_utf8(&data) {
                    Ok(text) => self.ingest(text),
                    Err(e) => Err(SyncError::protocol(format!("non UTF-8 frame: {e}"))),
                },
                Message::Close(frame) => {
                    debug!(?frame, "Server closed the WebSocket");
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(()),
            };
            if let Err(e) = ingested {
                return Some(Err(e));
            }
        }
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat
    }

    async fn heartbeat(&mut self) -> Result<()> {
        self.ws.send(Message::text("\n")).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.send_frame(Frame::new(StompCommand::Disconnect)).await;
        self.ws.close(None).await?;
        Ok(())
    }
}

fn error_frame(frame: &Frame) -> SyncError {
    let message = frame.get("message").unwrap_or("");
    if frame.body.is_empty() {
        SyncError::protocol(format!("STOMP ERROR: {message}"))
    } else {
        SyncError::protocol(format!("STOMP ERROR: {message}: {}", frame.body.trim()))
    }
}

/// Decode a MESSAGE frame. Payloads without a known `type` are skipped.
fn to_delivery(frame: &Frame) -> Option<Delivery> {
    if frame.command != StompCommand::Message {
        return None;
    }
    let destination = frame.get("destination").unwrap_or_default().to_string();
    match InboundMessage::decode(&frame.body) {
        Ok(message) => Some(Delivery {
            destination,
            message,
        }),
        Err(e) => {
            if frame.body.contains("\"type\"") {
                warn!(%destination, error = %e, "Skipping undecodable message");
            } else {
                debug!(%destination, body = %frame.body, "Skipping untyped response payload");
            }
            None
        }
    }
}
