//! Persistent channel transport.
//!
//! [`TransportConnection`] owns the connection state machine and the
//! reconnection policy; the wire itself sits behind the [`Connector`] /
//! [`Channel`] seam so the state machine can run against any transport.

mod backoff;
mod connection;
mod websocket;

pub use backoff::ReconnectPolicy;
pub use connection::TransportConnection;
pub use websocket::{StompChannel, StompConnector, install_rustls_provider};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::InboundMessage;

/// State of the persistent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        })
    }
}

/// Observable connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect.
    pub failures: u32,
    /// Delay before the next automatic retry, when one is scheduled.
    pub retry_in: Option<Duration>,
    /// Automatic retries are exhausted; only an explicit `connect()` resumes.
    pub retry_exhausted: bool,
}

impl ConnectionStatus {
    /// Terminal error: retries exhausted, waiting for the user.
    pub fn is_terminal(&self) -> bool {
        self.state == ConnectionState::Error && self.retry_exhausted
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// User credentials presented when connecting.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub user_id: String,
    pub token: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub credentials: Credentials,
}

/// One inbound item read from a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Destination the message arrived on.
    pub destination: String,
    pub message: InboundMessage,
}

/// Opens channels to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a channel, completing any protocol handshake.
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>>;
}

/// An established bidirectional channel.
#[async_trait]
pub trait Channel: Send {
    /// Subscribe to a destination.
    async fn subscribe(&mut self, destination: &str) -> Result<()>;

    /// Drop every active subscription.
    async fn unsubscribe_all(&mut self) -> Result<()>;

    /// Send a JSON payload to a destination.
    async fn send(&mut self, destination: &str, payload: &str) -> Result<()>;

    /// Read the next decoded message.
    ///
    /// Returns `None` once the peer closed the channel. Payloads that do not
    /// decode are logged and skipped by the implementation.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    /// Interval at which [`Channel::heartbeat`] must be called, if any.
    fn heartbeat_interval(&self) -> Option<Duration> {
        None
    }

    /// Send a keep-alive.
    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the channel gracefully.
    async fn close(&mut self) -> Result<()>;
}
