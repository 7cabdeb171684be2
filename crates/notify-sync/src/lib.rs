//! notify-sync: real-time notification delivery and synchronization.
//!
//! The engine keeps a canonical, de-duplicated list of a user's notifications
//! in sync with a backend, preferring a persistent STOMP-over-WebSocket
//! channel and falling back to periodic polling when that channel is
//! unavailable.
//!
//! ## Components
//!
//! - [`TransportConnection`] - Persistent channel with bounded exponential reconnection
//! - [`UpdateScheduler`] - Chooses push or poll and routes inbound messages into deltas
//! - [`Store`] - Canonical notification list: idempotent merge, monotonic reads
//! - [`PresentationAdapter`] - Read-only views, alerts and connection indicators
//! - [`NotificationEngine`] - Wires the above; [`EngineHandle`] is its cloneable front door
//!
//! ## Backend access
//!
//! - [`NotificationApi`] / [`RestClient`] - REST listing and acknowledgements
//! - [`StompConnector`] - Production [`Connector`] for the persistent channel
//!
//! ## Wire formats
//!
//! - [`stomp`] - STOMP 1.2 frame codec
//! - [`message`] - Tagged inbound/outbound JSON envelopes

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod model;
pub mod presenter;
pub mod scheduler;
pub mod stomp;
pub mod store;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use api::{ListQuery, NotificationApi, NotificationPoller, RestClient};
pub use config::{
    Destinations, RealtimeConfig, ReconnectConfig, SchedulerConfig, SchedulerConfigUpdate,
    SyncConfig,
};
pub use engine::{EngineHandle, NotificationEngine};
pub use error::{Result, SyncError};
pub use message::{InboundMessage, OutboundMessage};
pub use model::{Audience, Category, Notification, NotificationId, Page, Priority, RelatedEntity};
pub use presenter::{
    Alert, AlertLevel, ConnectionIndicator, NotificationFilter, PresentationAdapter,
    PresentationEvent,
};
pub use scheduler::{PollSource, SchedulerMode, UpdateScheduler};
pub use store::{Delta, ListenerId, Snapshot, Store, StoreChange};
pub use transport::{
    Channel, ConnectionState, ConnectionStatus, Connector, Credentials, Delivery, Endpoint,
    ReconnectPolicy, StompChannel, StompConnector, TransportConnection, install_rustls_provider,
};
