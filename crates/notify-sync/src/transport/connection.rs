//! Connection state machine with bounded reconnection.
//!
//! A connection run is a single spawned task that connects, subscribes,
//! pumps messages and reconnects with backoff. Every run carries an epoch;
//! `connect()` and `disconnect()` bump it, and a run whose epoch is stale may
//! no longer touch the shared status, so a timer that fires after teardown
//! has no effect.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::backoff::ReconnectPolicy;
use super::{Channel, ConnectionState, ConnectionStatus, Connector, Delivery, Endpoint};
use crate::config::Destinations;
use crate::error::Result;
use crate::message::OutboundMessage;
use crate::model::NotificationId;

/// Upper bound on the graceful close performed after `disconnect()`.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval used for the idle heart-beat timer when the channel has none.
const IDLE_TICK: Duration = Duration::from_secs(3600);

#[derive(Debug)]
struct Publish {
    destination: String,
    payload: String,
}

/// Why a connected session ended.
enum SessionEnd {
    /// Explicit disconnect or superseded run.
    Stopped,
    /// Peer closed or I/O failed; subject to reconnection.
    Lost(String),
}

struct RunHandle {
    cancel: CancellationToken,
    publish_tx: mpsc::UnboundedSender<Publish>,
}

#[derive(Default)]
struct Control {
    epoch: u64,
    run: Option<RunHandle>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    destinations: Destinations,
    status_tx: watch::Sender<ConnectionStatus>,
    control: Mutex<Control>,
    sink: Mutex<Option<mpsc::UnboundedSender<Delivery>>>,
}

/// Owner of the single persistent channel to the backend.
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

impl TransportConnection {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        destinations: Destinations,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                destinations,
                status_tx,
                control: Mutex::new(Control::default()),
                sink: Mutex::new(None),
            }),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Observe status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Register the single consumer of inbound messages, replacing any
    /// previous one. Messages are delivered in arrival order.
    pub fn on_message(&self, sink: mpsc::UnboundedSender<Delivery>) {
        *self.inner.sink.lock() = Some(sink);
    }

    /// Start connecting. No-op while already connecting or connected.
    ///
    /// Called while a retry is pending or after retries were exhausted, it
    /// starts a fresh run with the failure counter reset.
    pub fn connect(&self, endpoint: Endpoint) {
        let mut control = self.inner.control.lock();
        let state = self.status().state;
        if control.run.is_some()
            && matches!(state, ConnectionState::Connecting | ConnectionState::Connected)
        {
            debug!(%state, "connect ignored, channel already active");
            return;
        }

        if let Some(previous) = control.run.take() {
            previous.cancel.cancel();
        }
        control.epoch += 1;
        let epoch = control.epoch;

        self.inner.status_tx.send_replace(ConnectionStatus {
            state: ConnectionState::Connecting,
            ..ConnectionStatus::default()
        });

        let cancel = CancellationToken::new();
        let (publish_tx, publish_rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        let run_cancel = cancel.clone();
        info!(url = %endpoint.url, epoch, "Connecting to notification channel");
        tokio::spawn(async move {
            inner.run(epoch, endpoint, run_cancel, publish_rx).await;
        });

        control.run = Some(RunHandle { cancel, publish_tx });
    }

    /// Tear the channel down and suppress automatic reconnection.
    pub fn disconnect(&self) {
        let mut control = self.inner.control.lock();
        control.epoch += 1;
        if let Some(run) = control.run.take() {
            run.cancel.cancel();
            info!("Notification channel disconnected");
        }
        self.inner
            .status_tx
            .send_replace(ConnectionStatus::default());
    }

    /// Fire-and-forget send. Dropped with a warning when not connected.
    pub fn publish(&self, destination: &str, payload: &serde_json::Value) {
        if !self.status().is_connected() {
            warn!(destination, "Channel not connected, dropping outbound message");
            return;
        }
        let control = self.inner.control.lock();
        let Some(run) = control.run.as_ref() else {
            warn!(destination, "No active channel, dropping outbound message");
            return;
        };
        let publish = Publish {
            destination: destination.to_string(),
            payload: payload.to_string(),
        };
        if run.publish_tx.send(publish).is_err() {
            warn!(destination, "Channel task gone, dropping outbound message");
        }
    }

    /// Publish one of the application messages.
    pub fn publish_message(&self, message: &OutboundMessage) {
        let destination = message.destination(&self.inner.destinations);
        self.publish(&destination, &message.payload());
    }

    pub fn mark_read(&self, id: NotificationId) {
        self.publish_message(&OutboundMessage::MarkRead { id });
    }

    pub fn mark_batch_read(&self, ids: Vec<NotificationId>) {
        self.publish_message(&OutboundMessage::MarkBatchRead { ids });
    }

    pub fn mark_all_read(&self) {
        self.publish_message(&OutboundMessage::MarkAllRead);
    }

    /// Ask the server to push the current unread count.
    pub fn request_unread_count(&self) {
        self.publish_message(&OutboundMessage::GetUnreadCount);
    }
}

impl Inner {
    /// Apply a status change on behalf of run `epoch`.
    ///
    /// Returns false when the run has been superseded, in which case nothing
    /// is changed and the caller must stop.
    fn set_status(&self, epoch: u64, status: ConnectionStatus) -> bool {
        let control = self.control.lock();
        if control.epoch != epoch {
            return false;
        }
        self.status_tx.send_replace(status);
        true
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.control.lock().epoch == epoch
    }

    async fn run(
        self: Arc<Self>,
        epoch: u64,
        endpoint: Endpoint,
        cancel: CancellationToken,
        mut publish_rx: mpsc::UnboundedReceiver<Publish>,
    ) {
        let mut failures: u32 = 0;

        loop {
            let connecting = ConnectionStatus {
                state: ConnectionState::Connecting,
                failures,
                ..ConnectionStatus::default()
            };
            if !self.set_status(epoch, connecting) {
                break;
            }

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = self.open(&endpoint) => result,
            };

            match opened {
                Ok(mut channel) => {
                    failures = 0;
                    let connected = ConnectionStatus {
                        state: ConnectionState::Connected,
                        ..ConnectionStatus::default()
                    };
                    if !self.set_status(epoch, connected) {
                        let _ = channel.close().await;
                        break;
                    }
                    info!(url = %endpoint.url, "Notification channel connected");

                    // Publishes queued against a previous session are stale.
                    let mut stale = 0usize;
                    while publish_rx.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        debug!(stale, "Discarded outbound messages from previous session");
                    }

                    match self
                        .drive(epoch, &endpoint, channel.as_mut(), &cancel, &mut publish_rx)
                        .await
                    {
                        SessionEnd::Stopped => {
                            self.close_gracefully(&endpoint, channel.as_mut()).await;
                            break;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(%reason, "Notification channel lost");
                            let _ = channel.close().await;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = failures + 1, "Failed to connect notification channel");
                }
            }

            failures += 1;
            match self.policy.next_retry(failures) {
                Some(delay) => {
                    let retrying = ConnectionStatus {
                        state: ConnectionState::Error,
                        failures,
                        retry_in: Some(delay),
                        retry_exhausted: false,
                    };
                    if !self.set_status(epoch, retrying) {
                        break;
                    }
                    info!(
                        attempt = failures,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Scheduling reconnect"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    let exhausted = ConnectionStatus {
                        state: ConnectionState::Error,
                        failures,
                        retry_in: None,
                        retry_exhausted: true,
                    };
                    if self.set_status(epoch, exhausted) {
                        error!(
                            failures,
                            "Max reconnect attempts reached, waiting for manual reconnect"
                        );
                    }
                    break;
                }
            }
        }

        debug!(epoch, "Notification channel task stopped");
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>> {
        let mut channel = self.connector.open(endpoint).await?;
        for destination in self.destinations.subscriptions() {
            channel.subscribe(destination).await?;
        }
        let hello = OutboundMessage::Connect {
            user_id: endpoint.credentials.user_id.clone(),
            timestamp: Utc::now(),
        };
        channel
            .send(
                &hello.destination(&self.destinations),
                &hello.payload().to_string(),
            )
            .await?;
        Ok(channel)
    }

    async fn drive(
        &self,
        epoch: u64,
        endpoint: &Endpoint,
        channel: &mut dyn Channel,
        cancel: &CancellationToken,
        publish_rx: &mut mpsc::UnboundedReceiver<Publish>,
    ) -> SessionEnd {
        let heartbeat = channel.heartbeat_interval();
        let mut heartbeat_timer = tokio::time::interval(heartbeat.unwrap_or(IDLE_TICK));
        heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat_timer.reset();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return SessionEnd::Stopped,

                _ = heartbeat_timer.tick(), if heartbeat.is_some() => {
                    if let Err(e) = channel.heartbeat().await {
                        return SessionEnd::Lost(format!("heart-beat failed: {e}"));
                    }
                    trace!(url = %endpoint.url, "Sent heart-beat");
                }

                Some(publish) = publish_rx.recv() => {
                    if let Err(e) = channel.send(&publish.destination, &publish.payload).await {
                        return SessionEnd::Lost(format!("send to {} failed: {e}", publish.destination));
                    }
                }

                next = channel.next_delivery() => match next {
                    Some(Ok(delivery)) => {
                        if !self.is_current(epoch) {
                            return SessionEnd::Stopped;
                        }
                        self.dispatch(delivery);
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("closed by peer".to_string()),
                }
            }
        }
    }

    fn dispatch(&self, delivery: Delivery) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(tx) => {
                trace!(kind = delivery.message.kind(), destination = %delivery.destination, "Inbound message");
                if tx.send(delivery).is_err() {
                    debug!("Message consumer dropped, discarding inbound message");
                }
            }
            None => debug!("No message consumer registered, discarding inbound message"),
        }
    }

    async fn close_gracefully(&self, endpoint: &Endpoint, channel: &mut dyn Channel) {
        let bye = OutboundMessage::Disconnect {
            user_id: endpoint.credentials.user_id.clone(),
        };
        let destination = bye.destination(&self.destinations);
        let payload = bye.payload().to_string();
        let close = async {
            let _ = channel.send(&destination, &payload).await;
            let _ = channel.unsubscribe_all().await;
            channel.close().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, close).await {
            Ok(Ok(())) => debug!("Notification channel closed"),
            Ok(Err(e)) => debug!(error = %e, "Error while closing notification channel"),
            Err(_) => debug!("Timed out closing notification channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, wait_until};
    use crate::transport::Credentials;
    use serde_json::json;

    fn endpoint() -> Endpoint {
        Endpoint {
            url: "ws://test/ws".to_string(),
            credentials: Credentials {
                user_id: "7".to_string(),
                token: None,
            },
        }
    }

    fn connection(connector: &ScriptedConnector, max_attempts: u32) -> TransportConnection {
        TransportConnection::new(
            Arc::new(connector.clone()),
            ReconnectPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(30)),
            Destinations::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_subscribes_and_announces() {
        let connector = ScriptedConnector::new();
        let remote = connector.push_success();
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;

        let subs = remote.subscriptions();
        assert_eq!(subs.len(), 4);
        assert!(subs.contains(&"/topic/notifications".to_string()));
        let sent = remote.sent();
        assert_eq!(sent[0].0, "/app/notification/connect");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let connector = ScriptedConnector::new();
        connector.push_success();
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;
        conn.connect(endpoint());
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_and_exhaustion() {
        let connector = ScriptedConnector::new();
        for _ in 0..5 {
            connector.push_failure();
        }
        let conn = connection(&connector, 4);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_terminal()).await;

        let times = connector.attempt_times();
        assert_eq!(times.len(), 4);
        let gaps: Vec<u64> = times
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4]);

        // No further automatic retries.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.attempts(), 4);
        assert_eq!(conn.status().failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_after_disconnect() {
        let connector = ScriptedConnector::new();
        connector.push_failure();
        connector.push_failure();
        let conn = connection(&connector, 10);

        conn.connect(endpoint());
        wait_until(|| conn.status().state == ConnectionState::Error).await;
        conn.disconnect();
        assert_eq!(conn.status().state, ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(conn.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_reconnects_with_reset_counter() {
        let connector = ScriptedConnector::new();
        let first = connector.push_success();
        connector.push_success();
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;

        first.close();
        wait_until(|| conn.status().state == ConnectionState::Error).await;
        assert_eq!(conn.status().failures, 1);
        assert_eq!(conn.status().retry_in, Some(Duration::from_secs(1)));

        wait_until(|| conn.status().is_connected()).await;
        assert_eq!(conn.status().failures, 0);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_forwarded_in_order() {
        let connector = ScriptedConnector::new();
        let remote = connector.push_success();
        let conn = connection(&connector, 3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.on_message(tx);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;

        for count in 1..=3 {
            remote.deliver_json(
                "/user/queue/notification-count",
                json!({"type": "UNREAD_COUNT_UPDATE", "unreadCount": count}),
            );
        }

        for expected in 1..=3u32 {
            let delivery = rx.recv().await.unwrap();
            match delivery.message {
                crate::message::InboundMessage::UnreadCountUpdate { unread_count, .. } => {
                    assert_eq!(unread_count, expected)
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_only_when_connected() {
        let connector = ScriptedConnector::new();
        connector.push_failure();
        let remote = connector.push_success();
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        wait_until(|| conn.status().state == ConnectionState::Error).await;
        // Dropped: not connected.
        conn.publish_message(&OutboundMessage::MarkAllRead);

        wait_until(|| conn.status().is_connected()).await;
        conn.publish_message(&OutboundMessage::MarkRead { id: 9.into() });
        wait_until(|| remote.sent().len() >= 2).await;

        let sent = remote.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].0, "/app/notification/markRead");
        assert_eq!(sent[1].1, r#"{"notificationId":9}"#);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_closes_gracefully() {
        let connector = ScriptedConnector::new();
        let remote = connector.push_success();
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;
        conn.disconnect();

        wait_until(|| remote.is_closed()).await;
        let sent = remote.sent();
        assert_eq!(sent.last().map(|s| s.0.as_str()), Some("/app/notification/disconnect"));
        assert!(remote.subscriptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_at_negotiated_interval() {
        let connector = ScriptedConnector::new();
        let remote = connector.push_success_with_heartbeat(Duration::from_secs(10));
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(remote.heartbeats(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_helpers() {
        let connector = ScriptedConnector::new();
        let remote = connector.push_success();
        let conn = connection(&connector, 3);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;
        conn.mark_batch_read(vec![1.into(), 2.into()]);
        conn.mark_all_read();
        conn.request_unread_count();
        wait_until(|| remote.sent().len() >= 4).await;

        let destinations: Vec<String> = remote.sent().into_iter().skip(1).map(|(d, _)| d).collect();
        assert_eq!(
            destinations,
            vec![
                "/app/notification/markBatchRead",
                "/app/notification/markAllRead",
                "/app/notification/getUnreadCount",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_after_exhaustion_resets_counter() {
        let connector = ScriptedConnector::new();
        connector.push_failure();
        connector.push_failure();
        connector.push_success();
        let conn = connection(&connector, 2);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_terminal()).await;
        assert_eq!(conn.status().failures, 2);

        conn.connect(endpoint());
        wait_until(|| conn.status().is_connected()).await;
        assert_eq!(conn.status().failures, 0);
        assert_eq!(connector.attempts(), 3);
    }
}
