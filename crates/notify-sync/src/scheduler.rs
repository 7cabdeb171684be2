//! Push/poll delivery scheduling.
//!
//! The scheduler decides whether updates arrive through the persistent
//! channel (`Push`) or by periodic fetches (`Poll`). Both paths produce the
//! same [`Delta`] values on one outbound channel, so the store cannot tell
//! them apart.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Destinations, SchedulerConfig, SchedulerConfigUpdate};
use crate::error::Result;
use crate::message::InboundMessage;
use crate::model::{Audience, Notification};
use crate::store::Delta;
use crate::transport::{ConnectionStatus, Delivery, TransportConnection};

/// Request/response source polled while the persistent channel is not used.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    /// Cheap freshness check.
    async fn unread_count(&self) -> Result<u32>;

    /// Current first page of items.
    async fn fetch_page(&self) -> Result<Vec<Notification>>;
}

/// Active delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulerMode {
    Push,
    Poll,
    #[default]
    Idle,
}

impl fmt::Display for SchedulerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Push => "push",
            Self::Poll => "poll",
            Self::Idle => "idle",
        })
    }
}

#[derive(Default)]
struct State {
    config: Option<SchedulerConfig>,
    enabled: bool,
    mode: SchedulerMode,
    /// `Poll` was entered because push retries ran out.
    fallback: bool,
    /// Cancels the running poll loop.
    poll: Option<CancellationToken>,
    poll_interval: Option<Duration>,
}

struct Inner {
    transport: TransportConnection,
    source: Arc<dyn PollSource>,
    full_refresh_every: u32,
    delta_tx: mpsc::UnboundedSender<Delta>,
    state: Mutex<State>,
    mode_tx: watch::Sender<SchedulerMode>,
    shutdown: CancellationToken,
}

/// Chooses and drives the delivery mode.
#[derive(Clone)]
pub struct UpdateScheduler {
    inner: Arc<Inner>,
}

impl UpdateScheduler {
    /// Create a scheduler feeding `delta_tx`.
    ///
    /// Must be called inside a tokio runtime: inbound routing and status
    /// watching run as background tasks.
    pub fn new(
        transport: TransportConnection,
        destinations: Destinations,
        source: Arc<dyn PollSource>,
        full_refresh_every: u32,
        delta_tx: mpsc::UnboundedSender<Delta>,
    ) -> Self {
        let (mode_tx, _) = watch::channel(SchedulerMode::Idle);
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            transport: transport.clone(),
            source: Arc::clone(&source),
            full_refresh_every,
            delta_tx: delta_tx.clone(),
            state: Mutex::new(State::default()),
            mode_tx,
            shutdown: shutdown.clone(),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        transport.on_message(inbound_tx);
        tokio::spawn(route_inbound(
            inbound_rx,
            destinations,
            source,
            delta_tx,
            shutdown.child_token(),
        ));
        tokio::spawn(watch_transport(
            Arc::downgrade(&inner),
            transport.watch_status(),
            shutdown.child_token(),
        ));

        Self { inner }
    }

    pub fn mode(&self) -> SchedulerMode {
        self.inner.state.lock().mode
    }

    /// Whether the current `Poll` mode is an automatic fallback.
    pub fn is_fallback(&self) -> bool {
        self.inner.state.lock().fallback
    }

    pub fn watch_mode(&self) -> watch::Receiver<SchedulerMode> {
        self.inner.mode_tx.subscribe()
    }

    pub fn config(&self) -> Option<SchedulerConfig> {
        self.inner.state.lock().config.clone()
    }

    pub fn transport(&self) -> &TransportConnection {
        &self.inner.transport
    }

    /// Start delivering with `config`. Re-enabling applies the new config.
    ///
    /// Ignored after [`shutdown`](Self::shutdown) or with a zero poll interval.
    pub fn enable(&self, config: SchedulerConfig) {
        let mut state = self.inner.state.lock();
        if self.inner.shutdown.is_cancelled() {
            debug!("enable ignored, scheduler is shut down");
            return;
        }
        if config.poll_interval.is_zero() {
            warn!("enable ignored: poll interval must be non-zero");
            return;
        }
        state.enabled = true;
        self.inner.transition(&mut state, config);
    }

    /// Stop every delivery path.
    pub fn disable(&self) {
        let mut state = self.inner.state.lock();
        self.inner.stop_all(&mut state);
    }

    /// Apply a partial configuration change as one transition.
    ///
    /// While disabled the change is only recorded.
    pub fn update_config(&self, update: SchedulerConfigUpdate) {
        let mut state = self.inner.state.lock();
        if self.inner.shutdown.is_cancelled() {
            debug!("update_config ignored, scheduler is shut down");
            return;
        }
        let merged = match &state.config {
            Some(current) => current.merged(update),
            None => match update.endpoint.clone() {
                Some(endpoint) => SchedulerConfig {
                    use_push: update.use_push.unwrap_or(true),
                    poll_interval: update.poll_interval.unwrap_or(Duration::from_secs(30)),
                    endpoint,
                },
                None => {
                    warn!("update_config ignored: no endpoint configured yet");
                    return;
                }
            },
        };
        if merged.poll_interval.is_zero() {
            warn!("update_config ignored: poll interval must be non-zero");
            return;
        }
        if state.enabled {
            self.inner.transition(&mut state, merged);
        } else {
            state.config = Some(merged);
        }
    }

    /// Explicit reconnect of the persistent channel.
    ///
    /// Only meaningful with push configured. From fallback `Poll` the poll
    /// loop stops and the scheduler returns to `Push`; if the new attempts
    /// run out as well it falls back again.
    pub fn reconnect(&self) {
        let mut state = self.inner.state.lock();
        if self.inner.shutdown.is_cancelled() {
            debug!("Manual reconnect ignored, scheduler is shut down");
            return;
        }
        let endpoint = match &state.config {
            Some(config) if state.enabled && config.use_push => config.endpoint.clone(),
            _ => {
                debug!("Manual reconnect ignored, push delivery not configured");
                return;
            }
        };
        info!("Manual reconnect requested");
        if state.mode == SchedulerMode::Poll {
            self.inner.stop_poll(&mut state);
            self.inner.set_mode(&mut state, SchedulerMode::Push, false);
        }
        self.inner.transport.connect(endpoint);
    }

    /// Fetch the unread count once and forward it as a hint.
    pub fn request_count(&self) {
        spawn_count_fetch(Arc::clone(&self.inner.source), self.inner.delta_tx.clone());
    }

    /// Stop background tasks. The scheduler is unusable afterwards.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        self.inner.shutdown.cancel();
        self.inner.stop_all(&mut state);
    }
}

impl Inner {
    fn stop_all(&self, state: &mut State) {
        state.enabled = false;
        self.stop_poll(state);
        self.transport.disconnect();
        self.set_mode(state, SchedulerMode::Idle, false);
    }

    fn transition(&self, state: &mut State, config: SchedulerConfig) {
        let endpoint_changed = state
            .config
            .as_ref()
            .is_some_and(|current| current.endpoint != config.endpoint);

        if config.use_push {
            self.stop_poll(state);
            if endpoint_changed {
                self.transport.disconnect();
            }
            // Explicit configuration retries push even after exhaustion.
            self.transport.connect(config.endpoint.clone());
            state.config = Some(config);
            self.set_mode(state, SchedulerMode::Push, false);
        } else {
            self.transport.disconnect();
            if state.poll_interval != Some(config.poll_interval) {
                self.stop_poll(state);
            }
            if state.poll.is_none() {
                self.start_poll(state, config.poll_interval);
            }
            state.config = Some(config);
            self.set_mode(state, SchedulerMode::Poll, false);
        }
    }

    fn set_mode(&self, state: &mut State, mode: SchedulerMode, fallback: bool) {
        let previous = state.mode;
        state.mode = mode;
        state.fallback = fallback;
        if previous != mode {
            info!(from = %previous, mode = %mode, fallback, "Delivery mode changed");
        }
        self.mode_tx.send_replace(mode);
    }

    fn start_poll(&self, state: &mut State, interval: Duration) {
        let cancel = self.shutdown.child_token();
        state.poll = Some(cancel.clone());
        state.poll_interval = Some(interval);
        tokio::spawn(poll_loop(
            Arc::clone(&self.source),
            self.delta_tx.clone(),
            interval,
            self.full_refresh_every,
            cancel,
        ));
    }

    fn stop_poll(&self, state: &mut State) {
        if let Some(cancel) = state.poll.take() {
            cancel.cancel();
            debug!("Poll loop stopped");
        }
        state.poll_interval = None;
    }

    /// React to a transport transition. The status is re-read under the state
    /// lock so a reconnect issued meanwhile is not mistaken for exhaustion.
    fn on_status(&self) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }
        let status = self.transport.status();
        match state.mode {
            SchedulerMode::Push if status.is_terminal() => {
                let Some(interval) = state.config.as_ref().map(|c| c.poll_interval) else {
                    return;
                };
                warn!(
                    failures = status.failures,
                    "Push delivery unavailable, falling back to polling"
                );
                self.start_poll(&mut state, interval);
                self.set_mode(&mut state, SchedulerMode::Poll, true);
            }
            SchedulerMode::Poll if state.fallback && status.is_connected() => {
                info!("Persistent channel restored, resuming push delivery");
                self.stop_poll(&mut state);
                self.set_mode(&mut state, SchedulerMode::Push, false);
            }
            _ => {}
        }
    }
}

async fn watch_transport(
    inner: Weak<Inner>,
    mut status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        status_rx.mark_unchanged();
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_status();
    }
    trace!("Transport watcher stopped");
}

/// Outcome of routing one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Delta(Delta),
    /// The server asked for a fresh unread count.
    CountRequest,
    Ignored,
}

/// Translate an inbound message into store input.
pub fn route(delivery: Delivery, destinations: &Destinations) -> Routed {
    let from_broadcast = destinations.is_broadcast(&delivery.destination);
    match delivery.message {
        InboundMessage::NewNotification { mut notification, .. } => {
            if from_broadcast {
                notification.audience = Audience::Broadcast;
            }
            Routed::Delta(Delta::Single(notification))
        }
        InboundMessage::BroadcastNotification { mut notification, .. } => {
            notification.audience = Audience::Broadcast;
            Routed::Delta(Delta::Single(notification))
        }
        InboundMessage::UnreadCountUpdate { unread_count, .. } => {
            Routed::Delta(Delta::CountOnly(unread_count))
        }
        InboundMessage::UnreadCountUpdateRequest { .. } => Routed::CountRequest,
        InboundMessage::MarkReadAck {
            notification_id, ..
        } => {
            debug!(id = ?notification_id, "Mark-read acknowledged");
            Routed::Ignored
        }
        InboundMessage::ConnectAck { message, .. } => {
            debug!(message = message.as_deref().unwrap_or(""), "Channel connect acknowledged");
            Routed::Ignored
        }
        InboundMessage::ConnectError { message, .. } => {
            warn!(message = message.as_deref().unwrap_or(""), "Server rejected channel registration");
            Routed::Ignored
        }
    }
}

async fn route_inbound(
    mut inbound_rx: mpsc::UnboundedReceiver<Delivery>,
    destinations: Destinations,
    source: Arc<dyn PollSource>,
    delta_tx: mpsc::UnboundedSender<Delta>,
    cancel: CancellationToken,
) {
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delivery = inbound_rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        match route(delivery, &destinations) {
            Routed::Delta(delta) => {
                if delta_tx.send(delta).is_err() {
                    break;
                }
            }
            Routed::CountRequest => spawn_count_fetch(Arc::clone(&source), delta_tx.clone()),
            Routed::Ignored => {}
        }
    }
    trace!("Inbound router stopped");
}

fn spawn_count_fetch(source: Arc<dyn PollSource>, delta_tx: mpsc::UnboundedSender<Delta>) {
    tokio::spawn(async move {
        match source.unread_count().await {
            Ok(count) => {
                let _ = delta_tx.send(Delta::CountOnly(count));
            }
            Err(e) => warn!(error = %e, "Failed to fetch unread count"),
        }
    });
}

/// Periodic fetch loop. The first tick fires immediately.
async fn poll_loop(
    source: Arc<dyn PollSource>,
    delta_tx: mpsc::UnboundedSender<Delta>,
    interval: Duration,
    full_refresh_every: u32,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_count: Option<u32> = None;
    let mut ticks_since_list: u32 = 0;
    debug!(interval_ms = interval.as_millis() as u64, "Poll loop started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let delta = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            delta = poll_once(source.as_ref(), &mut last_count, &mut ticks_since_list, full_refresh_every) => delta,
        };

        // A tick that completes after teardown must not deliver.
        if cancel.is_cancelled() {
            break;
        }
        if let Some(delta) = delta
            && delta_tx.send(delta).is_err()
        {
            break;
        }
    }
    trace!("Poll loop exited");
}

async fn poll_once(
    source: &dyn PollSource,
    last_count: &mut Option<u32>,
    ticks_since_list: &mut u32,
    full_refresh_every: u32,
) -> Option<Delta> {
    let count = match source.unread_count().await {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Poll tick failed to fetch unread count");
            return None;
        }
    };

    let changed = *last_count != Some(count);
    let due = *ticks_since_list >= full_refresh_every;
    if !changed && !due {
        *ticks_since_list += 1;
        trace!(count, "Poll tick: count unchanged");
        return Some(Delta::CountOnly(count));
    }

    match source.fetch_page().await {
        Ok(items) => {
            *last_count = Some(count);
            *ticks_since_list = 0;
            debug!(count, items = items.len(), "Poll tick: fetched list");
            Some(Delta::Batch(items))
        }
        Err(e) => {
            warn!(error = %e, "Poll tick failed to fetch notifications");
            Some(Delta::CountOnly(count))
        }
    }
}
