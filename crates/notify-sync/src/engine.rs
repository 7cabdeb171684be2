//! Engine wiring.
//!
//! One task owns the [`Store`]. Deltas from the scheduler and commands from
//! [`EngineHandle`]s are processed strictly one at a time, so every mutation
//! and every listener callback sees a consistent snapshot. REST
//! acknowledgements for optimistic mutations run in spawned tasks; a failed
//! acknowledgement triggers a fresh server list applied as a refresh.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ListQuery, NotificationApi, NotificationPoller, RestClient};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::NotificationId;
use crate::presenter::{ConnectionIndicator, PresentationAdapter, PresentationEvent, events_for};
use crate::scheduler::{SchedulerMode, UpdateScheduler};
use crate::store::{Delta, Snapshot, Store};
use crate::transport::{ConnectionStatus, Connector, StompConnector, TransportConnection};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

enum Command {
    Snapshot(oneshot::Sender<Snapshot>),
    MarkRead {
        id: NotificationId,
        reply: oneshot::Sender<bool>,
    },
    MarkBatchRead {
        ids: Vec<NotificationId>,
        reply: oneshot::Sender<Vec<NotificationId>>,
    },
    MarkAllRead {
        reply: oneshot::Sender<Vec<NotificationId>>,
    },
    Delete {
        id: NotificationId,
        reply: oneshot::Sender<bool>,
    },
    DeleteBatch {
        ids: Vec<NotificationId>,
        reply: oneshot::Sender<Vec<NotificationId>>,
    },
    Clear {
        reply: oneshot::Sender<bool>,
    },
    Resync,
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PresentationEvent>,
    scheduler: UpdateScheduler,
}

impl EngineHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| SyncError::EngineClosed)?;
        rx.await.map_err(|_| SyncError::EngineClosed)
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot).await
    }

    /// Mark one notification read. Returns false when it was absent or already read.
    pub async fn mark_read(&self, id: NotificationId) -> Result<bool> {
        self.request(|reply| Command::MarkRead { id, reply }).await
    }

    pub async fn mark_batch_read(&self, ids: Vec<NotificationId>) -> Result<Vec<NotificationId>> {
        self.request(|reply| Command::MarkBatchRead { ids, reply })
            .await
    }

    pub async fn mark_all_read(&self) -> Result<Vec<NotificationId>> {
        self.request(|reply| Command::MarkAllRead { reply }).await
    }

    pub async fn delete(&self, id: NotificationId) -> Result<bool> {
        self.request(|reply| Command::Delete { id, reply }).await
    }

    pub async fn delete_batch(&self, ids: Vec<NotificationId>) -> Result<Vec<NotificationId>> {
        self.request(|reply| Command::DeleteBatch { ids, reply }).await
    }

    pub async fn clear(&self) -> Result<bool> {
        self.request(|reply| Command::Clear { reply }).await
    }

    /// Reload the first page from the server and replace the local list.
    pub async fn resync(&self) -> Result<()> {
        self.commands
            .send(Command::Resync)
            .await
            .map_err(|_| SyncError::EngineClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresentationEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.scheduler.transport().status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.scheduler.transport().watch_status()
    }

    pub fn mode(&self) -> SchedulerMode {
        self.scheduler.mode()
    }

    /// Manual reconnect of the persistent channel.
    pub fn reconnect(&self) {
        self.scheduler.reconnect();
    }

    pub fn scheduler(&self) -> &UpdateScheduler {
        &self.scheduler
    }
}

/// A running notification engine.
pub struct NotificationEngine {
    handle: EngineHandle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl NotificationEngine {
    /// Start with the STOMP connector and the REST client.
    pub fn start(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let connector = Arc::new(StompConnector::from_config(&config));
        let api = Arc::new(RestClient::new(&config)?);
        Self::with_parts(config, connector, api)
    }

    /// Start with explicit transport and API implementations.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_parts(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        api: Arc<dyn NotificationApi>,
    ) -> Result<Self> {
        config.validate()?;
        let page_size = config.realtime.page_size;

        let transport = TransportConnection::new(
            connector,
            config.reconnect.policy(),
            config.destinations.clone(),
        );
        let (delta_tx, delta_rx) = mpsc::unbounded_channel();
        let scheduler = UpdateScheduler::new(
            transport.clone(),
            config.destinations.clone(),
            Arc::new(NotificationPoller::new(Arc::clone(&api), page_size)),
            config.realtime.full_refresh_every,
            delta_tx.clone(),
        );

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        let mut store = Store::new();
        let listener_events = events_tx.clone();
        store.subscribe(move |change, snapshot| {
            for event in events_for(change, snapshot) {
                // No receivers is fine.
                let _ = listener_events.send(event);
            }
        });

        let cancel = CancellationToken::new();

        // Go live only after the initial load is queued, so a pushed item can
        // never be wiped by the initial refresh.
        let startup_api = Arc::clone(&api);
        let startup_tx = delta_tx.clone();
        let startup_scheduler = scheduler.clone();
        let startup_cancel = cancel.clone();
        let realtime = config.realtime.enabled.then(|| config.scheduler_config());
        tokio::spawn(async move {
            resync(startup_api.as_ref(), page_size, &startup_tx).await;
            if startup_cancel.is_cancelled() {
                return;
            }
            match realtime {
                Some(scheduler_config) => startup_scheduler.enable(scheduler_config),
                None => info!("Realtime delivery disabled, showing the initial load only"),
            }
        });

        let worker = EngineTask {
            store,
            api,
            page_size,
            delta_tx,
            events: events_tx.clone(),
            indicator: ConnectionIndicator::from(transport.status()),
        };
        let task = tokio::spawn(worker.run(
            command_rx,
            delta_rx,
            transport.watch_status(),
            cancel.child_token(),
        ));

        Ok(Self {
            handle: EngineHandle {
                commands: command_tx,
                events: events_tx,
                scheduler,
            },
            cancel,
            task: Some(task),
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    pub fn presenter(&self) -> PresentationAdapter {
        PresentationAdapter::new(self.handle())
    }

    /// Disable delivery and wait for the engine task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        self.handle.scheduler.shutdown();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Engine task ended abnormally");
        }
        info!("Notification engine stopped");
    }
}

impl Drop for NotificationEngine {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
            self.handle.scheduler.shutdown();
        }
    }
}

struct EngineTask {
    store: Store,
    api: Arc<dyn NotificationApi>,
    page_size: u32,
    delta_tx: mpsc::UnboundedSender<Delta>,
    events: broadcast::Sender<PresentationEvent>,
    indicator: ConnectionIndicator,
}

impl EngineTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut deltas: mpsc::UnboundedReceiver<Delta>,
        mut status_rx: watch::Receiver<ConnectionStatus>,
        cancel: CancellationToken,
    ) {
        let mut status_open = true;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                Some(delta) = deltas.recv() => {
                    debug!(kind = delta.kind(), "Applying delta");
                    self.store.apply_delta(delta);
                }

                changed = status_rx.changed(), if status_open => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    let status = *status_rx.borrow_and_update();
                    self.on_status(status);
                }
            }
        }
        debug!("Engine task stopped");
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        let indicator = ConnectionIndicator::from(status);
        if indicator != self.indicator {
            self.indicator = indicator;
            let _ = self.events.send(PresentationEvent::Connection(indicator));
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.store.snapshot().clone());
            }
            Command::MarkRead { id, reply } => {
                let changed = self.store.mark_read(&id);
                if changed {
                    let ack_id = id.clone();
                    self.acknowledge("mark_read", move |api| async move {
                        api.mark_read(&ack_id).await
                    });
                }
                let _ = reply.send(changed);
            }
            Command::MarkBatchRead { ids, reply } => {
                let changed = self.store.mark_batch_read(&ids);
                if !changed.is_empty() {
                    let ack_ids = changed.clone();
                    self.acknowledge("mark_batch_read", move |api| async move {
                        api.mark_batch_read(&ack_ids).await
                    });
                }
                let _ = reply.send(changed);
            }
            Command::MarkAllRead { reply } => {
                let changed = self.store.mark_all_read();
                // The server may hold unread items beyond the loaded page.
                self.acknowledge("mark_all_read", |api| async move { api.mark_all_read().await });
                let _ = reply.send(changed);
            }
            Command::Delete { id, reply } => {
                let removed = self.store.remove(&id).is_some();
                if removed {
                    self.acknowledge("delete", move |api| async move { api.delete(&id).await });
                }
                let _ = reply.send(removed);
            }
            Command::DeleteBatch { ids, reply } => {
                let removed = self.store.remove_batch(&ids);
                if !removed.is_empty() {
                    let ack_ids = removed.clone();
                    self.acknowledge("delete_batch", move |api| async move {
                        api.delete_batch(&ack_ids).await
                    });
                }
                let _ = reply.send(removed);
            }
            Command::Clear { reply } => {
                let cleared = self.store.clear();
                self.acknowledge("delete_all", |api| async move { api.delete_all().await });
                let _ = reply.send(cleared);
            }
            Command::Resync => self.spawn_resync("requested"),
        }
    }

    /// Send a REST acknowledgement; on failure, resynchronize from the server.
    fn acknowledge<F, Fut>(&self, operation: &'static str, call: F)
    where
        F: FnOnce(Arc<dyn NotificationApi>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let api = Arc::clone(&self.api);
        let page_size = self.page_size;
        let delta_tx = self.delta_tx.clone();
        tokio::spawn(async move {
            match call(Arc::clone(&api)).await {
                Ok(()) => debug!(operation, "Acknowledged"),
                Err(e) => {
                    let error = SyncError::Acknowledgement {
                        operation: operation.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(error = %error, "Resynchronizing after failed acknowledgement");
                    resync(api.as_ref(), page_size, &delta_tx).await;
                }
            }
        });
    }

    fn spawn_resync(&self, reason: &'static str) {
        let api = Arc::clone(&self.api);
        let page_size = self.page_size;
        let delta_tx = self.delta_tx.clone();
        debug!(reason, "Resynchronizing notifications");
        tokio::spawn(async move {
            resync(api.as_ref(), page_size, &delta_tx).await;
        });
    }
}

async fn resync(api: &dyn NotificationApi, page_size: u32, delta_tx: &mpsc::UnboundedSender<Delta>) {
    match api.list(&ListQuery::first_page(page_size)).await {
        Ok(page) => {
            let _ = delta_tx.send(Delta::Refresh(page.list));
        }
        Err(e) => warn!(error = %e, "Failed to load notifications"),
    }
}
