//! Test doubles for the transport, the REST API and the poll source.
//!
//! Available to this crate's unit tests and, through the `test-utils`
//! feature, to integration tests and downstream crates.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

use crate::api::{ListQuery, NotificationApi};
use crate::error::{Result, SyncError};
use crate::message::InboundMessage;
use crate::model::{Notification, NotificationId, Page};
use crate::scheduler::PollSource;
use crate::transport::{Channel, Connector, Delivery, Endpoint};

/// Poll `condition` until it holds, sleeping in small steps.
///
/// Under a paused clock the sleeps auto-advance, so timer-driven code makes
/// progress without real waiting.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

enum Outcome {
    Fail(String),
    Succeed(MockChannel),
}

#[derive(Default)]
struct ConnectorState {
    script: VecDeque<Outcome>,
    attempts: Vec<Instant>,
    endpoints: Vec<Endpoint>,
}

/// Connector that replays a script of successes and failures.
///
/// Once the script runs out every further attempt fails.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful attempt and return the far end of its channel.
    pub fn push_success(&self) -> RemoteHandle {
        self.push_channel(None)
    }

    /// Like [`push_success`](Self::push_success) with a negotiated heart-beat.
    pub fn push_success_with_heartbeat(&self, interval: Duration) -> RemoteHandle {
        self.push_channel(Some(interval))
    }

    fn push_channel(&self, heartbeat: Option<Duration>) -> RemoteHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Mutex::new(RemoteState::default()));
        let channel = MockChannel {
            events: rx,
            _keepalive: tx.clone(),
            shared: Arc::clone(&shared),
            heartbeat,
        };
        self.state.lock().script.push_back(Outcome::Succeed(channel));
        RemoteHandle { events: tx, shared }
    }

    /// Queue a failed attempt.
    pub fn push_failure(&self) {
        self.state
            .lock()
            .script
            .push_back(Outcome::Fail("connection refused".to_string()));
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// Instants at which `open` was called.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.state.lock().attempts.clone()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().endpoints.clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Channel>> {
        let outcome = {
            let mut state = self.state.lock();
            state.attempts.push(Instant::now());
            state.endpoints.push(endpoint.clone());
            state.script.pop_front()
        };
        match outcome {
            Some(Outcome::Succeed(channel)) => Ok(Box::new(channel)),
            Some(Outcome::Fail(reason)) => Err(SyncError::transport(reason)),
            None => Err(SyncError::transport("no scripted outcome left")),
        }
    }
}

enum RemoteEvent {
    Deliver(Delivery),
    Close,
}

#[derive(Default)]
struct RemoteState {
    subscriptions: Vec<String>,
    sent: Vec<(String, String)>,
    heartbeats: u32,
    closed: bool,
}

/// Server side of a [`MockChannel`].
#[derive(Clone)]
pub struct RemoteHandle {
    events: mpsc::UnboundedSender<RemoteEvent>,
    shared: Arc<Mutex<RemoteState>>,
}

impl RemoteHandle {
    pub fn deliver(&self, delivery: Delivery) {
        let _ = self.events.send(RemoteEvent::Deliver(delivery));
    }

    /// Deliver a JSON envelope on `destination`.
    pub fn deliver_json(&self, destination: &str, payload: serde_json::Value) {
        let message: InboundMessage =
            serde_json::from_value(payload).expect("scripted payload must decode");
        self.deliver(Delivery {
            destination: destination.to_string(),
            message,
        });
    }

    /// Drop the connection from the server side.
    pub fn close(&self) {
        let _ = self.events.send(RemoteEvent::Close);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.lock().subscriptions.clone()
    }

    /// `(destination, payload)` pairs sent by the client.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.shared.lock().sent.clone()
    }

    pub fn heartbeats(&self) -> u32 {
        self.shared.lock().heartbeats
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// In-memory [`Channel`].
pub struct MockChannel {
    events: mpsc::UnboundedReceiver<RemoteEvent>,
    // Keeps `events` open when the test drops its RemoteHandle.
    _keepalive: mpsc::UnboundedSender<RemoteEvent>,
    shared: Arc<Mutex<RemoteState>>,
    heartbeat: Option<Duration>,
}

#[async_trait]
impl Channel for MockChannel {
    async fn subscribe(&mut self, destination: &str) -> Result<()> {
        self.shared.lock().subscriptions.push(destination.to_string());
        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<()> {
        self.shared.lock().subscriptions.clear();
        Ok(())
    }

    async fn send(&mut self, destination: &str, payload: &str) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.closed {
            return Err(SyncError::transport("channel closed"));
        }
        shared
            .sent
            .push((destination.to_string(), payload.to_string()));
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        match self.events.recv().await {
            Some(RemoteEvent::Deliver(delivery)) => Some(Ok(delivery)),
            Some(RemoteEvent::Close) | None => {
                self.shared.lock().closed = true;
                None
            }
        }
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat
    }

    async fn heartbeat(&mut self) -> Result<()> {
        self.shared.lock().heartbeats += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.shared.lock().closed = true;
        Ok(())
    }
}

/// Poll source with a settable count and item list.
#[derive(Default)]
pub struct CountingSource {
    count: AtomicU32,
    items: Mutex<Vec<Notification>>,
    count_calls: AtomicU32,
    page_calls: AtomicU32,
}

impl CountingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_count(&self, count: u32) {
        self.count.store(count, Ordering::SeqCst);
    }

    pub fn set_items(&self, items: Vec<Notification>) {
        *self.items.lock() = items;
    }

    pub fn count_calls(&self) -> u32 {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn page_calls(&self) -> u32 {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PollSource for CountingSource {
    async fn unread_count(&self) -> Result<u32> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.count.load(Ordering::SeqCst))
    }

    async fn fetch_page(&self) -> Result<Vec<Notification>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.items.lock().clone())
    }
}

#[derive(Default)]
struct MemoryState {
    items: Vec<Notification>,
    fail_acks: bool,
    calls: Vec<String>,
    /// Acknowledgements wait on this until released.
    ack_gate: Option<Arc<Semaphore>>,
}

/// In-memory backend implementing [`NotificationApi`].
#[derive(Default)]
pub struct MemoryApi {
    state: Mutex<MemoryState>,
}

impl MemoryApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: Vec<Notification>) -> Self {
        let api = Self::default();
        api.state.lock().items = items;
        api
    }

    pub fn insert(&self, notification: Notification) {
        let mut state = self.state.lock();
        state.items.retain(|n| n.id != notification.id);
        state.items.push(notification);
    }

    /// Make every acknowledgement fail without touching the stored items.
    pub fn set_fail_acks(&self, fail: bool) {
        self.state.lock().fail_acks = fail;
    }

    /// Park acknowledgements until [`release_acks`](Self::release_acks).
    pub fn hold_acks(&self) {
        self.state.lock().ack_gate = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_acks(&self) {
        if let Some(gate) = self.state.lock().ack_gate.take() {
            gate.add_permits(1);
        }
    }

    /// Names of the calls received so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn items(&self) -> Vec<Notification> {
        self.state.lock().items.clone()
    }

    async fn ack(&self, call: &str, apply: impl FnOnce(&mut Vec<Notification>)) -> Result<()> {
        let gate = {
            let mut state = self.state.lock();
            state.calls.push(call.to_string());
            state.ack_gate.clone()
        };
        if let Some(gate) = gate {
            // The permit goes back on drop, letting the next parked call through.
            let _permit = gate.acquire().await;
        }
        let mut state = self.state.lock();
        if state.fail_acks {
            return Err(SyncError::api(Some(500), format!("{call} rejected")));
        }
        apply(&mut state.items);
        Ok(())
    }
}

#[async_trait]
impl NotificationApi for MemoryApi {
    async fn list(&self, query: &ListQuery) -> Result<Page<Notification>> {
        let mut state = self.state.lock();
        state.calls.push("list".to_string());
        let mut matching: Vec<Notification> = state
            .items
            .iter()
            .filter(|n| query.read.is_none_or(|read| n.read == read))
            .filter(|n| query.category.is_none_or(|c| n.category == c))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let size = query.size.max(1);
        let total = matching.len() as u64;
        let start = (query.page.max(1) - 1) as usize * size as usize;
        let list = matching.into_iter().skip(start).take(size as usize).collect();
        Ok(Page {
            list,
            total,
            current: query.page,
            size,
            pages: total.div_ceil(u64::from(size)) as u32,
        })
    }

    async fn unread_count(&self) -> Result<u32> {
        let mut state = self.state.lock();
        state.calls.push("unread_count".to_string());
        Ok(state.items.iter().filter(|n| !n.read).count() as u32)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<()> {
        self.ack("mark_read", |items| {
            items.iter_mut().filter(|n| &n.id == id).for_each(|n| n.read = true)
        }).await
    }

    async fn mark_batch_read(&self, ids: &[NotificationId]) -> Result<()> {
        self.ack("mark_batch_read", |items| {
            items
                .iter_mut()
                .filter(|n| ids.contains(&n.id))
                .for_each(|n| n.read = true)
        }).await
    }

    async fn mark_all_read(&self) -> Result<()> {
        self.ack("mark_all_read", |items| items.iter_mut().for_each(|n| n.read = true))
            .await
    }

    async fn delete(&self, id: &NotificationId) -> Result<()> {
        self.ack("delete", |items| items.retain(|n| &n.id != id)).await
    }

    async fn delete_batch(&self, ids: &[NotificationId]) -> Result<()> {
        self.ack("delete_batch", |items| items.retain(|n| !ids.contains(&n.id)))
            .await
    }

    async fn delete_all(&self) -> Result<()> {
        self.ack("delete_all", Vec::clear).await
    }
}
