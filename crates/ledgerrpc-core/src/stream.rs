//! Event Stream Manager — long-lived ledger event subscriptions.
//!
//! Every subscription is driven by its own task through
//!
//! ```text
//! Connecting ──open ok──▶ Live ──drop──▶ Reconnecting ──open ok──▶ Live
//!                                             │
//!                                 reconnect limit exceeded
//!                                             ▼
//!                                           Closed
//! ```
//!
//! Events are accepted strictly in cursor order. A cursor at or below the last
//! acknowledged one is a duplicate and is discarded; a cursor beyond the next
//! expected one triggers a resynchronisation through [`EventSource::resync`]
//! before the stream continues. Accepted events are written to the
//! [`StateCache`] first, then fanned out to every attached subscriber over
//! unbounded channels so a slow subscriber never holds back the others.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::cache::{StateCache, StateKey};
use crate::error::RpcError;
use crate::policy::{RetryConfig, RetryPolicy};
use crate::request::IdGenerator;

/// Which events a subscription carries (mirrors Soroban `getEvents` filters).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventFilter {
    /// `contract`, `system` or `diagnostic`.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "contractIds", default, skip_serializing_if = "Vec::is_empty")]
    pub contract_ids: Vec<String>,
    /// Topic segments as base64 XDR, `*` matching any segment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<Vec<String>>,
}

impl EventFilter {
    pub fn contract(contract_id: impl Into<String>) -> Self {
        Self {
            event_type: Some("contract".into()),
            contract_ids: vec![contract_id.into()],
            topics: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: Vec<String>) -> Self {
        self.topics.push(topic);
        self
    }
}

/// One event as delivered by an [`EventSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    /// Position in the subscription's stream.
    pub cursor: u64,
    /// Ledger object whose state the event carries.
    pub key: StateKey,
    /// Version of that object after the event (usually the ledger sequence).
    pub version: u64,
    pub payload: Value,
}

/// Events replayed to close a cursor gap.
#[derive(Debug, Clone, Default)]
pub struct ResyncSnapshot {
    /// Missed events, ascending by cursor.
    pub events: Vec<LedgerEvent>,
    /// Everything up to and including this cursor is covered by the snapshot.
    pub cursor: u64,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<LedgerEvent, RpcError>> + Send>>;

/// Streaming backend the manager subscribes through.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Open a live stream, resuming after `resume_after` when given.
    async fn open(
        &self,
        filter: &EventFilter,
        resume_after: Option<u64>,
    ) -> Result<EventStream, RpcError>;

    /// Fetch everything the subscription missed after cursor `after`.
    async fn resync(&self, filter: &EventFilter, after: u64) -> Result<ResyncSnapshot, RpcError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Delivery state of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Connecting,
    Live,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Live => write!(f, "live"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What a subscriber receives.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Event(Arc<LedgerEvent>),
    /// A cursor gap was closed by replaying `from..=to`.
    Resynced { from: u64, to: u64 },
    /// Terminal. Sent exactly once, after which the channel ends.
    Closed { reason: String },
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Backoff between reconnect attempts; `max_retries` bounds the attempts.
    pub reconnect: RetryConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: RetryConfig {
                max_retries: 5,
                initial_backoff: std::time::Duration::from_secs(1),
                max_backoff: std::time::Duration::from_secs(60),
                multiplier: 2.0,
                jitter_fraction: 0.1,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub delivered: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub resyncs: u64,
    pub reconnects: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    duplicates: AtomicU64,
    gaps: AtomicU64,
    resyncs: AtomicU64,
    reconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StreamStats {
        StreamStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            gaps: self.gaps.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Receiving end of a subscription. Also usable as a [`Stream`].
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<StreamUpdate>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next update; `None` once the subscription has closed and drained.
    pub async fn recv(&mut self) -> Option<StreamUpdate> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamUpdate> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscriber {
    type Item = StreamUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Default)]
struct Fanout {
    senders: Vec<mpsc::UnboundedSender<StreamUpdate>>,
    closed: Option<String>,
}

/// State shared between a subscription's task and the manager.
struct Shared {
    id: SubscriptionId,
    filter: EventFilter,
    fanout: Mutex<Fanout>,
    state: watch::Sender<DeliveryState>,
    cursor: Mutex<Option<u64>>,
    counters: Counters,
}

impl Shared {
    fn attach(&self) -> Result<Subscriber, RpcError> {
        let mut fanout = self.fanout.lock();
        if let Some(reason) = &fanout.closed {
            return Err(RpcError::SubscriptionClosed {
                reason: reason.clone(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        fanout.senders.push(tx);
        Ok(Subscriber { id: self.id, rx })
    }

    /// Deliver to every live subscriber, dropping the ones that went away.
    fn publish(&self, update: StreamUpdate) {
        let mut fanout = self.fanout.lock();
        fanout.senders.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn set_state(&self, state: DeliveryState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(subscription = %self.id, from = %previous, to = %state, "subscription state");
        }
    }

    fn close(&self, reason: String) {
        let mut fanout = self.fanout.lock();
        if fanout.closed.is_some() {
            return;
        }
        for tx in fanout.senders.drain(..) {
            let _ = tx.send(StreamUpdate::Closed {
                reason: reason.clone(),
            });
        }
        fanout.closed = Some(reason);
        drop(fanout);
        self.set_state(DeliveryState::Closed);
    }
}

struct SubscriptionHandle {
    shared: Arc<Shared>,
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }
}

type Registry = Mutex<HashMap<SubscriptionId, SubscriptionHandle>>;

/// Owns every subscription and the task driving it.
///
/// A subscription that closes on its own (reconnect limit reached) removes
/// itself from the manager before notifying its subscribers.
pub struct EventStreamManager {
    source: Arc<dyn EventSource>,
    cache: StateCache,
    config: StreamConfig,
    subscriptions: Arc<Registry>,
    ids: IdGenerator,
}

impl EventStreamManager {
    pub fn new(source: Arc<dyn EventSource>, cache: StateCache, config: StreamConfig) -> Self {
        Self {
            source,
            cache,
            config,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            ids: IdGenerator::new(),
        }
    }

    /// Start a subscription and return its first subscriber.
    ///
    /// `resume_after` is the last cursor the caller already processed; events
    /// at or below it are treated as duplicates. Must be called from within a
    /// Tokio runtime.
    pub fn subscribe(&self, filter: EventFilter, resume_after: Option<u64>) -> Subscriber {
        let id = SubscriptionId(self.ids.next());
        let (state, _) = watch::channel(DeliveryState::Connecting);
        let shared = Arc::new(Shared {
            id,
            filter,
            fanout: Mutex::new(Fanout::default()),
            state,
            cursor: Mutex::new(resume_after),
            counters: Counters::default(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        shared.fanout.lock().senders.push(tx);

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = Worker {
            shared: Arc::clone(&shared),
            source: Arc::clone(&self.source),
            cache: self.cache.clone(),
            reconnect: RetryPolicy::new(self.config.reconnect.clone()),
            last_acked: resume_after,
            cancel: cancel_rx,
            registry: Arc::downgrade(&self.subscriptions),
        };
        tracing::debug!(subscription = %id, filter = ?shared.filter, "subscribed");

        // Held across the spawn so the worker cannot deregister before it
        // is registered.
        let mut subscriptions = self.subscriptions.lock();
        let task = tokio::spawn(worker.run());
        subscriptions.insert(
            id,
            SubscriptionHandle {
                shared,
                cancel: Some(cancel_tx),
                task,
            },
        );
        Subscriber { id, rx }
    }

    /// Add another subscriber to a running subscription.
    pub fn attach(&self, id: SubscriptionId) -> Result<Subscriber, RpcError> {
        let shared = self
            .subscriptions
            .lock()
            .get(&id)
            .map(|h| Arc::clone(&h.shared))
            .ok_or_else(|| RpcError::SubscriptionClosed {
                reason: format!("unknown subscription {id}"),
            })?;
        shared.attach()
    }

    /// Stop a subscription. Its subscribers receive `Closed` once.
    /// Returns `false` if the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscriptions.lock().remove(&id) {
            Some(mut handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: SubscriptionId) -> Option<DeliveryState> {
        self.with_shared(id, |s| *s.state.borrow())
    }

    /// Watch delivery state transitions of a subscription.
    pub fn watch_state(&self, id: SubscriptionId) -> Option<watch::Receiver<DeliveryState>> {
        self.with_shared(id, |s| s.state.subscribe())
    }

    /// Last acknowledged cursor.
    pub fn cursor(&self, id: SubscriptionId) -> Option<u64> {
        self.with_shared(id, |s| *s.cursor.lock()).flatten()
    }

    pub fn stats(&self, id: SubscriptionId) -> Option<StreamStats> {
        self.with_shared(id, |s| s.counters.snapshot())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionId> {
        self.subscriptions.lock().keys().copied().collect()
    }

    /// Cancel every subscription and wait for their tasks to finish.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.subscriptions.lock().drain().map(|(_, h)| h).collect();
        for mut handle in handles {
            handle.cancel();
            let _ = handle.task.await;
        }
    }

    fn with_shared<R>(&self, id: SubscriptionId, f: impl FnOnce(&Shared) -> R) -> Option<R> {
        self.subscriptions.lock().get(&id).map(|h| f(&h.shared))
    }
}

impl Drop for EventStreamManager {
    fn drop(&mut self) {
        for handle in self.subscriptions.lock().values_mut() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for EventStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamManager")
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

enum Position {
    Duplicate,
    Next,
    Gap { expected: u64 },
}

enum Flow {
    Cancelled,
    Dropped(String),
}

/// Drives one subscription through its state machine.
struct Worker {
    shared: Arc<Shared>,
    source: Arc<dyn EventSource>,
    cache: StateCache,
    reconnect: RetryPolicy,
    last_acked: Option<u64>,
    cancel: oneshot::Receiver<()>,
    registry: Weak<Registry>,
}

impl Worker {
    async fn run(mut self) {
        let id = self.shared.id;
        let mut attempt: u32 = 0;

        let reason = loop {
            let opened = tokio::select! {
                _ = &mut self.cancel => break None,
                opened = self.source.open(&self.shared.filter, self.last_acked) => opened,
            };

            match opened {
                Ok(stream) => {
                    self.shared.set_state(DeliveryState::Live);
                    match self.pump(stream, &mut attempt).await {
                        Flow::Cancelled => break None,
                        Flow::Dropped(reason) => {
                            tracing::warn!(subscription = %id, cursor = ?self.last_acked, %reason, "event stream dropped");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(subscription = %id, attempt, error = %e, "failed to open event stream");
                }
            }

            attempt += 1;
            let Some(delay) = self.reconnect.next_delay(attempt) else {
                break Some(format!(
                    "reconnect limit of {} attempts exceeded",
                    self.reconnect.config.max_retries
                ));
            };
            self.shared.set_state(DeliveryState::Reconnecting);
            Counters::bump(&self.shared.counters.reconnects);
            tracing::info!(subscription = %id, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

            tokio::select! {
                _ = &mut self.cancel => break None,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let reason = match reason {
            Some(reason) => {
                tracing::error!(subscription = %id, %reason, "subscription closed");
                if let Some(registry) = self.registry.upgrade() {
                    registry.lock().remove(&id);
                }
                reason
            }
            None => "unsubscribed".to_string(),
        };
        self.shared.close(reason);
    }

    /// Consume a live stream until it drops or the subscription is cancelled.
    /// A successful delivery resets the reconnect attempt counter.
    async fn pump(&mut self, mut stream: EventStream, attempt: &mut u32) -> Flow {
        loop {
            let next = tokio::select! {
                _ = &mut self.cancel => return Flow::Cancelled,
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => return Flow::Dropped(e.to_string()),
                None => return Flow::Dropped("stream ended".into()),
            };
            match self.ingest(event).await {
                Ok(true) => *attempt = 0,
                Ok(false) => {}
                Err(reason) => return Flow::Dropped(reason),
            }
        }
    }

    fn position(&self, cursor: u64) -> Position {
        match self.last_acked {
            None => Position::Next,
            Some(last) if cursor <= last => Position::Duplicate,
            Some(last) if cursor == last + 1 => Position::Next,
            Some(last) => Position::Gap { expected: last + 1 },
        }
    }

    /// Returns whether the event was accepted. An unrecoverable gap is an error.
    async fn ingest(&mut self, event: LedgerEvent) -> Result<bool, String> {
        match self.position(event.cursor) {
            Position::Next => {
                self.accept(event);
                Ok(true)
            }
            Position::Duplicate => {
                Counters::bump(&self.shared.counters.duplicates);
                tracing::trace!(subscription = %self.shared.id, cursor = event.cursor, "duplicate event discarded");
                Ok(false)
            }
            Position::Gap { expected } => {
                Counters::bump(&self.shared.counters.gaps);
                tracing::warn!(
                    subscription = %self.shared.id,
                    expected,
                    cursor = event.cursor,
                    "cursor gap, resynchronising"
                );
                self.resync().await?;
                match self.position(event.cursor) {
                    Position::Next => {
                        self.accept(event);
                        Ok(true)
                    }
                    Position::Duplicate => {
                        Counters::bump(&self.shared.counters.duplicates);
                        Ok(true)
                    }
                    Position::Gap { expected } => Err(format!(
                        "gap persists after resync: expected cursor {expected}, got {}",
                        event.cursor
                    )),
                }
            }
        }
    }

    async fn resync(&mut self) -> Result<(), String> {
        let Some(from) = self.last_acked else {
            return Ok(());
        };
        Counters::bump(&self.shared.counters.resyncs);
        let snapshot = self
            .source
            .resync(&self.shared.filter, from)
            .await
            .map_err(|e| format!("resync failed: {e}"))?;

        for event in snapshot.events {
            if self.last_acked.map_or(true, |last| event.cursor > last) {
                self.accept(event);
            } else {
                Counters::bump(&self.shared.counters.duplicates);
            }
        }
        if self.last_acked.map_or(true, |last| snapshot.cursor > last) {
            self.set_cursor(snapshot.cursor);
        }
        let to = self.last_acked.unwrap_or(from);
        tracing::info!(subscription = %self.shared.id, from, to, "resynchronised");
        self.shared.publish(StreamUpdate::Resynced { from, to });
        Ok(())
    }

    /// Apply to the cache, advance the cursor, then fan out.
    fn accept(&mut self, event: LedgerEvent) {
        self.cache
            .apply_update(event.key.clone(), event.version, event.payload.clone());
        self.set_cursor(event.cursor);
        Counters::bump(&self.shared.counters.delivered);
        self.shared.publish(StreamUpdate::Event(Arc::new(event)));
    }

    fn set_cursor(&mut self, cursor: u64) {
        self.last_acked = Some(cursor);
        *self.shared.cursor.lock() = Some(cursor);
    }
}
