//! # Background Update Queue
//!
//! The update queue decouples state mutation from subscriber notification.
//! Mutators enqueue a small change record and return immediately; a
//! dedicated dispatcher task fans the record out to every subscriber
//! registered for that field.
//!
//! ## Design Decisions
//!
//! - The producer side is a bounded deque behind its own mutex. Enqueue is
//!   O(1) and never touches any lock used by delivery, so a stalled
//!   subscriber cannot slow a mutation down.
//! - On overflow the **oldest** unconsumed event is dropped and counted
//!   (`dropped_events`), rather than blocking producers or growing without
//!   limit. Subscribers are notified at-least-once per observed version,
//!   not once per historical version.
//! - Each subscriber owns a private bounded channel. Delivery is `try_send`
//!   on the fast path; a congested channel falls back to a spawned send
//!   with a per-delivery timeout, so the dispatcher itself never waits on
//!   a slow consumer.
//! - Consecutive delivery failures are counted per subscriber; crossing
//!   the configured threshold unsubscribes the subscriber automatically.
//!   A successful delivery resets the streak.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::state::Field;

/// Record of a single field mutation: which field changed and the version
/// the write produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub field: Field,
    pub version: u64,
}

/// What a subscriber receives for every observed version transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub field: Field,
    pub version: u64,
}

/// Opaque handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum DispatcherState {
    #[default]
    Idle,
    Dispatching,
    ShuttingDown,
    Stopped,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("update queue is closed")]
    QueueClosed,

    #[error("delivery to subscriber {subscriber} failed: {message}")]
    DeliveryFailed {
        subscriber: SubscriptionId,
        message: String,
    },

    #[error("dispatcher shutdown failed: {0}")]
    ShutdownFailed(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Receiving end of one subscription.
pub struct SubscriptionReceiver {
    receiver: mpsc::Receiver<Notification>,
}

impl SubscriptionReceiver {
    /// Waits for the next notification. Returns `None` once the
    /// subscription has been removed and the channel drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<Notification> {
        ReceiverStream::new(self.receiver)
    }
}

// Producer-visible queue state. Shared between sinks, the dispatcher task
// and observability accessors.
struct Shared {
    queue: Mutex<VecDeque<ChangeEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
    state: Mutex<DispatcherState>,
    subscriber_count: AtomicUsize,
}

impl Shared {
    fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Cheap clonable producer handle held by [`StateNode`](crate::state::StateNode).
#[derive(Clone)]
pub struct UpdateSink {
    shared: Arc<Shared>,
}

impl UpdateSink {
    /// Enqueues a change event without blocking. O(1); drops the oldest
    /// queued event (and counts the drop) when the queue is full. Events
    /// offered after the dispatcher stopped are dropped and counted.
    pub fn enqueue(&self, event: ChangeEvent) {
        if self.shared.state() == DispatcherState::Stopped {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(field = %event.field, "change event after stop, dropped");
            return;
        }
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            while queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }
}

enum Control {
    Subscribe(SubscriberEntry),
    Unsubscribe(SubscriptionId),
    DeliveryResult { id: SubscriptionId, success: bool },
}

struct SubscriberEntry {
    id: SubscriptionId,
    field: Field,
    sender: mpsc::Sender<Notification>,
    consecutive_failures: u32,
    in_flight: bool,
}

/// The background dispatcher and its control surface.
pub struct UpdateQueue {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    handle: Mutex<Option<JoinHandle<()>>>,
    subscriber_channel_capacity: usize,
    shutdown_grace: Duration,
}

impl UpdateQueue {
    /// Spawns the dispatcher task. The task runs until a message arrives on
    /// `shutdown_rx`, then drains best-effort within the configured grace
    /// period and stops.
    pub fn start(config: &NodeConfig, shutdown_rx: broadcast::Receiver<()>) -> Self {
        // Zero capacities are clamped to one: the queue always admits the
        // newest event, and mpsc channels reject a zero capacity outright.
        let capacity = config.update_queue_capacity.max(1);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            state: Mutex::new(DispatcherState::Idle),
            subscriber_count: AtomicUsize::new(0),
        });
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let dispatcher = Dispatcher {
            shared: shared.clone(),
            control_tx: control_tx.clone(),
            subscribers: HashMap::new(),
            delivery_timeout: config.delivery_timeout,
            max_delivery_failures: config.max_delivery_failures,
            shutdown_grace: config.shutdown_grace,
        };
        let handle = tokio::spawn(dispatcher.run(control_rx, shutdown_rx));

        Self {
            shared,
            control_tx,
            handle: Mutex::new(Some(handle)),
            subscriber_channel_capacity: config.subscriber_channel_capacity.max(1),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Producer handle for state mutators.
    pub fn sink(&self) -> UpdateSink {
        UpdateSink {
            shared: self.shared.clone(),
        }
    }

    /// Registers a subscriber for one field. Notifications arrive in the
    /// order the dispatcher processes version transitions; subscribers for
    /// the same field are served in registration order.
    pub fn subscribe(&self, field: Field) -> DispatchResult<(SubscriptionId, SubscriptionReceiver)> {
        if self.shared.state() == DispatcherState::Stopped {
            return Err(DispatchError::QueueClosed);
        }
        let id = SubscriptionId::new();
        let (sender, receiver) = mpsc::channel(self.subscriber_channel_capacity);
        let entry = SubscriberEntry {
            id,
            field,
            sender,
            consecutive_failures: 0,
            in_flight: false,
        };
        self.control_tx
            .send(Control::Subscribe(entry))
            .map_err(|_| DispatchError::QueueClosed)?;
        debug!(%id, %field, "subscriber registered");
        Ok((id, SubscriptionReceiver { receiver }))
    }

    /// Removes a subscription. Idempotent; unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        // A closed control channel means the dispatcher already stopped
        // and dropped every subscriber with it.
        let _ = self.control_tx.send(Control::Unsubscribe(id));
    }

    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Events dropped by overflow or offered after stop.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscriber_count.load(Ordering::Relaxed)
    }

    /// Waits for the dispatcher task to finish after a shutdown signal was
    /// broadcast. Bounded by the grace period plus a small margin, so an
    /// unresponsive subscriber cannot hold shutdown hostage.
    pub async fn join(&self) -> DispatchResult<()> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let budget = self.shutdown_grace + Duration::from_secs(1);
        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DispatchError::ShutdownFailed(e.to_string())),
            Err(_) => Err(DispatchError::ShutdownFailed(
                "dispatcher did not stop within the grace period".to_string(),
            )),
        }
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    // Per field, in registration order.
    subscribers: HashMap<Field, Vec<SubscriberEntry>>,
    delivery_timeout: Duration,
    max_delivery_failures: u32,
    shutdown_grace: Duration,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        debug!("dispatcher started");
        loop {
            tokio::select! {
                _ = self.shared.notify.notified() => {
                    self.shared.set_state(DispatcherState::Dispatching);
                    while let Some(event) = self.pop_event() {
                        self.dispatch(event);
                    }
                    self.shared.set_state(DispatcherState::Idle);
                }
                Some(control) = control_rx.recv() => {
                    self.handle_control(control);
                }
                _ = shutdown_rx.recv() => {
                    info!("dispatcher received shutdown signal");
                    break;
                }
            }
        }

        self.shared.set_state(DispatcherState::ShuttingDown);
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while let Some(event) = self.pop_event() {
            if tokio::time::Instant::now() >= deadline {
                let remaining = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
                let abandoned = remaining.len() as u64 + 1;
                self.shared.dropped.fetch_add(abandoned, Ordering::Relaxed);
                warn!(abandoned, "shutdown grace expired with events still queued");
                break;
            }
            self.dispatch(event);
        }
        self.subscribers.clear();
        self.shared.subscriber_count.store(0, Ordering::Relaxed);
        self.shared.set_state(DispatcherState::Stopped);
        info!("dispatcher stopped");
    }

    fn pop_event(&self) -> Option<ChangeEvent> {
        self.shared
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Subscribe(entry) => {
                self.subscribers.entry(entry.field).or_default().push(entry);
                self.shared.subscriber_count.fetch_add(1, Ordering::Relaxed);
            }
            Control::Unsubscribe(id) => {
                self.remove_subscriber(id);
            }
            Control::DeliveryResult { id, success } => {
                self.record_outcome(id, success);
            }
        }
    }

    fn remove_subscriber(&mut self, id: SubscriptionId) {
        for entries in self.subscribers.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != id);
            if entries.len() < before {
                self.shared.subscriber_count.fetch_sub(1, Ordering::Relaxed);
                debug!(%id, "subscriber removed");
                return;
            }
        }
    }

    /// Fans one change event out to the field's subscribers. Never awaits:
    /// a congested subscriber gets a spawned timed send so the dispatcher
    /// stays responsive for everyone else.
    fn dispatch(&mut self, event: ChangeEvent) {
        let Some(entries) = self.subscribers.get_mut(&event.field) else {
            return;
        };
        let notification = Notification {
            field: event.field,
            version: event.version,
        };

        let mut expired: Vec<SubscriptionId> = Vec::new();
        for entry in entries.iter_mut() {
            if entry.in_flight {
                // A previous delivery is still pending for this subscriber;
                // piling more sends behind it would reorder notifications.
                // Skipped, not failed: only the resolved outcome of the
                // pending send feeds the failure threshold.
                trace!(id = %entry.id, "delivery skipped, previous send still in flight");
                continue;
            }
            match entry.sender.try_send(notification) {
                Ok(()) => {
                    entry.consecutive_failures = 0;
                }
                Err(TrySendError::Closed(_)) => {
                    // Receiver was dropped; discard silently.
                    expired.push(entry.id);
                }
                Err(TrySendError::Full(notification)) => {
                    entry.in_flight = true;
                    let sender = entry.sender.clone();
                    let control_tx = self.control_tx.clone();
                    let id = entry.id;
                    let timeout = self.delivery_timeout;
                    tokio::spawn(async move {
                        let success = match sender.send_timeout(notification, timeout).await {
                            Ok(()) => true,
                            Err(SendTimeoutError::Timeout(_)) => {
                                let error = DispatchError::DeliveryFailed {
                                    subscriber: id,
                                    message: "delivery timed out".to_string(),
                                };
                                debug!(error = %error, "subscriber delivery failed");
                                false
                            }
                            Err(SendTimeoutError::Closed(_)) => false,
                        };
                        let _ = control_tx.send(Control::DeliveryResult { id, success });
                    });
                }
            }
        }

        for id in expired {
            warn!(%id, "subscriber dropped after repeated delivery failures");
            self.remove_subscriber(id);
        }
    }

    fn record_outcome(&mut self, id: SubscriptionId, success: bool) {
        let Some(entry) = self
            .subscribers
            .values_mut()
            .flat_map(|entries| entries.iter_mut())
            .find(|entry| entry.id == id)
        else {
            // Already unsubscribed; the in-flight result is discarded.
            return;
        };
        entry.in_flight = false;
        if success {
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            if entry.consecutive_failures >= self.max_delivery_failures {
                warn!(%id, "subscriber dropped after repeated delivery failures");
                self.remove_subscriber(id);
            }
        }
    }
}
