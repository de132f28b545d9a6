//! Event queue bridging enqueuers and worker processes.
//!
//! Enqueuers push events; workers pull them with `pop` and report the
//! outcome with `ack` / `error`. Entries leave the queue on `pop`, so the
//! terminal signals only feed the completion side channel:
//!
//! ```text
//! enqueue ──▶ [pending] ──pop──▶ worker ──ack/error──▶ completions (broadcast)
//!                 ▲                                         │
//!           parked pops (FIFO)              http / broker enqueuers, logs
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::event::Event;

/// Default capacity of the completion side channel.
pub const DEFAULT_COMPLETION_CAPACITY: usize = 1024;

/// Callback invoked for every enqueued event (instrumentation, fan-out).
pub type EnqueueCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Returned by [`EventQueue::enqueue`] once the queue has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event queue is closed")]
pub struct QueueClosed;

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Failed(String),
}

/// Worker report for one popped event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub event_id: String,
    pub outcome: Outcome,
}

struct Waiter {
    worker_id: String,
    tx: oneshot::Sender<Event>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Event>,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl QueueState {
    /// Hand an event to the oldest live waiter.
    ///
    /// Returns the event back if nobody is waiting.
    fn hand_off(&mut self, mut event: Event) -> Option<Event> {
        while let Some(waiter) = self.waiters.pop_front() {
            let event_id = event.id().to_string();
            match waiter.tx.send(event) {
                Ok(()) => {
                    debug!(
                        event_id = %event_id,
                        worker_id = %waiter.worker_id,
                        "Event handed to parked worker"
                    );
                    return None;
                }
                // Receiver dropped: that worker went away, try the next one.
                Err(returned) => event = returned,
            }
        }
        Some(event)
    }
}

struct Shared {
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process store of pending events with parked, FIFO-fair pops.
pub struct EventQueue {
    shared: Arc<Shared>,
    on_enqueue: Option<EnqueueCallback>,
    completions: broadcast::Sender<Completion>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::with_completion_capacity(DEFAULT_COMPLETION_CAPACITY)
    }

    /// Create an empty queue with a custom side-channel capacity.
    pub fn with_completion_capacity(capacity: usize) -> Self {
        let (completions, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
            }),
            on_enqueue: None,
            completions,
        }
    }

    /// Install a callback invoked for every enqueued event.
    pub fn with_enqueue_callback(mut self, callback: impl Fn(&Event) + Send + Sync + 'static) -> Self {
        self.on_enqueue = Some(Box::new(callback));
        self
    }

    /// Add an event. Never blocks.
    ///
    /// The oldest parked `pop` receives the event directly; otherwise it is
    /// stored until a worker asks for it. Fails once the queue is closed, in
    /// which case the event is dropped.
    pub fn enqueue(&self, event: Event) -> Result<(), QueueClosed> {
        if !self.is_closed() {
            if let Some(callback) = &self.on_enqueue {
                callback(&event);
            }
        }

        let mut state = self.shared.lock();
        if state.closed {
            warn!(event_id = %event.id(), target_id = %event.target().id, "Queue closed, dropping event");
            return Err(QueueClosed);
        }

        debug!(
            event_id = %event.id(),
            target_id = %event.target().id,
            event_type = %event.event_type(),
            "Event enqueued"
        );

        if let Some(event) = state.hand_off(event) {
            state.pending.push_back(event);
        }
        Ok(())
    }

    /// Take the next event, parking until one is available.
    ///
    /// Parked pops are satisfied in arrival order. Dropping the returned
    /// future releases the waiter; an event already handed to it goes back to
    /// the next waiter or the head of the queue. Returns `None` once the queue
    /// is closed.
    pub async fn pop(&self, worker_id: &str) -> Option<Event> {
        let rx = {
            let mut state = self.shared.lock();
            if let Some(event) = state.pending.pop_front() {
                debug!(event_id = %event.id(), worker_id = %worker_id, "Event popped");
                return Some(event);
            }
            if state.closed {
                return None;
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                worker_id: worker_id.to_string(),
                tx,
            });
            rx
        };

        debug!(worker_id = %worker_id, "Worker parked waiting for events");

        ParkedPop {
            rx: Some(rx),
            shared: Arc::clone(&self.shared),
        }
        .wait()
        .await
    }

    /// Worker reports successful completion.
    pub fn ack(&self, event_id: &str) {
        debug!(event_id = %event_id, "Event acknowledged");
        self.complete(event_id, Outcome::Acked);
    }

    /// Worker reports failure.
    pub fn error(&self, event_id: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(event_id = %event_id, error = %message, "Event failed");
        self.complete(event_id, Outcome::Failed(message));
    }

    fn complete(&self, event_id: &str, outcome: Outcome) {
        // No listeners is fine: nobody needs to react to this outcome.
        let _ = self.completions.send(Completion {
            event_id: event_id.to_string(),
            outcome,
        });
    }

    /// Receive every subsequent ack / error.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<Completion> {
        self.completions.subscribe()
    }

    /// Number of events waiting for a worker.
    pub fn size(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Number of workers currently parked in `pop`.
    pub fn waiting(&self) -> usize {
        self.shared.lock().waiters.len()
    }

    /// Close the queue: parked pops resolve to `None`, further enqueues are dropped.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        let released = state.waiters.len();
        state.waiters.clear();
        info!(released_waiters = released, pending = state.pending.len(), "Event queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// A pop waiting for an event.
///
/// On drop, any event that was delivered but never observed is restored.
struct ParkedPop {
    rx: Option<oneshot::Receiver<Event>>,
    shared: Arc<Shared>,
}

impl ParkedPop {
    async fn wait(mut self) -> Option<Event> {
        let rx = self.rx.as_mut()?;
        let event = rx.await.ok();
        self.rx = None;
        event
    }
}

impl Drop for ParkedPop {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        rx.close();
        let mut state = self.shared.lock();
        if let Ok(event) = rx.try_recv() {
            debug!(event_id = %event.id(), "Restoring event from cancelled pop");
            if let Some(event) = state.hand_off(event) {
                state.pending.push_front(event);
            }
        }
        state.waiters.retain(|waiter| !waiter.tx.is_closed());
    }
}
