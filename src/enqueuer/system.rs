//! System lifecycle enqueuer.
//!
//! Fires a single `READY` wave once per process, after the subscriptions made
//! during startup have settled: every subscribe restarts a debounce timer, and
//! when it expires each subscribed target receives one event. The wave is
//! spent afterwards; targets subscribing later never fire.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{parse_options, EnqueueError, Enqueuer, Result};
use crate::event::{Event, EventType, Target};
use crate::queue::EventQueue;
use crate::registry::TargetRegistry;

/// Default quiet period after the last subscribe before the wave fires.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// The only system event currently emitted.
pub const READY: &str = "READY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOptions {
    #[serde(default = "default_name")]
    pub name: String,
}

fn default_name() -> String {
    READY.to_string()
}

#[derive(Default)]
struct Inner {
    registry: TargetRegistry<SystemOptions, ()>,
    fired: bool,
    debounce: Option<JoinHandle<()>>,
}

pub struct SystemEnqueuer {
    queue: Arc<EventQueue>,
    debounce: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl SystemEnqueuer {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            debounce: DEFAULT_DEBOUNCE,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Whether the wave has already fired.
    pub fn fired(&self) -> bool {
        lock(&self.inner).fired
    }

    fn schedule_wave(&self, inner: &mut Inner) {
        if let Some(pending) = inner.debounce.take() {
            pending.abort();
        }

        let state = Arc::clone(&self.inner);
        let queue = Arc::clone(&self.queue);
        let debounce = self.debounce;
        inner.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            fire(&state, &queue);
        }));
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

fn fire(state: &Mutex<Inner>, queue: &EventQueue) {
    let mut inner = lock(state);
    if inner.fired {
        return;
    }
    inner.fired = true;
    inner.debounce = None;

    let mut fired = 0usize;
    for entry in inner.registry.entries() {
        let payload = serde_json::json!({ "name": entry.options.name });
        match Event::with_json(entry.target.clone(), EventType::System, &payload) {
            Ok(event) => {
                if queue.enqueue(event).is_ok() {
                    fired += 1;
                }
            }
            Err(e) => warn!(target_id = %entry.target.id, error = %e, "Failed to encode system event"),
        }
    }
    info!(targets = fired, "System READY wave fired");
}

#[async_trait]
impl Enqueuer for SystemEnqueuer {
    fn kind(&self) -> EventType {
        EventType::System
    }

    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()> {
        let options: SystemOptions = parse_options(EventType::System, options)?;
        if !options.name.eq_ignore_ascii_case(READY) {
            return Err(EnqueueError::invalid(
                EventType::System,
                format!("unsupported system event '{}'", options.name),
            ));
        }
        let options = SystemOptions {
            name: READY.to_string(),
        };

        let mut inner = lock(&self.inner);
        let target_id = target.id.clone();
        inner.registry.insert(target, options, ())?;

        if inner.fired {
            debug!(target_id = %target_id, "System wave already fired, late subscriber will not fire");
        } else {
            self.schedule_wave(&mut inner);
        }
        info!(target_id = %target_id, "Subscribed to system events");
        Ok(())
    }

    async fn unsubscribe(&self, target: &Target) {
        if lock(&self.inner).registry.remove(target).is_some() {
            info!(target_id = %target.id, "Unsubscribed from system events");
        }
    }

    async fn subscriptions(&self) -> Vec<Target> {
        lock(&self.inner)
            .registry
            .entries()
            .map(|entry| entry.target.clone())
            .collect()
    }
}

impl Drop for SystemEnqueuer {
    fn drop(&mut self) {
        if let Some(pending) = lock(&self.inner).debounce.take() {
            pending.abort();
        }
    }
}
