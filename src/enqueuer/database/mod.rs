//! Database-change enqueuer.
//!
//! One change stream is opened per distinct collection and shared by every
//! subscription on that collection. Each stream is pumped by its own task
//! into a bounded channel read by a single dispatch loop, which fans every
//! notification out to the subscriptions whose operation filter matches:
//!
//! ```text
//! watch("orders") ──pump──┐
//! watch("users")  ──pump──┼──▶ mpsc ──▶ dispatch loop ──▶ EventQueue
//! watch("carts")  ──pump──┘               (registry + collection index)
//! ```
//!
//! A failed stream closes that collection's watcher; subscriptions on it stay
//! registered but dormant until a later subscribe on the collection reopens it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{parse_options, EnqueueError, Enqueuer, Result};
use crate::event::{Event, EventType, Target};
use crate::queue::EventQueue;
use crate::registry::{TargetKey, TargetRegistry};

pub mod change_stream;

pub use change_stream::{
    ChangeEvent, ChangeSource, ChangeStream, ChangeStreamError, InMemoryChangeStream, OperationKind,
};

/// Default capacity of the handoff between stream pumps and the dispatch loop.
pub const DEFAULT_SIGNAL_BUFFER: usize = 256;

/// Which mutations a subscription wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationFilter {
    Insert,
    /// Updates and whole-document replacements, both reported as `UPDATE`.
    Update,
    /// Whole-document replacements only.
    Replace,
    Delete,
    #[default]
    All,
}

impl OperationFilter {
    /// The user-facing kind to report, or `None` if the change is filtered out.
    pub fn matches(&self, operation: OperationKind) -> Option<OperationKind> {
        let reported = match operation {
            OperationKind::Replace if *self != OperationFilter::Replace => OperationKind::Update,
            other => other,
        };
        let accepted = match self {
            OperationFilter::All => true,
            OperationFilter::Insert => operation == OperationKind::Insert,
            OperationFilter::Update => {
                matches!(operation, OperationKind::Update | OperationKind::Replace)
            }
            OperationFilter::Replace => operation == OperationKind::Replace,
            OperationFilter::Delete => operation == OperationKind::Delete,
        };
        accepted.then_some(reported)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseOptions {
    pub collection: String,
    #[serde(default, alias = "type")]
    pub operation_type: OperationFilter,
}

/// Payload carried by database events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseChange {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub collection: String,
    pub document_key: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}

enum WatchSignal {
    Change {
        collection: String,
        generation: u64,
        change: ChangeEvent,
    },
    Failed {
        collection: String,
        generation: u64,
        error: String,
    },
}

struct Watcher {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    registry: TargetRegistry<DatabaseOptions, ()>,
    by_collection: HashMap<String, BTreeSet<TargetKey>>,
    watchers: HashMap<String, Watcher>,
    next_generation: u64,
}

pub struct DatabaseEnqueuer {
    source: Arc<dyn ChangeSource>,
    state: Arc<tokio::sync::Mutex<State>>,
    signals: mpsc::Sender<WatchSignal>,
    dispatch_loop: JoinHandle<()>,
}

impl DatabaseEnqueuer {
    /// Create the enqueuer and start its dispatch loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(queue: Arc<EventQueue>, source: Arc<dyn ChangeSource>) -> Self {
        Self::with_signal_buffer(queue, source, DEFAULT_SIGNAL_BUFFER)
    }

    pub fn with_signal_buffer(
        queue: Arc<EventQueue>,
        source: Arc<dyn ChangeSource>,
        signal_buffer: usize,
    ) -> Self {
        let state = Arc::new(tokio::sync::Mutex::new(State::default()));
        let (signals, rx) = mpsc::channel(signal_buffer.max(1));
        let dispatch_loop = tokio::spawn(dispatch_loop(rx, Arc::clone(&state), queue));

        Self {
            source,
            state,
            signals,
            dispatch_loop,
        }
    }

    /// Number of collections with an open watcher.
    pub async fn watched_collections(&self) -> usize {
        self.state.lock().await.watchers.len()
    }

    fn spawn_pump(&self, collection: String, generation: u64, mut stream: ChangeStream) -> JoinHandle<()> {
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let error = loop {
                match stream.next().await {
                    Some(Ok(change)) => {
                        let signal = WatchSignal::Change {
                            collection: collection.clone(),
                            generation,
                            change,
                        };
                        if signals.send(signal).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => break e.to_string(),
                    None => break "change stream ended".to_string(),
                }
            };
            let _ = signals
                .send(WatchSignal::Failed {
                    collection,
                    generation,
                    error,
                })
                .await;
        })
    }
}

async fn dispatch_loop(
    mut signals: mpsc::Receiver<WatchSignal>,
    state: Arc<tokio::sync::Mutex<State>>,
    queue: Arc<EventQueue>,
) {
    while let Some(signal) = signals.recv().await {
        let mut state = state.lock().await;
        match signal {
            WatchSignal::Change {
                collection,
                generation,
                change,
            } => {
                let current = state
                    .watchers
                    .get(&collection)
                    .is_some_and(|w| w.generation == generation);
                if !current {
                    continue;
                }
                fan_out(&state, &queue, &collection, change);
            }
            WatchSignal::Failed {
                collection,
                generation,
                error,
            } => {
                let current = state
                    .watchers
                    .get(&collection)
                    .is_some_and(|w| w.generation == generation);
                if current {
                    state.watchers.remove(&collection);
                    error!(collection = %collection, error = %error, "Change stream closed");
                }
            }
        }
    }
}

fn fan_out(state: &State, queue: &EventQueue, collection: &str, change: ChangeEvent) {
    let Some(keys) = state.by_collection.get(collection) else {
        return;
    };

    for key in keys {
        let Some(entry) = state.registry.get(key) else {
            continue;
        };
        let Some(kind) = entry.options.operation_type.matches(change.operation) else {
            continue;
        };

        let payload = DatabaseChange {
            kind,
            collection: collection.to_string(),
            document_key: change.document_key.clone(),
            document: change.full_document.clone(),
        };
        match Event::with_json(entry.target.clone(), EventType::Database, &payload) {
            Ok(event) => {
                if queue.enqueue(event).is_err() {
                    return;
                }
                debug!(
                    target_id = %entry.target.id,
                    collection = %collection,
                    operation = %kind,
                    "Database change dispatched"
                );
            }
            Err(e) => warn!(target_id = %entry.target.id, error = %e, "Failed to encode database event"),
        }
    }
}

#[async_trait]
impl Enqueuer for DatabaseEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Database
    }

    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()> {
        let options: DatabaseOptions = parse_options(EventType::Database, options)?;
        let collection = options.collection.trim().to_string();
        if collection.is_empty() {
            return Err(EnqueueError::invalid(EventType::Database, "collection must not be empty"));
        }
        let options = DatabaseOptions {
            collection: collection.clone(),
            ..options
        };

        let mut state = self.state.lock().await;
        state.registry.ensure_vacant(&target)?;

        if !state.watchers.contains_key(&collection) {
            let stream = self
                .source
                .watch(&collection)
                .await
                .map_err(|e| EnqueueError::Transport(e.to_string()))?;
            state.next_generation += 1;
            let generation = state.next_generation;
            let task = self.spawn_pump(collection.clone(), generation, stream);
            state.watchers.insert(collection.clone(), Watcher { generation, task });
            info!(collection = %collection, "Change stream opened");
        }

        let target_id = target.id.clone();
        let operation = options.operation_type;
        let key = state.registry.insert(target, options, ())?;
        state
            .by_collection
            .entry(collection.clone())
            .or_default()
            .insert(key);

        info!(
            target_id = %target_id,
            collection = %collection,
            operation = ?operation,
            "Subscribed to database changes"
        );
        Ok(())
    }

    async fn unsubscribe(&self, target: &Target) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.registry.remove(target) else {
            return;
        };

        let collection = entry.options.collection;
        let key = TargetKey::from(target);
        let now_empty = match state.by_collection.get_mut(&collection) {
            Some(keys) => {
                keys.remove(&key);
                keys.is_empty()
            }
            None => true,
        };

        if now_empty {
            state.by_collection.remove(&collection);
            if let Some(watcher) = state.watchers.remove(&collection) {
                watcher.task.abort();
                info!(collection = %collection, "Change stream closed after last unsubscribe");
            }
        }
        info!(target_id = %target.id, collection = %collection, "Unsubscribed from database changes");
    }

    async fn subscriptions(&self) -> Vec<Target> {
        self.state
            .lock()
            .await
            .registry
            .entries()
            .map(|entry| entry.target.clone())
            .collect()
    }
}

impl Drop for DatabaseEnqueuer {
    fn drop(&mut self) {
        self.dispatch_loop.abort();
        if let Ok(mut state) = self.state.try_lock() {
            for (_, watcher) in state.watchers.drain() {
                watcher.task.abort();
            }
        }
    }
}
