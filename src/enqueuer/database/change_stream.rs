//! Change-stream abstraction consumed by the database enqueuer.
//!
//! The database driver owns the real change-stream primitive; the enqueuer
//! only needs "give me a stream of mutations for this collection".
//! `InMemoryChangeStream` is a broadcast-backed source for tests and
//! standalone mode.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Capacity of each in-memory collection channel.
const COLLECTION_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by a change source.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChangeStreamError {
    #[error("Failed to open change stream: {0}")]
    Open(String),

    #[error("Change stream failed: {0}")]
    Failed(String),
}

/// Kind of mutation reported by the change stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "INSERT",
            OperationKind::Update => "UPDATE",
            OperationKind::Replace => "REPLACE",
            OperationKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: OperationKind,
    pub collection: String,
    pub document_key: serde_json::Value,
    /// Post-change document, when the source provides it.
    pub full_document: Option<serde_json::Value>,
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, ChangeStreamError>>;

/// Opens change streams over collections.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Start watching `collection`.
    ///
    /// Changes made after this returns are observed by the stream.
    async fn watch(&self, collection: &str) -> Result<ChangeStream, ChangeStreamError>;
}

type Notification = Result<ChangeEvent, ChangeStreamError>;

/// Process-local change source driven by explicit mutation calls.
#[derive(Default)]
pub struct InMemoryChangeStream {
    channels: Mutex<HashMap<String, broadcast::Sender<Notification>>>,
}

impl InMemoryChangeStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, collection: &str) -> broadcast::Sender<Notification> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(collection.to_string())
            .or_insert_with(|| broadcast::channel(COLLECTION_CHANNEL_CAPACITY).0)
            .clone()
    }

    fn publish(&self, collection: &str, notification: Notification) {
        // Nobody watching is fine: the mutation simply goes unobserved.
        let _ = self.sender(collection).send(notification);
    }

    fn change(
        &self,
        operation: OperationKind,
        collection: &str,
        document_key: serde_json::Value,
        full_document: Option<serde_json::Value>,
    ) {
        self.publish(
            collection,
            Ok(ChangeEvent {
                operation,
                collection: collection.to_string(),
                document_key,
                full_document,
            }),
        );
    }

    pub fn insert(&self, collection: &str, document_key: serde_json::Value, document: serde_json::Value) {
        self.change(OperationKind::Insert, collection, document_key, Some(document));
    }

    pub fn update(&self, collection: &str, document_key: serde_json::Value, document: serde_json::Value) {
        self.change(OperationKind::Update, collection, document_key, Some(document));
    }

    pub fn replace(&self, collection: &str, document_key: serde_json::Value, document: serde_json::Value) {
        self.change(OperationKind::Replace, collection, document_key, Some(document));
    }

    pub fn delete(&self, collection: &str, document_key: serde_json::Value) {
        self.change(OperationKind::Delete, collection, document_key, None);
    }

    /// Make every open stream on `collection` fail.
    pub fn fail(&self, collection: &str, message: impl Into<String>) {
        self.publish(collection, Err(ChangeStreamError::Failed(message.into())));
    }

    /// Number of open streams on `collection`.
    pub fn watcher_count(&self, collection: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(collection)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChangeSource for InMemoryChangeStream {
    async fn watch(&self, collection: &str) -> Result<ChangeStream, ChangeStreamError> {
        let rx = self.sender(collection).subscribe();
        let collection = collection.to_string();

        let stream = futures::stream::unfold(rx, move |mut rx| {
            let collection = collection.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(notification) => return Some((notification, rx)),
                        Err(broadcast::error::RecvError::Lagged(count)) => {
                            warn!(collection = %collection, lagged = count, "Change stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
