//! Enqueuers - one per trigger kind.
//!
//! An enqueuer turns trigger-specific signals (change notifications, cron
//! ticks, HTTP requests, broker deliveries, socket messages, process
//! lifecycle) into [`Event`](crate::Event)s and pushes them into the shared
//! [`EventQueue`]. Every enqueuer owns a [`TargetRegistry`](crate::registry::TargetRegistry)
//! whose entries hold the live resource backing a subscription.
//!
//! The set of available kinds is assembled at startup with
//! [`EnqueuerSetBuilder`], which maps each [`EventType`] to a constructor.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::event::{EventType, Target};
use crate::queue::EventQueue;
use crate::reducer::JobReducer;
use crate::registry::RegistryError;
use crate::utils::clock::{Clock, SystemClock};

pub mod database;
pub mod http;
pub mod message_queue;
pub mod schedule;
pub mod socket;
pub mod system;

pub use database::DatabaseEnqueuer;
pub use http::HttpEnqueuer;
pub use message_queue::MessageQueueEnqueuer;
pub use schedule::ScheduleEnqueuer;
pub use socket::SocketEnqueuer;
pub use system::SystemEnqueuer;

/// Result type for enqueuer operations.
pub type Result<T> = std::result::Result<T, EnqueueError>;

/// Errors reported to the caller of `subscribe`.
///
/// Faults that happen after a subscription is live (a change stream dying, a
/// broker dropping the consumer) are logged and close the resource; they are
/// never surfaced here.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Invalid {kind} options: {message}")]
    InvalidOptions { kind: EventType, message: String },

    #[error("Target '{0}' is already subscribed")]
    AlreadySubscribed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown trigger kind: {0}")]
    UnknownKind(String),
}

impl EnqueueError {
    pub fn invalid(kind: EventType, message: impl fmt::Display) -> Self {
        EnqueueError::InvalidOptions {
            kind,
            message: message.to_string(),
        }
    }
}

impl From<RegistryError> for EnqueueError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadySubscribed(key) => EnqueueError::AlreadySubscribed(key),
        }
    }
}

/// Decode the JSON options of a subscribe request into the kind's options type.
pub fn parse_options<T: DeserializeOwned>(kind: EventType, options: serde_json::Value) -> Result<T> {
    // A missing options object means "all defaults".
    let options = if options.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        options
    };
    serde_json::from_value(options).map_err(|e| EnqueueError::invalid(kind, e))
}

/// Translates one trigger kind's signals into events.
///
/// Subscribe and unsubscribe are serialized with the enqueuer's own signal
/// handling. When `subscribe` returns `Ok`, the subscription is live.
#[async_trait]
pub trait Enqueuer: Send + Sync {
    /// The trigger kind this enqueuer serves.
    fn kind(&self) -> EventType;

    /// Validate options, allocate the subscription's resource and start listening.
    ///
    /// Rejects a target that is already subscribed.
    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()>;

    /// Release the target's resource and remove its entry. No-op for unknown targets.
    async fn unsubscribe(&self, target: &Target);

    /// Currently subscribed targets.
    async fn subscriptions(&self) -> Vec<Target>;

    /// Tear down every subscription.
    async fn shutdown(&self) {
        for target in self.subscriptions().await {
            self.unsubscribe(&target).await;
        }
    }
}

/// Shared collaborators handed to enqueuer constructors.
#[derive(Clone)]
pub struct DispatchContext {
    pub queue: Arc<EventQueue>,
    /// Present when time-based triggers must be deduplicated across replicas.
    pub reducer: Option<Arc<JobReducer>>,
    pub clock: Arc<dyn Clock>,
}

impl DispatchContext {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            reducer: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_reducer(mut self, reducer: Arc<JobReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

type Constructor = Box<dyn FnOnce(&DispatchContext) -> Arc<dyn Enqueuer> + Send>;

/// Builder mapping trigger kinds to enqueuer constructors.
pub struct EnqueuerSetBuilder {
    context: DispatchContext,
    constructors: BTreeMap<EventType, Constructor>,
}

impl EnqueuerSetBuilder {
    pub fn new(context: DispatchContext) -> Self {
        Self {
            context,
            constructors: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &DispatchContext {
        &self.context
    }

    /// Register the constructor for `kind`, replacing any earlier one.
    pub fn register<F, E>(mut self, kind: EventType, constructor: F) -> Self
    where
        F: FnOnce(&DispatchContext) -> Arc<E> + Send + 'static,
        E: Enqueuer + 'static,
    {
        self.constructors.insert(
            kind,
            Box::new(move |context| constructor(context) as Arc<dyn Enqueuer>),
        );
        self
    }

    /// Register an already constructed enqueuer under its own kind.
    pub fn with_enqueuer(mut self, enqueuer: Arc<dyn Enqueuer>) -> Self {
        self.constructors
            .insert(enqueuer.kind(), Box::new(move |_| enqueuer));
        self
    }

    /// Run every constructor.
    pub fn build(self) -> EnqueuerSet {
        let mut enqueuers = BTreeMap::new();
        for (kind, constructor) in self.constructors {
            enqueuers.insert(kind, constructor(&self.context));
        }
        info!(
            kinds = ?enqueuers.keys().map(EventType::as_str).collect::<Vec<_>>(),
            "Enqueuers ready"
        );
        EnqueuerSet {
            context: self.context,
            enqueuers,
        }
    }
}

/// The enqueuers available to this process, keyed by kind.
pub struct EnqueuerSet {
    context: DispatchContext,
    enqueuers: BTreeMap<EventType, Arc<dyn Enqueuer>>,
}

impl EnqueuerSet {
    pub fn builder(context: DispatchContext) -> EnqueuerSetBuilder {
        EnqueuerSetBuilder::new(context)
    }

    pub fn context(&self) -> &DispatchContext {
        &self.context
    }

    pub fn get(&self, kind: EventType) -> Option<Arc<dyn Enqueuer>> {
        self.enqueuers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = EventType> + '_ {
        self.enqueuers.keys().copied()
    }

    /// Resolve a kind name (aliases included) to its enqueuer.
    pub fn resolve(&self, kind: &str) -> Result<Arc<dyn Enqueuer>> {
        let kind: EventType = kind
            .parse()
            .map_err(|_| EnqueueError::UnknownKind(kind.to_string()))?;
        self.get(kind)
            .ok_or_else(|| EnqueueError::UnknownKind(kind.to_string()))
    }

    pub async fn subscribe(&self, kind: &str, target: Target, options: serde_json::Value) -> Result<()> {
        self.resolve(kind)?.subscribe(target, options).await
    }

    pub async fn unsubscribe(&self, kind: &str, target: &Target) -> Result<()> {
        self.resolve(kind)?.unsubscribe(target).await;
        Ok(())
    }

    /// Tear down every enqueuer's subscriptions.
    pub async fn shutdown(&self) {
        for (kind, enqueuer) in &self.enqueuers {
            enqueuer.shutdown().await;
            info!(kind = %kind, "Enqueuer shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::target;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    struct SampleOptions {
        queue_name: String,
        #[serde(default)]
        durable: bool,
    }

    #[test]
    fn test_parse_options() {
        let options: SampleOptions =
            parse_options(EventType::MessageQueue, json!({ "queueName": "jobs" })).unwrap();
        assert_eq!(options.queue_name, "jobs");
        assert!(!options.durable);
    }

    #[test]
    fn test_parse_options_rejects_invalid() {
        let err = parse_options::<SampleOptions>(EventType::MessageQueue, json!({ "durable": true }))
            .unwrap_err();
        assert!(matches!(
            err,
            EnqueueError::InvalidOptions {
                kind: EventType::MessageQueue,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_set_resolves_aliases() {
        let queue = Arc::new(EventQueue::new());
        let set = EnqueuerSet::builder(DispatchContext::new(queue))
            .register(EventType::System, |ctx| {
                Arc::new(SystemEnqueuer::new(Arc::clone(&ctx.queue)))
            })
            .build();

        assert!(set.resolve("system").is_ok());
        assert!(set.get(EventType::System).is_some());
        assert!(matches!(set.resolve("http"), Err(EnqueueError::UnknownKind(_))));
        assert!(matches!(set.resolve("bigquery"), Err(EnqueueError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn test_set_routes_subscribe_and_unsubscribe() {
        let queue = Arc::new(EventQueue::new());
        let set = EnqueuerSet::builder(DispatchContext::new(queue))
            .register(EventType::System, |ctx| {
                Arc::new(SystemEnqueuer::new(Arc::clone(&ctx.queue)))
            })
            .build();
        let system = set.get(EventType::System).unwrap();

        set.subscribe("system", target("fn-1"), json!({ "name": "READY" }))
            .await
            .unwrap();
        assert_eq!(system.subscriptions().await, vec![target("fn-1")]);

        let err = set
            .subscribe("system", target("fn-1"), json!({ "name": "READY" }))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::AlreadySubscribed(_)));

        set.unsubscribe("system", &target("fn-1")).await.unwrap();
        set.unsubscribe("system", &target("fn-1")).await.unwrap();
        assert!(system.subscriptions().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_subscriptions() {
        let queue = Arc::new(EventQueue::new());
        let system = Arc::new(SystemEnqueuer::new(Arc::clone(&queue)));
        let set = EnqueuerSet::builder(DispatchContext::new(queue))
            .with_enqueuer(system.clone())
            .build();

        set.subscribe("system", target("fn-1"), json!({})).await.unwrap();
        set.subscribe("system", target("fn-2"), json!({})).await.unwrap();
        set.shutdown().await;

        assert!(system.subscriptions().await.is_empty());
    }
}
