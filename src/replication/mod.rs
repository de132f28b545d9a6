//! Cross-replica registry convergence.
//!
//! Control-plane replicas each keep their own in-memory registries. A
//! [`ReplicationCoordinator`] mirrors registered method calls (subscribe and
//! unsubscribe) to the other replicas so every replica ends up with the same
//! subscriptions. Convergence is all it provides: exactly-once firing of
//! scheduled occurrences is the job reducer's business.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::enqueuer::{EnqueueError, EnqueuerSet};
use crate::event::Target;

/// Capacity of the in-process replication channel.
const CHANNEL_CAPACITY: usize = 1024;

/// Instance name the enqueuer set registers under.
pub const ENQUEUERS_INSTANCE: &str = "enqueuers";
pub const SUBSCRIBE: &str = "subscribe";
pub const UNSUBSCRIBE: &str = "unsubscribe";

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Method '{method}' is not registered for instance '{instance}'")]
    Unregistered { instance: String, method: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Replication channel closed")]
    Closed,
}

/// A method call mirrored to other replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedCall {
    /// Replica that made the call.
    pub origin: String,
    pub instance: String,
    pub method: String,
    pub args: serde_json::Value,
}

/// Calls from every replica (the local one included), in publish order.
pub type CallStream = BoxStream<'static, ReplicatedCall>;

#[async_trait]
pub trait ReplicationCoordinator: Send + Sync {
    fn replica_id(&self) -> &str;

    /// Declare which methods of `instance` are mirrored.
    async fn register(&self, instance: &str, methods: &[&str]) -> Result<()>;

    /// Mirror a call made locally. The method must have been registered.
    async fn publish(&self, call: ReplicatedCall) -> Result<()>;

    /// Stream of mirrored calls, starting now.
    fn incoming(&self) -> CallStream;
}

/// In-process coordinator over a broadcast channel.
///
/// Replicas created with [`ChannelCoordinator::replica`] share one channel.
pub struct ChannelCoordinator {
    replica_id: String,
    sender: broadcast::Sender<ReplicatedCall>,
    registered: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl ChannelCoordinator {
    pub fn new(replica_id: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self::with_sender(replica_id.into(), sender)
    }

    fn with_sender(replica_id: String, sender: broadcast::Sender<ReplicatedCall>) -> Self {
        Self {
            replica_id,
            sender,
            registered: Mutex::new(HashMap::new()),
        }
    }

    /// Another replica on the same channel.
    pub fn replica(&self, replica_id: impl Into<String>) -> Self {
        Self::with_sender(replica_id.into(), self.sender.clone())
    }

    fn registered(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.registered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ReplicationCoordinator for ChannelCoordinator {
    fn replica_id(&self) -> &str {
        &self.replica_id
    }

    async fn register(&self, instance: &str, methods: &[&str]) -> Result<()> {
        self.registered()
            .entry(instance.to_string())
            .or_default()
            .extend(methods.iter().map(|m| m.to_string()));
        info!(replica_id = %self.replica_id, instance = %instance, methods = ?methods, "Replicated methods registered");
        Ok(())
    }

    async fn publish(&self, call: ReplicatedCall) -> Result<()> {
        let allowed = self
            .registered()
            .get(&call.instance)
            .is_some_and(|methods| methods.contains(&call.method));
        if !allowed {
            return Err(ReplicationError::Unregistered {
                instance: call.instance,
                method: call.method,
            });
        }

        let method = call.method.clone();
        match self.sender.send(call) {
            Ok(receivers) => debug!(method = %method, receivers, "Replicated call published"),
            Err(_) => debug!(method = %method, "Replicated call published (no receivers)"),
        }
        Ok(())
    }

    fn incoming(&self) -> CallStream {
        let receiver = self.sender.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(call) => return Some((call, receiver)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Replication receiver lagged, registries may diverge");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SubscribeArgs {
    kind: String,
    target: Target,
    options: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UnsubscribeArgs {
    kind: String,
    target: Target,
}

/// Enqueuer set whose subscribe/unsubscribe calls are mirrored across replicas.
pub struct ReplicatedEnqueuers {
    set: Arc<EnqueuerSet>,
    coordinator: Arc<dyn ReplicationCoordinator>,
    applier: JoinHandle<()>,
}

impl ReplicatedEnqueuers {
    /// Register the mirrored methods and start applying remote calls.
    pub async fn new(set: Arc<EnqueuerSet>, coordinator: Arc<dyn ReplicationCoordinator>) -> Result<Self> {
        coordinator
            .register(ENQUEUERS_INSTANCE, &[SUBSCRIBE, UNSUBSCRIBE])
            .await?;
        let incoming = coordinator.incoming();
        let applier = tokio::spawn(apply_remote_calls(
            Arc::clone(&set),
            coordinator.replica_id().to_string(),
            incoming,
        ));
        Ok(Self {
            set,
            coordinator,
            applier,
        })
    }

    pub fn set(&self) -> &Arc<EnqueuerSet> {
        &self.set
    }

    pub fn replica_id(&self) -> &str {
        self.coordinator.replica_id()
    }

    /// Subscribe locally, then mirror the call.
    ///
    /// Only the local outcome is reported; a failure to mirror is logged.
    pub async fn subscribe(
        &self,
        kind: &str,
        target: Target,
        options: serde_json::Value,
    ) -> std::result::Result<(), EnqueueError> {
        self.set
            .subscribe(kind, target.clone(), options.clone())
            .await?;
        let args = SubscribeArgs {
            kind: kind.to_string(),
            target,
            options,
        };
        self.mirror(SUBSCRIBE, &args).await;
        Ok(())
    }

    /// Unsubscribe locally, then mirror the call.
    pub async fn unsubscribe(&self, kind: &str, target: &Target) -> std::result::Result<(), EnqueueError> {
        self.set.unsubscribe(kind, target).await?;
        let args = UnsubscribeArgs {
            kind: kind.to_string(),
            target: target.clone(),
        };
        self.mirror(UNSUBSCRIBE, &args).await;
        Ok(())
    }

    async fn mirror<T: Serialize>(&self, method: &str, args: &T) {
        let call = match serde_json::to_value(args) {
            Ok(args) => ReplicatedCall {
                origin: self.coordinator.replica_id().to_string(),
                instance: ENQUEUERS_INSTANCE.to_string(),
                method: method.to_string(),
                args,
            },
            Err(e) => {
                warn!(method = %method, error = %e, "Failed to encode replicated call");
                return;
            }
        };
        if let Err(e) = self.coordinator.publish(call).await {
            warn!(method = %method, error = %e, "Failed to replicate call");
        }
    }
}

/// Where subscribe/unsubscribe calls land: the local set, or the set plus
/// every peer replica.
#[derive(Clone)]
pub enum Subscriptions {
    Local(Arc<EnqueuerSet>),
    Replicated(Arc<ReplicatedEnqueuers>),
}

impl Subscriptions {
    pub fn set(&self) -> &Arc<EnqueuerSet> {
        match self {
            Subscriptions::Local(set) => set,
            Subscriptions::Replicated(replicated) => replicated.set(),
        }
    }

    pub fn is_replicated(&self) -> bool {
        matches!(self, Subscriptions::Replicated(_))
    }

    pub async fn subscribe(
        &self,
        kind: &str,
        target: Target,
        options: serde_json::Value,
    ) -> std::result::Result<(), EnqueueError> {
        match self {
            Subscriptions::Local(set) => set.subscribe(kind, target, options).await,
            Subscriptions::Replicated(replicated) => replicated.subscribe(kind, target, options).await,
        }
    }

    pub async fn unsubscribe(&self, kind: &str, target: &Target) -> std::result::Result<(), EnqueueError> {
        match self {
            Subscriptions::Local(set) => set.unsubscribe(kind, target).await,
            Subscriptions::Replicated(replicated) => replicated.unsubscribe(kind, target).await,
        }
    }
}

impl Drop for ReplicatedEnqueuers {
    fn drop(&mut self) {
        self.applier.abort();
    }
}

async fn apply_remote_calls(set: Arc<EnqueuerSet>, replica_id: String, mut incoming: CallStream) {
    while let Some(call) = incoming.next().await {
        if call.origin == replica_id || call.instance != ENQUEUERS_INSTANCE {
            continue;
        }
        let outcome = match call.method.as_str() {
            SUBSCRIBE => match serde_json::from_value::<SubscribeArgs>(call.args) {
                Ok(args) => set.subscribe(&args.kind, args.target, args.options).await,
                Err(e) => {
                    warn!(origin = %call.origin, error = %e, "Malformed replicated subscribe");
                    continue;
                }
            },
            UNSUBSCRIBE => match serde_json::from_value::<UnsubscribeArgs>(call.args) {
                Ok(args) => set.unsubscribe(&args.kind, &args.target).await,
                Err(e) => {
                    warn!(origin = %call.origin, error = %e, "Malformed replicated unsubscribe");
                    continue;
                }
            },
            other => {
                debug!(origin = %call.origin, method = %other, "Ignoring unknown replicated method");
                continue;
            }
        };

        match outcome {
            Ok(()) => debug!(origin = %call.origin, method = %call.method, "Applied replicated call"),
            Err(EnqueueError::AlreadySubscribed(target_id)) => {
                debug!(origin = %call.origin, target_id = %target_id, "Replicated subscription already present")
            }
            Err(e) => warn!(origin = %call.origin, method = %call.method, error = %e, "Failed to apply replicated call"),
        }
    }
    info!(replica_id = %replica_id, "Replication stream closed");
}

#[cfg(test)]
mod tests;
