//! Message-queue enqueuer.
//!
//! Each subscription runs one consumer on its queue. Every delivery becomes
//! an event; the delivery's acknowledger is parked under the event id until
//! the worker's ack or error comes back through the queue's completion
//! channel, which settles the delivery with the broker (ack, or nack with the
//! subscription's requeue policy).
//!
//! Once the queue is closed the consumer stops and nacks the refused delivery
//! with requeue. Unsubscribing drops
//! the target's unsettled acknowledgers; the broker takes those deliveries
//! back when the consumer's channel goes away.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{parse_options, EnqueueError, Enqueuer, Result};
use crate::event::{Event, EventType, Target};
use crate::queue::{Completion, EventQueue, Outcome};
use crate::registry::{TargetKey, TargetRegistry};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod broker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use broker::{
    Acknowledger, BrokerError, BrokerMessage, Delivery, DeliveryStream, InMemoryBroker, MessageBroker, QueueSpec,
};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageQueueOptions {
    /// Broker URL; the enqueuer's default when absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(alias = "queueName")]
    pub queue: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub prefetch: Option<u16>,
    /// Requeue the delivery when the worker reports an error.
    #[serde(default)]
    pub requeue_on_error: bool,
}

/// Payload carried by message-queue events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub queue: String,
    pub routing_key: String,
    /// Base64-encoded message body.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

impl QueueMessage {
    pub fn decode_body(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body)
    }
}

struct PendingAck {
    acker: Box<dyn Acknowledger>,
    requeue_on_error: bool,
    target: TargetKey,
}

type PendingAcks = Arc<Mutex<HashMap<String, PendingAck>>>;

fn lock_acks(acks: &PendingAcks) -> MutexGuard<'_, HashMap<String, PendingAck>> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}

type Subscriptions = TargetRegistry<MessageQueueOptions, JoinHandle<()>>;

pub struct MessageQueueEnqueuer {
    queue: Arc<EventQueue>,
    broker: Arc<dyn MessageBroker>,
    default_url: Option<String>,
    subscriptions: Mutex<Subscriptions>,
    pending: PendingAcks,
    relay: JoinHandle<()>,
}

impl MessageQueueEnqueuer {
    /// Create the enqueuer and start relaying completions to the broker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(queue: Arc<EventQueue>, broker: Arc<dyn MessageBroker>) -> Self {
        let pending = PendingAcks::default();
        let relay = tokio::spawn(relay_completions(queue.subscribe_completions(), Arc::clone(&pending)));
        Self {
            queue,
            broker,
            default_url: None,
            subscriptions: Mutex::new(Subscriptions::new()),
            pending,
            relay,
        }
    }

    /// Broker URL for subscriptions that do not name one.
    pub fn with_default_url(mut self, url: impl Into<String>) -> Self {
        self.default_url = Some(url.into());
        self
    }

    /// Deliveries handed to workers and not yet settled.
    pub fn unsettled(&self) -> usize {
        lock_acks(&self.pending).len()
    }

    fn registry(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn relay_completions(mut completions: broadcast::Receiver<Completion>, pending: PendingAcks) {
    loop {
        let completion = match completions.recv().await {
            Ok(completion) => completion,
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(skipped = count, "Broker completion relay lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let Some(ack) = lock_acks(&pending).remove(&completion.event_id) else {
            continue;
        };
        let settled = match &completion.outcome {
            Outcome::Acked => ack.acker.ack().await,
            Outcome::Failed(_) => ack.acker.nack(ack.requeue_on_error).await,
        };
        match settled {
            Ok(()) => debug!(
                event_id = %completion.event_id,
                target_id = %ack.target,
                outcome = ?completion.outcome,
                "Delivery settled"
            ),
            Err(e) => warn!(
                event_id = %completion.event_id,
                target_id = %ack.target,
                error = %e,
                "Failed to settle delivery"
            ),
        }
    }
}

struct Consumer {
    target: Target,
    queue_name: String,
    requeue_on_error: bool,
    deliveries: DeliveryStream,
    queue: Arc<EventQueue>,
    pending: PendingAcks,
}

impl Consumer {
    async fn run(mut self) {
        while let Some(delivery) = self.deliveries.next().await {
            match delivery {
                Ok(delivery) => {
                    if let Some(refused) = self.handle(delivery) {
                        // The queue is closed: stop consuming, then hand the
                        // delivery back so another consumer can take it.
                        let Consumer { target, deliveries, .. } = self;
                        drop(deliveries);
                        if let Err(e) = refused.nack(true).await {
                            warn!(target_id = %target.id, error = %e, "Failed to return refused delivery");
                        }
                        info!(target_id = %target.id, "Event queue closed, broker consumer stopped");
                        return;
                    }
                }
                Err(e) => {
                    error!(
                        target_id = %self.target.id,
                        queue = %self.queue_name,
                        error = %e,
                        "Broker consumer failed, subscription closed"
                    );
                    return;
                }
            }
        }
        warn!(target_id = %self.target.id, queue = %self.queue_name, "Broker consumer ended");
    }

    /// Turn a delivery into an event. Hands the acknowledger back when the
    /// queue refuses the event.
    fn handle(&self, delivery: Delivery) -> Option<Box<dyn Acknowledger>> {
        let Delivery { message, acker } = delivery;
        let payload = QueueMessage {
            queue: self.queue_name.clone(),
            routing_key: message.routing_key,
            body: BASE64.encode(&message.body),
            content_type: message.content_type,
            headers: message.headers,
            delivery_tag: message.delivery_tag,
            redelivered: message.redelivered,
        };
        let event = match Event::with_json(self.target.clone(), EventType::MessageQueue, &payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(target_id = %self.target.id, error = %e, "Failed to encode broker event");
                return None;
            }
        };

        let event_id = event.id().to_string();
        lock_acks(&self.pending).insert(
            event_id.clone(),
            PendingAck {
                acker,
                requeue_on_error: self.requeue_on_error,
                target: TargetKey::from(&self.target),
            },
        );
        if self.queue.enqueue(event).is_err() {
            return lock_acks(&self.pending).remove(&event_id).map(|ack| ack.acker);
        }
        debug!(
            event_id = %event_id,
            target_id = %self.target.id,
            queue = %self.queue_name,
            delivery_tag = payload.delivery_tag,
            "Broker delivery dispatched"
        );
        None
    }
}

#[async_trait]
impl Enqueuer for MessageQueueEnqueuer {
    fn kind(&self) -> EventType {
        EventType::MessageQueue
    }

    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()> {
        let options: MessageQueueOptions = parse_options(EventType::MessageQueue, options)?;
        if options.queue.trim().is_empty() {
            return Err(EnqueueError::invalid(EventType::MessageQueue, "queue must not be empty"));
        }
        let Some(url) = options.url.clone().or_else(|| self.default_url.clone()) else {
            return Err(EnqueueError::invalid(
                EventType::MessageQueue,
                "no broker url given and no default configured",
            ));
        };

        self.registry().ensure_vacant(&target)?;

        let spec = QueueSpec {
            url,
            queue: options.queue.clone(),
            durable: options.durable,
            exclusive: options.exclusive,
            prefetch: options.prefetch,
        };
        let deliveries = self
            .broker
            .consume(&spec)
            .await
            .map_err(|e| EnqueueError::Transport(e.to_string()))?;

        let mut subscriptions = self.registry();
        // A concurrent subscribe for the same target may have won while we
        // were connecting; the dropped stream cancels our consumer.
        subscriptions.ensure_vacant(&target)?;

        let consumer = Consumer {
            target: target.clone(),
            queue_name: options.queue.clone(),
            requeue_on_error: options.requeue_on_error,
            deliveries,
            queue: Arc::clone(&self.queue),
            pending: Arc::clone(&self.pending),
        };
        let task = tokio::spawn(consumer.run());

        let target_id = target.id.clone();
        subscriptions.insert(target, options, task)?;
        info!(target_id = %target_id, queue = %spec.queue, "Subscribed to message queue");
        Ok(())
    }

    async fn unsubscribe(&self, target: &Target) {
        let removed = self.registry().remove(target);
        if let Some(entry) = removed {
            entry.resource.abort();
            let key = TargetKey::from(target);
            let mut pending = lock_acks(&self.pending);
            let before = pending.len();
            pending.retain(|_, ack| ack.target != key);
            info!(
                target_id = %target.id,
                queue = %entry.options.queue,
                dropped_unsettled = before - pending.len(),
                "Unsubscribed from message queue"
            );
        }
    }

    async fn subscriptions(&self) -> Vec<Target> {
        self.registry()
            .entries()
            .map(|entry| entry.target.clone())
            .collect()
    }
}

impl Drop for MessageQueueEnqueuer {
    fn drop(&mut self) {
        self.relay.abort();
        for entry in self.registry().drain() {
            entry.resource.abort();
        }
    }
}
