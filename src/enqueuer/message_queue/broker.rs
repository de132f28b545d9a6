//! Broker abstraction for the message-queue enqueuer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("Acknowledge error: {0}")]
    Acknowledge(String),
}

/// Queue to consume and how to declare it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub url: String,
    pub queue: String,
    pub durable: bool,
    pub exclusive: bool,
    pub prefetch: Option<u16>,
}

/// A delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerMessage {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub message: BrokerMessage,
    pub acker: Box<dyn Acknowledger>,
}

/// Deliveries for one consumer. Dropping the stream cancels the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare the queue and start consuming from it.
    async fn consume(&self, spec: &QueueSpec) -> Result<DeliveryStream>;
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Nacked { requeue: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub queue: String,
    pub delivery_tag: u64,
    pub settlement: Settlement,
}

type QueueKey = (String, String);

#[derive(Default)]
struct InMemoryQueue {
    spec: Option<QueueSpec>,
    backlog: VecDeque<BrokerMessage>,
    consumers: Vec<mpsc::UnboundedSender<Result<Delivery>>>,
    next_consumer: usize,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<QueueKey, InMemoryQueue>,
    settlements: Vec<SettlementRecord>,
    next_tag: u64,
    unreachable: bool,
}

/// Process-local broker for tests and standalone mode.
///
/// Messages published before a consumer attaches are buffered. Several
/// consumers on one queue share its messages round-robin. A nack with requeue
/// redelivers the message to the next consumer.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a message to `queue` on `url`.
    pub fn publish(&self, url: &str, queue: &str, body: impl Into<Vec<u8>>, headers: BTreeMap<String, String>) {
        let mut state = self.lock();
        state.next_tag += 1;
        let message = BrokerMessage {
            body: body.into(),
            routing_key: queue.to_string(),
            content_type: None,
            headers,
            delivery_tag: state.next_tag,
            redelivered: false,
        };
        self.deliver(&mut state, (url.to_string(), queue.to_string()), message);
    }

    fn deliver(&self, state: &mut BrokerState, key: QueueKey, message: BrokerMessage) {
        let entry = state.queues.entry(key.clone()).or_default();
        entry.consumers.retain(|consumer| !consumer.is_closed());
        while !entry.consumers.is_empty() {
            let index = entry.next_consumer % entry.consumers.len();
            let delivery = Delivery {
                message: message.clone(),
                acker: Box::new(InMemoryAcker {
                    broker: self.clone(),
                    key: key.clone(),
                    message: message.clone(),
                }),
            };
            if entry.consumers[index].unbounded_send(Ok(delivery)).is_ok() {
                entry.next_consumer = index + 1;
                return;
            }
            entry.consumers.remove(index);
        }
        entry.backlog.push_back(message);
    }

    /// Terminate every consumer on `queue` with an error.
    pub fn fail_consumer(&self, url: &str, queue: &str, message: &str) {
        let mut state = self.lock();
        if let Some(entry) = state.queues.get_mut(&(url.to_string(), queue.to_string())) {
            for consumer in entry.consumers.drain(..) {
                let _ = consumer.unbounded_send(Err(BrokerError::Consume(message.to_string())));
            }
        }
    }

    /// Make subsequent `consume` calls fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Declaration of `queue` as last requested by a consumer.
    pub fn declared(&self, url: &str, queue: &str) -> Option<QueueSpec> {
        self.lock()
            .queues
            .get(&(url.to_string(), queue.to_string()))
            .and_then(|entry| entry.spec.clone())
    }

    /// Whether a consumer is attached to `queue`.
    pub fn has_consumer(&self, url: &str, queue: &str) -> bool {
        self.consumer_count(url, queue) > 0
    }

    /// Live consumers attached to `queue`.
    pub fn consumer_count(&self, url: &str, queue: &str) -> usize {
        self.lock()
            .queues
            .get(&(url.to_string(), queue.to_string()))
            .map(|entry| entry.consumers.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }

    /// Every settlement so far, in order.
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.lock().settlements.clone()
    }

    /// Messages buffered on `queue` without a consumer.
    pub fn backlog(&self, url: &str, queue: &str) -> usize {
        self.lock()
            .queues
            .get(&(url.to_string(), queue.to_string()))
            .map(|entry| entry.backlog.len())
            .unwrap_or(0)
    }

    fn settle(&self, key: &QueueKey, message: &BrokerMessage, settlement: Settlement) {
        let mut state = self.lock();
        state.settlements.push(SettlementRecord {
            queue: key.1.clone(),
            delivery_tag: message.delivery_tag,
            settlement,
        });
        if settlement == (Settlement::Nacked { requeue: true }) {
            let redelivery = BrokerMessage {
                redelivered: true,
                ..message.clone()
            };
            self.deliver(&mut state, key.clone(), redelivery);
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn consume(&self, spec: &QueueSpec) -> Result<DeliveryStream> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(BrokerError::Connection(format!("{} is unreachable", spec.url)));
        }

        let key = (spec.url.clone(), spec.queue.clone());
        let (tx, rx) = mpsc::unbounded();
        let entry = state.queues.entry(key.clone()).or_default();
        entry.spec = Some(spec.clone());
        entry.consumers.push(tx);

        let backlog: Vec<_> = entry.backlog.drain(..).collect();
        for message in backlog {
            self.deliver(&mut state, key.clone(), message);
        }
        Ok(rx.boxed())
    }
}

struct InMemoryAcker {
    broker: InMemoryBroker,
    key: QueueKey,
    message: BrokerMessage,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.broker.settle(&self.key, &self.message, Settlement::Acked);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.broker
            .settle(&self.key, &self.message, Settlement::Nacked { requeue });
        Ok(())
    }
}
