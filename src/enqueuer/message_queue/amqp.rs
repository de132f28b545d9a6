//! AMQP (RabbitMQ) broker.
//!
//! Keeps one connection pool per broker URL; every consumer gets its own
//! channel, which lives as long as the delivery stream.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::broker::{Acknowledger, BrokerError, BrokerMessage, Delivery, DeliveryStream, MessageBroker, QueueSpec, Result};
use crate::utils::bootstrap::connect_with_retry;

/// Maximum pooled connections per broker URL.
const POOL_MAX_SIZE: usize = 10;

#[derive(Default)]
pub struct AmqpBroker {
    pools: Mutex<HashMap<String, Pool>>,
}

impl AmqpBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool(&self, url: &str) -> Result<Pool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }

        let manager = Manager::new(url.to_string(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(POOL_MAX_SIZE)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create pool: {}", e)))?;
        pools.insert(url.to_string(), pool.clone());
        Ok(pool)
    }
}

fn header_value(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::LongInt(n) => Some(n.to_string()),
        AMQPValue::LongLongInt(n) => Some(n.to_string()),
        AMQPValue::ShortInt(n) => Some(n.to_string()),
        _ => None,
    }
}

fn to_message(delivery: &lapin::message::Delivery) -> BrokerMessage {
    let headers: BTreeMap<String, String> = delivery
        .properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| header_value(value).map(|v| (key.as_str().to_string(), v)))
                .collect()
        })
        .unwrap_or_default();

    BrokerMessage {
        body: delivery.data.clone(),
        routing_key: delivery.routing_key.as_str().to_string(),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        headers,
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn consume(&self, spec: &QueueSpec) -> Result<DeliveryStream> {
        let pool = self.pool(&spec.url).await?;
        let conn = connect_with_retry("amqp", &spec.url, || async {
            pool.get().await.map_err(|e: PoolError| {
                BrokerError::Connection(format!("Failed to get connection from pool: {}", e))
            })
        })
        .await?;

        let channel = conn
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to create channel: {}", e)))?;

        if let Some(prefetch) = spec.prefetch {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|e| BrokerError::Consume(format!("Failed to set prefetch: {}", e)))?;
        }

        channel
            .queue_declare(
                &spec.queue,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to declare queue: {}", e)))?;

        let consumer_tag = format!("trigger-dispatch-{}", Uuid::new_v4());
        let consumer = channel
            .basic_consume(
                &spec.queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %spec.queue, consumer_tag = %consumer_tag, "AMQP consumer started");

        // The stream owns the channel so it stays open while deliveries flow.
        let stream = consumer.map(move |delivery| {
            let _channel = &channel;
            match delivery {
                Ok(delivery) => Ok(Delivery {
                    message: to_message(&delivery),
                    acker: Box::new(AmqpAcker {
                        acker: delivery.acker,
                    }),
                }),
                Err(e) => Err(BrokerError::Consume(e.to_string())),
            }
        });
        Ok(stream.boxed())
    }
}
