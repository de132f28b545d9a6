//! Socket-fanout enqueuer.
//!
//! Host adapters (a websocket server, a test harness) attach client sockets
//! to a [`SocketHub`] through the enqueuer. Lifecycle changes and incoming
//! client messages become events; workers talk back through the hub with
//! send, broadcast and close calls arriving over the worker transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_options, EnqueueError, Enqueuer, Result};
use crate::event::{Event, EventType, Target};
use crate::queue::EventQueue;
use crate::registry::TargetRegistry;

/// Frames buffered per client before sends start failing.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

pub const CONNECTION: &str = "connection";
pub const DISCONNECT: &str = "disconnect";
/// Matches every client message (not lifecycle changes).
pub const ANY_MESSAGE: &str = "**";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SocketError {
    #[error("Unknown socket client: {0}")]
    UnknownClient(String),

    #[error("Outbound buffer full for socket client: {0}")]
    Backpressure(String),
}

/// Frame pushed to a client's outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Message { name: String, data: Vec<u8> },
    Close,
}

struct Client {
    remote_address: String,
    outbound: mpsc::Sender<SocketFrame>,
}

/// Open client sockets, independent of any subscription.
#[derive(Clone)]
pub struct SocketHub {
    clients: Arc<Mutex<HashMap<String, Client>>>,
    buffer: usize,
}

impl Default for SocketHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_OUTBOUND_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            clients: Arc::default(),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Client>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client and return its id and outbound frames.
    pub fn attach(&self, remote_address: impl Into<String>) -> (String, mpsc::Receiver<SocketFrame>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().insert(
            client_id.clone(),
            Client {
                remote_address: remote_address.into(),
                outbound: tx,
            },
        );
        (client_id, rx)
    }

    /// Forget a client, returning its remote address.
    pub fn detach(&self, client_id: &str) -> Option<String> {
        self.lock().remove(client_id).map(|client| client.remote_address)
    }

    /// Forget every client, ending their outbound channels.
    pub fn detach_all(&self) -> usize {
        let mut clients = self.lock();
        let detached = clients.len();
        clients.clear();
        detached
    }

    pub fn remote_address(&self, client_id: &str) -> Option<String> {
        self.lock().get(client_id).map(|client| client.remote_address.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    /// Number of open clients.
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Send a named message to one client.
    pub fn send(&self, client_id: &str, name: &str, data: Vec<u8>) -> std::result::Result<(), SocketError> {
        let clients = self.lock();
        let client = clients
            .get(client_id)
            .ok_or_else(|| SocketError::UnknownClient(client_id.to_string()))?;
        let frame = SocketFrame::Message {
            name: name.to_string(),
            data,
        };
        client.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SocketError::Backpressure(client_id.to_string()),
            mpsc::error::TrySendError::Closed(_) => SocketError::UnknownClient(client_id.to_string()),
        })
    }

    /// Send a named message to every client; returns how many accepted it.
    pub fn broadcast(&self, name: &str, data: &[u8]) -> usize {
        let clients = self.lock();
        let mut delivered = 0;
        for (client_id, client) in clients.iter() {
            let frame = SocketFrame::Message {
                name: name.to_string(),
                data: data.to_vec(),
            };
            match client.outbound.try_send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(client_id = %client_id, error = %e, "Socket broadcast dropped"),
            }
        }
        delivered
    }

    /// Ask the host adapter to close a client's socket.
    ///
    /// The client stays attached until the adapter reports the disconnect.
    pub fn close(&self, client_id: &str) -> std::result::Result<(), SocketError> {
        let clients = self.lock();
        let client = clients
            .get(client_id)
            .ok_or_else(|| SocketError::UnknownClient(client_id.to_string()))?;
        // A full buffer still gets the close once the adapter drains it.
        if let Err(mpsc::error::TrySendError::Full(frame)) = client.outbound.try_send(SocketFrame::Close) {
            let outbound = client.outbound.clone();
            tokio::spawn(async move {
                let _ = outbound.send(frame).await;
            });
        }
        Ok(())
    }
}

/// Which socket signal a subscription listens for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SocketTrigger {
    Connection,
    Disconnect,
    AnyMessage,
    Message(String),
}

impl TryFrom<String> for SocketTrigger {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let value = value.trim();
        match value {
            "" => Err("event must not be empty".to_string()),
            CONNECTION => Ok(SocketTrigger::Connection),
            DISCONNECT => Ok(SocketTrigger::Disconnect),
            ANY_MESSAGE => Ok(SocketTrigger::AnyMessage),
            name => Ok(SocketTrigger::Message(name.to_string())),
        }
    }
}

impl From<SocketTrigger> for String {
    fn from(trigger: SocketTrigger) -> Self {
        match trigger {
            SocketTrigger::Connection => CONNECTION.to_string(),
            SocketTrigger::Disconnect => DISCONNECT.to_string(),
            SocketTrigger::AnyMessage => ANY_MESSAGE.to_string(),
            SocketTrigger::Message(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketOptions {
    pub event: SocketTrigger,
}

enum Signal<'a> {
    Connection,
    Disconnect,
    Message { name: &'a str, data: &'a [u8] },
}

impl SocketTrigger {
    fn matches(&self, signal: &Signal<'_>) -> bool {
        match (self, signal) {
            (SocketTrigger::Connection, Signal::Connection) => true,
            (SocketTrigger::Disconnect, Signal::Disconnect) => true,
            (SocketTrigger::AnyMessage, Signal::Message { .. }) => true,
            (SocketTrigger::Message(wanted), Signal::Message { name, .. }) => wanted == name,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketClient {
    pub id: String,
    pub remote_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketPool {
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketMessage {
    pub name: String,
    /// Base64-encoded message data.
    pub data: String,
}

impl SocketMessage {
    pub fn decode_data(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.data)
    }
}

/// Payload carried by socket events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketPayload {
    pub client: SocketClient,
    pub pool: SocketPool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<SocketMessage>,
}

pub struct SocketEnqueuer {
    queue: Arc<EventQueue>,
    hub: SocketHub,
    registry: Mutex<TargetRegistry<SocketOptions, ()>>,
}

impl SocketEnqueuer {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self::with_hub(queue, SocketHub::new())
    }

    pub fn with_hub(queue: Arc<EventQueue>, hub: SocketHub) -> Self {
        Self {
            queue,
            hub,
            registry: Mutex::new(TargetRegistry::new()),
        }
    }

    pub fn hub(&self) -> &SocketHub {
        &self.hub
    }

    fn registry(&self) -> MutexGuard<'_, TargetRegistry<SocketOptions, ()>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a client socket; fires `connection` subscriptions.
    pub fn connect(&self, remote_address: impl Into<String>) -> (String, mpsc::Receiver<SocketFrame>) {
        let remote_address = remote_address.into();
        let (client_id, frames) = self.hub.attach(remote_address.clone());
        info!(client_id = %client_id, remote_address = %remote_address, "Socket client connected");
        self.fan_out(&client_id, &remote_address, Signal::Connection);
        (client_id, frames)
    }

    /// Turn a client message into events; returns how many were enqueued.
    pub fn receive(&self, client_id: &str, name: &str, data: &[u8]) -> std::result::Result<usize, SocketError> {
        let remote_address = self
            .hub
            .remote_address(client_id)
            .ok_or_else(|| SocketError::UnknownClient(client_id.to_string()))?;
        Ok(self.fan_out(client_id, &remote_address, Signal::Message { name, data }))
    }

    /// Detach a client socket; fires `disconnect` subscriptions.
    pub fn disconnect(&self, client_id: &str) {
        let Some(remote_address) = self.hub.detach(client_id) else {
            return;
        };
        info!(client_id = %client_id, "Socket client disconnected");
        self.fan_out(client_id, &remote_address, Signal::Disconnect);
    }

    fn fan_out(&self, client_id: &str, remote_address: &str, signal: Signal<'_>) -> usize {
        let payload = SocketPayload {
            client: SocketClient {
                id: client_id.to_string(),
                remote_address: remote_address.to_string(),
            },
            pool: SocketPool { size: self.hub.size() },
            message: match &signal {
                Signal::Message { name, data } => Some(SocketMessage {
                    name: name.to_string(),
                    data: BASE64.encode(data),
                }),
                _ => None,
            },
        };

        let registry = self.registry();
        let mut enqueued = 0;
        for entry in registry.entries().filter(|e| e.options.event.matches(&signal)) {
            match Event::with_json(entry.target.clone(), EventType::Socket, &payload) {
                Ok(event) => {
                    debug!(event_id = %event.id(), target_id = %entry.target.id, client_id = %client_id, "Socket event dispatched");
                    if self.queue.enqueue(event).is_ok() {
                        enqueued += 1;
                    }
                }
                Err(e) => warn!(target_id = %entry.target.id, error = %e, "Failed to encode socket event"),
            }
        }
        enqueued
    }
}

#[async_trait]
impl Enqueuer for SocketEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Socket
    }

    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()> {
        let options: SocketOptions = parse_options(EventType::Socket, options)?;
        let event = String::from(options.event.clone());
        let target_id = target.id.clone();
        self.registry()
            .insert(target, options, ())
            .map_err(EnqueueError::from)?;
        info!(target_id = %target_id, event = %event, "Subscribed to socket events");
        Ok(())
    }

    async fn unsubscribe(&self, target: &Target) {
        if self.registry().remove(target).is_some() {
            info!(target_id = %target.id, "Unsubscribed from socket events");
        }
    }

    async fn subscriptions(&self) -> Vec<Target> {
        self.registry()
            .entries()
            .map(|entry| entry.target.clone())
            .collect()
    }

    async fn shutdown(&self) {
        let targets = self.registry().drain();
        let detached = self.hub.detach_all();
        info!(subscriptions = targets.len(), detached_clients = detached, "Socket enqueuer shut down");
    }
}
