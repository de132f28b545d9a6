//! Invocation events and the targets they address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proto;

/// A function handler eligible to receive invocation events.
///
/// Two targets with the same `id` are the same subscription, regardless of
/// where they were constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Stable identity used for unsubscription and cross-replica coordination.
    pub id: String,
    /// Working directory of the executable unit.
    pub cwd: String,
    /// Exported handler name inside `cwd`.
    pub handler: String,
}

impl Target {
    pub fn new(id: impl Into<String>, cwd: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            cwd: cwd.into(),
            handler: handler.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}#{})", self.id, self.cwd, self.handler)
    }
}

/// Trigger kind that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Http,
    Database,
    Schedule,
    System,
    MessageQueue,
    Socket,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::Http,
        EventType::Database,
        EventType::Schedule,
        EventType::System,
        EventType::MessageQueue,
        EventType::Socket,
    ];

    /// Canonical kind name used in subscription requests and replication.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Http => "http",
            EventType::Database => "database",
            EventType::Schedule => "schedule",
            EventType::System => "system",
            EventType::MessageQueue => "message_queue",
            EventType::Socket => "socket",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(EventType::Http),
            "database" => Ok(EventType::Database),
            "schedule" => Ok(EventType::Schedule),
            "system" => Ok(EventType::System),
            "message_queue" | "rabbitmq" => Ok(EventType::MessageQueue),
            "socket" | "firehose" => Ok(EventType::Socket),
            other => Err(format!("unknown trigger kind: {}", other)),
        }
    }
}

impl From<EventType> for proto::EventType {
    fn from(kind: EventType) -> Self {
        match kind {
            EventType::Http => proto::EventType::Http,
            EventType::Database => proto::EventType::Database,
            EventType::Schedule => proto::EventType::Schedule,
            EventType::System => proto::EventType::System,
            EventType::MessageQueue => proto::EventType::MessageQueue,
            EventType::Socket => proto::EventType::Socket,
        }
    }
}

impl From<proto::EventType> for EventType {
    fn from(kind: proto::EventType) -> Self {
        match kind {
            proto::EventType::Http => EventType::Http,
            proto::EventType::Database => EventType::Database,
            proto::EventType::Schedule => EventType::Schedule,
            proto::EventType::System => EventType::System,
            proto::EventType::MessageQueue => EventType::MessageQueue,
            proto::EventType::Socket => EventType::Socket,
        }
    }
}

/// The immutable unit of work handed to workers.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: String,
    target: Target,
    event_type: EventType,
    payload: Vec<u8>,
}

impl Event {
    /// Create an event with a freshly generated id.
    pub fn new(target: Target, event_type: EventType, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            event_type,
            payload,
        }
    }

    /// Create an event whose payload is the JSON encoding of `payload`.
    pub fn with_json<T: Serialize>(
        target: Target,
        event_type: EventType,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(target, event_type, serde_json::to_vec(payload)?))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload as JSON.
    pub fn json_payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

impl From<Event> for proto::Event {
    fn from(event: Event) -> Self {
        proto::Event {
            id: event.id,
            target: Some(proto::Target {
                cwd: event.target.cwd,
                handler: event.target.handler,
                id: String::new(),
            }),
            r#type: proto::EventType::from(event.event_type) as i32,
            payload: event.payload,
        }
    }
}

impl From<proto::Target> for Target {
    fn from(target: proto::Target) -> Self {
        Target::new(target.id, target.cwd, target.handler)
    }
}

impl From<Target> for proto::Target {
    fn from(target: Target) -> Self {
        proto::Target {
            cwd: target.cwd,
            handler: target.handler,
            id: target.id,
        }
    }
}
