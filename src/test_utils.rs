//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::event::{Event, EventType, Target};
use crate::queue::EventQueue;
use crate::utils::clock::{saturating_add, Clock};

/// Target whose cwd and handler derive from `id`.
pub fn target(id: &str) -> Target {
    Target::new(id, format!("/functions/{}", id), "default")
}

/// System event addressed to `target(id)`.
pub fn make_event(id: &str) -> Event {
    Event::new(target(id), EventType::System, br#"{"name":"READY"}"#.to_vec())
}

/// Fixed wall-clock origin for time-sensitive tests.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Drain every event currently pending in `queue` without parking.
pub async fn drain(queue: &EventQueue) -> Vec<Event> {
    let mut events = Vec::new();
    while queue.size() > 0 {
        match queue.pop("test-drain").await {
            Some(event) => events.push(event),
            None => break,
        }
    }
    events
}

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = saturating_add(*now, by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
