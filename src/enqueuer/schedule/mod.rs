//! Schedule enqueuer - cron-driven triggers.
//!
//! Every subscription owns a timer task that sleeps until the next cron
//! occurrence in the subscription's timezone. When a [`JobReducer`] is
//! configured the tick first claims a job id derived from the target and the
//! occurrence, so that of all replicas running the same schedule exactly one
//! enqueues it.
//!
//! Timers carry the generation they were started with. A tick only enqueues
//! if its generation is still the one registered for the target, checked
//! under the registry lock, so a tick racing an unsubscribe never fires.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_options, DispatchContext, EnqueueError, Enqueuer, Result};
use crate::event::{Event, EventType, Target};
use crate::queue::EventQueue;
use crate::reducer::JobReducer;
use crate::registry::{TargetKey, TargetRegistry};
use crate::utils::clock::{sleep_until, Clock};

pub mod cron;

pub use cron::{CronError, CronSchedule};

/// Namespace for schedule job ids.
const SCHEDULE_JOB_NAMESPACE: Uuid = Uuid::from_bytes([
    0x3c, 0x1f, 0x8e, 0x52, 0x6a, 0x0d, 0x4b, 0x7e, 0x9a, 0x41, 0x2d, 0xc8, 0x55, 0x07, 0xe3, 0x19,
]);

/// Deterministic job id for one occurrence of one target's schedule.
///
/// Every replica computes the same id for the same occurrence.
pub fn job_id(target: &Target, occurrence: DateTime<Utc>) -> String {
    let name = format!("{}@{}", TargetKey::from(target), occurrence.timestamp());
    Uuid::new_v5(&SCHEDULE_JOB_NAMESPACE, name.as_bytes()).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOptions {
    /// Cron expression.
    pub frequency: String,
    /// IANA timezone name; the enqueuer's default when absent.
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Payload carried by schedule events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTick {
    pub frequency: String,
    pub timezone: String,
    pub scheduled_at: DateTime<Utc>,
    pub job_id: String,
}

struct Timer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    registry: TargetRegistry<ScheduleOptions, Timer>,
    next_generation: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct ScheduleEnqueuer {
    queue: Arc<EventQueue>,
    reducer: Option<Arc<JobReducer>>,
    clock: Arc<dyn Clock>,
    default_timezone: Tz,
    inner: Arc<Mutex<Inner>>,
}

impl ScheduleEnqueuer {
    pub fn new(context: &DispatchContext) -> Self {
        Self {
            queue: Arc::clone(&context.queue),
            reducer: context.reducer.clone(),
            clock: Arc::clone(&context.clock),
            default_timezone: Tz::UTC,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Timezone used by subscriptions that do not name one.
    pub fn with_default_timezone(mut self, timezone: Tz) -> Self {
        self.default_timezone = timezone;
        self
    }
}

/// Everything a timer task needs; cloned out of the enqueuer.
struct TimerContext {
    target: Target,
    schedule: CronSchedule,
    timezone: Tz,
    generation: u64,
    queue: Arc<EventQueue>,
    reducer: Option<Arc<JobReducer>>,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
}

impl TimerContext {
    fn is_current(&self, inner: &Inner) -> bool {
        inner
            .registry
            .get(&TargetKey::from(&self.target))
            .is_some_and(|entry| entry.resource.generation == self.generation)
    }

    async fn run(self) {
        let mut after = self.clock.now();
        loop {
            let Some(occurrence) = self.schedule.next_after(after, &self.timezone) else {
                warn!(
                    target_id = %self.target.id,
                    frequency = %self.schedule,
                    "Schedule has no further occurrences, timer stopped"
                );
                return;
            };

            sleep_until(self.clock.as_ref(), occurrence).await;
            after = occurrence;

            let current = self.is_current(&lock(&self.inner));
            if !current {
                return;
            }
            self.tick(occurrence).await;
        }
    }

    async fn tick(&self, occurrence: DateTime<Utc>) {
        let job_id = job_id(&self.target, occurrence);

        if let Some(reducer) = &self.reducer {
            let metadata = serde_json::json!({
                "targetId": self.target.id,
                "scheduledAt": occurrence,
            });
            match reducer.claim(&job_id, metadata).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(target_id = %self.target.id, job_id = %job_id, "Occurrence claimed by another replica");
                    return;
                }
                Err(e) => {
                    warn!(
                        target_id = %self.target.id,
                        job_id = %job_id,
                        error = %e,
                        "Claim failed, skipping occurrence"
                    );
                    return;
                }
            }
        }

        let payload = ScheduledTick {
            frequency: self.schedule.source().to_string(),
            timezone: self.timezone.name().to_string(),
            scheduled_at: occurrence,
            job_id,
        };
        let event = match Event::with_json(self.target.clone(), EventType::Schedule, &payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(target_id = %self.target.id, error = %e, "Failed to encode schedule event");
                return;
            }
        };

        let inner = lock(&self.inner);
        if !self.is_current(&inner) {
            debug!(target_id = %self.target.id, "Timer stopped during tick, dropping occurrence");
            return;
        }
        if self.queue.enqueue(event).is_ok() {
            debug!(target_id = %self.target.id, scheduled_at = %occurrence, "Schedule fired");
        }
    }
}

#[async_trait]
impl Enqueuer for ScheduleEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Schedule
    }

    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()> {
        let options: ScheduleOptions = parse_options(EventType::Schedule, options)?;
        let schedule = CronSchedule::from_str(&options.frequency)
            .map_err(|e| EnqueueError::invalid(EventType::Schedule, e))?;
        let timezone = match options.timezone.as_deref() {
            Some(name) => Tz::from_str(name.trim())
                .map_err(|_| EnqueueError::invalid(EventType::Schedule, format!("unknown timezone '{}'", name)))?,
            None => self.default_timezone,
        };
        if schedule.next_after(self.clock.now(), &timezone).is_none() {
            return Err(EnqueueError::invalid(
                EventType::Schedule,
                format!("'{}' never fires", schedule),
            ));
        }

        let mut inner = lock(&self.inner);
        inner.registry.ensure_vacant(&target)?;

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let timer = TimerContext {
            target: target.clone(),
            schedule,
            timezone,
            generation,
            queue: Arc::clone(&self.queue),
            reducer: self.reducer.clone(),
            clock: Arc::clone(&self.clock),
            inner: Arc::clone(&self.inner),
        };
        let task = tokio::spawn(timer.run());

        let target_id = target.id.clone();
        inner.registry.insert(target, options.clone(), Timer { generation, task })?;
        info!(
            target_id = %target_id,
            frequency = %options.frequency,
            timezone = %timezone.name(),
            "Subscribed to schedule"
        );
        Ok(())
    }

    async fn unsubscribe(&self, target: &Target) {
        let removed = lock(&self.inner).registry.remove(target);
        if let Some(entry) = removed {
            entry.resource.task.abort();
            info!(target_id = %target.id, "Unsubscribed from schedule");
        }
    }

    async fn subscriptions(&self) -> Vec<Target> {
        lock(&self.inner)
            .registry
            .entries()
            .map(|entry| entry.target.clone())
            .collect()
    }
}

impl Drop for ScheduleEnqueuer {
    fn drop(&mut self) {
        for entry in lock(&self.inner).registry.drain() {
            entry.resource.task.abort();
        }
    }
}
