//! Wall-clock sources.
//!
//! Cron occurrences and claim windows are computed in wall-clock time, while
//! sleeping uses tokio's timer. `TokioClock` ties the two together so that
//! tests running with a paused tokio clock see wall time advance with it.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Reads the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock anchored to tokio's (possibly paused) monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall: DateTime<Utc>,
    instant: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor `wall` to the current tokio instant.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self {
            wall,
            instant: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(self.instant);
        chrono::Duration::from_std(elapsed)
            .ok()
            .and_then(|elapsed| self.wall.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Sleep until `clock` reads at least `deadline`.
///
/// Re-checks after waking, since the wall clock and tokio's timer may drift.
pub async fn sleep_until(clock: &dyn Clock, deadline: DateTime<Utc>) {
    loop {
        let remaining = deadline - clock.now();
        match remaining.to_std() {
            Ok(duration) if !duration.is_zero() => tokio::time::sleep(duration).await,
            _ => return,
        }
    }
}

/// `time + duration`, saturating at the representable bounds.
pub fn saturating_add(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `time - duration`, saturating at the representable bounds.
pub fn saturating_sub(time: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| time.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::starting_at(start);

        tokio::time::advance(Duration::from_secs(90)).await;

        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_until_wakes_at_deadline() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TokioClock::starting_at(start);
        let deadline = start + chrono::Duration::seconds(30);

        sleep_until(&clock, deadline).await;

        assert!(clock.now() >= deadline);
    }

    #[test]
    fn test_saturating_arithmetic() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            saturating_add(start, Duration::from_secs(60)),
            start + chrono::Duration::seconds(60)
        );
        assert_eq!(
            saturating_sub(start, Duration::from_secs(60)),
            start - chrono::Duration::seconds(60)
        );
        assert_eq!(saturating_add(start, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_sleep_until_past_deadline_returns_immediately() {
        let clock = SystemClock;
        let deadline = clock.now() - chrono::Duration::seconds(5);
        tokio::time::timeout(Duration::from_millis(100), sleep_until(&clock, deadline))
            .await
            .unwrap();
    }
}
