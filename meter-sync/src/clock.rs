use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::time::Instant;

/// Source of wall-clock time.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's real-time clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall time derived from tokio's monotonic clock, starting at `origin_wall`.
///
/// Follows `tokio::time::pause`/`advance`, which makes schedules testable.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
}

impl MonotonicClock {
    pub fn starting_at(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin: Instant::now(),
        }
    }
}

impl WallClock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::MAX);
        self.origin_wall + elapsed
    }
}

/// One scheduled sampling instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Position in the schedule, counted from the anchor.
    pub index: u64,
    /// Scheduled wall time; readings are stamped with this, not with arrival time.
    pub at: DateTime<Utc>,
}

/// Fixed-period schedule `anchor + n * period`, checked against the wall clock.
///
/// Each wait is recomputed from the absolute target, so per-tick jitter never
/// accumulates. When the loop falls more than one period behind (host suspend,
/// clock step) the missed instants are skipped rather than fired in a burst.
pub struct Ticker<C: WallClock> {
    clock: C,
    anchor: DateTime<Utc>,
    period: TimeDelta,
    next: u64,
}

impl<C: WallClock> Ticker<C> {
    pub fn new(clock: C, anchor: DateTime<Utc>, period: Duration) -> Self {
        let period = TimeDelta::from_std(period).unwrap_or(TimeDelta::seconds(1));
        Self {
            clock,
            anchor,
            period,
            next: 0,
        }
    }

    /// Anchors the schedule on the next whole wall-clock second.
    pub fn starting_next_second(clock: C, period: Duration) -> Self {
        let now = clock.now();
        let anchor = now
            .duration_trunc(TimeDelta::seconds(1))
            .map(|s| s + TimeDelta::seconds(1))
            .unwrap_or(now);
        Self::new(clock, anchor, period)
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    pub fn scheduled_at(&self, index: u64) -> DateTime<Utc> {
        let steps = i32::try_from(index).unwrap_or(i32::MAX);
        self.anchor + self.period * steps
    }

    /// Waits for the next scheduled instant and returns it.
    pub async fn tick(&mut self) -> Tick {
        let now = self.clock.now();
        let mut at = self.scheduled_at(self.next);

        if now - at > self.period {
            let behind = (now - self.anchor).num_milliseconds() / self.period.num_milliseconds().max(1);
            let skip_to = u64::try_from(behind).unwrap_or(self.next).max(self.next);
            tracing::warn!(
                skipped = skip_to - self.next,
                "sampling loop fell behind schedule, skipping missed ticks"
            );
            metrics::counter!("sampler_ticks_skipped_total").increment(skip_to - self.next);
            self.next = skip_to;
            at = self.scheduled_at(self.next);
        }

        if let Ok(wait) = (at - now).to_std() {
            tokio::time::sleep(wait).await;
        }

        let tick = Tick { index: self.next, at };
        self.next += 1;
        tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + TimeDelta::milliseconds(250)
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_follow_absolute_schedule() {
        let clock = MonotonicClock::starting_at(origin());
        let mut ticker = Ticker::starting_next_second(clock, Duration::from_millis(500));

        let anchor = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        assert_eq!(ticker.anchor(), anchor);

        for i in 0..6u64 {
            let tick = ticker.tick().await;
            assert_eq!(tick.index, i);
            assert_eq!(tick.at, anchor + TimeDelta::milliseconds(500 * i as i64));
            // Simulated work shorter than a period must not shift later ticks.
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        assert_eq!(clock.now(), anchor + TimeDelta::milliseconds(2500 + 120));
    }

    #[tokio::test(start_paused = true)]
    async fn late_loop_skips_missed_ticks() {
        let clock = MonotonicClock::starting_at(origin());
        let mut ticker = Ticker::starting_next_second(clock, Duration::from_millis(500));

        let first = ticker.tick().await;
        assert_eq!(first.index, 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        let next = ticker.tick().await;
        assert!(next.index >= 10, "expected missed ticks to be skipped, got {}", next.index);
        assert!(next.at <= clock.now());
    }
}
