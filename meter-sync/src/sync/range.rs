use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use chrono_tz::Tz;
use meter_client::domain::{site_day, start_of_day};

/// How a sync pass picks the time range of each site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// From the watermark (bounded by the look-back horizon) up to now.
    Incremental,
    /// Every day the site has files for.
    Full,
    /// Caller-supplied days; a missing bound is derived from the look-back window.
    Explicit {
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RangeError {
    #[error("start date {start} is after end date {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// The days one site will be synced over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRange {
    pub first_day: NaiveDate,
    pub last_day: NaiveDate,
    /// Rows stamped before this instant are dropped after fetching.
    pub filter_from: Option<DateTime<Utc>>,
    /// Proposed as the site's watermark once every day was processed.
    pub end: DateTime<Utc>,
}

impl SyncRange {
    /// Days in the range, ascending, both ends included.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.first_day
            .iter_days()
            .take_while(move |d| *d <= self.last_day)
    }

    pub fn keeps(&self, ts: DateTime<Utc>) -> bool {
        self.filter_from.map_or(true, |from| ts >= from)
    }
}

/// Range selection in a site-local calendar.
#[derive(Debug, Clone, Copy)]
pub struct RangePolicy {
    tz: Tz,
    lookback: TimeDelta,
}

impl RangePolicy {
    pub fn new(tz: Tz, lookback_days: i64) -> Self {
        Self {
            tz,
            lookback: TimeDelta::days(lookback_days),
        }
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// `[max(watermark, now - lookback), now]`. A site that was never synced
    /// counts as synced up to the epoch. The filter is inclusive, so the
    /// watermark second itself is loaded again and overwritten in place.
    pub fn incremental(&self, watermark: Option<DateTime<Utc>>, now: DateTime<Utc>) -> SyncRange {
        let horizon = now - self.lookback;
        let start = watermark.unwrap_or(DateTime::UNIX_EPOCH).max(horizon);

        SyncRange {
            first_day: site_day(start, self.tz),
            last_day: site_day(now, self.tz),
            filter_from: Some(start),
            end: now,
        }
    }

    /// Whole days from `start` to `end`. Without an end the range runs up to
    /// `now`; without a start it begins one look-back window before its end.
    /// The proposed watermark never lies past `now`.
    pub fn explicit(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        now: DateTime<Utc>,
    ) -> Result<SyncRange, RangeError> {
        let (last_day, end_ts) = match end {
            Some(day) => (day, start_of_day(day, self.tz).min(now)),
            None => (site_day(now, self.tz), now),
        };
        let first_day = start.unwrap_or_else(|| site_day(end_ts - self.lookback, self.tz));

        if first_day > last_day {
            return Err(RangeError::Inverted {
                start: first_day,
                end: last_day,
            });
        }

        Ok(SyncRange {
            first_day,
            last_day,
            filter_from: None,
            end: end_ts,
        })
    }

    /// Every day between the earliest and latest of `available`, or `None`
    /// when the site has no day files at all.
    pub fn full(&self, available: &[NaiveDate], now: DateTime<Utc>) -> Option<SyncRange> {
        let first_day = available.iter().min().copied()?;
        let last_day = available.iter().max().copied()?;

        Some(SyncRange {
            first_day,
            last_day,
            filter_from: None,
            end: start_of_day(last_day, self.tz).min(now),
        })
    }
}
