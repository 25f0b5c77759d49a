use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use meter_client::domain::{
    site_day, ChannelValues, DaySeries, Reading, ResampledRow, SiteId, SourceKind, CHANNEL_COUNT,
};

/// Per-second running means, one per channel.
#[derive(Debug, Clone, Copy, Default)]
struct SecondAccumulator {
    counts: [u32; CHANNEL_COUNT],
    means: [f64; CHANNEL_COUNT],
}

impl SecondAccumulator {
    fn add(&mut self, values: &ChannelValues) {
        for (idx, value) in values.iter().enumerate() {
            if let Some(x) = value {
                self.counts[idx] += 1;
                self.means[idx] += (x - self.means[idx]) / f64::from(self.counts[idx]);
            }
        }
    }

    fn finish(&self) -> ChannelValues {
        let mut out = [None; CHANNEL_COUNT];
        for (idx, slot) in out.iter_mut().enumerate() {
            if self.counts[idx] > 0 {
                *slot = Some(self.means[idx]);
            }
        }
        ChannelValues::new(out)
    }
}

/// Turns irregular readings into a one-row-per-second grid, split by local day.
#[derive(Debug, Clone)]
pub struct Resampler {
    site_id: SiteId,
    kind: SourceKind,
    tz: Tz,
}

impl Resampler {
    pub fn new(site_id: SiteId, kind: SourceKind, tz: Tz) -> Self {
        Self { site_id, kind, tz }
    }

    /// Resamples `readings` to whole seconds.
    ///
    /// A reading belongs to the second its timestamp floors to. The grid runs
    /// over `span` (both ends inclusive, floored) when given, widened to any
    /// reading outside it; otherwise over the observed min..max. Seconds
    /// without readings are emitted with null values.
    pub fn resample(
        &self,
        readings: &[Reading],
        span: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Vec<DaySeries> {
        let mut sorted: Vec<&Reading> = readings.iter().collect();
        sorted.sort_by_key(|r| r.ts);

        let mut buckets: BTreeMap<i64, SecondAccumulator> = BTreeMap::new();
        for reading in &sorted {
            buckets.entry(reading.ts.timestamp()).or_default().add(&reading.values);
        }

        let observed = buckets
            .keys()
            .next()
            .copied()
            .zip(buckets.keys().next_back().copied());
        let requested = span.map(|(start, end)| (start.timestamp(), end.timestamp()));

        let (first, last) = match (requested, observed) {
            (Some((s, e)), Some((lo, hi))) => (s.min(lo), e.max(hi)),
            (Some(bounds), None) | (None, Some(bounds)) => bounds,
            (None, None) => return Vec::new(),
        };

        let mut days: Vec<DaySeries> = Vec::new();
        for second in first..=last {
            let Some(ts) = DateTime::from_timestamp(second, 0) else {
                continue;
            };
            let values = buckets
                .get(&second)
                .map(SecondAccumulator::finish)
                .unwrap_or_else(ChannelValues::empty);
            let day = site_day(ts, self.tz);

            let row = ResampledRow {
                site_id: self.site_id.clone(),
                kind: self.kind,
                day,
                ts,
                values,
            };

            match days.last_mut() {
                Some(series) if series.day == day => series.rows.push(row),
                _ => days.push(DaySeries { day, rows: vec![row] }),
            }
        }

        days
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta, TimeZone};
    use chrono_tz::Europe::Brussels;

    fn power(p: f64) -> ChannelValues {
        let mut v = ChannelValues::empty();
        v.set("active_power_w", p);
        v
    }

    fn resampler() -> Resampler {
        Resampler::new(SiteId::new("ECH001"), SourceKind::Primary, Brussels)
    }

    #[test]
    fn averages_readings_within_a_second() {
        let t0 = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();
        let readings = vec![
            Reading::new(t0 + TimeDelta::milliseconds(500), power(300.0)),
            Reading::new(t0, power(100.0)),
            Reading::new(t0 + TimeDelta::milliseconds(1500), power(50.0)),
        ];

        let days = resampler().resample(&readings, None);
        assert_eq!(days.len(), 1);
        let rows = &days[0].rows;

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, t0);
        assert_eq!(rows[0].values.active_power(), Some(200.0));
        assert_eq!(rows[1].values.active_power(), Some(50.0));
        assert_eq!(rows[0].values.get(0), None);
    }

    #[test]
    fn missing_seconds_are_null_not_dropped() {
        let t0 = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();
        let readings = vec![
            Reading::new(t0, power(1.0)),
            Reading::new(t0 + TimeDelta::seconds(4), power(5.0)),
        ];

        let rows = &resampler().resample(&readings, None)[0].rows;

        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.ts, t0 + TimeDelta::seconds(i as i64));
            let expect_value = i == 0 || i == 4;
            assert_eq!(row.values.active_power().is_some(), expect_value, "second {i}");
        }
    }

    #[test]
    fn span_covers_seconds_without_any_reading() {
        let start = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();
        let end = start + TimeDelta::milliseconds(59_500);
        let readings = vec![Reading::new(start + TimeDelta::seconds(10), power(7.0))];

        let rows = &resampler().resample(&readings, Some((start, end)))[0].rows;

        assert_eq!(rows.len(), 60);
        assert_eq!(rows.first().map(|r| r.ts), Some(start));
        assert_eq!(rows.last().map(|r| r.ts), Some(start + TimeDelta::seconds(59)));
        assert_eq!(rows.iter().filter(|r| !r.values.is_empty()).count(), 1);
    }

    #[test]
    fn window_straddling_midnight_is_split_by_local_day() {
        // 22:59:58 UTC is 23:59:58 in Brussels during winter.
        let t0 = Utc.with_ymd_and_hms(2024, 1, 10, 22, 59, 58).unwrap();
        let readings: Vec<Reading> = (0..8)
            .map(|i| Reading::new(t0 + TimeDelta::milliseconds(500 * i), power(i as f64)))
            .collect();

        let days = resampler().resample(&readings, None);

        assert_eq!(days.len(), 2);
        assert_eq!(days[0].day, NaiveDate::from_ymd_opt(2024, 1, 10).unwrap());
        assert_eq!(days[0].rows.len(), 2);
        assert_eq!(days[1].day, NaiveDate::from_ymd_opt(2024, 1, 11).unwrap());
        assert_eq!(days[1].rows.len(), 2);
        assert!(days[1].rows.iter().all(|r| r.day == days[1].day));
    }

    #[test]
    fn many_samples_per_second_stay_stable() {
        let t0 = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();
        let readings: Vec<Reading> = (0..1000)
            .map(|i| Reading::new(t0 + TimeDelta::microseconds(i * 997), power(1e9 + (i % 2) as f64)))
            .collect();

        let rows = &resampler().resample(&readings, None)[0].rows;
        let mean = rows[0].values.active_power().unwrap();
        assert!((mean - (1e9 + 0.5)).abs() < 1e-4, "mean = {mean}");
    }

    #[test]
    fn no_input_and_no_span_yields_nothing() {
        assert!(resampler().resample(&[], None).is_empty());
    }
}
