use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use meter_client::domain::{Reading, SiteId, SourceKind};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{error::PipelineError, sinks::DayFileAppender, transform::Resampler};

/// Readings captured over one flush window, immutable once handed off.
#[derive(Debug, Clone)]
pub struct FlushWindow {
    /// Scheduled time of the first tick in the window.
    pub start: DateTime<Utc>,
    /// Scheduled time of the last tick in the window.
    pub end: DateTime<Utc>,
    pub primary: Vec<Reading>,
    /// `None` on sites without a production meter.
    pub production: Option<Vec<Reading>>,
}

impl FlushWindow {
    pub fn reading_count(&self) -> usize {
        self.primary.len() + self.production.as_ref().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub windows: u64,
    pub rows: u64,
    pub failures: u64,
}

/// Resamples a window and appends it to the day files of each source.
#[derive(Debug, Clone)]
pub struct Flusher {
    site_id: SiteId,
    tz: Tz,
    appender: DayFileAppender,
}

impl Flusher {
    pub fn new(site_id: SiteId, tz: Tz, appender: DayFileAppender) -> Self {
        Self { site_id, tz, appender }
    }

    /// Writes `window` to disk. Blocking; returns the number of rows appended.
    pub fn flush(&self, window: &FlushWindow) -> Result<u64, PipelineError> {
        let span = Some((window.start, window.end));
        let mut rows = 0u64;

        let mut sources: Vec<(SourceKind, &[Reading])> = vec![(SourceKind::Primary, window.primary.as_slice())];
        if let Some(production) = &window.production {
            sources.push((SourceKind::Production, production.as_slice()));
        }

        for (kind, readings) in sources {
            let resampler = Resampler::new(self.site_id.clone(), kind, self.tz);
            for series in resampler.resample(readings, span) {
                self.appender.append(&series)?;
                rows += series.rows.len() as u64;
            }
        }

        Ok(rows)
    }

    /// Starts the single flush worker.
    ///
    /// Windows are flushed one at a time, in the order sent. Sending blocks
    /// once `capacity` windows are queued. The worker exits after the sender
    /// is dropped and the queue is drained.
    pub fn spawn(self, capacity: usize) -> (mpsc::Sender<FlushWindow>, JoinHandle<FlushStats>) {
        let (tx, mut rx) = mpsc::channel::<FlushWindow>(capacity.max(1));
        let flusher = Arc::new(self);

        let handle = tokio::spawn(async move {
            let mut stats = FlushStats::default();
            while let Some(window) = rx.recv().await {
                stats.windows += 1;
                let worker = Arc::clone(&flusher);
                let readings = window.reading_count();
                match tokio::task::spawn_blocking(move || worker.flush(&window)).await {
                    Ok(Ok(rows)) => {
                        stats.rows += rows;
                        metrics::counter!("sampler_flushed_rows_total").increment(rows);
                        tracing::debug!(rows, readings, "flushed window");
                    }
                    Ok(Err(e)) => {
                        stats.failures += 1;
                        metrics::counter!("sampler_flush_errors_total").increment(1);
                        tracing::error!(error = %e, readings, "flush failed, window dropped");
                    }
                    Err(e) => {
                        stats.failures += 1;
                        metrics::counter!("sampler_flush_errors_total").increment(1);
                        tracing::error!(error = %e, readings, "flush task panicked");
                    }
                }
            }
            stats
        });

        (tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use chrono_tz::Europe::Brussels;
    use meter_client::domain::ChannelValues;

    fn power(p: f64) -> ChannelValues {
        let mut v = ChannelValues::empty();
        v.set("active_power_w", p);
        v
    }

    fn window(start: DateTime<Utc>, seconds: i64, with_production: bool) -> FlushWindow {
        let primary: Vec<Reading> = (0..seconds * 2)
            .map(|i| Reading::new(start + TimeDelta::milliseconds(500 * i), power(i as f64)))
            .collect();
        let production = with_production.then(|| primary.iter().map(|r| Reading::new(r.ts, power(10.0))).collect());
        FlushWindow {
            start,
            end: start + TimeDelta::milliseconds(500 * (seconds * 2 - 1)),
            primary,
            production,
        }
    }

    #[tokio::test]
    async fn windows_are_flushed_in_order_to_both_sources() {
        let dir = tempfile::tempdir().unwrap();
        let flusher = Flusher::new(
            SiteId::new("ECH001"),
            Brussels,
            DayFileAppender::new(dir.path(), Brussels),
        );
        let (tx, handle) = flusher.spawn(1);

        let t0 = Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).unwrap();
        for n in 0..3 {
            tx.send(window(t0 + TimeDelta::seconds(10 * n), 10, true)).await.unwrap();
        }
        drop(tx);
        let stats = handle.await.unwrap();

        assert_eq!(stats, FlushStats { windows: 3, rows: 60, failures: 0 });
        let p1 = std::fs::read_to_string(dir.path().join("2024/05/2024_05_03_ECH001_p1.csv")).unwrap();
        let pv = std::fs::read_to_string(dir.path().join("2024/05/2024_05_03_ECH001_pv.csv")).unwrap();
        assert_eq!(p1.lines().count(), 31);
        assert_eq!(pv.lines().count(), 31);

        let stamps: Vec<&str> = p1.lines().skip(1).map(|l| &l[..25]).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[tokio::test]
    async fn failed_flush_does_not_stop_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let flusher = Flusher::new(SiteId::new("ECH001"), Brussels, DayFileAppender::new(&blocker, Brussels));
        let (tx, handle) = flusher.spawn(2);

        let t0 = Utc.with_ymd_and_hms(2024, 5, 3, 8, 0, 0).unwrap();
        tx.send(window(t0, 2, false)).await.unwrap();
        tx.send(window(t0 + TimeDelta::seconds(2), 2, false)).await.unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.windows, 2);
        assert_eq!(stats.failures, 2);
    }
}
