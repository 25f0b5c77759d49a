pub mod flusher;

use std::{future::Future, mem, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use meter_client::domain::{Reading, SourceKind};

use crate::{
    clock::{Ticker, WallClock},
    config::{SamplerConfig, SiteConfig},
    error::PipelineError,
    sinks::DayFileAppender,
    sources::{HttpSensorReader, SourceError, SourceReader},
};

pub use flusher::{FlushStats, FlushWindow, Flusher};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerSummary {
    pub ticks: u64,
    pub failed_reads: u64,
    /// Includes the final flush performed at shutdown.
    pub flush: FlushStats,
}

/// Readings of the flush window currently being filled.
#[derive(Default)]
struct WindowBuffer {
    window_id: Option<u64>,
    start: Option<DateTime<Utc>>,
    last_at: Option<DateTime<Utc>>,
    /// Scheduled time of the window's last tick.
    closes_at: Option<DateTime<Utc>>,
    /// First second after the previous window, so consecutive windows tile
    /// the second grid even across skipped ticks.
    next_start: Option<DateTime<Utc>>,
    primary: Vec<Reading>,
    production: Option<Vec<Reading>>,
}

impl WindowBuffer {
    fn new(has_production: bool) -> Self {
        Self {
            production: has_production.then(Vec::new),
            ..Default::default()
        }
    }

    fn belongs(&self, window_id: u64) -> bool {
        self.window_id.map_or(true, |current| current == window_id)
    }

    fn record(
        &mut self,
        window_id: u64,
        at: DateTime<Utc>,
        closes_at: DateTime<Utc>,
        primary: Option<Reading>,
        production: Option<Reading>,
    ) {
        if self.window_id.is_none() {
            self.window_id = Some(window_id);
            self.start = Some(self.next_start.map_or(at, |s| s.min(at)));
            self.closes_at = Some(closes_at);
        }
        self.last_at = Some(at);
        self.primary.extend(primary);
        if let Some(buf) = self.production.as_mut() {
            buf.extend(production);
        }
    }

    /// Hands out the buffered window. A `complete` window spans up to its
    /// scheduled close; otherwise it stops at the last tick seen.
    fn take(&mut self, complete: bool) -> Option<FlushWindow> {
        let start = self.start.take()?;
        let last_at = self.last_at.take()?;
        let closes_at = self.closes_at.take().unwrap_or(last_at);
        self.window_id = None;

        let end = if complete { closes_at.max(last_at) } else { last_at };
        self.next_start = DateTime::from_timestamp(end.timestamp() + 1, 0);

        Some(FlushWindow {
            start,
            end,
            primary: mem::take(&mut self.primary),
            production: self.production.as_mut().map(mem::take),
        })
    }
}

async fn read_one(reader: &dyn SourceReader, timeout: Duration, at: DateTime<Utc>) -> Option<Reading> {
    let kind = reader.kind();
    let result = match tokio::time::timeout(timeout, reader.read()).await {
        Ok(res) => res,
        Err(_) => Err(SourceError::Timeout(timeout)),
    };

    match result {
        Ok(values) => Some(Reading::new(at, values)),
        Err(e) => {
            tracing::warn!(kind = %kind, error = %e, "sensor read failed");
            metrics::counter!("sensor_read_failures_total", "kind" => kind.as_str()).increment(1);
            None
        }
    }
}

/// Edge sampling loop: polls the site's meters on a fixed schedule and hands
/// completed windows to a single background flush worker.
pub struct Sampler<C: WallClock> {
    ticker: Ticker<C>,
    primary: Arc<dyn SourceReader>,
    production: Option<Arc<dyn SourceReader>>,
    flusher: Flusher,
    read_timeout: Duration,
    ticks_per_flush: u64,
    queue_capacity: usize,
}

impl<C: WallClock> Sampler<C> {
    pub fn new(
        ticker: Ticker<C>,
        primary: Arc<dyn SourceReader>,
        production: Option<Arc<dyn SourceReader>>,
        flusher: Flusher,
        cfg: &SamplerConfig,
    ) -> Self {
        Self {
            ticker,
            primary,
            production,
            flusher,
            read_timeout: cfg.read_timeout(),
            ticks_per_flush: cfg.ticks_per_flush(),
            queue_capacity: cfg.flush_queue_capacity,
        }
    }

    /// Wires HTTP readers and the day-file flusher from configuration. The
    /// first tick falls on the next whole second of `clock`.
    pub fn from_config(site: &SiteConfig, cfg: &SamplerConfig, clock: C) -> Result<Self, SourceError> {
        let primary: Arc<dyn SourceReader> = Arc::new(HttpSensorReader::new(
            cfg.primary_url.clone(),
            SourceKind::Primary,
            cfg.read_timeout(),
        )?);
        let production = match &cfg.production_url {
            Some(url) => Some(Arc::new(HttpSensorReader::new(
                url.clone(),
                SourceKind::Production,
                cfg.read_timeout(),
            )?) as Arc<dyn SourceReader>),
            None => None,
        };

        let flusher = Flusher::new(
            site.site_id.clone(),
            site.timezone,
            DayFileAppender::new(site.data_dir.clone(), site.timezone),
        );
        let ticker = Ticker::starting_next_second(clock, cfg.sample_period());

        Ok(Self::new(ticker, primary, production, flusher, cfg))
    }

    /// Samples until `shutdown` resolves or the flush worker goes away.
    ///
    /// Either way the queued windows are drained and whatever remains in the
    /// buffer is flushed before returning.
    pub async fn run<F>(mut self, shutdown: F) -> Result<SamplerSummary, PipelineError>
    where
        F: Future<Output = ()>,
    {
        let (tx, worker) = self.flusher.clone().spawn(self.queue_capacity);
        let mut buffer = WindowBuffer::new(self.production.is_some());
        let mut summary = SamplerSummary::default();

        tracing::info!(
            anchor = %self.ticker.anchor(),
            ticks_per_flush = self.ticks_per_flush,
            production = self.production.is_some(),
            "sampler started"
        );

        tokio::pin!(shutdown);
        let outcome: Result<(), PipelineError> = loop {
            let tick = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                tick = self.ticker.tick() => tick,
            };

            let window_id = tick.index / self.ticks_per_flush;
            if !buffer.belongs(window_id) {
                if let Some(window) = buffer.take(true) {
                    if tx.send(window).await.is_err() {
                        break Err(PipelineError::Sink("flush worker stopped".to_string()));
                    }
                }
            }

            let primary = read_one(self.primary.as_ref(), self.read_timeout, tick.at);
            let production = async {
                match &self.production {
                    Some(reader) => read_one(reader.as_ref(), self.read_timeout, tick.at).await,
                    None => None,
                }
            };
            let (primary, production) = tokio::join!(primary, production);

            summary.ticks += 1;
            summary.failed_reads += u64::from(primary.is_none());
            if self.production.is_some() {
                summary.failed_reads += u64::from(production.is_none());
            }
            let closes_at = self.ticker.scheduled_at((window_id + 1) * self.ticks_per_flush - 1);
            buffer.record(window_id, tick.at, closes_at, primary, production);
        };

        if let Err(e) = &outcome {
            tracing::error!(error = %e, "sampling loop aborted, draining");
        }

        drop(tx);
        match worker.await {
            Ok(stats) => summary.flush = stats,
            Err(e) => tracing::error!(error = %e, "flush worker panicked"),
        }

        if let Some(window) = buffer.take(false) {
            let flusher = self.flusher.clone();
            summary.flush.windows += 1;
            let result = tokio::task::spawn_blocking(move || flusher.flush(&window))
                .await
                .map_err(|e| PipelineError::Sink(format!("final flush panicked: {e}")))
                .and_then(|res| res);
            match result {
                Ok(rows) => summary.flush.rows += rows,
                Err(e) => {
                    summary.flush.failures += 1;
                    tracing::error!(error = %e, "final flush failed");
                }
            }
        }

        tracing::info!(
            ticks = summary.ticks,
            failed_reads = summary.failed_reads,
            rows = summary.flush.rows,
            "sampler stopped"
        );

        outcome.map(|()| summary)
    }
}
