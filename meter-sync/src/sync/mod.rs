pub mod discovery;
pub mod range;
pub mod remote;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use futures::StreamExt;
use meter_client::domain::{start_of_day, AccessRecord, DayFileKey, ResampledRow, SiteId, SourceKind};
use tracing::Instrument;

use crate::{
    config::SyncConfig,
    error::PipelineError,
    sinks::{BatchLoader, CentralStore, LoadStats, StoreError},
    sources::parse_day_file,
    transform::derive_power,
};

pub use discovery::RoutingTable;
pub use range::{RangeError, RangePolicy, SyncMode, SyncRange};
pub use remote::{FetchError, LocalConnector, RemoteConnector, RemoteSession, SftpConnector};

/// Errors that stop a pass before any site is processed.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Range(#[from] RangeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteStatus {
    Advanced {
        from: Option<DateTime<Utc>>,
        to: DateTime<Utc>,
    },
    Unchanged {
        watermark: Option<DateTime<Utc>>,
    },
    /// No route, or the session could not be established.
    Unreachable { reason: String },
    /// Session established but the pass for this site was aborted.
    Failed { reason: String },
}

impl SiteStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Advanced { .. } => "advanced",
            Self::Unchanged { .. } => "unchanged",
            Self::Unreachable { .. } => "unreachable",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedDay {
    pub day: NaiveDate,
    pub kind: SourceKind,
    pub reason: String,
}

impl fmt::Display for SkippedDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.day, self.kind, self.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteReport {
    pub site_id: SiteId,
    pub status: SiteStatus,
    pub days_loaded: usize,
    pub skipped_days: Vec<SkippedDay>,
    pub raw_rows: usize,
    pub power_rows: usize,
}

impl SiteReport {
    fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            status: SiteStatus::Unchanged { watermark: None },
            days_loaded: 0,
            skipped_days: Vec::new(),
            raw_rows: 0,
            power_rows: 0,
        }
    }
}

/// Outcome of one pass, one entry per provisioned site, ordered by site id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub sites: Vec<SiteReport>,
}

impl SyncReport {
    pub fn site(&self, site_id: &SiteId) -> Option<&SiteReport> {
        self.sites.iter().find(|s| &s.site_id == site_id)
    }

    pub fn count(&self, label: &str) -> usize {
        self.sites.iter().filter(|s| s.status.label() == label).count()
    }

    pub fn has_failures(&self) -> bool {
        self.sites
            .iter()
            .any(|s| matches!(s.status, SiteStatus::Failed { .. }))
    }

    pub fn log_summary(&self) {
        for site in &self.sites {
            match &site.status {
                SiteStatus::Advanced { from, to } => tracing::info!(
                    site = %site.site_id,
                    from = ?from,
                    to = %to,
                    days = site.days_loaded,
                    power_rows = site.power_rows,
                    "watermark advanced"
                ),
                SiteStatus::Unchanged { watermark } => {
                    tracing::info!(site = %site.site_id, watermark = ?watermark, "watermark unchanged")
                }
                SiteStatus::Unreachable { reason } => {
                    tracing::warn!(site = %site.site_id, reason = %reason, "site skipped, unreachable")
                }
                SiteStatus::Failed { reason } => {
                    tracing::error!(site = %site.site_id, reason = %reason, "site sync failed")
                }
            }
            for skipped in &site.skipped_days {
                tracing::warn!(site = %site.site_id, skipped = %skipped, "day skipped");
            }
        }

        tracing::info!(
            advanced = self.count("advanced"),
            unchanged = self.count("unchanged"),
            unreachable = self.count("unreachable"),
            failed = self.count("failed"),
            "sync pass complete"
        );
    }
}

struct EngineInner<C, S> {
    connector: C,
    store: Arc<S>,
    routes: RoutingTable,
    policy: RangePolicy,
    loader: BatchLoader,
    connect_timeout: Duration,
}

/// Reconciles every provisioned site's day files into the central store.
///
/// Sites run in parallel on at most `workers` tasks, each with its own
/// session and its own watermark. Days within a site run in order.
pub struct SyncEngine<C, S> {
    inner: Arc<EngineInner<C, S>>,
    workers: usize,
}

impl<C, S> SyncEngine<C, S>
where
    C: RemoteConnector + 'static,
    S: CentralStore + 'static,
{
    pub fn new(connector: C, store: Arc<S>, routes: RoutingTable, cfg: &SyncConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                connector,
                store,
                routes,
                policy: RangePolicy::new(cfg.timezone, cfg.lookback_days),
                loader: BatchLoader::from_config(&cfg.batch),
                connect_timeout: cfg.remote.connect_timeout(),
            }),
            workers: cfg.worker_count(),
        }
    }

    /// Runs one pass over all sites. `now` bounds incremental ranges and is
    /// the watermark proposed by them.
    pub async fn run(&self, mode: SyncMode, now: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        if let SyncMode::Explicit { start, end } = mode {
            self.inner.policy.explicit(start, end, now)?;
        }

        let sites = self.inner.store.sites().await?;
        tracing::info!(sites = sites.len(), workers = self.workers, mode = ?mode, "starting sync pass");

        let mut reports: Vec<SiteReport> = futures::stream::iter(sites)
            .map(|access| {
                let inner = Arc::clone(&self.inner);
                let site_id = access.site_id.clone();
                let span = tracing::info_span!("site", site = %site_id);
                let task = tokio::spawn(async move { inner.sync_site(access, mode, now).await }.instrument(span));
                async move {
                    match task.await {
                        Ok(report) => report,
                        Err(e) => {
                            let mut report = SiteReport::new(site_id);
                            report.status = SiteStatus::Failed {
                                reason: format!("worker panicked: {e}"),
                            };
                            report
                        }
                    }
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        reports.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        for report in &reports {
            metrics::counter!("sync_sites_total", "status" => report.status.label()).increment(1);
        }
        Ok(SyncReport { sites: reports })
    }
}

impl<C, S> EngineInner<C, S>
where
    C: RemoteConnector,
    S: CentralStore,
{
    async fn sync_site(&self, access: AccessRecord, mode: SyncMode, now: DateTime<Utc>) -> SiteReport {
        let mut report = SiteReport::new(access.site_id.clone());

        let Some(address) = self.routes.resolve(&access.site_id) else {
            tracing::warn!("site not in routing table");
            report.status = SiteStatus::Unreachable {
                reason: "no route to site".to_string(),
            };
            return report;
        };

        let connect = self.connector.connect(&access.site_id, address);
        let mut session = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                tracing::warn!(address, error = %e, "cannot open session");
                report.status = SiteStatus::Unreachable { reason: e.to_string() };
                return report;
            }
            Err(_) => {
                let e = FetchError::ConnectTimeout(self.connect_timeout);
                tracing::warn!(address, error = %e, "cannot open session");
                report.status = SiteStatus::Unreachable { reason: e.to_string() };
                return report;
            }
        };

        let result = self.sync_session(&mut session, &access, mode, now, &mut report).await;

        if let Err(e) = session.close().await {
            tracing::warn!(error = %e, "failed to close session");
        }

        report.status = match result {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(error = %e, "site sync aborted, watermark left as is");
                SiteStatus::Failed { reason: e.to_string() }
            }
        };
        report
    }

    async fn sync_session(
        &self,
        session: &mut C::Session,
        access: &AccessRecord,
        mode: SyncMode,
        now: DateTime<Utc>,
        report: &mut SiteReport,
    ) -> Result<SiteStatus, PipelineError> {
        let site_id = &access.site_id;
        let previous = self.store.watermark(site_id).await?;

        let range = match mode {
            SyncMode::Incremental => self.policy.incremental(previous, now),
            SyncMode::Explicit { start, end } => self
                .policy
                .explicit(start, end, now)
                .map_err(|e| PipelineError::Source(e.to_string()))?,
            SyncMode::Full => {
                let days = session
                    .list_days(site_id)
                    .await
                    .map_err(|e| PipelineError::Source(format!("cannot list day files: {e}")))?;
                match self.policy.full(&days, now) {
                    Some(range) => range,
                    None => {
                        tracing::warn!("no day files available");
                        return Ok(SiteStatus::Unchanged { watermark: previous });
                    }
                }
            }
        };

        tracing::info!(
            first_day = %range.first_day,
            last_day = %range.last_day,
            filter_from = ?range.filter_from,
            "syncing range"
        );

        // Earliest instant of a row still being written on the edge.
        let mut resume_at: Option<DateTime<Utc>> = None;
        for day in range.days() {
            self.sync_day(session, access, day, &range, &mut resume_at, report).await?;
        }

        let proposed = match resume_at {
            Some(resume) if resume < range.end => {
                tracing::info!(resume = %resume, "day file still being written, watermark held back");
                resume
            }
            _ => range.end,
        };
        let stored = self.store.advance_watermark(site_id, proposed).await?;
        if previous == Some(stored) {
            return Ok(SiteStatus::Unchanged { watermark: previous });
        }

        metrics::counter!("sync_watermark_advances_total").increment(1);
        Ok(SiteStatus::Advanced {
            from: previous,
            to: stored,
        })
    }

    async fn sync_day(
        &self,
        session: &mut C::Session,
        access: &AccessRecord,
        day: NaiveDate,
        range: &SyncRange,
        resume_at: &mut Option<DateTime<Utc>>,
        report: &mut SiteReport,
    ) -> Result<(), PipelineError> {
        let primary_key = DayFileKey::new(access.site_id.clone(), day, SourceKind::Primary);
        let Some(primary) = self.fetch_rows(session, &primary_key, range, resume_at, report).await? else {
            return Ok(());
        };

        let production = if access.has_production {
            let key = DayFileKey::new(access.site_id.clone(), day, SourceKind::Production);
            // A capable site without a production file gets null production, not zero.
            Some(
                self.fetch_rows(session, &key, range, resume_at, report)
                    .await?
                    .unwrap_or_default(),
            )
        } else {
            None
        };

        let power = derive_power(&primary, production.as_deref());

        let mut raw = self.load_raw(SourceKind::Primary, &primary).await?;
        if let Some(rows) = &production {
            raw.merge(self.load_raw(SourceKind::Production, rows).await?);
        }
        let power_stats = self.loader.load(self.store.as_ref(), "power", &power).await?;

        tracing::debug!(%day, raw_rows = raw.rows, power_rows = power_stats.rows, "day loaded");
        report.days_loaded += 1;
        report.raw_rows += raw.rows;
        report.power_rows += power_stats.rows;
        Ok(())
    }

    async fn load_raw(&self, kind: SourceKind, rows: &[ResampledRow]) -> Result<LoadStats, PipelineError> {
        self.loader.load(self.store.as_ref(), kind.raw_table(), rows).await
    }

    /// Fetches and parses one day file, keeping rows inside `range`.
    ///
    /// A missing file skips the day. A file that exists but cannot be
    /// transferred or parsed aborts the site, so the watermark never moves
    /// past data that was not loaded. A file caught mid-append lowers
    /// `resume_at` to just after its last complete row.
    async fn fetch_rows(
        &self,
        session: &mut C::Session,
        key: &DayFileKey,
        range: &SyncRange,
        resume_at: &mut Option<DateTime<Utc>>,
        report: &mut SiteReport,
    ) -> Result<Option<Vec<ResampledRow>>, PipelineError> {
        let bytes = match session.fetch_day(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(day = %key.day, kind = %key.kind, "day file missing, skipping day");
                metrics::counter!("sync_days_skipped_total", "kind" => key.kind.as_str()).increment(1);
                report.skipped_days.push(SkippedDay {
                    day: key.day,
                    kind: key.kind,
                    reason: "file missing".to_string(),
                });
                return Ok(None);
            }
            Err(e) => {
                return Err(PipelineError::Source(format!("cannot fetch {}: {e}", key.file_name())));
            }
        };
        metrics::counter!("sync_files_fetched_total", "kind" => key.kind.as_str()).increment(1);

        let rows = parse_day_file(key, bytes.as_slice()).map_err(|e| match e {
            PipelineError::Source(reason) => PipelineError::Source(format!("{}: {reason}", key.file_name())),
            other => other,
        })?;

        if !bytes.is_empty() && bytes.last() != Some(&b'\n') {
            let resume = match rows.last() {
                Some(row) => row.ts + TimeDelta::seconds(1),
                None => start_of_day(key.day, self.policy.timezone()),
            };
            *resume_at = Some(resume_at.map_or(resume, |current| current.min(resume)));
        }
        Ok(Some(rows.into_iter().filter(|r| range.keeps(r.ts)).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_by_status() {
        let mut a = SiteReport::new(SiteId::new("A"));
        a.status = SiteStatus::Failed { reason: "x".into() };
        let mut b = SiteReport::new(SiteId::new("B"));
        b.status = SiteStatus::Unreachable { reason: "y".into() };
        let c = SiteReport::new(SiteId::new("C"));

        let report = SyncReport { sites: vec![a, b, c] };
        assert!(report.has_failures());
        assert_eq!(report.count("unreachable"), 1);
        assert_eq!(report.count("unchanged"), 1);
        assert_eq!(report.site(&SiteId::new("B")).map(|s| s.status.label()), Some("unreachable"));
    }
}
