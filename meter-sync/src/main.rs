use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{NaiveDate, SubsecRound, Utc};
use clap::{error::ErrorKind, CommandFactory, Parser};
use meter_client::{
    db::schema::ensure_schema,
    domain::{DayFileKey, SiteId},
};
use meter_sync::{
    config::{AppConfig, RemoteKind},
    metrics_server,
    observability,
    sinks::PgStore,
    sync::{
        remote::{LocalSession, SftpSession},
        FetchError, LocalConnector, RangePolicy, RemoteConnector, RemoteSession, RoutingTable, SftpConnector,
        SyncEngine, SyncMode,
    },
};
use sqlx::postgres::PgPoolOptions;

/// Reconcile edge day files into the central store.
///
/// Without arguments each site is synced incrementally from its watermark.
#[derive(Parser, Debug)]
#[command(name = "meter-sync", version)]
struct Cli {
    /// Sync every day each site has files for.
    #[arg(long, conflicts_with_all = ["start", "end"])]
    all: bool,

    /// First day to sync (YYYY-MM-DD).
    #[arg(long)]
    start: Option<NaiveDate>,

    /// Last day to sync (YYYY-MM-DD).
    #[arg(long)]
    end: Option<NaiveDate>,
}

impl Cli {
    fn mode(&self) -> SyncMode {
        if self.all {
            SyncMode::Full
        } else if self.start.is_some() || self.end.is_some() {
            SyncMode::Explicit {
                start: self.start,
                end: self.end,
            }
        } else {
            SyncMode::Incremental
        }
    }
}

enum Connector {
    Sftp(SftpConnector),
    Local(LocalConnector),
}

enum Session {
    Sftp(SftpSession),
    Local(LocalSession),
}

#[async_trait::async_trait]
impl RemoteConnector for Connector {
    type Session = Session;

    async fn connect(&self, site_id: &SiteId, address: &str) -> Result<Session, FetchError> {
        match self {
            Self::Sftp(c) => c.connect(site_id, address).await.map(Session::Sftp),
            Self::Local(c) => c.connect(site_id, address).await.map(Session::Local),
        }
    }
}

#[async_trait::async_trait]
impl RemoteSession for Session {
    async fn list_days(&mut self, site_id: &SiteId) -> Result<Vec<NaiveDate>, FetchError> {
        match self {
            Self::Sftp(s) => s.list_days(site_id).await,
            Self::Local(s) => s.list_days(site_id).await,
        }
    }

    async fn fetch_day(&mut self, key: &DayFileKey) -> Result<Option<Vec<u8>>, FetchError> {
        match self {
            Self::Sftp(s) => s.fetch_day(key).await,
            Self::Local(s) => s.fetch_day(key).await,
        }
    }

    async fn close(&mut self) -> Result<(), FetchError> {
        match self {
            Self::Sftp(s) => s.close().await,
            Self::Local(s) => s.close().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;
    let sync_cfg = cfg.sync()?;
    let mode = cli.mode();
    let now = Utc::now().trunc_subsecs(0);

    if let SyncMode::Explicit { start, end } = mode {
        let policy = RangePolicy::new(sync_cfg.timezone, sync_cfg.lookback_days);
        if let Err(e) = policy.explicit(start, end, now) {
            Cli::command().error(ErrorKind::ArgumentConflict, e.to_string()).exit();
        }
    }

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let store_cfg = cfg.store()?;
    let pool = PgPoolOptions::new()
        .max_connections(store_cfg.max_connections)
        .connect(&store_cfg.uri)
        .await?;
    ensure_schema(&pool).await?;

    let routes = RoutingTable::load(&sync_cfg.routing_table_path).await?;

    let connector = match sync_cfg.remote.kind {
        RemoteKind::Sftp => Connector::Sftp(SftpConnector::from_config(&sync_cfg.remote)?),
        RemoteKind::Local => {
            let root = sync_cfg
                .remote
                .local_root
                .clone()
                .ok_or_else(|| anyhow!("sync.remote.local_root is required for the local transport"))?;
            Connector::Local(LocalConnector::new(root))
        }
    };

    let engine = SyncEngine::new(connector, Arc::new(PgStore::new(pool)), routes, sync_cfg);
    let report = engine.run(mode, now).await?;
    report.log_summary();

    if report.has_failures() {
        return Err(anyhow!(
            "{} of {} sites failed to sync",
            report.count("failed"),
            report.sites.len()
        ));
    }
    Ok(())
}
