use chrono::{DateTime, Utc};
use meter_client::{
    db::{access_queries, watermark_queries},
    domain::{AccessRecord, PowerRecord, ResampledRow, SiteId, SourceKind, CHANNEL_NAMES},
};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};

use super::batch::BatchWriter;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Query(#[from] anyhow::Error),
    #[error("{0}")]
    Other(String),
}

/// Everything the sync engine needs from the central store.
///
/// Raw and power rows are upserted on `(site_id, day, ts)`, so loading the
/// same rows twice leaves the store unchanged.
#[async_trait::async_trait]
pub trait CentralStore: BatchWriter<ResampledRow> + BatchWriter<PowerRecord> + Send + Sync {
    async fn sites(&self) -> Result<Vec<AccessRecord>, StoreError>;

    async fn watermark(&self, site_id: &SiteId) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Stores `max(current, candidate)` and returns the stored value.
    async fn advance_watermark(
        &self,
        site_id: &SiteId,
        candidate: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_raw(&self, kind: SourceKind, batch: &[&ResampledRow]) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {} (site_id, day, ts, {}) ",
            kind.raw_table(),
            CHANNEL_NAMES.join(", ")
        ));

        builder.push_values(batch, |mut b, row| {
            b.push_bind(&row.site_id).push_bind(row.day).push_bind(row.ts);
            for value in row.values.iter() {
                b.push_bind(value);
            }
        });

        let updates: Vec<String> = CHANNEL_NAMES
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect();
        builder.push(" ON CONFLICT (site_id, day, ts) DO UPDATE SET ");
        builder.push(updates.join(", "));

        builder.build().execute(&self.pool).await.map(|_| ())
    }
}

#[async_trait::async_trait]
impl BatchWriter<ResampledRow> for PgStore {
    async fn write_batch(&self, rows: &[ResampledRow]) -> Result<(), StoreError> {
        for kind in SourceKind::ALL {
            let batch: Vec<&ResampledRow> = rows.iter().filter(|r| r.kind == kind).collect();
            if !batch.is_empty() {
                self.insert_raw(kind, &batch).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BatchWriter<PowerRecord> for PgStore {
    async fn write_batch(&self, rows: &[PowerRecord]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut builder =
            QueryBuilder::<Postgres>::new("INSERT INTO power (site_id, day, ts, consumption, production, net) ");
        builder.push_values(rows, |mut b, r| {
            b.push_bind(&r.site_id)
                .push_bind(r.day)
                .push_bind(r.ts)
                .push_bind(r.consumption)
                .push_bind(r.production)
                .push_bind(r.net);
        });
        builder.push(
            " ON CONFLICT (site_id, day, ts) DO UPDATE SET \
             consumption = EXCLUDED.consumption, \
             production = EXCLUDED.production, \
             net = EXCLUDED.net",
        );

        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CentralStore for PgStore {
    async fn sites(&self) -> Result<Vec<AccessRecord>, StoreError> {
        Ok(access_queries::list_sites(&self.pool).await?)
    }

    async fn watermark(&self, site_id: &SiteId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(watermark_queries::read_watermark(&self.pool, site_id).await?)
    }

    async fn advance_watermark(
        &self,
        site_id: &SiteId,
        candidate: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        Ok(watermark_queries::advance_watermark(&self.pool, site_id, candidate).await?)
    }
}
