use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU32, Ordering},
};

use chrono::{DateTime, NaiveDate, Utc};
use meter_client::domain::{watermark, AccessRecord, PowerRecord, ResampledRow, SiteId, SourceKind};
use tokio::sync::Mutex;

use super::{
    batch::BatchWriter,
    store::{CentralStore, StoreError},
};

type RowKey = (SiteId, NaiveDate, DateTime<Utc>);

#[derive(Default)]
struct Tables {
    access: Vec<AccessRecord>,
    raw_primary: BTreeMap<RowKey, ResampledRow>,
    raw_production: BTreeMap<RowKey, ResampledRow>,
    power: BTreeMap<RowKey, PowerRecord>,
    watermarks: BTreeMap<SiteId, DateTime<Utc>>,
    batch_sizes: Vec<usize>,
}

/// In-process store with the same upsert and watermark semantics as
/// [`PgStore`](super::PgStore), used by the sync tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing_writes: AtomicU32,
}

impl MemoryStore {
    pub fn new(access: Vec<AccessRecord>) -> Self {
        Self {
            tables: Mutex::new(Tables {
                access,
                ..Default::default()
            }),
            failing_writes: AtomicU32::new(0),
        }
    }

    /// Makes the next `n` batch writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub async fn set_watermark(&self, site_id: &SiteId, ts: DateTime<Utc>) {
        self.tables.lock().await.watermarks.insert(site_id.clone(), ts);
    }

    pub async fn raw_rows(&self, kind: SourceKind) -> Vec<ResampledRow> {
        let tables = self.tables.lock().await;
        let table = match kind {
            SourceKind::Primary => &tables.raw_primary,
            SourceKind::Production => &tables.raw_production,
        };
        table.values().cloned().collect()
    }

    pub async fn power_rows(&self) -> Vec<PowerRecord> {
        self.tables.lock().await.power.values().cloned().collect()
    }

    /// Sizes of every batch written so far, in write order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.tables.lock().await.batch_sizes.clone()
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Other("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BatchWriter<ResampledRow> for MemoryStore {
    async fn write_batch(&self, rows: &[ResampledRow]) -> Result<(), StoreError> {
        self.take_failure()?;
        let mut tables = self.tables.lock().await;
        tables.batch_sizes.push(rows.len());
        for row in rows {
            let key = (row.site_id.clone(), row.day, row.ts);
            let table = match row.kind {
                SourceKind::Primary => &mut tables.raw_primary,
                SourceKind::Production => &mut tables.raw_production,
            };
            table.insert(key, row.clone());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BatchWriter<PowerRecord> for MemoryStore {
    async fn write_batch(&self, rows: &[PowerRecord]) -> Result<(), StoreError> {
        self.take_failure()?;
        let mut tables = self.tables.lock().await;
        tables.batch_sizes.push(rows.len());
        for row in rows {
            tables
                .power
                .insert((row.site_id.clone(), row.day, row.ts), row.clone());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CentralStore for MemoryStore {
    async fn sites(&self) -> Result<Vec<AccessRecord>, StoreError> {
        let mut sites = self.tables.lock().await.access.clone();
        sites.sort_by(|a, b| a.site_id.cmp(&b.site_id));
        Ok(sites)
    }

    async fn watermark(&self, site_id: &SiteId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.tables.lock().await.watermarks.get(site_id).copied())
    }

    async fn advance_watermark(
        &self,
        site_id: &SiteId,
        candidate: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut tables = self.tables.lock().await;
        let previous = tables.watermarks.get(site_id).copied();
        let stored = watermark::advanced(previous, candidate);
        tables.watermarks.insert(site_id.clone(), stored);
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use meter_client::domain::ChannelValues;

    fn row(second: u32, power: f64) -> ResampledRow {
        let mut values = ChannelValues::empty();
        values.set("active_power_w", power);
        ResampledRow {
            site_id: SiteId::new("ECH001"),
            kind: SourceKind::Primary,
            day: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            ts: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, second).unwrap(),
            values,
        }
    }

    #[tokio::test]
    async fn reloading_rows_is_an_upsert() {
        let store = MemoryStore::default();
        let rows = vec![row(0, 1.0), row(1, 2.0)];

        BatchWriter::<ResampledRow>::write_batch(&store, &rows).await.unwrap();
        BatchWriter::<ResampledRow>::write_batch(&store, &[row(1, 5.0)]).await.unwrap();

        let stored = store.raw_rows(SourceKind::Primary).await;
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].values.active_power(), Some(5.0));
        assert!(store.raw_rows(SourceKind::Production).await.is_empty());
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let store = MemoryStore::default();
        let site = SiteId::new("ECH001");
        let later = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        assert_eq!(store.advance_watermark(&site, later).await.unwrap(), later);
        assert_eq!(store.advance_watermark(&site, earlier).await.unwrap(), later);
        assert_eq!(store.watermark(&site).await.unwrap(), Some(later));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::default();
        store.fail_next_writes(1);

        assert!(BatchWriter::<ResampledRow>::write_batch(&store, &[row(0, 1.0)]).await.is_err());
        assert!(BatchWriter::<ResampledRow>::write_batch(&store, &[row(0, 1.0)]).await.is_ok());
    }
}
