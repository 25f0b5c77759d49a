use std::time::Duration;

use crate::{config::BatchConfig, error::PipelineError};

use super::store::StoreError;

/// Writes one bounded batch of rows in a single store round trip.
#[async_trait::async_trait]
pub trait BatchWriter<T: Sync>: Send + Sync {
    async fn write_batch(&self, rows: &[T]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub rows: usize,
    pub batches: usize,
}

impl LoadStats {
    pub fn merge(&mut self, other: LoadStats) {
        self.rows += other.rows;
        self.batches += other.batches;
    }
}

/// Splits row sets into batches of at most `max_batch` rows and writes each
/// with bounded retries.
///
/// Writes are idempotent upserts, so a retried batch that partially landed
/// before the failure leaves no duplicates behind.
#[derive(Debug, Clone)]
pub struct BatchLoader {
    max_batch: usize,
    max_retries: u32,
    retry_backoff: Duration,
}

impl BatchLoader {
    pub fn new(max_batch: usize, max_retries: u32, retry_backoff: Duration) -> Self {
        Self {
            max_batch: max_batch.max(1),
            max_retries,
            retry_backoff,
        }
    }

    pub fn from_config(cfg: &BatchConfig) -> Self {
        Self::new(
            cfg.batch_size,
            cfg.max_retries,
            Duration::from_millis(cfg.retry_backoff_ms),
        )
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    /// Loads `rows` in order. `table` only labels logs and metrics.
    pub async fn load<T, W>(&self, writer: &W, table: &'static str, rows: &[T]) -> Result<LoadStats, PipelineError>
    where
        T: Sync,
        W: BatchWriter<T> + ?Sized,
    {
        let mut stats = LoadStats::default();
        for chunk in rows.chunks(self.max_batch) {
            self.flush_batch(writer, table, chunk).await?;
            stats.rows += chunk.len();
            stats.batches += 1;
        }
        Ok(stats)
    }

    async fn flush_batch<T, W>(&self, writer: &W, table: &'static str, batch: &[T]) -> Result<(), PipelineError>
    where
        T: Sync,
        W: BatchWriter<T> + ?Sized,
    {
        if batch.is_empty() {
            return Ok(());
        }

        let started = std::time::Instant::now();
        let mut attempt: u32 = 0;
        loop {
            match writer.write_batch(batch).await {
                Ok(()) => {
                    metrics::counter!("store_loaded_rows_total", "table" => table).increment(batch.len() as u64);
                    metrics::histogram!("store_batch_write_seconds", "table" => table)
                        .record(started.elapsed().as_secs_f64());
                    return Ok(());
                }
                Err(e) if attempt < self.max_retries => {
                    attempt += 1;
                    let sleep_for = self.retry_backoff * attempt;
                    tracing::warn!(
                        error = %e,
                        table,
                        attempt,
                        rows = batch.len(),
                        "batch write failed, retrying with backoff"
                    );
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, table, rows = batch.len(), "batch write failed, giving up");
                    metrics::counter!("store_write_errors_total", "table" => table).increment(1);
                    return Err(PipelineError::Sink(format!("{table}: {e}")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<Vec<u32>>>,
        failures_left: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl BatchWriter<u32> for Recording {
        async fn write_batch(&self, rows: &[u32]) -> Result<(), StoreError> {
            {
                let mut left = self.failures_left.lock().unwrap();
                if *left > 0 {
                    *left -= 1;
                    return Err(StoreError::Other("connection reset".into()));
                }
            }
            self.batches.lock().unwrap().push(rows.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn splits_into_bounded_batches_in_order() {
        let writer = Recording::default();
        let loader = BatchLoader::new(4, 0, Duration::ZERO);
        let rows: Vec<u32> = (0..10).collect();

        let stats = loader.load(&writer, "t", &rows).await.unwrap();

        assert_eq!(stats, LoadStats { rows: 10, batches: 3 });
        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(batches.concat(), rows);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let writer = Recording {
            failures_left: Mutex::new(2),
            ..Default::default()
        };
        let loader = BatchLoader::new(100, 3, Duration::from_millis(50));

        let stats = loader.load(&writer, "t", &[1, 2, 3]).await.unwrap();

        assert_eq!(stats.rows, 3);
        assert_eq!(writer.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let writer = Recording {
            failures_left: Mutex::new(5),
            ..Default::default()
        };
        let loader = BatchLoader::new(100, 2, Duration::from_millis(10));

        let err = loader.load(&writer, "power", &[1]).await.unwrap_err();

        assert!(matches!(err, PipelineError::Sink(msg) if msg.starts_with("power:")));
        assert!(writer.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_input_writes_nothing() {
        let writer = Recording::default();
        let stats = BatchLoader::new(10, 0, Duration::ZERO)
            .load(&writer, "t", &[] as &[u32])
            .await
            .unwrap();
        assert_eq!(stats, LoadStats::default());
    }
}
