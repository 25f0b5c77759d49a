use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use chrono::SecondsFormat;
use chrono_tz::Tz;
use meter_client::domain::{DayFileKey, DaySeries, CHANNEL_NAMES};

use crate::error::PipelineError;

/// Column header of every day file.
pub fn header() -> Vec<&'static str> {
    let mut cols = Vec::with_capacity(CHANNEL_NAMES.len() + 3);
    cols.push("timestamp");
    cols.extend(CHANNEL_NAMES);
    cols.push("date");
    cols.push("site_id");
    cols
}

/// Cuts a partial last line left by an interrupted write, so the next append
/// starts on a fresh line. Returns the length kept.
fn trim_torn_tail(file: &mut File) -> io::Result<u64> {
    const CHUNK: u64 = 4096;

    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = vec![0u8; CHUNK as usize];

    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;

        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                file.set_len(keep)?;
            }
            return Ok(keep);
        }
        end = start;
    }

    if len > 0 {
        file.set_len(0)?;
    }
    Ok(0)
}

/// Appends resampled rows to `<data_dir>/<YYYY>/<MM>/<file>` per (site, day, kind).
///
/// Append is the only mutation. Reopening an existing file after a crash
/// first drops a partial last line, if any. The header is written when the
/// file is new or holds no complete line, never otherwise.
#[derive(Debug, Clone)]
pub struct DayFileAppender {
    data_dir: PathBuf,
    tz: Tz,
}

impl DayFileAppender {
    pub fn new<P: Into<PathBuf>>(data_dir: P, tz: Tz) -> Self {
        Self {
            data_dir: data_dir.into(),
            tz,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn path_for(&self, key: &DayFileKey) -> PathBuf {
        self.data_dir.join(key.relative_path())
    }

    /// Appends one day's rows and syncs the file. Blocking.
    ///
    /// Returns the file written, or `None` when `series` is empty.
    pub fn append(&self, series: &DaySeries) -> Result<Option<PathBuf>, PipelineError> {
        let Some(first) = series.rows.first() else {
            return Ok(None);
        };
        let key = DayFileKey::new(first.site_id.clone(), series.day, first.kind);
        let path = self.path_for(&key);

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| PipelineError::Sink(format!("failed to create {}: {e}", dir.display())))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| PipelineError::Sink(format!("failed to open {}: {e}", path.display())))?;
        let kept = trim_torn_tail(&mut file)
            .map_err(|e| PipelineError::Sink(format!("failed to check tail of {}: {e}", path.display())))?;
        let needs_header = kept == 0;

        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        let write_err = |e: csv::Error| PipelineError::Sink(format!("failed to write {}: {e}", path.display()));

        if needs_header {
            wtr.write_record(header()).map_err(write_err)?;
        }

        let date = series.day.format("%Y-%m-%d").to_string();
        for row in &series.rows {
            let mut record: Vec<String> = Vec::with_capacity(CHANNEL_NAMES.len() + 3);
            record.push(
                row.ts
                    .with_timezone(&self.tz)
                    .to_rfc3339_opts(SecondsFormat::Secs, false),
            );
            record.extend(row.values.iter().map(|v| v.map(|x| x.to_string()).unwrap_or_default()));
            record.push(date.clone());
            record.push(row.site_id.to_string());
            wtr.write_record(&record).map_err(write_err)?;
        }

        let file = wtr
            .into_inner()
            .map_err(|e| PipelineError::Sink(format!("failed to flush {}: {e}", path.display())))?;
        file.sync_data()
            .map_err(|e| PipelineError::Sink(format!("failed to sync {}: {e}", path.display())))?;

        metrics::counter!("day_file_rows_appended_total", "kind" => key.kind.as_str())
            .increment(series.rows.len() as u64);

        Ok(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::parse_day_file;
    use chrono::{NaiveDate, TimeDelta, TimeZone, Utc};
    use chrono_tz::Europe::Brussels;
    use meter_client::domain::{ChannelValues, ResampledRow, SiteId, SourceKind};

    fn series(start_second: i64, len: i64) -> DaySeries {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let rows = (start_second..start_second + len)
            .map(|i| {
                let mut values = ChannelValues::empty();
                if i % 2 == 0 {
                    values.set("active_power_w", i as f64 * 1.5);
                }
                ResampledRow {
                    site_id: SiteId::new("ECH001"),
                    kind: SourceKind::Primary,
                    day,
                    ts: t0 + TimeDelta::seconds(i),
                    values,
                }
            })
            .collect();
        DaySeries { day, rows }
    }

    #[test]
    fn header_is_written_once_across_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let appender = DayFileAppender::new(dir.path(), Brussels);

        let path = appender.append(&series(0, 3)).unwrap().unwrap();
        // A fresh appender stands in for a restarted process.
        let reopened = DayFileAppender::new(dir.path(), Brussels);
        assert_eq!(reopened.append(&series(3, 2)).unwrap(), Some(path.clone()));

        assert!(path.ends_with("2024/02/2024_02_01_ECH001_p1.csv"));
        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1 + 5);
        assert_eq!(content.matches("timestamp,").count(), 1);
        assert!(lines[0].starts_with("timestamp,total_power_import_kwh,"));
        assert!(lines[0].ends_with(",date,site_id"));
        assert!(lines[1].starts_with("2024-02-01T10:00:00+01:00,"));
        assert!(lines[1].ends_with(",2024-02-01,ECH001"));
    }

    #[test]
    fn appended_file_parses_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let appender = DayFileAppender::new(dir.path(), Brussels);
        appender.append(&series(0, 4)).unwrap();
        let path = appender.append(&series(4, 4)).unwrap().unwrap();

        let key = DayFileKey::new(
            SiteId::new("ECH001"),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            SourceKind::Primary,
        );
        let rows = parse_day_file(&key, fs::File::open(path).unwrap()).unwrap();

        assert_eq!(rows.len(), 8);
        assert_eq!(rows[2].values.active_power(), Some(3.0));
        assert_eq!(rows[3].values.active_power(), None);
        for pair in rows.windows(2) {
            assert_eq!(pair[1].ts - pair[0].ts, TimeDelta::seconds(1));
        }
    }

    fn write_torn(path: &Path, bytes: &str) {
        use std::io::Write;
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes.as_bytes()).unwrap();
    }

    #[test]
    fn append_after_a_torn_line_starts_on_a_fresh_line() {
        let dir = tempfile::tempdir().unwrap();
        let appender = DayFileAppender::new(dir.path(), Brussels);
        let path = appender.append(&series(0, 3)).unwrap().unwrap();

        // The previous process died halfway through the row for second 3.
        write_torn(&path, "2024-02-01T10:00:03+01:00,1,2");
        appender.append(&series(3, 2)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.ends_with('\n'));
        assert!(!content.contains("22024"));
        assert_eq!(content.lines().count(), 1 + 5);

        let key = DayFileKey::new(
            SiteId::new("ECH001"),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            SourceKind::Primary,
        );
        let rows = parse_day_file(&key, fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[3].values.active_power(), None);
        assert_eq!(rows[4].values.active_power(), Some(6.0));
    }

    #[test]
    fn torn_header_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let appender = DayFileAppender::new(dir.path(), Brussels);
        let key = DayFileKey::new(
            SiteId::new("ECH001"),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            SourceKind::Primary,
        );
        let path = appender.path_for(&key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "timestamp,total_po").unwrap();

        appender.append(&series(0, 2)).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("timestamp,total_power_import_kwh,"));
        assert_eq!(content.lines().count(), 1 + 2);
    }

    #[test]
    fn empty_series_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let appender = DayFileAppender::new(dir.path(), Brussels);
        let empty = DaySeries {
            day: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            rows: Vec::new(),
        };
        assert_eq!(appender.append(&empty).unwrap(), None);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
