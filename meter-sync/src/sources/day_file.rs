use std::io::Read;

use chrono::{DateTime, Utc};
use csv::StringRecord;
use meter_client::domain::{ChannelValues, DayFileKey, ResampledRow, CHANNEL_COUNT, CHANNEL_NAMES};

use crate::error::PipelineError;

/// Column positions of a day file, resolved from its header by name.
struct Columns {
    ts: usize,
    channels: [Option<usize>; CHANNEL_COUNT],
}

impl Columns {
    fn resolve(headers: &StringRecord) -> Result<Self, PipelineError> {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);

        let ts = position("timestamp")
            .ok_or_else(|| PipelineError::Source("missing column 'timestamp' in day file".to_string()))?;

        let mut channels = [None; CHANNEL_COUNT];
        for (slot, name) in channels.iter_mut().zip(CHANNEL_NAMES) {
            *slot = position(name);
        }

        Ok(Self { ts, channels })
    }
}

fn parse_optional_f64(s: &str) -> Result<Option<f64>, String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e| format!("invalid number '{trimmed}': {e}"))
}

fn record_to_row(key: &DayFileKey, record: &StringRecord, cols: &Columns) -> Result<ResampledRow, PipelineError> {
    let ts_str = record
        .get(cols.ts)
        .ok_or_else(|| PipelineError::Source("short record: no timestamp".to_string()))?;
    let ts = DateTime::parse_from_rfc3339(ts_str.trim())
        .map_err(|e| PipelineError::Source(format!("invalid timestamp '{ts_str}': {e}")))?
        .with_timezone(&Utc);

    let mut values = [None; CHANNEL_COUNT];
    for (value, idx) in values.iter_mut().zip(cols.channels) {
        if let Some(cell) = idx.and_then(|i| record.get(i)) {
            *value = parse_optional_f64(cell).map_err(PipelineError::Source)?;
        }
    }

    Ok(ResampledRow {
        site_id: key.site_id.clone(),
        kind: key.kind,
        day: key.day,
        ts,
        values: ChannelValues::new(values),
    })
}

/// Parses a day file into rows tagged with the file's identity.
///
/// A file fetched while the edge is still appending may end in a partial
/// line. Only newline-terminated records are parsed; the torn tail is left
/// for the next pass. Every record must carry all header columns.
///
/// Rows must be strictly increasing in time: the edge writer never produces
/// anything else, so a violation is reported instead of being sorted away.
pub fn parse_day_file<R: Read>(key: &DayFileKey, mut input: R) -> Result<Vec<ResampledRow>, PipelineError> {
    let mut raw = Vec::new();
    input
        .read_to_end(&mut raw)
        .map_err(|e| PipelineError::Source(format!("failed to read day file: {e}")))?;

    let complete = match raw.iter().rposition(|b| *b == b'\n') {
        Some(last_newline) => last_newline + 1,
        None => 0,
    };
    if complete < raw.len() {
        tracing::debug!(
            file = %key.file_name(),
            bytes = raw.len() - complete,
            "ignoring unterminated last line"
        );
        metrics::counter!("day_file_torn_tails_total", "kind" => key.kind.as_str()).increment(1);
    }
    if complete == 0 {
        return Ok(Vec::new());
    }

    let mut rdr = csv::ReaderBuilder::new().from_reader(&raw[..complete]);
    let headers = rdr
        .headers()
        .map_err(|e| PipelineError::Source(format!("failed to read day file header: {e}")))?
        .clone();
    let cols = Columns::resolve(&headers)?;

    let mut rows: Vec<ResampledRow> = Vec::new();
    let mut last: Option<DateTime<Utc>> = None;

    for result in rdr.records() {
        let record = result.map_err(|e| PipelineError::Source(format!("failed to read day file record: {e}")))?;
        let row = record_to_row(key, &record, &cols)?;

        if let Some(prev) = last {
            if row.ts <= prev {
                metrics::counter!("day_file_integrity_violations_total").increment(1);
                return Err(PipelineError::Integrity(format!(
                    "{}: row at {} does not follow {}",
                    key.file_name(),
                    row.ts,
                    prev
                )));
            }
        }
        last = Some(row.ts);
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use meter_client::domain::{SiteId, SourceKind};

    fn key() -> DayFileKey {
        DayFileKey::new(
            SiteId::new("ECH001"),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            SourceKind::Primary,
        )
    }

    #[test]
    fn parses_rows_with_nulls() {
        let data = "\
timestamp,total_power_import_kwh,active_power_w,date,site_id
2024-02-01T10:00:00+01:00,1523.1,410.5,2024-02-01,ECH001
2024-02-01T10:00:01+01:00,,,2024-02-01,ECH001
";
        let rows = parse_day_file(&key(), data.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ts, Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap());
        assert_eq!(rows[0].values.active_power(), Some(410.5));
        assert_eq!(rows[0].values.get(0), Some(1523.1));
        assert!(rows[1].values.is_empty());
        assert_eq!(rows[1].site_id, SiteId::new("ECH001"));
        assert_eq!(rows[1].kind, SourceKind::Primary);
    }

    #[test]
    fn out_of_order_rows_are_an_integrity_violation() {
        let data = "\
timestamp,active_power_w
2024-02-01T10:00:01+01:00,1.0
2024-02-01T10:00:01+01:00,2.0
";
        let err = parse_day_file(&key(), data.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::Integrity(_)));
    }

    #[test]
    fn unterminated_last_line_is_left_for_the_next_pass() {
        let data = "\
timestamp,total_power_import_kwh,active_power_w
2024-02-01T10:00:00+01:00,1523.1,410.5
2024-02-01T10:00:01+01:00,1523.1,41";
        let rows = parse_day_file(&key(), data.as_bytes()).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values.active_power(), Some(410.5));
    }

    #[test]
    fn file_with_only_a_partial_header_has_no_rows() {
        let rows = parse_day_file(&key(), "timestamp,total_po".as_bytes()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn short_records_are_rejected() {
        let data = "\
timestamp,total_power_import_kwh,active_power_w
2024-02-01T10:00:00+01:00,1523.1
";
        assert!(matches!(
            parse_day_file(&key(), data.as_bytes()),
            Err(PipelineError::Source(_))
        ));
    }

    #[test]
    fn missing_timestamp_column_is_rejected() {
        let data = "active_power_w\n1.0\n";
        assert!(matches!(
            parse_day_file(&key(), data.as_bytes()),
            Err(PipelineError::Source(_))
        ));
    }
}
