use std::collections::HashMap;

use chrono::{DateTime, Utc};
use meter_client::domain::{PowerRecord, ResampledRow};

/// Derives one [`PowerRecord`] per second present in `primary`.
///
/// `production` is `None` for sites without a production meter: production is
/// then zero and net equals consumption. For capable sites the production
/// meter's active power is negated and aligned by timestamp; a second missing
/// from the production series yields null production and null net.
pub fn derive_power(primary: &[ResampledRow], production: Option<&[ResampledRow]>) -> Vec<PowerRecord> {
    let produced: Option<HashMap<DateTime<Utc>, Option<f64>>> = production.map(|rows| {
        rows.iter()
            .map(|row| (row.ts, row.values.active_power().map(|p| -p)))
            .collect()
    });

    primary
        .iter()
        .map(|row| {
            let consumption = row.values.active_power();
            let production = match &produced {
                None => Some(0.0),
                Some(by_ts) => by_ts.get(&row.ts).copied().flatten(),
            };
            let net = consumption.zip(production).map(|(c, p)| c + p);

            PowerRecord {
                site_id: row.site_id.clone(),
                day: row.day,
                ts: row.ts,
                consumption,
                production,
                net,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta, TimeZone};
    use meter_client::domain::{ChannelValues, SiteId, SourceKind};

    fn series(kind: SourceKind, powers: &[Option<f64>]) -> Vec<ResampledRow> {
        let t0 = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
        powers
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut values = ChannelValues::empty();
                if let Some(p) = p {
                    values.set("active_power_w", *p);
                }
                ResampledRow {
                    site_id: SiteId::new("ECH001"),
                    kind,
                    day: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
                    ts: t0 + TimeDelta::seconds(i as i64),
                    values,
                }
            })
            .collect()
    }

    #[test]
    fn site_without_production_nets_to_consumption() {
        let primary = series(SourceKind::Primary, &[Some(500.0), None, Some(-20.0)]);
        let records = derive_power(&primary, None);

        assert_eq!(records.len(), 3);
        for (record, row) in records.iter().zip(&primary) {
            assert_eq!(record.ts, row.ts);
            assert_eq!(record.production, Some(0.0));
            assert_eq!(record.net, record.consumption);
        }
        assert_eq!(records[1].consumption, None);
    }

    #[test]
    fn production_is_subtracted_and_gaps_propagate() {
        let primary = series(SourceKind::Primary, &[Some(500.0), Some(400.0), Some(300.0), Some(200.0)]);
        // The last second is absent from the production series entirely.
        let production = series(SourceKind::Production, &[Some(120.0), None, Some(-50.0)]);

        let records = derive_power(&primary, Some(production.as_slice()));

        assert_eq!(records[0].production, Some(-120.0));
        assert_eq!(records[0].net, Some(380.0));
        assert_eq!(records[1].production, None);
        assert_eq!(records[1].net, None);
        assert_eq!(records[2].net, Some(350.0));
        assert_eq!(records[3].production, None);
        assert_eq!(records[3].net, None);
        assert_eq!(records[3].consumption, Some(200.0));
    }

    #[test]
    fn derivation_is_bit_identical_across_runs() {
        let primary = series(SourceKind::Primary, &[Some(0.1), Some(0.2), Some(1e-12)]);
        let production = series(SourceKind::Production, &[Some(0.3), Some(0.7), Some(-1e300)]);

        let a = derive_power(&primary, Some(production.as_slice()));
        let b = derive_power(&primary, Some(production.as_slice()));

        let bits = |records: &[PowerRecord]| -> Vec<Option<u64>> {
            records.iter().map(|r| r.net.map(f64::to_bits)).collect()
        };
        assert_eq!(bits(&a), bits(&b));
    }
}
