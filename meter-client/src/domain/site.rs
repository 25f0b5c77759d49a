use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Identifier of one edge installation (also its remote login name).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SiteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Which meter of a site a series comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceKind {
    /// Grid connection meter (consumption).
    Primary,
    /// Meter on the production installation, only present on capable sites.
    Production,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Primary, SourceKind::Production];

    /// Suffix used in day file names.
    pub fn file_tag(self) -> &'static str {
        match self {
            SourceKind::Primary => "p1",
            SourceKind::Production => "pv",
        }
    }

    pub fn from_file_tag(tag: &str) -> Option<Self> {
        match tag {
            "p1" => Some(SourceKind::Primary),
            "pv" => Some(SourceKind::Production),
            _ => None,
        }
    }

    /// Central table holding the raw rows of this kind.
    pub fn raw_table(self) -> &'static str {
        match self {
            SourceKind::Primary => "raw_primary",
            SourceKind::Production => "raw_production",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Production => "production",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calendar day of `ts` in the site's local time zone.
pub fn site_day(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// First instant of `day` in the site's local time zone.
///
/// Falls back to the earliest valid local time when midnight does not exist
/// (DST gap), and to UTC midnight if the zone has no valid time at all that day.
pub fn start_of_day(day: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
    match tz.from_local_datetime(&midnight).earliest() {
        Some(local) => local.with_timezone(&Utc),
        None => (0..24)
            .filter_map(|h| day.and_hms_opt(h, 0, 0))
            .find_map(|t| tz.from_local_datetime(&t).earliest())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&midnight)),
    }
}
