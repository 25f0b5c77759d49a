use chrono::{DateTime, NaiveDate, Utc};

use super::{channels::ChannelValues, site::SiteId, SourceKind};

/// One whole-second sample of one source of one site.
///
/// `day` is the site-local calendar day the second belongs to; it is also the
/// clustering prefix in the central raw tables.
#[derive(Debug, Clone, PartialEq)]
pub struct ResampledRow {
    pub site_id: SiteId,
    pub kind: SourceKind,
    pub day: NaiveDate,
    pub ts: DateTime<Utc>,
    pub values: ChannelValues,
}

/// A run of resampled rows belonging to one site-local day.
#[derive(Debug, Clone, PartialEq)]
pub struct DaySeries {
    pub day: NaiveDate,
    pub rows: Vec<ResampledRow>,
}
