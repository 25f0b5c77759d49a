use chrono::{DateTime, NaiveDate, Utc};

use super::site::SiteId;

/// Derived consumption/production balance for one second of one site.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerRecord {
    pub site_id: SiteId,
    pub day: NaiveDate,
    pub ts: DateTime<Utc>,
    pub consumption: Option<f64>,
    pub production: Option<f64>,
    pub net: Option<f64>,
}
