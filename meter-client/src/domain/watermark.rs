use chrono::{DateTime, Utc};

use super::site::SiteId;

/// Instant below which a site's central data is complete.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Watermark {
    pub site_id: SiteId,
    pub ts: DateTime<Utc>,
}

/// The value a watermark may take after proposing `candidate`: it never moves back.
pub fn advanced(previous: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    match previous {
        Some(prev) if prev > candidate => prev,
        _ => candidate,
    }
}
