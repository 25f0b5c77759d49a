use super::site::SiteId;

/// Per-site access entry, provisioned out of band and only read by the sync.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AccessRecord {
    pub site_id: SiteId,
    pub credential_hash: String,
    pub has_production: bool,
    pub installations: Vec<String>,
}
