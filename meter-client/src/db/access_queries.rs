use anyhow::Result;
use sqlx::PgPool;

use crate::domain::AccessRecord;

/// Every provisioned site, ordered by id.
pub async fn list_sites(pool: &PgPool) -> Result<Vec<AccessRecord>> {
    let rows = sqlx::query_as::<_, AccessRecord>(
        r#"
        SELECT
            site_id,
            credential_hash,
            has_production,
            installations
        FROM access
        ORDER BY site_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
