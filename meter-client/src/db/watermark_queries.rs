use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::domain::{SiteId, Watermark};

/// Current watermark of a site, if it was ever synced.
pub async fn read_watermark(pool: &PgPool, site_id: &SiteId) -> Result<Option<DateTime<Utc>>> {
    let row = sqlx::query_as::<_, Watermark>(
        r#"
        SELECT site_id, ts
        FROM watermark
        WHERE site_id = $1
        "#,
    )
    .bind(site_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|w| w.ts))
}

/// Proposes `candidate` as the new watermark and returns the stored value.
///
/// The upsert keeps the later of the stored and proposed instants, so a
/// concurrent or stale writer can never move a watermark backwards.
pub async fn advance_watermark(
    pool: &PgPool,
    site_id: &SiteId,
    candidate: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let row = sqlx::query_as::<_, Watermark>(
        r#"
        INSERT INTO watermark (site_id, ts)
        VALUES ($1, $2)
        ON CONFLICT (site_id)
        DO UPDATE SET ts = GREATEST(watermark.ts, EXCLUDED.ts)
        RETURNING site_id, ts
        "#,
    )
    .bind(site_id)
    .bind(candidate)
    .fetch_one(pool)
    .await?;

    Ok(row.ts)
}
