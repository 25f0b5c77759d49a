use anyhow::Result;
use sqlx::PgPool;

use crate::domain::CHANNEL_NAMES;

fn raw_table_ddl(table: &str) -> String {
    let channels: Vec<String> = CHANNEL_NAMES
        .iter()
        .map(|c| format!("{c} DOUBLE PRECISION"))
        .collect();

    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            site_id TEXT NOT NULL,
            day     DATE NOT NULL,
            ts      TIMESTAMPTZ NOT NULL,
            {},
            PRIMARY KEY (site_id, day, ts)
        )
        "#,
        channels.join(",\n            ")
    )
}

/// Statements creating every central table, in dependency-free order.
pub fn schema_statements() -> Vec<String> {
    vec![
        r#"
        CREATE TABLE IF NOT EXISTS access (
            site_id         TEXT PRIMARY KEY,
            credential_hash TEXT NOT NULL,
            has_production  BOOLEAN NOT NULL DEFAULT FALSE,
            installations   TEXT[] NOT NULL DEFAULT '{}'
        )
        "#
        .to_string(),
        raw_table_ddl("raw_primary"),
        raw_table_ddl("raw_production"),
        r#"
        CREATE TABLE IF NOT EXISTS power (
            site_id     TEXT NOT NULL,
            day         DATE NOT NULL,
            ts          TIMESTAMPTZ NOT NULL,
            consumption DOUBLE PRECISION,
            production  DOUBLE PRECISION,
            net         DOUBLE PRECISION,
            PRIMARY KEY (site_id, day, ts)
        )
        "#
        .to_string(),
        r#"
        CREATE TABLE IF NOT EXISTS watermark (
            site_id TEXT PRIMARY KEY,
            ts      TIMESTAMPTZ NOT NULL
        )
        "#
        .to_string(),
    ]
}

/// Creates the central tables when missing. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for stmt in schema_statements() {
        sqlx::query(&stmt).execute(pool).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_tables_cluster_by_day_then_timestamp() {
        let ddl = raw_table_ddl("raw_primary");
        assert!(ddl.contains("PRIMARY KEY (site_id, day, ts)"));
        for name in CHANNEL_NAMES {
            assert!(ddl.contains(&format!("{name} DOUBLE PRECISION")), "missing {name}");
        }
    }

    #[test]
    fn schema_covers_all_tables() {
        let all = schema_statements().join("\n");
        for table in ["access", "raw_primary", "raw_production", "power", "watermark"] {
            assert!(all.contains(&format!("CREATE TABLE IF NOT EXISTS {table} ")), "missing {table}");
        }
    }
}
