//! First-connect schema rollout.
//!
//! Each store has a fixed, ordered script sequence. A catalog lookup on the
//! target schema name decides whether anything needs to run at all; the
//! scripts themselves are only idempotent in the not-yet-applied case, so a
//! half-applied rollout surfaces the failing script and stops.

use tracing::{error, info};

use crate::error::StoreError;
use crate::pool::Pool;

const CONFIG_SCHEMA: &str = "pgwatch3";
const METRIC_SCHEMA: &str = "admin";

static CONFIG_SCHEMA_SQLS: &[&str] = &[
    include_str!("../sql/config_schema.sql"),
    include_str!("../sql/config_definitions.sql"),
];

static METRIC_SCHEMA_SQLS: &[&str] = &[
    include_str!("../sql/metric_admin_schema.sql"),
    include_str!("../sql/metric_admin_functions.sql"),
    include_str!("../sql/metric_ensure_partition_postgres.sql"),
    include_str!("../sql/metric_ensure_partition_timescale.sql"),
    include_str!("../sql/metric_change_chunk_interval_timescale.sql"),
    include_str!("../sql/metric_change_compression_interval_timescale.sql"),
];

/// Roll out the configuration-store schema if it is not present yet.
pub async fn ensure_config_schema(pool: &Pool) -> Result<(), StoreError> {
    execute_schema_scripts(pool, CONFIG_SCHEMA, CONFIG_SCHEMA_SQLS).await
}

/// Roll out the metric-store schema if it is not present yet.
pub async fn ensure_metric_schema(pool: &Pool) -> Result<(), StoreError> {
    execute_schema_scripts(pool, METRIC_SCHEMA, METRIC_SCHEMA_SQLS).await
}

async fn execute_schema_scripts(
    pool: &Pool,
    schema: &'static str,
    sqls: &[&str],
) -> Result<(), StoreError> {
    let conn = pool.get().await?;
    let exists: bool = conn
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_namespace WHERE nspname = $1)",
            &[&schema],
        )
        .await?
        .get(0);
    if exists {
        return Ok(());
    }

    info!(schema, scripts = sqls.len(), "executing schema scripts");
    for (index, sql) in sqls.iter().enumerate() {
        if let Err(source) = conn.batch_execute(sql).await {
            error!(schema, index, %source, "schema script failed, aborting rollout");
            return Err(StoreError::SchemaScript {
                schema,
                index,
                source,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_sequences_are_complete() {
        assert_eq!(CONFIG_SCHEMA_SQLS.len(), 2);
        assert_eq!(METRIC_SCHEMA_SQLS.len(), 6);
        for sql in CONFIG_SCHEMA_SQLS.iter().chain(METRIC_SCHEMA_SQLS) {
            assert!(!sql.trim().is_empty());
        }
    }

    #[test]
    fn scripts_create_their_target_schemas() {
        assert!(CONFIG_SCHEMA_SQLS[0].contains("CREATE SCHEMA pgwatch3"));
        assert!(METRIC_SCHEMA_SQLS[0].contains("CREATE SCHEMA admin"));
    }
}
