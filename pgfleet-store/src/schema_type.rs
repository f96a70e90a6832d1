//! Probe for the metric store's physical layout.

use std::fmt::{self, Display};

use tracing::debug;

use crate::pool::Pool;

/// How the metric store lays out measurement tables. Decided once per writer
/// lifetime at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageSchemaType {
    /// Native partitioned tables, sub-partitioned per monitored database.
    #[default]
    Postgres,
    /// TimescaleDB hypertables, except `_realtime` metrics which stay on
    /// native time partitions.
    Timescale,
}

impl Display for StorageSchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageSchemaType::Postgres => f.write_str("postgres"),
            StorageSchemaType::Timescale => f.write_str("timescale"),
        }
    }
}

/// Read the storage schema type from the one-row settings table. Any error
/// (including a missing row) falls back to plain Postgres partitioning.
pub async fn read_schema_type(pool: &Pool) -> StorageSchemaType {
    const SQL: &str = "SELECT schema_type = 'timescale' FROM admin.storage_schema_type";

    let is_timescale = async {
        let conn = pool.get().await.ok()?;
        let row = conn.query_one(SQL, &[]).await.ok()?;
        row.try_get::<_, bool>(0).ok()
    }
    .await;

    let schema = match is_timescale {
        Some(true) => StorageSchemaType::Timescale,
        Some(false) => StorageSchemaType::Postgres,
        None => {
            debug!("could not read storage schema type, assuming plain postgres");
            StorageSchemaType::Postgres
        }
    };
    debug!(%schema, "metric store storage schema");
    schema
}
