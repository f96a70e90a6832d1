//! Bulk-copy streaming of measurement rows into per-metric tables.

use chrono::{DateTime, Utc};
use futures::pin_mut;
use pgfleet_store::ident::quote_ident;
use pgfleet_store::Pool;
use serde_json::{Map, Value};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::types::{ToSql, Type};
use tracing::{error, warn};

use crate::{SinkError, SinkStats};

const COPY_COLUMN_TYPES: &[Type] = &[Type::TIMESTAMPTZ, Type::TEXT, Type::JSON, Type::JSON];

/// A measurement row reduced to its stored shape.
#[derive(Debug, Clone)]
pub(crate) struct StoredMeasurement {
    pub time: DateTime<Utc>,
    pub dbname: String,
    pub data: Map<String, Value>,
    pub tag_data: Map<String, Value>,
}

/// Partition-missing copy errors trigger a full re-ensure pass; they are
/// recognized by message substring, as reported by the server.
pub(crate) fn partition_missing(message: &str) -> bool {
    message.contains("no partition")
}

/// Stream `rows` into the metric's top-level table. Rows that fail payload
/// encoding are dropped individually; a tag encoding failure only nulls the
/// tag column. Returns the number of rows handed to the server.
pub(crate) async fn copy_metric_rows(
    pool: &Pool,
    metric: &str,
    rows: &[StoredMeasurement],
    stats: &SinkStats,
) -> Result<u64, SinkError> {
    let conn = pool.get().await?;
    let copy = format!(
        "COPY public.{} (time, dbname, data, tag_data) FROM STDIN BINARY",
        quote_ident(metric)
    );
    let sink = conn.copy_in(&copy).await?;
    let writer = BinaryCopyInWriter::new(sink, COPY_COLUMN_TYPES);
    pin_mut!(writer);

    let mut written = 0u64;
    for m in rows {
        let payload = match serde_json::to_value(&m.data) {
            Ok(v) => v,
            Err(error) => {
                warn!(dbname = %m.dbname, metric, %error,
                      "skipping measurement row, payload is not JSON-encodable");
                stats.record_dropped();
                continue;
            }
        };
        let tag_payload = if m.tag_data.is_empty() {
            None
        } else {
            match serde_json::to_value(&m.tag_data) {
                Ok(v) => Some(v),
                Err(error) => {
                    error!(dbname = %m.dbname, metric, %error,
                           "tag data is not JSON-encodable, storing null tags");
                    stats.record_write_failure();
                    None
                }
            }
        };

        let row: [&(dyn ToSql + Sync); 4] = [&m.time, &m.dbname, &payload, &tag_payload];
        writer.as_mut().write(&row).await?;
        written += 1;
    }
    writer.finish().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_partition_missing_errors() {
        assert!(partition_missing(
            "ERROR: no partition of relation \"wal\" found for row"
        ));
        assert!(!partition_missing("connection reset by peer"));
        assert!(!partition_missing("ERROR: relation \"wal\" does not exist"));
    }
}
