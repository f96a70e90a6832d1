//! Measurement messages and the row-splitting rules applied at ingestion.
//!
//! A measurement row is an untyped map of column name to scalar, exactly as
//! produced by a metric query against a monitored database. At ingestion
//! time each row is split into a timestamp, a tag map, and a payload map
//! according to the reserved-field rules below; the storage layer serializes
//! both maps to JSON without further interpretation, so scalars keep their
//! source representation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved row field carrying the measurement timestamp as nanoseconds
/// since the epoch. Expected in every metric query's result set.
pub const EPOCH_COLUMN_NAME: &str = "epoch_ns";

/// Row fields with this prefix become tags; the prefix is stripped and the
/// value stringified.
pub const TAG_PREFIX: &str = "tag_";

lazy_static! {
    static ref POOLER_METRICS: Regex = Regex::new("^pgbouncer_(stats|pools)$").unwrap();
}

/// Connection-pooler metrics never carry `epoch_ns`, so the missing-timestamp
/// warning is suppressed for them.
pub fn is_pooler_metric(metric: &str) -> bool {
    POOLER_METRICS.is_match(metric)
}

/// One result row of a metric query: column name to scalar value.
pub type MeasurementRow = Map<String, Value>;

/// A batch of rows gathered for one metric on one monitored database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeasurementEnvelope {
    /// Unique name of the monitored database the rows were gathered from.
    pub dbname: String,
    /// Metric name; lowercase `[a-z0-9_.]` by the catalog rules.
    pub metric_name: String,
    /// Extra tags configured per monitored database, merged into every row.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom_tags: HashMap<String, String>,
    /// The gathered rows.
    pub data: Vec<MeasurementRow>,
}

impl MeasurementEnvelope {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A measurement row split into its storage constituents.
#[derive(Debug, Clone, PartialEq)]
pub struct RowParts {
    /// Timestamp from `epoch_ns`, or `None` when the field was absent or
    /// zero (the writer substitutes its wall clock).
    pub timestamp: Option<DateTime<Utc>>,
    /// Non-tag payload fields.
    pub fields: Map<String, Value>,
    /// Tag fields, values stringified, custom tags included.
    pub tags: Map<String, Value>,
}

/// Split a row into timestamp, tags and payload.
///
/// Null and empty-string values are not stored. Returns `None` when nothing
/// remains after filtering, in which case the row is elided entirely.
pub fn split_row(row: &MeasurementRow, custom_tags: &HashMap<String, String>) -> Option<RowParts> {
    let mut epoch_ns = 0i64;
    let mut fields = Map::new();
    let mut tags = Map::new();

    for (k, v) in custom_tags {
        tags.insert(k.clone(), Value::String(v.clone()));
    }

    for (k, v) in row {
        if v.is_null() || v.as_str() == Some("") {
            continue;
        }
        if k == EPOCH_COLUMN_NAME {
            epoch_ns = v.as_i64().unwrap_or(0);
        } else if let Some(tag) = k.strip_prefix(TAG_PREFIX) {
            tags.insert(tag.to_owned(), Value::String(stringify(v)));
        } else {
            fields.insert(k.clone(), v.clone());
        }
    }

    if fields.is_empty() && tags.is_empty() {
        return None;
    }

    let timestamp = (epoch_ns != 0).then(|| DateTime::from_timestamp_nanos(epoch_ns));
    Some(RowParts {
        timestamp,
        fields,
        tags,
    })
}

/// Tag values are stored as strings whatever scalar the query produced.
fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> MeasurementRow {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn splits_epoch_tags_and_payload() {
        let parts = split_row(
            &row(json!({
                "epoch_ns": 1_700_000_000_000_000_000i64,
                "numbackends": 10,
                "tag_host": "h",
            })),
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(
            parts.timestamp.unwrap().to_rfc3339(),
            "2023-11-14T22:13:20+00:00"
        );
        assert_eq!(parts.fields, row(json!({"numbackends": 10})));
        assert_eq!(parts.tags, row(json!({"host": "h"})));
    }

    #[test]
    fn null_and_empty_values_are_dropped() {
        let parts = split_row(
            &row(json!({
                "numbackends": 3,
                "datname": "",
                "conflicts": null,
                "tag_role": null,
            })),
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(parts.fields, row(json!({"numbackends": 3})));
        assert!(parts.tags.is_empty());
    }

    #[test]
    fn row_with_nothing_left_is_elided() {
        assert_eq!(split_row(&row(json!({"a": null, "b": ""})), &HashMap::new()), None);
        // a bare timestamp carries no data either
        assert_eq!(
            split_row(&row(json!({"epoch_ns": 123})), &HashMap::new()),
            None
        );
    }

    #[test]
    fn tag_only_row_is_kept_with_empty_payload() {
        let parts = split_row(&row(json!({"tag_host": "h"})), &HashMap::new()).unwrap();
        assert!(parts.fields.is_empty());
        assert_eq!(parts.tags, row(json!({"host": "h"})));
    }

    #[test]
    fn zero_epoch_means_no_timestamp() {
        let parts = split_row(&row(json!({"epoch_ns": 0, "x": 1})), &HashMap::new()).unwrap();
        assert_eq!(parts.timestamp, None);
    }

    #[test]
    fn custom_tags_merge_and_row_tags_win() {
        let custom = HashMap::from([
            ("cluster".to_owned(), "prod".to_owned()),
            ("host".to_owned(), "configured".to_owned()),
        ]);
        let parts = split_row(&row(json!({"tag_host": "observed", "x": 1})), &custom).unwrap();
        assert_eq!(
            parts.tags,
            row(json!({"cluster": "prod", "host": "observed"}))
        );
    }

    #[test]
    fn non_string_tag_values_are_stringified() {
        let parts = split_row(
            &row(json!({"tag_port": 5432, "tag_primary": true, "x": 1})),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            parts.tags,
            row(json!({"port": "5432", "primary": "true"}))
        );
    }

    #[test]
    fn pooler_metric_pattern() {
        assert!(is_pooler_metric("pgbouncer_stats"));
        assert!(is_pooler_metric("pgbouncer_pools"));
        assert!(!is_pooler_metric("pgbouncer_clients"));
        assert!(!is_pooler_metric("db_stats"));
    }
}
