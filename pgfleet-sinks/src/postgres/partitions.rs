//! Partition management for the metric store.
//!
//! The writer keeps an in-process cache of the time envelope known to be
//! covered by physical partitions, per metric (timescale layout) or per
//! (metric, dbname) pair (plain layout). The cache is advisory: it only ever
//! lags the real catalog, and a `no partition` copy error forces one full
//! re-ensure pass on the next flush.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::SinkError;

/// Metrics with this suffix stay on plain time partitions even under the
/// timescale layout.
pub(crate) const REALTIME_SUFFIX: &str = "_realtime";

const SQL_ENSURE_DBNAME_TIME: &str =
    "select * from admin.ensure_partition_metric_dbname_time($1, $2, $3)";
const SQL_ENSURE_TIME: &str = "select * from admin.ensure_partition_metric_time($1, $2)";
const SQL_ENSURE_TIMESCALE: &str = "select admin.ensure_partition_timescale($1)";

/// Time envelope covered by existing partitions, or wanted by a flush.
/// Unset bounds on a flush request are a caller bug and fail the flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PartitionBounds {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl PartitionBounds {
    /// Widen the envelope to include `ts`.
    pub fn observe(&mut self, ts: DateTime<Utc>) {
        if self.start.map_or(true, |s| ts < s) {
            self.start = Some(ts);
        }
        if self.end.map_or(true, |e| ts > e) {
            self.end = Some(ts);
        }
    }

    fn range(&self, metric: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), SinkError> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(SinkError::ZeroPartitionBounds {
                metric: metric.to_owned(),
            }),
        }
    }
}

fn bounds_from_row(row: &Row) -> Result<PartitionBounds, SinkError> {
    Ok(PartitionBounds {
        start: Some(row.try_get(0)?),
        end: Some(row.try_get(1)?),
    })
}

/// Plain layout: make sure every (metric, dbname) pair has partitions
/// covering its wanted envelope, consulting and updating `cache`.
pub(crate) async fn ensure_dbname_time(
    conn: &Client,
    cache: &mut HashMap<String, HashMap<String, PartitionBounds>>,
    wanted: &HashMap<String, HashMap<String, PartitionBounds>>,
    force: bool,
) -> Result<(), SinkError> {
    for (metric, tenants) in wanted {
        let metric_cache = cache.entry(metric.clone()).or_default();
        for (dbname, wanted_bounds) in tenants {
            let (want_start, want_end) = wanted_bounds.range(metric)?;

            let mut known = metric_cache.get(dbname).copied().unwrap_or_default();
            if force || known.start.map_or(true, |s| want_start < s) {
                let row = conn
                    .query_one(SQL_ENSURE_DBNAME_TIME, &[metric, dbname, &want_start])
                    .await?;
                known = bounds_from_row(&row)?;
                metric_cache.insert(dbname.clone(), known);
            }
            if force || known.end.map_or(true, |e| want_end >= e) {
                // TODO: check whether this should query with want_end; the
                // server side creates the whole covering range either way
                let row = conn
                    .query_one(SQL_ENSURE_DBNAME_TIME, &[metric, dbname, &want_start])
                    .await?;
                metric_cache.insert(dbname.clone(), bounds_from_row(&row)?);
            }
        }
    }
    Ok(())
}

/// Timescale layout: hypertables for regular metrics, plain time partitions
/// for `_realtime` metrics.
pub(crate) async fn ensure_timescale(
    conn: &Client,
    cache: &mut HashMap<String, PartitionBounds>,
    wanted: &HashMap<String, PartitionBounds>,
    force: bool,
) -> Result<(), SinkError> {
    for metric in wanted.keys() {
        if metric.ends_with(REALTIME_SUFFIX) {
            continue;
        }
        if !cache.contains_key(metric) {
            conn.execute(SQL_ENSURE_TIMESCALE, &[metric]).await?;
            cache.insert(metric.clone(), PartitionBounds::default());
        }
    }
    ensure_metric_time(conn, cache, wanted, force).await
}

/// Plain time partitions keyed on metric only; under the timescale layout
/// this applies to `_realtime` metrics.
pub(crate) async fn ensure_metric_time(
    conn: &Client,
    cache: &mut HashMap<String, PartitionBounds>,
    wanted: &HashMap<String, PartitionBounds>,
    force: bool,
) -> Result<(), SinkError> {
    for (metric, wanted_bounds) in wanted {
        if !metric.ends_with(REALTIME_SUFFIX) {
            continue;
        }
        let (want_start, want_end) = wanted_bounds.range(metric)?;

        let mut known = cache.get(metric).copied().unwrap_or_default();
        if force || known.start.map_or(true, |s| want_start < s) {
            let row = conn.query_one(SQL_ENSURE_TIME, &[metric, &want_start]).await?;
            known = bounds_from_row(&row)?;
            cache.insert(metric.clone(), known);
        }
        if force || known.end.map_or(true, |e| want_end > e) {
            let row = conn.query_one(SQL_ENSURE_TIME, &[metric, &want_end]).await?;
            // only the end advances here; the returned start is discarded
            known.end = Some(row.try_get(1)?);
            cache.insert(metric.clone(), known);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn observe_widens_the_envelope() {
        let mut bounds = PartitionBounds::default();
        bounds.observe(ts(100));
        assert_eq!(bounds.start, Some(ts(100)));
        assert_eq!(bounds.end, Some(ts(100)));

        bounds.observe(ts(50));
        bounds.observe(ts(200));
        bounds.observe(ts(150));
        assert_eq!(bounds.start, Some(ts(50)));
        assert_eq!(bounds.end, Some(ts(200)));
    }

    #[test]
    fn unset_bounds_are_a_usage_error() {
        let err = PartitionBounds::default().range("wal").unwrap_err();
        assert!(matches!(
            err,
            SinkError::ZeroPartitionBounds { metric } if metric == "wal"
        ));
    }

    #[test]
    fn start_is_never_after_end() {
        let mut bounds = PartitionBounds::default();
        for secs in [30, 10, 20, 40] {
            bounds.observe(ts(secs));
        }
        let (start, end) = bounds.range("db_stats").unwrap();
        assert!(start <= end);
    }
}
