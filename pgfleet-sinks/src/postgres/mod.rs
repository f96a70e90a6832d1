//! The PostgreSQL metric-store writer.
//!
//! Batches arriving through [`Writer::write`] land on a bounded queue; a
//! single batcher task drains the queue, accumulates messages up to the
//! cache limit or the batching delay, makes sure partitions cover the
//! flush's time range, and streams the rows per metric with bulk copy.
//! Retention pruning and the distinct-dbname listing refresh run as
//! independent background loops against the same pool.

mod copy;
mod maintenance;
mod partitions;

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgfleet_data::{is_pooler_metric, split_row, MeasurementEnvelope};
use pgfleet_store::{connect_metric_store, read_schema_type, Pool, StorageSchemaType};
use pgfleet_util::shutdown::ShutdownReceiver;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{SinkError, SinkStats, SyncOp, Writer};
use copy::StoredMeasurement;
use partitions::PartitionBounds;

/// Upper bound on buffered measurement messages and on queued batches.
const CACHE_LIMIT: usize = 512;

/// How long `write` may wait for queue space before shedding the batch.
const HIGH_LOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Change-event metrics always get a top-level table so dashboards see an
/// empty result set instead of a missing relation.
const BUILTIN_DUMMIES: [&str; 6] = [
    "sproc_changes",
    "table_changes",
    "index_changes",
    "privilege_changes",
    "object_changes",
    "configuration_changes",
];

const SQL_ENSURE_DUMMY: &str = "select admin.ensure_dummy_metrics_table($1)";
const SQL_ADD_TENANT_METRIC: &str = "
    INSERT INTO admin.all_distinct_dbname_metrics
    SELECT $1, $2
    WHERE NOT EXISTS (
        SELECT 1 FROM admin.all_distinct_dbname_metrics WHERE dbname = $1 AND metric = $2)";

/// Tunables of one metric-store sink.
#[derive(Debug, Clone)]
pub struct PostgresSinkOptions {
    /// Maximum time a partial buffer waits before being flushed.
    pub batching_delay: Duration,
    /// Measurements older than this many days are pruned; non-positive
    /// disables retention.
    pub retention_days: i32,
}

impl Default for PostgresSinkOptions {
    fn default() -> Self {
        Self {
            batching_delay: Duration::from_millis(250),
            retention_days: 14,
        }
    }
}

/// Writer for a PostgreSQL (or TimescaleDB) metric store.
pub struct PostgresWriter {
    pool: Pool,
    schema: StorageSchemaType,
    input: mpsc::Sender<Vec<MeasurementEnvelope>>,
    last_error: Mutex<mpsc::Receiver<SinkError>>,
    shutdown: ShutdownReceiver,
    stats: Arc<SinkStats>,
}

impl PostgresWriter {
    /// Connect to the metric store at `connstr`, bootstrap its schema if
    /// needed, and start the batcher and maintenance tasks.
    pub async fn connect(
        connstr: &str,
        options: PostgresSinkOptions,
        shutdown: ShutdownReceiver,
    ) -> Result<Self, SinkError> {
        let pool = connect_metric_store(connstr).await?;
        let schema = read_schema_type(&pool).await;

        let (input, queue) = mpsc::channel(CACHE_LIMIT);
        let (error_tx, error_rx) = mpsc::channel(1);
        let stats = Arc::new(SinkStats::default());

        let writer = PostgresWriter {
            pool: pool.clone(),
            schema,
            input,
            last_error: Mutex::new(error_rx),
            shutdown: shutdown.clone(),
            stats: Arc::clone(&stats),
        };
        writer.ensure_builtin_metric_dummies().await?;

        let batcher = Batcher {
            pool: pool.clone(),
            schema,
            stats,
            last_error: error_tx,
            batching_delay: options.batching_delay,
            metric_bounds: HashMap::new(),
            tenant_bounds: HashMap::new(),
            force_recreate: false,
            server_time_warned: false,
        };
        tokio::spawn(batcher.run(queue, shutdown.clone()));
        tokio::spawn(
            maintenance::RetentionWorker::new(
                pool.clone(),
                schema,
                options.retention_days,
                shutdown.clone(),
            )
            .run(),
        );
        tokio::spawn(maintenance::ListingMaintainer::new(pool, shutdown).run());

        Ok(writer)
    }

    /// The storage layout decided at startup; fixed for this writer's life.
    pub fn schema_type(&self) -> StorageSchemaType {
        self.schema
    }

    /// Snapshot handle for the writer's drop/failure counters.
    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }

    async fn ensure_builtin_metric_dummies(&self) -> Result<(), SinkError> {
        let mut errors = Vec::new();
        for metric in BUILTIN_DUMMIES {
            if let Err(e) = self.ensure_metric_dummy(metric).await {
                errors.push(e);
            }
        }
        SinkError::join(errors)
    }

    async fn ensure_metric_dummy(&self, metric: &str) -> Result<(), SinkError> {
        let conn = self.pool.get().await?;
        conn.execute(SQL_ENSURE_DUMMY, &[&metric]).await?;
        Ok(())
    }

    async fn add_tenant_metric(&self, dbname: &str, metric: &str) -> Result<(), SinkError> {
        let conn = self.pool.get().await?;
        conn.execute(SQL_ADD_TENANT_METRIC, &[&dbname, &metric])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Writer for PostgresWriter {
    async fn sync_metric(&self, dbname: &str, metric: &str, op: SyncOp) -> Result<(), SinkError> {
        match op {
            SyncOp::Add => {
                let mut errors = Vec::new();
                if let Err(e) = self.add_tenant_metric(dbname, metric).await {
                    errors.push(e);
                }
                if let Err(e) = self.ensure_metric_dummy(metric).await {
                    errors.push(e);
                }
                SinkError::join(errors)
            }
            SyncOp::Remove => Ok(()),
        }
    }

    async fn write(&self, batch: Vec<MeasurementEnvelope>) -> Result<(), SinkError> {
        if self.shutdown.signalled() {
            return Ok(());
        }

        // Shed at ingress under sustained overload: a full queue must slow
        // down the monitored databases' pollers, never block them.
        let _ = timeout(HIGH_LOAD_TIMEOUT, self.input.send(batch)).await;

        // Surface at most one pending flush error per call.
        if let Ok(mut last_error) = self.last_error.try_lock() {
            if let Ok(error) = last_error.try_recv() {
                return Err(error);
            }
        }
        Ok(())
    }
}

/// Everything the flush path touches lives on the batcher task; only the
/// counters behind [`SinkStats`] are shared.
struct Batcher {
    pool: Pool,
    schema: StorageSchemaType,
    stats: Arc<SinkStats>,
    last_error: mpsc::Sender<SinkError>,
    batching_delay: Duration,
    /// metric -> covered time envelope (timescale layout)
    metric_bounds: HashMap<String, PartitionBounds>,
    /// metric -> dbname -> covered time envelope (plain layout)
    tenant_bounds: HashMap<String, HashMap<String, PartitionBounds>>,
    /// Set by a `no partition` copy error; the next flush re-ensures every
    /// partition before writing.
    force_recreate: bool,
    server_time_warned: bool,
}

impl Batcher {
    async fn run(
        mut self,
        mut queue: mpsc::Receiver<Vec<MeasurementEnvelope>>,
        mut shutdown: ShutdownReceiver,
    ) {
        let mut buffer: Vec<MeasurementEnvelope> = Vec::with_capacity(CACHE_LIMIT);
        let mut tick = interval(self.batching_delay);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return,
                received = queue.recv() => {
                    let Some(batch) = received else { return };
                    buffer.extend(batch);
                    if buffer.len() >= CACHE_LIMIT {
                        tick.reset();
                        self.flush(&mut buffer).await;
                    }
                }
                _ = tick.tick() => self.flush(&mut buffer).await,
            }
        }
    }

    async fn flush(&mut self, buffer: &mut Vec<MeasurementEnvelope>) {
        if buffer.is_empty() {
            return;
        }
        let msgs: Vec<MeasurementEnvelope> = buffer.drain(..).collect();
        let started = Instant::now();

        let plan = build_flush_plan(&msgs, self.schema, &mut self.server_time_warned, Utc::now());

        let force = mem::take(&mut self.force_recreate);
        let ensured = self.ensure_partitions(&plan, force).await;
        if let Err(error) = ensured {
            error!(%error, "partition setup failed, abandoning flush");
            self.stats.record_write_failure();
            let _ = self.last_error.try_send(error);
            return;
        }

        debug!(rows = plan.rows_batched, "copying measurement rows to the metric store");
        for (metric, rows) in &plan.rows_per_metric {
            if let Err(error) = copy::copy_metric_rows(&self.pool, metric, rows, &self.stats).await
            {
                self.stats.record_write_failure();
                if copy::partition_missing(&error.to_string()) {
                    warn!(
                        %metric,
                        "a metric partition seems to have been dropped, will re-create \
                         all needed partitions on the next flush"
                    );
                    self.force_recreate = true;
                }
                error!(%metric, %error, "metric copy failed");
                let _ = self.last_error.try_send(error);
            }
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let [only] = msgs.as_slice() {
            info!(
                rows_batched = plan.rows_batched,
                rows_total = plan.rows_total,
                elapsed_ms,
                dbname = %only.dbname,
                metric = %only.metric_name,
                "wrote measurement rows"
            );
        } else {
            info!(
                rows_batched = plan.rows_batched,
                rows_total = plan.rows_total,
                elapsed_ms,
                metric_sets = msgs.len(),
                "wrote measurement rows"
            );
        }
    }

    async fn ensure_partitions(&mut self, plan: &FlushPlan, force: bool) -> Result<(), SinkError> {
        let conn = self.pool.get().await?;
        match self.schema {
            StorageSchemaType::Postgres => {
                partitions::ensure_dbname_time(
                    &conn,
                    &mut self.tenant_bounds,
                    &plan.tenant_bounds,
                    force,
                )
                .await
            }
            StorageSchemaType::Timescale => {
                partitions::ensure_timescale(
                    &conn,
                    &mut self.metric_bounds,
                    &plan.metric_bounds,
                    force,
                )
                .await
            }
        }
    }
}

/// The work derived from one buffer of messages: rows grouped per metric
/// plus the partition envelopes they require.
#[derive(Default)]
struct FlushPlan {
    rows_per_metric: HashMap<String, Vec<StoredMeasurement>>,
    metric_bounds: HashMap<String, PartitionBounds>,
    tenant_bounds: HashMap<String, HashMap<String, PartitionBounds>>,
    rows_batched: usize,
    rows_total: usize,
}

fn build_flush_plan(
    msgs: &[MeasurementEnvelope],
    schema: StorageSchemaType,
    server_time_warned: &mut bool,
    now: DateTime<Utc>,
) -> FlushPlan {
    let mut plan = FlushPlan::default();
    for msg in msgs {
        if msg.data.is_empty() {
            continue;
        }
        for raw_row in &msg.data {
            plan.rows_total += 1;
            let Some(parts) = split_row(raw_row, &msg.custom_tags) else {
                continue;
            };
            let time = match parts.timestamp {
                Some(t) => t,
                None => {
                    if !*server_time_warned && !is_pooler_metric(&msg.metric_name) {
                        warn!(
                            metric = %msg.metric_name,
                            "no epoch_ns found in measurement, server time will be used"
                        );
                        *server_time_warned = true;
                    }
                    now
                }
            };

            plan.rows_per_metric
                .entry(msg.metric_name.clone())
                .or_default()
                .push(StoredMeasurement {
                    time,
                    dbname: msg.dbname.clone(),
                    data: parts.fields,
                    tag_data: parts.tags,
                });
            plan.rows_batched += 1;

            match schema {
                StorageSchemaType::Timescale => plan
                    .metric_bounds
                    .entry(msg.metric_name.clone())
                    .or_default()
                    .observe(time),
                StorageSchemaType::Postgres => plan
                    .tenant_bounds
                    .entry(msg.metric_name.clone())
                    .or_default()
                    .entry(msg.dbname.clone())
                    .or_default()
                    .observe(time),
            }
        }
    }
    plan
}
