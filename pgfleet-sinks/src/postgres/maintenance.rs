//! Background maintenance loops of the metric store writer: retention
//! pruning and the distinct-dbname listing refresh. Both run against the
//! shared pool and never touch the writer's partition caches; the copy
//! engine's no-partition recovery reconciles lazily.

use std::time::Duration;

use pgfleet_store::ident::quote_qualified;
use pgfleet_store::{Pool, StorageSchemaType};
use pgfleet_util::shutdown::ShutdownReceiver;
use tracing::{debug, error, info};

use crate::SinkError;

const RETENTION_STARTUP_DELAY: Duration = Duration::from_secs(60 * 60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
const RETENTION_ERROR_BACKOFF: Duration = Duration::from_secs(300);
const RETENTION_DROP_PAUSE: Duration = Duration::from_secs(5);

const LISTING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const LISTING_METRIC_PAUSE: Duration = Duration::from_secs(60);

/// Cooperative lock key shared by all collector instances writing to one
/// metric store; an arbitrary fixed bigint.
const LISTING_LOCK_KEY: i64 = 1_571_543_679_778_230_000;

/// Sleep unless shutdown arrives first; returns true on shutdown.
async fn idle(shutdown: &mut ShutdownReceiver, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Periodically drops partitions holding measurements older than the
/// configured threshold. A non-positive threshold disables the worker.
pub(crate) struct RetentionWorker {
    pool: Pool,
    schema: StorageSchemaType,
    older_than_days: i32,
    shutdown: ShutdownReceiver,
}

impl RetentionWorker {
    pub fn new(
        pool: Pool,
        schema: StorageSchemaType,
        older_than_days: i32,
        shutdown: ShutdownReceiver,
    ) -> Self {
        Self {
            pool,
            schema,
            older_than_days,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        if self.older_than_days <= 0 {
            return;
        }
        // stay quiet through the chatty startup phase
        if idle(&mut self.shutdown, RETENTION_STARTUP_DELAY).await {
            return;
        }
        loop {
            match self.schema {
                StorageSchemaType::Timescale => match self.drop_old_time_partitions().await {
                    Ok(dropped) => info!(dropped, "dropped old metric partitions"),
                    Err(error) => error!(
                        older_than_days = self.older_than_days,
                        %error,
                        "failed to drop old metric partitions"
                    ),
                },
                StorageSchemaType::Postgres => {
                    if self.prune_plain_partitions().await {
                        return;
                    }
                }
            }
            if idle(&mut self.shutdown, RETENTION_INTERVAL).await {
                return;
            }
        }
    }

    async fn drop_old_time_partitions(&self) -> Result<i32, SinkError> {
        let conn = self.pool.get().await?;
        let row = conn
            .query_one(
                "select admin.drop_old_time_partitions($1, $2)",
                &[&self.older_than_days, &false],
            )
            .await?;
        Ok(row.try_get(0)?)
    }

    /// One plain-layout pruning pass; returns true on shutdown.
    async fn prune_plain_partitions(&mut self) -> bool {
        loop {
            let listed = self.list_old_time_partitions().await;
            let partitions = match listed {
                Ok(partitions) => partitions,
                Err(error) => {
                    error!(
                        older_than_days = self.older_than_days,
                        %error,
                        "failed to list old time partitions, check that \
                         admin.get_old_time_partitions() is rolled out"
                    );
                    if idle(&mut self.shutdown, RETENTION_ERROR_BACKOFF).await {
                        return true;
                    }
                    continue;
                }
            };
            if partitions.is_empty() {
                info!("no old metric partitions found to drop");
                return false;
            }

            info!(count = partitions.len(), "dropping old metric partitions one by one");
            for table in partitions {
                debug!(%table, "dropping old metric data partition");
                let pause = match self.drop_partition(&table).await {
                    Ok(()) => RETENTION_DROP_PAUSE,
                    Err(error) => {
                        error!(%table, %error, "failed to drop old metric partition");
                        RETENTION_ERROR_BACKOFF
                    }
                };
                if idle(&mut self.shutdown, pause).await {
                    return true;
                }
            }
            return false;
        }
    }

    async fn list_old_time_partitions(&self) -> Result<Vec<String>, SinkError> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "select admin.get_old_time_partitions($1)",
                &[&self.older_than_days],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| r.try_get(0))
            .collect::<Result<_, _>>()?)
    }

    async fn drop_partition(&self, table: &str) -> Result<(), SinkError> {
        let conn = self.pool.get().await?;
        conn.execute(&drop_partition_sql(table), &[]).await?;
        Ok(())
    }
}

fn drop_partition_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_qualified(table))
}

/// The recursive skip scan pgfleet uses to enumerate distinct dbnames of a
/// metric table without a full sequential pass.
fn distinct_dbnames_sql(table: &str) -> String {
    let table = quote_qualified(table);
    format!(
        "WITH RECURSIVE t(dbname) AS (
            SELECT MIN(dbname) AS dbname FROM {table}
            UNION
            SELECT (SELECT MIN(dbname) FROM {table} WHERE dbname > t.dbname) FROM t)
        SELECT dbname FROM t WHERE dbname NOTNULL ORDER BY 1"
    )
}

const SQL_ADVISORY_LOCK: &str = "SELECT pg_try_advisory_lock($1) AS have_lock";
const SQL_TOP_LEVEL_TABLES: &str = "SELECT table_name FROM admin.get_top_level_metric_tables()";
const SQL_DELETE_STALE: &str =
    "DELETE FROM admin.all_distinct_dbname_metrics WHERE NOT dbname = ANY($1) AND metric = $2";
const SQL_DELETE_ALL: &str = "DELETE FROM admin.all_distinct_dbname_metrics WHERE metric = $1";
const SQL_ADD_MISSING: &str = "
    INSERT INTO admin.all_distinct_dbname_metrics
    SELECT u, $2 FROM (SELECT unnest($1::text[]) AS u) x
    WHERE NOT EXISTS (
        SELECT 1 FROM admin.all_distinct_dbname_metrics WHERE dbname = u AND metric = $2)";

/// Keeps `admin.all_distinct_dbname_metrics` in sync with the dbnames that
/// actually occur in the per-metric tables; retention makes the listing go
/// stale without this. Coordinates with other collector instances through a
/// session-scoped advisory lock, so one refresher runs per store.
pub(crate) struct ListingMaintainer {
    pool: Pool,
    shutdown: ShutdownReceiver,
}

impl ListingMaintainer {
    pub fn new(pool: Pool, shutdown: ShutdownReceiver) -> Self {
        Self { pool, shutdown }
    }

    pub async fn run(mut self) {
        loop {
            if idle(&mut self.shutdown, LISTING_INTERVAL).await {
                return;
            }
            if self.refresh().await {
                return;
            }
        }
    }

    /// One refresh cycle; returns true on shutdown. The advisory lock is
    /// session-scoped, so the whole cycle runs on a single pooled session.
    async fn refresh(&mut self) -> bool {
        info!("trying to acquire the dbname listing maintainer advisory lock");
        let conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(error) => {
                error!(%error, "acquiring the listing maintainer advisory lock failed");
                return false;
            }
        };
        let locked = conn
            .query_one(SQL_ADVISORY_LOCK, &[&LISTING_LOCK_KEY])
            .await
            .and_then(|row| row.try_get::<_, bool>("have_lock"));
        match locked {
            Ok(true) => {}
            Ok(false) => {
                info!("skipping dbname listing maintenance, another instance holds the advisory lock");
                return false;
            }
            Err(error) => {
                error!(%error, "acquiring the listing maintainer advisory lock failed");
                return false;
            }
        }

        info!("refreshing the admin.all_distinct_dbname_metrics listing table");
        let tables: Vec<String> = match conn.query(SQL_TOP_LEVEL_TABLES, &[]).await {
            Ok(rows) => match rows.iter().map(|r| r.try_get(0)).collect() {
                Ok(tables) => tables,
                Err(error) => {
                    error!(%error, "listing top-level metric tables failed");
                    return false;
                }
            },
            Err(error) => {
                error!(%error, "listing top-level metric tables failed");
                return false;
            }
        };

        for table in tables {
            let metric = table.strip_prefix("public.").unwrap_or(&table).to_owned();
            debug!(%metric, "refreshing the dbname listing");

            let dbnames: Result<Vec<String>, _> = match conn
                .query(&distinct_dbnames_sql(&table), &[])
                .await
            {
                Ok(rows) => rows.iter().map(|r| r.try_get(0)).collect(),
                Err(error) => {
                    error!(%metric, %error, "enumerating distinct dbnames failed");
                    break;
                }
            };
            let dbnames = match dbnames {
                Ok(dbnames) => dbnames,
                Err(error) => {
                    error!(%metric, %error, "enumerating distinct dbnames failed");
                    break;
                }
            };

            if dbnames.is_empty() {
                debug!(%metric, "no dbnames left, deleting all listing entries for the metric");
                if let Err(error) = conn.execute(SQL_DELETE_ALL, &[&metric]).await {
                    error!(%metric, %error, "deleting dbname listing entries failed");
                }
                continue;
            }

            match conn.execute(SQL_DELETE_STALE, &[&dbnames, &metric]).await {
                Ok(removed) if removed > 0 => {
                    info!(%metric, removed, "removed stale dbname listing entries")
                }
                Ok(_) => {}
                Err(error) => error!(%metric, %error, "refreshing the dbname listing failed"),
            }
            match conn.execute(SQL_ADD_MISSING, &[&dbnames, &metric]).await {
                Ok(added) if added > 0 => {
                    info!(%metric, added, "added missing dbname listing entries")
                }
                Ok(_) => {}
                Err(error) => error!(%metric, %error, "refreshing the dbname listing failed"),
            }

            // spread the per-table scans out to avoid load spikes
            if idle(&mut self.shutdown, LISTING_METRIC_PAUSE).await {
                return true;
            }
        }
        false
    }
}
