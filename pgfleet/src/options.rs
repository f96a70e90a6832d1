//! Command-line and environment configuration for the pgfleet binary.

use std::time::Duration;

use clap::Parser;

use crate::logging;

#[derive(Debug, Parser)]
#[command(name = "pgfleet", version, about = "Metrics pipeline for PostgreSQL fleets")]
pub struct Options {
    /// Connection string(s) of PostgreSQL metric stores; each one becomes
    /// an independent sink
    #[arg(
        long = "pg-metric-store-conn-str",
        env = "PGF_PG_METRIC_STORE_CONN_STR",
        value_delimiter = ','
    )]
    pub pg_metric_store_conn_str: Vec<String>,

    /// File(s) to append measurements to as newline-delimited JSON
    #[arg(
        long = "json-storage-file",
        env = "PGF_JSON_STORAGE_FILE",
        value_delimiter = ','
    )]
    pub json_storage_file: Vec<String>,

    /// Address for the Prometheus scrape endpoint sink
    #[arg(long, env = "PGF_PROMETHEUS_LISTEN_ADDR")]
    pub prometheus_listen_addr: Option<String>,

    /// Maximum time a partial measurement buffer waits before being
    /// flushed, in milliseconds
    #[arg(long, env = "PGF_BATCHING_DELAY_MS", default_value_t = 250)]
    pub batching_delay_ms: u64,

    /// Drop measurements older than this many days from plain PostgreSQL
    /// storage; zero or negative disables pruning
    #[arg(long, env = "PGF_PG_RETENTION_DAYS", default_value_t = 14)]
    pub pg_retention_days: i32,

    #[command(flatten)]
    pub logging: logging::Options,
}

impl Options {
    pub fn batching_delay(&self) -> Duration {
        Duration::from_millis(self.batching_delay_ms)
    }
}
