//! pgfleet entry point: configures logging, wires the configured metric
//! sinks into a [`MultiWriter`] and runs until interrupted.

mod logging;
mod options;

use anyhow::{bail, ensure, Context};
use clap::Parser;
use pgfleet_sinks::{JsonFileWriter, MultiWriter, PostgresSinkOptions, PostgresWriter};
use tracing::info;

use crate::options::Options;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    options.logging.init()?;
    run(options).await
}

async fn run(options: Options) -> anyhow::Result<()> {
    if options.prometheus_listen_addr.is_some() {
        bail!("the Prometheus scrape sink is not part of this build");
    }

    let (shutdown_tx, shutdown_rx) = pgfleet_util::shutdown::channel();

    let mut multi = MultiWriter::new();
    for file in &options.json_storage_file {
        let writer = JsonFileWriter::create(file)
            .await
            .with_context(|| format!("opening JSON storage file {file}"))?;
        multi.add_writer(Box::new(writer));
        info!(%file, "JSON output enabled");
    }
    for connstr in &options.pg_metric_store_conn_str {
        let sink_options = PostgresSinkOptions {
            batching_delay: options.batching_delay(),
            retention_days: options.pg_retention_days,
        };
        let writer = PostgresWriter::connect(connstr, sink_options, shutdown_rx.clone())
            .await
            .context("connecting to the metric store")?;
        multi.add_writer(Box::new(writer));
        info!("PostgreSQL output enabled");
    }
    ensure!(!multi.is_empty(), "no storages specified for metrics");

    info!(sinks = multi.len(), "metric sinks ready");
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    drop(shutdown_rx);
    shutdown_tx.shutdown().await;
    Ok(())
}
