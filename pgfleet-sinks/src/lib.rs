//! Measurement sinks.
//!
//! A [`Writer`] accepts batches of measurement messages and ships them to
//! one storage backend; the [`MultiWriter`] fans every batch out to all
//! configured writers. The PostgreSQL metric-store writer in
//! [`postgres`] is the primary sink; [`json_file`] appends newline-delimited
//! JSON for ad-hoc setups.

use std::fmt::{self, Display};

use async_trait::async_trait;
use itertools::Itertools;
use pgfleet_data::MeasurementEnvelope;
use pgfleet_store::StoreError;
use pgfleet_util::shutdown::ShutdownReceiver;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

pub mod json_file;
pub mod postgres;
mod stats;

pub use json_file::JsonFileWriter;
pub use postgres::{PostgresSinkOptions, PostgresWriter};
pub use stats::{recorded, SinkStats};

/// Errors surfaced by sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("timed out waiting for a pooled connection")]
    PoolTimeout,

    /// A partition request with an unset bound; always a caller bug.
    #[error("zero start/end in partitioning request for metric '{metric}'")]
    ZeroPartitionBounds { metric: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{}", .0.iter().map(ToString::to_string).join("; "))]
    Multiple(Vec<SinkError>),
}

impl From<bb8::RunError<tokio_postgres::Error>> for SinkError {
    fn from(err: bb8::RunError<tokio_postgres::Error>) -> Self {
        match err {
            bb8::RunError::User(e) => SinkError::Postgres(e),
            bb8::RunError::TimedOut => SinkError::PoolTimeout,
        }
    }
}

impl SinkError {
    /// Collapse the outcome of several independent sink calls into one
    /// result, keeping every failure.
    pub fn join(mut errors: Vec<SinkError>) -> Result<(), SinkError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(SinkError::Multiple(errors)),
        }
    }
}

/// Metric registration operations a sink may react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOp {
    Add,
    Remove,
}

impl Display for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOp::Add => f.write_str("add"),
            SyncOp::Remove => f.write_str("remove"),
        }
    }
}

/// A storage backend for measurement messages.
#[async_trait]
pub trait Writer: Send + Sync {
    /// React to a (database, metric) pair being added to or removed from
    /// the monitoring configuration.
    async fn sync_metric(&self, dbname: &str, metric: &str, op: SyncOp) -> Result<(), SinkError>;

    /// Accept a batch of measurement messages. Overloaded sinks may shed
    /// the batch rather than block the caller.
    async fn write(&self, batch: Vec<MeasurementEnvelope>) -> Result<(), SinkError>;
}

/// Dispatches every batch to all configured writers.
///
/// Writers are registered while the dispatcher is still exclusively owned,
/// before any dispatching starts; iteration never locks.
#[derive(Default)]
pub struct MultiWriter {
    writers: Vec<Box<dyn Writer>>,
}

impl MultiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_writer(&mut self, writer: Box<dyn Writer>) {
        self.writers.push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }

    /// Propagate a metric registration to every writer, aggregating errors.
    pub async fn sync_metrics(
        &self,
        dbname: &str,
        metric: &str,
        op: SyncOp,
    ) -> Result<(), SinkError> {
        let mut errors = Vec::new();
        for writer in &self.writers {
            if let Err(e) = writer.sync_metric(dbname, metric, op).await {
                errors.push(e);
            }
        }
        SinkError::join(errors)
    }

    /// Hand one batch to every writer. A failing writer is logged and does
    /// not keep the batch from reaching the remaining writers.
    pub async fn write_metrics(&self, batch: Vec<MeasurementEnvelope>) {
        for writer in &self.writers {
            if let Err(error) = writer.write(batch.clone()).await {
                error!(%error, "metric sink write failed");
            }
        }
    }

    /// Consume batches from `storage` until shutdown or channel close.
    pub async fn run(
        &self,
        mut storage: mpsc::Receiver<Vec<MeasurementEnvelope>>,
        mut shutdown: ShutdownReceiver,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return,
                received = storage.recv() => match received {
                    Some(batch) => self.write_metrics(batch).await,
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default, Clone)]
    struct RecordingWriter {
        batches: Arc<Mutex<Vec<Vec<MeasurementEnvelope>>>>,
        syncs: Arc<Mutex<Vec<(String, String, SyncOp)>>>,
        fail: bool,
    }

    #[async_trait]
    impl Writer for RecordingWriter {
        async fn sync_metric(
            &self,
            dbname: &str,
            metric: &str,
            op: SyncOp,
        ) -> Result<(), SinkError> {
            self.syncs
                .lock()
                .unwrap()
                .push((dbname.to_owned(), metric.to_owned(), op));
            if self.fail {
                return Err(SinkError::PoolTimeout);
            }
            Ok(())
        }

        async fn write(&self, batch: Vec<MeasurementEnvelope>) -> Result<(), SinkError> {
            if self.fail {
                return Err(SinkError::PoolTimeout);
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    fn batch() -> Vec<MeasurementEnvelope> {
        vec![MeasurementEnvelope {
            dbname: "t1".into(),
            metric_name: "db_stats".into(),
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn failing_writer_does_not_block_others() {
        let healthy = RecordingWriter::default();
        let mut multi = MultiWriter::new();
        multi.add_writer(Box::new(RecordingWriter {
            fail: true,
            ..Default::default()
        }));
        multi.add_writer(Box::new(healthy.clone()));

        multi.write_metrics(batch()).await;
        assert_eq!(healthy.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sync_errors_are_aggregated() {
        let mut multi = MultiWriter::new();
        multi.add_writer(Box::new(RecordingWriter {
            fail: true,
            ..Default::default()
        }));
        multi.add_writer(Box::new(RecordingWriter {
            fail: true,
            ..Default::default()
        }));

        match multi.sync_metrics("t1", "db_stats", SyncOp::Add).await {
            Err(SinkError::Multiple(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregated error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_reaches_every_writer() {
        let recorder = RecordingWriter::default();
        let mut multi = MultiWriter::new();
        multi.add_writer(Box::new(recorder.clone()));

        multi
            .sync_metrics("t1", "db_stats", SyncOp::Add)
            .await
            .unwrap();
        multi
            .sync_metrics("t1", "db_stats", SyncOp::Remove)
            .await
            .unwrap();
        let syncs = recorder.syncs.lock().unwrap();
        assert_eq!(
            *syncs,
            vec![
                ("t1".to_owned(), "db_stats".to_owned(), SyncOp::Add),
                ("t1".to_owned(), "db_stats".to_owned(), SyncOp::Remove),
            ]
        );
    }

    #[test]
    fn join_collapses_error_lists() {
        assert!(SinkError::join(vec![]).is_ok());
        assert!(matches!(
            SinkError::join(vec![SinkError::PoolTimeout]),
            Err(SinkError::PoolTimeout)
        ));
        let joined = SinkError::join(vec![
            SinkError::PoolTimeout,
            SinkError::ZeroPartitionBounds {
                metric: "wal".into(),
            },
        ])
        .unwrap_err();
        assert!(joined.to_string().contains("; "));
    }
}
