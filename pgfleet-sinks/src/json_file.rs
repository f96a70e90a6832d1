//! Newline-delimited JSON file sink, mostly useful for ad-hoc setups and
//! integration smoke tests.
//!
//! Rows go through the same splitting rules as the metric store path, so a
//! line carries exactly what a stored row would: the split payload under
//! `data` and the split tags under `tag_data` (null when empty).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use pgfleet_data::{split_row, MeasurementEnvelope};
use serde_json::{json, Value};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{SinkError, SyncOp, Writer};

/// Appends each measurement row as one JSON line.
pub struct JsonFileWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonFileWriter {
    /// Open (or create) the target file for appending.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Writer for JsonFileWriter {
    async fn sync_metric(&self, _dbname: &str, _metric: &str, _op: SyncOp) -> Result<(), SinkError> {
        Ok(())
    }

    async fn write(&self, batch: Vec<MeasurementEnvelope>) -> Result<(), SinkError> {
        let mut out = Vec::new();
        let mut rows = 0usize;
        let received_at = Utc::now();
        for msg in &batch {
            for raw_row in &msg.data {
                let Some(parts) = split_row(raw_row, &msg.custom_tags) else {
                    continue;
                };
                let tag_data = if parts.tags.is_empty() {
                    Value::Null
                } else {
                    Value::Object(parts.tags)
                };
                let line = json!({
                    "time": parts.timestamp.unwrap_or(received_at),
                    "dbname": msg.dbname,
                    "metric": msg.metric_name,
                    "data": parts.fields,
                    "tag_data": tag_data,
                });
                serde_json::to_writer(&mut out, &line).map_err(std::io::Error::from)?;
                out.push(b'\n');
                rows += 1;
            }
        }
        if out.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock().await;
        file.write_all(&out).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), rows, "appended measurement lines");
        Ok(())
    }
}
