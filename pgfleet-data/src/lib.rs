//! Data types shared across the pgfleet metric pipeline: the measurement
//! messages flowing from pollers to sinks, and the read-only configuration
//! catalog types (preset bundles, metric definitions, monitored-db rules)
//! served by the configuration store.

pub mod catalog;
pub mod measurement;

pub use catalog::{
    is_valid_metric_name, validate_source_name, EncryptionMode, MetricDefinition, PresetConfig,
    SourceKind, ValidationError,
};
pub use measurement::{
    is_pooler_metric, split_row, MeasurementEnvelope, MeasurementRow, RowParts,
};
