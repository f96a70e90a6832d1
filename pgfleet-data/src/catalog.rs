//! Read-only views of the configuration-store catalog: preset bundles,
//! metric definitions and the validation rules the store enforces. The
//! collector consumes these; the metric sink never interprets them.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

lazy_static! {
    static ref METRIC_NAME: Regex = Regex::new("^[a-z0-9_.]+$").unwrap();
}

/// Returns whether `name` is a well-formed metric name.
pub fn is_valid_metric_name(name: &str) -> bool {
    METRIC_NAME.is_match(name)
}

/// Validation failures for catalog inputs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid metric name '{0}', expected ^[a-z0-9_.]+$")]
    MetricName(String),

    #[error("gather interval for metric '{0}' must be positive")]
    NonPositiveInterval(String),

    #[error("monitored database name must be non-empty and must not contain ':', got '{0}'")]
    SourceName(String),

    #[error("metric '{0}' cannot be both master-only and standby-only")]
    MasterStandbyConflict(String),

    #[error("invalid source kind '{0}'")]
    SourceKind(String),

    #[error("invalid encryption mode '{0}'")]
    EncryptionMode(String),
}

/// A named bundle mapping metric names to gather intervals in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresetConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// metric name -> gather interval, seconds
    pub metrics: BTreeMap<String, u32>,
}

impl PresetConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (metric, interval) in &self.metrics {
            if !is_valid_metric_name(metric) {
                return Err(ValidationError::MetricName(metric.clone()));
            }
            if *interval == 0 {
                return Err(ValidationError::NonPositiveInterval(metric.clone()));
            }
        }
        Ok(())
    }
}

/// One SQL text for a metric, applicable from a given server version.
///
/// Definitions are unique on `(name, version_from, standby_only)`;
/// [`MetricDefinition::unique_key`] produces that key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    /// Minimum monitored-server version the SQL applies to, as reported by
    /// `server_version_num` (e.g. 120000).
    pub version_from: i32,
    pub sql: String,
    /// Privileged variant executed when the gatherer has superuser rights.
    #[serde(default)]
    pub sql_su: Option<String>,
    #[serde(default)]
    pub master_only: bool,
    #[serde(default)]
    pub standby_only: bool,
}

impl MetricDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_metric_name(&self.name) {
            return Err(ValidationError::MetricName(self.name.clone()));
        }
        if self.master_only && self.standby_only {
            return Err(ValidationError::MasterStandbyConflict(self.name.clone()));
        }
        Ok(())
    }

    pub fn unique_key(&self) -> (&str, i32, bool) {
        (&self.name, self.version_from, self.standby_only)
    }
}

/// Checks the monitored-database naming rule: names are non-empty and may
/// not contain `:` (the name is used in composite identifiers downstream).
pub fn validate_source_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.contains(':') {
        return Err(ValidationError::SourceName(name.to_owned()));
    }
    Ok(())
}

/// Kind of a monitored database entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Postgres,
    PostgresContinuousDiscovery,
    Pgbouncer,
    Patroni,
    PatroniContinuousDiscovery,
    PatroniNamespaceDiscovery,
    Pgpool,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Postgres,
        SourceKind::PostgresContinuousDiscovery,
        SourceKind::Pgbouncer,
        SourceKind::Patroni,
        SourceKind::PatroniContinuousDiscovery,
        SourceKind::PatroniNamespaceDiscovery,
        SourceKind::Pgpool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Postgres => "postgres",
            SourceKind::PostgresContinuousDiscovery => "postgres-continuous-discovery",
            SourceKind::Pgbouncer => "pgbouncer",
            SourceKind::Patroni => "patroni",
            SourceKind::PatroniContinuousDiscovery => "patroni-continuous-discovery",
            SourceKind::PatroniNamespaceDiscovery => "patroni-namespace-discovery",
            SourceKind::Pgpool => "pgpool",
        }
    }
}

impl Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::SourceKind(s.to_owned()))
    }
}

/// How credentials of a monitored database are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    PlainText,
    #[serde(rename = "aes-gcm-256")]
    AesGcm256,
}

impl EncryptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionMode::PlainText => "plain-text",
            EncryptionMode::AesGcm256 => "aes-gcm-256",
        }
    }
}

impl Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain-text" => Ok(EncryptionMode::PlainText),
            "aes-gcm-256" => Ok(EncryptionMode::AesGcm256),
            other => Err(ValidationError::EncryptionMode(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_rejects_bad_names_and_intervals() {
        let mut preset = PresetConfig {
            name: "basic".into(),
            description: String::new(),
            metrics: BTreeMap::from([("db_stats".into(), 60), ("wal".into(), 120)]),
        };
        preset.validate().unwrap();

        preset.metrics.insert("Bad-Name".into(), 60);
        assert_eq!(
            preset.validate(),
            Err(ValidationError::MetricName("Bad-Name".into()))
        );

        preset.metrics.remove("Bad-Name");
        preset.metrics.insert("wal".into(), 0);
        assert_eq!(
            preset.validate(),
            Err(ValidationError::NonPositiveInterval("wal".into()))
        );
    }

    #[test]
    fn metric_definition_master_standby_exclusive() {
        let def = MetricDefinition {
            name: "db_stats".into(),
            version_from: 120000,
            sql: "select 1".into(),
            master_only: true,
            standby_only: true,
            ..Default::default()
        };
        assert_eq!(
            def.validate(),
            Err(ValidationError::MasterStandbyConflict("db_stats".into()))
        );
    }

    #[test]
    fn unique_key_distinguishes_standby_variants() {
        let master = MetricDefinition {
            name: "wal".into(),
            version_from: 100000,
            sql: "select 1".into(),
            ..Default::default()
        };
        let standby = MetricDefinition {
            standby_only: true,
            ..master.clone()
        };
        assert_ne!(master.unique_key(), standby.unique_key());
    }

    #[test]
    fn source_names_reject_colons() {
        validate_source_name("prod-db1").unwrap();
        assert!(validate_source_name("").is_err());
        assert!(validate_source_name("prod:db1").is_err());
    }

    #[test]
    fn source_kind_round_trips() {
        for kind in SourceKind::ALL {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("mysql".parse::<SourceKind>().is_err());
    }

    #[test]
    fn encryption_mode_round_trips() {
        assert_eq!(
            "plain-text".parse::<EncryptionMode>().unwrap(),
            EncryptionMode::PlainText
        );
        assert_eq!(
            "aes-gcm-256".parse::<EncryptionMode>().unwrap(),
            EncryptionMode::AesGcm256
        );
        assert!("rot13".parse::<EncryptionMode>().is_err());
    }
}
