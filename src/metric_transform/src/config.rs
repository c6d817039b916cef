//! Pipeline configuration: parsing, normalization, and loading.
//!
//! This module defines the TOML-backed pipeline configuration that replaces ad-hoc column
//! lists and rename maps. It describes:
//! - Global settings (rolling window, provisional cutoff, digest size, deploy chunk size)
//! - Per-metric fill policy and which derived statistics apply
//! - Aliases from raw metric names to canonical ones
//!
//! Key behaviors:
//! - Normalization trims metric names and alias entries, rejects duplicates after
//!   trimming, and drops aliases that point at themselves.
//! - Metrics without an explicit `date_basis` get one inferred from their name.
//!
//! Entrypoints:
//! - Parse + normalize from a TOML string: [`load_config_str`]
//! - Parse + normalize from a file path: [`load_config_path`]
//!
//! A loaded [`PipelineConfig`] is immutable and shared by reference with every stage.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashing::DigestSize;

/// Errors raised while loading or validating a pipeline configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML could not be parsed into a [`PipelineConfig`].
    #[error("failed to parse pipeline config TOML")]
    Parse(#[from] toml::de::Error),

    /// The config file could not be read.
    #[error("read pipeline config file {path}")]
    Read {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A metric or alias name is empty after trimming.
    #[error("metric name cannot be empty after trimming")]
    EmptyMetricName,

    /// Two metric keys collapse to the same name after trimming.
    #[error("duplicate metric after normalization: {0}")]
    DuplicateMetric(String),

    /// An alias targets another alias; aliases are applied exactly once.
    #[error("alias {from} -> {to} targets another alias")]
    ChainedAlias {
        /// Raw name.
        from: String,
        /// Canonical name that is itself aliased.
        to: String,
    },

    /// A global setting is out of range.
    #[error("invalid setting {name}: {message}")]
    InvalidSetting {
        /// Setting name.
        name: &'static str,
        /// Why it is invalid.
        message: String,
    },
}

/// How gaps inside a series' observed span are filled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Nulls inside the span become 0 (daily counts).
    Zero,
    /// Nulls inside the span repeat the last value (cumulative totals).
    Cumulative,
    /// Leave nulls alone.
    #[default]
    None,
}

/// Which date a metric is reported against; drives the provisional cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateBasis {
    /// Specimen or event date: the most recent days are incomplete.
    Specimen,
    /// Publish date: complete up to the metric's own last date.
    Publish,
}

/// What a change percentage becomes when the rolling sum rises from exactly zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroBaseChange {
    /// `(new / 1 - 1) * 100`, i.e. the base is clamped to one.
    #[default]
    Formula,
    /// No percentage is published.
    Null,
}

/// Per-metric configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricCfg {
    /// Gap fill policy.
    #[serde(default)]
    pub fill: FillPolicy,
    /// Compute rolling sum and rolling rate.
    #[serde(default)]
    pub rolling_rate: bool,
    /// Date basis; inferred from the metric name when absent.
    #[serde(default)]
    pub date_basis: Option<DateBasis>,
    /// Compute week-over-week change.
    #[serde(default)]
    pub change: bool,
    /// Compute the non-windowed incidence rate.
    #[serde(default)]
    pub incidence_rate: bool,
}

impl MetricCfg {
    /// Date basis after normalization (publish when nothing was inferred).
    pub fn basis(&self) -> DateBasis {
        self.date_basis.unwrap_or(DateBasis::Publish)
    }
}

/// Global pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineSettings {
    /// Rolling window length in days; also the change period.
    pub rolling_window: usize,
    /// Days at the end of a specimen-date series treated as provisional.
    pub provisional_days: u32,
    /// Row hash digest size in bytes.
    pub digest_size: DigestSize,
    /// Maximum rows per upsert chunk.
    pub chunk_size: usize,
    /// Zero-base change percentage policy.
    pub zero_base_change: ZeroBaseChange,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            rolling_window: 7,
            provisional_days: 5,
            digest_size: DigestSize::Short,
            chunk_size: 8_000,
            zero_base_change: ZeroBaseChange::Formula,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Global settings.
    #[serde(default)]
    pub pipeline: PipelineSettings,
    /// Canonical metric name -> configuration.
    #[serde(default)]
    pub metrics: IndexMap<String, MetricCfg>,
    /// Raw metric name -> canonical metric name.
    #[serde(default)]
    pub aliases: IndexMap<String, String>,
}

impl PipelineConfig {
    /// Canonical name for a raw metric name.
    pub fn canonical_metric<'a>(&'a self, raw: &'a str) -> &'a str {
        self.aliases.get(raw).map(String::as_str).unwrap_or(raw)
    }

    /// Configuration for a canonical metric; undeclared metrics pass through untouched.
    pub fn metric(&self, name: &str) -> Option<&MetricCfg> {
        self.metrics.get(name)
    }

    /// Fill policy for a canonical metric.
    pub fn fill_policy(&self, name: &str) -> FillPolicy {
        self.metric(name).map(|m| m.fill).unwrap_or_default()
    }
}

/// Summary of changes performed during normalization.
#[derive(Debug, Default)]
pub struct NormalizationReport {
    /// Metric keys that changed when trimmed.
    pub metrics_renamed: usize,
    /// Aliases dropped because they map a name onto itself.
    pub aliases_dropped: usize,
    /// Metrics whose date basis was inferred from the name.
    pub date_basis_inferred: usize,
}

fn infer_basis(metric: &str) -> DateBasis {
    if metric.ends_with("BySpecimenDate") || metric.ends_with("ByDeathDate") {
        DateBasis::Specimen
    } else {
        DateBasis::Publish
    }
}

/// Normalize a configuration in place and validate its settings.
///
/// What normalization does:
/// - Trim metric keys; reject empty or duplicate keys after trimming
/// - Trim alias entries; drop self-aliases; reject alias chains
/// - Infer a missing `date_basis` from the metric name
///
/// Errors:
/// - Empty or duplicate metric names after normalization
/// - Alias chains
/// - `rolling_window` or `chunk_size` of zero
pub fn normalize_config(cfg: &mut PipelineConfig) -> Result<NormalizationReport, ConfigError> {
    let mut report = NormalizationReport::default();

    if cfg.pipeline.rolling_window == 0 {
        return Err(ConfigError::InvalidSetting {
            name: "rolling_window",
            message: "must be at least 1".into(),
        });
    }
    if cfg.pipeline.chunk_size == 0 {
        return Err(ConfigError::InvalidSetting {
            name: "chunk_size",
            message: "must be at least 1".into(),
        });
    }

    let mut rebuilt: IndexMap<String, MetricCfg> = IndexMap::new();
    for (raw_name, mut m) in std::mem::take(&mut cfg.metrics) {
        let name = raw_name.trim().to_string();
        if name.is_empty() {
            return Err(ConfigError::EmptyMetricName);
        }
        if name != raw_name {
            report.metrics_renamed += 1;
        }
        if rebuilt.contains_key(&name) {
            return Err(ConfigError::DuplicateMetric(name));
        }
        if m.date_basis.is_none() {
            m.date_basis = Some(infer_basis(&name));
            report.date_basis_inferred += 1;
        }
        rebuilt.insert(name, m);
    }
    cfg.metrics = rebuilt;

    let mut aliases: IndexMap<String, String> = IndexMap::new();
    for (from, to) in std::mem::take(&mut cfg.aliases) {
        let (from, to) = (from.trim().to_string(), to.trim().to_string());
        if from.is_empty() || to.is_empty() {
            return Err(ConfigError::EmptyMetricName);
        }
        if from == to {
            report.aliases_dropped += 1;
            continue;
        }
        aliases.insert(from, to);
    }
    if let Some((from, to)) = aliases.iter().find(|(_, to)| aliases.contains_key(*to)) {
        return Err(ConfigError::ChainedAlias {
            from: from.clone(),
            to: to.clone(),
        });
    }
    cfg.aliases = aliases;

    Ok(report)
}

/// Parse and normalize a configuration from a TOML string.
pub fn load_config_str(toml_str: &str) -> Result<PipelineConfig, ConfigError> {
    let mut cfg: PipelineConfig = toml::from_str(toml_str)?;
    let report = normalize_config(&mut cfg)?;
    tracing::debug!(?report, metrics = cfg.metrics.len(), "pipeline config loaded");
    Ok(cfg)
}

/// Read a configuration TOML file from disk, parse, and normalize it.
pub fn load_config_path(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    load_config_str(&text)
}
