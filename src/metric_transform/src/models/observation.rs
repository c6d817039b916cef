//! Raw observations as they arrive in a snapshot.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::models::area::AreaType;

/// One metric value for one area on one day, straight from ingestion.
///
/// Uniqueness within a release: one observation per (area_type, area_code, date, metric,
/// band). Duplicates are resolved by the homogenizer (last write wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricObservation {
    /// Geographic level.
    pub area_type: AreaType,
    /// Area code, e.g. `E06000001`.
    pub area_code: String,
    /// Human-readable area name; may be missing on some rows.
    #[serde(default)]
    pub area_name: Option<String>,
    /// Observation date.
    pub date: NaiveDate,
    /// Metric name (before alias resolution).
    pub metric: String,
    /// Numeric value, or null when the source reported nothing.
    pub value: Option<f64>,
    /// Nesting key for demographic breakdowns (e.g. an age band).
    #[serde(default)]
    pub band: Option<String>,
}
