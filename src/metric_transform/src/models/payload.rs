//! Derived values and the JSON payload stored per row.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::area::AreaType;

/// Week-over-week direction of a rolling sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Rolling sum increased.
    Up,
    /// Rolling sum decreased.
    Down,
    /// Rolling sum unchanged.
    Same,
}

impl Direction {
    /// Classify a change; exactly zero is [`Direction::Same`].
    pub fn from_change(change: f64) -> Self {
        if change > 0.0 {
            Direction::Up
        } else if change < 0.0 {
            Direction::Down
        } else {
            Direction::Same
        }
    }
}

/// Values derived for one day of one series. All fields are optional because each only
/// applies to some metrics and some dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    /// Trailing rolling sum.
    pub rolling_sum: Option<f64>,
    /// Rolling sum per 100,000 population.
    pub rolling_rate: Option<f64>,
    /// Rolling sum minus the rolling sum one period earlier.
    pub change: Option<f64>,
    /// Sign of `change`.
    pub direction: Option<Direction>,
    /// Percentage change of the rolling sum over one period.
    pub change_percentage: Option<f64>,
    /// Value per 100,000 population.
    pub rate: Option<f64>,
}

/// Value plus derived fields for one row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Reported (and possibly filled) value.
    pub value: Option<f64>,
    /// Derived fields.
    pub derived: Derived,
}

/// Payload of one band inside a demographic row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandPayload {
    /// Band label, e.g. `00_04`.
    pub band: String,
    /// Values for this band.
    pub payload: Payload,
}

/// Payload stored for one (area, metric, date) row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowPayload {
    /// A plain metric.
    Single(Payload),
    /// A demographic metric: one entry per band, ordered by band.
    Banded(Vec<BandPayload>),
}

// Wire shape: absent derived fields are omitted rather than written as null.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    band: Option<&'a str>,
    value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rolling_sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rolling_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    change: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    change_percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rate: Option<f64>,
}

impl<'a> WirePayload<'a> {
    fn new(band: Option<&'a str>, p: &Payload) -> Self {
        Self {
            band,
            value: p.value,
            rolling_sum: p.derived.rolling_sum,
            rolling_rate: p.derived.rolling_rate,
            change: p.derived.change,
            direction: p.derived.direction,
            change_percentage: p.derived.change_percentage,
            rate: p.derived.rate,
        }
    }
}

impl RowPayload {
    /// Render the JSON document stored in the time-series table.
    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        match self {
            RowPayload::Single(p) => serde_json::to_value(WirePayload::new(None, p)),
            RowPayload::Banded(bands) => bands
                .iter()
                .map(|b| serde_json::to_value(WirePayload::new(Some(&b.band), &b.payload)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }
}

/// A fully transformed row, ready for reference resolution and hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformedRow {
    /// Geographic level.
    pub area_type: AreaType,
    /// Area code.
    pub area_code: String,
    /// Repaired area name.
    pub area_name: Option<String>,
    /// Canonical metric name.
    pub metric: String,
    /// Row date.
    pub date: NaiveDate,
    /// Value and derived fields.
    pub payload: RowPayload,
}
