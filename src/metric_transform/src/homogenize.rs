//! Date homogenization: sparse observations to dense daily series.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::{
    errors::TransformError,
    models::{
        area::AreaType,
        observation::MetricObservation,
        series::{AreaSeries, SeriesKey},
    },
};

/// Longest calendar the homogenizer will materialize (about a century of days).
pub const MAX_CALENDAR_DAYS: i64 = 36_600;

/// Output of [`homogenize_dates`].
#[derive(Debug, Clone)]
pub struct Homogenized {
    /// One dense series per observed (area, metric, band), sorted by key.
    pub series: Vec<AreaSeries>,
    /// First calendar day shared by every series.
    pub start: NaiveDate,
    /// Last calendar day shared by every series.
    pub end: NaiveDate,
    /// Distinct non-null names seen per area, consumed by name repair.
    pub area_names: BTreeMap<(AreaType, String), BTreeSet<String>>,
}

/// Expand observations onto the global calendar spanning the earliest and latest date in
/// the whole input.
///
/// Every series observed at least once gets one slot per calendar day; days without an
/// observation stay `None`. Duplicate (area, metric, band, date) observations are resolved
/// after a stable sort by (date, area type, area code): the one appearing last wins.
pub fn homogenize_dates(
    observations: Vec<MetricObservation>,
) -> Result<Homogenized, TransformError> {
    homogenize_within(observations, None)
}

/// [`homogenize_dates`] over a calendar that covers at least `calendar`.
///
/// Callers processing one slice of a larger dataset pass the dataset's first and last day
/// so every slice shares the same calendar.
pub fn homogenize_within(
    mut observations: Vec<MetricObservation>,
    calendar: Option<(NaiveDate, NaiveDate)>,
) -> Result<Homogenized, TransformError> {
    let (start, end) = observations
        .iter()
        .fold(None, |acc: Option<(NaiveDate, NaiveDate)>, o| match acc {
            None => Some((o.date, o.date)),
            Some((lo, hi)) => Some((lo.min(o.date), hi.max(o.date))),
        })
        .ok_or(TransformError::EmptyInput)?;
    let (start, end) = match calendar {
        Some((lo, hi)) => (start.min(lo), end.max(hi)),
        None => (start, end),
    };

    let span = end.signed_duration_since(start).num_days();
    if span > MAX_CALENDAR_DAYS {
        return Err(TransformError::InvalidCalendar { start, end });
    }
    let len = span as usize + 1;

    observations.sort_by(|a, b| {
        (a.date, a.area_type.as_str(), a.area_code.as_str()).cmp(&(
            b.date,
            b.area_type.as_str(),
            b.area_code.as_str(),
        ))
    });

    let mut by_key: BTreeMap<SeriesKey, AreaSeries> = BTreeMap::new();
    let mut area_names: BTreeMap<(AreaType, String), BTreeSet<String>> = BTreeMap::new();

    for obs in observations {
        let names = area_names
            .entry((obs.area_type, obs.area_code.clone()))
            .or_default();
        if let Some(name) = obs.area_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            names.insert(name.to_string());
        }

        let key = SeriesKey {
            area_type: obs.area_type,
            area_code: obs.area_code,
            metric: obs.metric,
            band: obs.band,
        };
        let series = by_key
            .entry(key)
            .or_insert_with_key(|k| AreaSeries::empty(k.clone(), start, len));
        if let Some(i) = series.index_of(obs.date) {
            series.values[i] = obs.value;
        }
    }

    tracing::debug!(
        series = by_key.len(),
        days = len,
        %start,
        %end,
        "homogenized observations"
    );

    Ok(Homogenized {
        series: by_key.into_values().collect(),
        start,
        end,
        area_names,
    })
}
