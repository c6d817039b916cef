//! Gap filling and area-name repair over homogenized series.
//!
//! Both fill policies are bounded by a series' own observed span: nothing is written before
//! its first or after its last non-null value. Demographic series are filled independently
//! per band, except that cumulative bands of one (area, metric) all start on the same day.

use std::collections::BTreeMap;

use crate::{
    config::{FillPolicy, PipelineConfig},
    errors::TransformError,
    homogenize::Homogenized,
    models::{area::AreaType, series::AreaSeries},
};

/// Replace nulls between the first and last non-null value with zero.
pub fn zero_fill(values: &mut [Option<f64>]) {
    let Some(first) = values.iter().position(Option::is_some) else {
        return;
    };
    let Some(last) = values.iter().rposition(Option::is_some) else {
        return;
    };
    for v in &mut values[first..=last] {
        v.get_or_insert(0.0);
    }
}

/// Carry the most recent non-null value forward, up to the last non-null value.
pub fn forward_fill(values: &mut [Option<f64>]) {
    let Some(last) = values.iter().rposition(Option::is_some) else {
        return;
    };
    let mut carry = None;
    for v in &mut values[..=last] {
        match v {
            Some(x) => carry = Some(*x),
            None => *v = carry,
        }
    }
}

/// Applies the per-metric fill policies and repairs area names.
#[derive(Debug, Clone, Copy)]
pub struct RecordNormalizer<'a> {
    config: &'a PipelineConfig,
}

impl<'a> RecordNormalizer<'a> {
    /// Normalizer driven by `config`.
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Fill and name-repair every series in place.
    ///
    /// Errors with [`TransformError::InconsistentAreaName`] if an area carries more than one
    /// distinct name.
    pub fn normalize(&self, data: &mut Homogenized) -> Result<(), TransformError> {
        self.repair_names(data)?;
        self.seed_banded_cumulative(&mut data.series);

        for series in &mut data.series {
            match self.config.fill_policy(&series.key.metric) {
                FillPolicy::Zero => zero_fill(&mut series.values),
                FillPolicy::Cumulative => forward_fill(&mut series.values),
                FillPolicy::None => {}
            }
        }
        Ok(())
    }

    fn repair_names(&self, data: &mut Homogenized) -> Result<(), TransformError> {
        let mut resolved = BTreeMap::new();
        for ((area_type, area_code), names) in &data.area_names {
            let name = match names.len() {
                0 => None,
                1 => names.first().cloned(),
                _ => {
                    return Err(TransformError::InconsistentAreaName {
                        area_type: area_type.to_string(),
                        area_code: area_code.clone(),
                        names: names.iter().cloned().collect(),
                    });
                }
            };
            resolved.insert((*area_type, area_code.as_str()), name);
        }
        for series in &mut data.series {
            series.area_name = resolved
                .get(&(series.key.area_type, series.key.area_code.as_str()))
                .cloned()
                .flatten();
        }
        Ok(())
    }

    // Cumulative bands of one (area, metric) must share their first date: a band that
    // starts reporting later is seeded with 0 on the group's first observed day.
    fn seed_banded_cumulative(&self, series: &mut [AreaSeries]) {
        let group_of = |s: &AreaSeries| {
            (
                s.key.area_type,
                s.key.area_code.clone(),
                s.key.metric.clone(),
            )
        };
        let is_cumulative_band = |s: &AreaSeries| {
            s.key.band.is_some()
                && self.config.fill_policy(&s.key.metric) == FillPolicy::Cumulative
        };

        let mut group_start: BTreeMap<(AreaType, String, String), usize> = BTreeMap::new();
        for s in series.iter().filter(|s| is_cumulative_band(s)) {
            if let Some((first, _)) = s.observed_span() {
                group_start
                    .entry(group_of(s))
                    .and_modify(|start| *start = (*start).min(first))
                    .or_insert(first);
            }
        }

        for s in series.iter_mut().filter(|s| is_cumulative_band(s)) {
            let Some(&start) = group_start.get(&group_of(s)) else {
                continue;
            };
            if s.values[start].is_none() {
                tracing::debug!(
                    area_code = %s.key.area_code,
                    metric = %s.key.metric,
                    band = ?s.key.band,
                    "seeding late cumulative band with 0"
                );
                s.values[start] = Some(0.0);
            }
        }
    }
}
