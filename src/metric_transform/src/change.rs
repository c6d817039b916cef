//! Week-over-week change of rolling sums.

use crate::{
    config::{PipelineConfig, ZeroBaseChange},
    models::{
        payload::{Derived, Direction},
        series::AreaSeries,
    },
    rates::rolling_sum,
    round1,
};

/// Percentage change from `previous` to `current`.
///
/// Both zero gives 0 and a drop to exactly zero gives -100. A rise from zero or below
/// follows `policy`; otherwise the base is clamped to at least 1.
pub fn change_percentage(current: f64, previous: f64, policy: ZeroBaseChange) -> Option<f64> {
    if current == 0.0 && previous == 0.0 {
        return Some(0.0);
    }
    if current == 0.0 && previous > 0.0 {
        return Some(-100.0);
    }
    if previous <= 0.0 && policy == ZeroBaseChange::Null {
        return None;
    }
    Some(round1((current / previous.max(1.0) - 1.0) * 100.0))
}

/// Derives `change`, `direction` and `change_percentage` for change-tracked metrics.
#[derive(Debug, Clone, Copy)]
pub struct ChangeEngine<'a> {
    config: &'a PipelineConfig,
}

impl<'a> ChangeEngine<'a> {
    /// Engine driven by `config`; the change period equals the rolling window.
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Fill change fields in place. Must run after [`crate::rates::RateEngine::apply`],
    /// whose rolling sums are reused when present.
    pub fn apply(&self, series: &mut [AreaSeries]) {
        let period = self.config.pipeline.rolling_window;
        let policy = self.config.pipeline.zero_base_change;

        for s in series.iter_mut() {
            if !self.config.metric(&s.key.metric).is_some_and(|m| m.change) {
                continue;
            }

            if s.derived.iter().all(|d| d.rolling_sum.is_none()) {
                let sums = rolling_sum(&s.values, period);
                for (d, sum) in s.derived.iter_mut().zip(sums) {
                    d.rolling_sum = sum;
                }
            }

            // A history of nothing but zero sums is "no data", not "no change".
            if s
                .derived
                .iter()
                .filter_map(|d| d.rolling_sum)
                .all(|rs| rs == 0.0)
            {
                tracing::debug!(
                    area_code = %s.key.area_code,
                    metric = %s.key.metric,
                    "all rolling sums are zero; change left empty"
                );
                s.derived.iter_mut().for_each(clear_change);
                continue;
            }

            let sums: Vec<Option<f64>> = s.derived.iter().map(|d| d.rolling_sum).collect();
            for i in 0..s.len() {
                let d = &mut s.derived[i];
                clear_change(d);
                if s.values[i].is_none() || i < period {
                    continue;
                }
                let (Some(current), Some(previous)) = (sums[i], sums[i - period]) else {
                    continue;
                };
                let change = round1(current - previous);
                d.change = Some(change);
                d.direction = Some(Direction::from_change(change));
                d.change_percentage = change_percentage(current, previous, policy);
            }
        }
    }
}

fn clear_change(d: &mut Derived) {
    d.change = None;
    d.direction = None;
    d.change_percentage = None;
}
