//! Rolling sums, rolling rates and incidence rates.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use crate::{
    config::{DateBasis, PipelineConfig},
    models::series::AreaSeries,
    round1,
};

/// Rates are published per this many people.
pub const RATE_SCALE: f64 = 100_000.0;

/// Population reference keyed by area code and optional demographic band.
pub trait PopulationLookup: Send + Sync {
    /// Population of `area_code` (restricted to `band` when given).
    fn population(&self, area_code: &str, band: Option<&str>) -> Option<u64>;
}

/// Trailing rolling sum over `window` days.
///
/// A day only gets a sum when every value in its window is present, so the first
/// `window - 1` days and any window touching a null stay `None`.
pub fn rolling_sum(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if window == 0 {
        return out;
    }
    for (i, slot) in out.iter_mut().enumerate().skip(window - 1) {
        *slot = values[i + 1 - window..=i]
            .iter()
            .try_fold(0.0, |acc, v| v.map(|x| acc + x));
    }
    out
}

/// Per-100k rate, rounded to one decimal; `None` for a missing or zero population.
pub fn per_100k(value: f64, population: Option<u64>) -> Option<f64> {
    population
        .filter(|&p| p > 0)
        .map(|p| round1(value / p as f64 * RATE_SCALE))
}

/// Derives rolling statistics and incidence rates for configured metrics.
pub struct RateEngine<'a> {
    config: &'a PipelineConfig,
    population: &'a dyn PopulationLookup,
}

impl<'a> RateEngine<'a> {
    /// Engine for `config` joining against `population`.
    pub fn new(config: &'a PipelineConfig, population: &'a dyn PopulationLookup) -> Self {
        Self { config, population }
    }

    /// Fill `rolling_sum`, `rolling_rate` and `rate` on every series whose metric asks for
    /// them.
    ///
    /// Provisional data is nulled out of the rolling statistics: specimen-date metrics lose
    /// the last `provisional_days` days before the metric's latest date, publish-date
    /// metrics anything after it. The latest date is taken from `dataset_last_observed`
    /// (the whole dataset, not just `series`) when it knows the metric. Banded series use
    /// `banded_cutoff` instead when it is given.
    pub fn apply(
        &self,
        series: &mut [AreaSeries],
        dataset_last_observed: &BTreeMap<String, NaiveDate>,
        banded_cutoff: Option<NaiveDate>,
    ) {
        let window = self.config.pipeline.rolling_window;
        let mut metric_max = last_observed_by_metric(series);
        for (metric, &date) in dataset_last_observed {
            metric_max
                .entry(metric.clone())
                .and_modify(|d| *d = (*d).max(date))
                .or_insert(date);
        }

        for s in series.iter_mut() {
            let Some(cfg) = self.config.metric(&s.key.metric) else {
                continue;
            };
            let population = self
                .population
                .population(&s.key.area_code, s.key.band.as_deref());
            if population.is_none() && (cfg.rolling_rate || cfg.incidence_rate) {
                tracing::debug!(
                    area_code = %s.key.area_code,
                    band = ?s.key.band,
                    "no population reference; rates left empty"
                );
            }

            if cfg.rolling_rate {
                let cutoff = match (&s.key.band, banded_cutoff) {
                    (Some(_), Some(max_date)) => Some(max_date),
                    _ => metric_max.get(s.key.metric.as_str()).map(|&max| match cfg.basis() {
                        DateBasis::Specimen => {
                            max - Days::new(u64::from(self.config.pipeline.provisional_days))
                        }
                        DateBasis::Publish => max,
                    }),
                };

                let sums = rolling_sum(&s.values, window);
                for (i, sum) in sums.into_iter().enumerate() {
                    let provisional = cutoff.is_none_or(|c| s.date_at(i) > c);
                    let d = &mut s.derived[i];
                    if provisional {
                        d.rolling_sum = None;
                        d.rolling_rate = None;
                        continue;
                    }
                    d.rolling_sum = sum;
                    d.rolling_rate = sum.and_then(|rs| per_100k(rs, population));
                }
            }

            if cfg.incidence_rate {
                for (v, d) in s.values.iter().zip(s.derived.iter_mut()) {
                    d.rate = v.and_then(|x| per_100k(x, population));
                }
            }
        }
    }
}

/// Last date with a non-null value, per metric, across `series`.
pub fn last_observed_by_metric(series: &[AreaSeries]) -> BTreeMap<String, NaiveDate> {
    let mut out: BTreeMap<String, NaiveDate> = BTreeMap::new();
    for s in series {
        if let Some(last) = s.last_observed_date() {
            out.entry(s.key.metric.clone())
                .and_modify(|d| *d = (*d).max(last))
                .or_insert(last);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::load_config_str,
        models::{area::AreaType, series::SeriesKey},
    };

    struct Flat(u64);

    impl PopulationLookup for Flat {
        fn population(&self, _: &str, _: Option<&str>) -> Option<u64> {
            Some(self.0)
        }
    }

    fn series(metric: &str, values: Vec<Option<f64>>) -> AreaSeries {
        let start = NaiveDate::from_ymd_opt(2021, 2, 1).unwrap();
        let mut s = AreaSeries::empty(
            SeriesKey {
                area_type: AreaType::Ltla,
                area_code: "E07000001".into(),
                metric: metric.into(),
                band: None,
            },
            start,
            values.len(),
        );
        s.values = values;
        s
    }

    #[test]
    fn rolling_sum_needs_a_full_window() {
        let v = [Some(1.0), Some(2.0), Some(3.0), None, Some(5.0), Some(6.0), Some(7.0)];
        assert_eq!(
            rolling_sum(&v, 3),
            vec![None, None, Some(6.0), None, None, None, Some(18.0)]
        );
    }

    #[test]
    fn rate_rounds_to_one_decimal() {
        assert_eq!(per_100k(7.0, Some(300_000)), Some(2.3));
        assert_eq!(per_100k(7.0, Some(0)), None);
        assert_eq!(per_100k(7.0, None), None);
    }

    #[test]
    fn specimen_metric_drops_provisional_days() {
        let cfg = load_config_str(
            r#"
            [pipeline]
            rolling_window = 2
            provisional_days = 2
            [metrics.newCasesBySpecimenDate]
            rolling_rate = true
            "#,
        )
        .unwrap();
        let mut s = vec![series("newCasesBySpecimenDate", vec![Some(1.0); 6])];
        RateEngine::new(&cfg, &Flat(100_000)).apply(&mut s, &BTreeMap::new(), None);
        let sums: Vec<_> = s[0].derived.iter().map(|d| d.rolling_sum).collect();
        assert_eq!(sums, vec![None, Some(2.0), Some(2.0), Some(2.0), None, None]);
        assert_eq!(s[0].derived[3].rolling_rate, Some(2.0));
    }

    #[test]
    fn cutoff_follows_the_dataset_not_the_series() {
        let cfg = load_config_str(
            r#"
            [pipeline]
            rolling_window = 2
            provisional_days = 2
            [metrics.newCasesBySpecimenDate]
            rolling_rate = true
            "#,
        )
        .unwrap();
        // this area stopped reporting on 6 Feb; the dataset runs to 10 Feb
        let dataset = BTreeMap::from([(
            "newCasesBySpecimenDate".to_string(),
            NaiveDate::from_ymd_opt(2021, 2, 10).unwrap(),
        )]);
        let mut s = vec![series("newCasesBySpecimenDate", vec![Some(1.0); 6])];
        RateEngine::new(&cfg, &Flat(100_000)).apply(&mut s, &dataset, None);
        let sums: Vec<_> = s[0].derived.iter().map(|d| d.rolling_sum).collect();
        assert_eq!(sums, vec![None, Some(2.0), Some(2.0), Some(2.0), Some(2.0), Some(2.0)]);
    }

    #[test]
    fn publish_metric_keeps_everything_up_to_its_last_date() {
        let cfg = load_config_str(
            r#"
            [pipeline]
            rolling_window = 2
            [metrics.newCasesByPublishDate]
            rolling_rate = true
            incidence_rate = true
            "#,
        )
        .unwrap();
        let mut s = vec![series(
            "newCasesByPublishDate",
            vec![Some(1.0), Some(3.0), Some(5.0), None],
        )];
        RateEngine::new(&cfg, &Flat(200_000)).apply(&mut s, &BTreeMap::new(), None);
        let sums: Vec<_> = s[0].derived.iter().map(|d| d.rolling_sum).collect();
        assert_eq!(sums, vec![None, Some(4.0), Some(8.0), None]);
        let rates: Vec<_> = s[0].derived.iter().map(|d| d.rate).collect();
        assert_eq!(rates, vec![Some(0.5), Some(1.5), Some(2.5), None]);
    }

    #[test]
    fn banded_series_use_the_caller_cutoff() {
        let cfg = load_config_str(
            r#"
            [pipeline]
            rolling_window = 1
            [metrics.newCasesBySpecimenDate]
            rolling_rate = true
            "#,
        )
        .unwrap();
        let mut s = series("newCasesBySpecimenDate", vec![Some(1.0); 4]);
        s.key.band = Some("00_04".into());
        let mut all = vec![s];
        let cutoff = NaiveDate::from_ymd_opt(2021, 2, 2).unwrap();
        RateEngine::new(&cfg, &Flat(100_000)).apply(&mut all, &BTreeMap::new(), Some(cutoff));
        let sums: Vec<_> = all[0].derived.iter().map(|d| d.rolling_sum).collect();
        assert_eq!(sums, vec![Some(1.0), Some(1.0), None, None]);
    }
}
