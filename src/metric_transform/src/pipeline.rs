//! One area chunk through every transformation stage.

use std::{collections::BTreeMap, sync::Arc};

use chrono::NaiveDate;

use crate::{
    change::ChangeEngine,
    config::PipelineConfig,
    errors::TransformError,
    homogenize::homogenize_within,
    models::{
        area::AreaType,
        observation::MetricObservation,
        payload::{BandPayload, Payload, RowPayload, TransformedRow},
        series::AreaSeries,
    },
    normalize::RecordNormalizer,
    rates::{PopulationLookup, RateEngine},
};

/// Calendar and per-metric recency of a whole raw snapshot.
///
/// Chunks of one snapshot are transformed against the same bounds, so an area's rows do
/// not depend on which other areas share its chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetBounds {
    /// First and last observation date; `None` for an empty snapshot.
    pub calendar: Option<(NaiveDate, NaiveDate)>,
    /// Last date with a non-null value, keyed by canonical metric name.
    pub last_observed: BTreeMap<String, NaiveDate>,
}

/// Runs homogenize, normalize, rates and change over one chunk of observations.
///
/// Cheap to clone; chunks of different areas can run on separate tasks with clones of the
/// same pipeline.
#[derive(Clone)]
pub struct ChunkPipeline {
    config: Arc<PipelineConfig>,
    population: Arc<dyn PopulationLookup>,
}

impl std::fmt::Debug for ChunkPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChunkPipeline {
    /// Pipeline over `config` with population reference `population`.
    pub fn new(config: Arc<PipelineConfig>, population: Arc<dyn PopulationLookup>) -> Self {
        Self { config, population }
    }

    /// Configuration the stages run with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Scan a whole snapshot for its [`DatasetBounds`]. Metric aliases are resolved.
    pub fn bounds(&self, observations: &[MetricObservation]) -> DatasetBounds {
        let mut bounds = DatasetBounds::default();
        for obs in observations {
            bounds.calendar = Some(match bounds.calendar {
                None => (obs.date, obs.date),
                Some((lo, hi)) => (lo.min(obs.date), hi.max(obs.date)),
            });
            if obs.value.is_some() {
                bounds
                    .last_observed
                    .entry(self.config.canonical_metric(&obs.metric).to_string())
                    .and_modify(|d| *d = (*d).max(obs.date))
                    .or_insert(obs.date);
            }
        }
        bounds
    }

    /// Transform `observations` as a complete dataset.
    ///
    /// Shorthand for [`ChunkPipeline::run_within`] with the bounds of `observations`.
    pub fn run(
        &self,
        observations: Vec<MetricObservation>,
        banded_cutoff: Option<NaiveDate>,
    ) -> Result<Vec<TransformedRow>, TransformError> {
        let bounds = self.bounds(&observations);
        self.run_within(observations, &bounds, banded_cutoff)
    }

    /// Transform one chunk of a dataset described by `bounds` into deployable rows.
    ///
    /// Metric aliases are resolved first. Days whose value is still null after filling
    /// produce no row. Banded series of one (area, metric, date) are merged into a single
    /// row whose payload lists each band; `banded_cutoff` is handed to the rate engine.
    pub fn run_within(
        &self,
        mut observations: Vec<MetricObservation>,
        bounds: &DatasetBounds,
        banded_cutoff: Option<NaiveDate>,
    ) -> Result<Vec<TransformedRow>, TransformError> {
        for obs in &mut observations {
            let canonical = self.config.canonical_metric(&obs.metric);
            if canonical != obs.metric {
                obs.metric = canonical.to_string();
            }
        }

        let mut data = homogenize_within(observations, bounds.calendar)?;
        RecordNormalizer::new(&self.config).normalize(&mut data)?;
        RateEngine::new(&self.config, self.population.as_ref()).apply(
            &mut data.series,
            &bounds.last_observed,
            banded_cutoff,
        );
        ChangeEngine::new(&self.config).apply(&mut data.series);

        let rows = flatten(data.series);
        tracing::debug!(rows = rows.len(), "chunk transformed");
        Ok(rows)
    }
}

type BandedKey = (AreaType, String, String, NaiveDate);

fn flatten(series: Vec<AreaSeries>) -> Vec<TransformedRow> {
    let mut rows = Vec::new();
    let mut banded: BTreeMap<BandedKey, (Option<String>, Vec<BandPayload>)> = BTreeMap::new();

    for s in series {
        for i in 0..s.len() {
            let Some(value) = s.values[i] else {
                continue;
            };
            let payload = Payload {
                value: Some(value),
                derived: s.derived[i],
            };
            let date = s.date_at(i);
            match &s.key.band {
                None => rows.push(TransformedRow {
                    area_type: s.key.area_type,
                    area_code: s.key.area_code.clone(),
                    area_name: s.area_name.clone(),
                    metric: s.key.metric.clone(),
                    date,
                    payload: RowPayload::Single(payload),
                }),
                Some(band) => {
                    let key = (
                        s.key.area_type,
                        s.key.area_code.clone(),
                        s.key.metric.clone(),
                        date,
                    );
                    let entry = banded
                        .entry(key)
                        .or_insert_with(|| (s.area_name.clone(), Vec::new()));
                    entry.1.push(BandPayload {
                        band: band.clone(),
                        payload,
                    });
                }
            }
        }
    }

    rows.extend(banded.into_iter().map(
        |((area_type, area_code, metric, date), (area_name, mut bands))| {
            bands.sort_by(|a, b| a.band.cmp(&b.band));
            TransformedRow {
                area_type,
                area_code,
                area_name,
                metric,
                date,
                payload: RowPayload::Banded(bands),
            }
        },
    ));
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::load_config_str, population::PopulationTable};

    fn obs(metric: &str, band: Option<&str>, day: u32, value: Option<f64>) -> MetricObservation {
        MetricObservation {
            area_type: AreaType::Utla,
            area_code: "E06000001".into(),
            area_name: Some("Hartlepool".into()),
            date: NaiveDate::from_ymd_opt(2021, 1, day).unwrap(),
            metric: metric.into(),
            value,
            band: band.map(Into::into),
        }
    }

    fn pipeline(toml: &str) -> ChunkPipeline {
        let mut population = PopulationTable::default();
        population.insert("E06000001", None, 100_000);
        population.insert("E06000001", Some("00_59"), 50_000);
        ChunkPipeline::new(Arc::new(load_config_str(toml).unwrap()), Arc::new(population))
    }

    #[test]
    fn zero_filled_window_of_four() {
        let p = pipeline(
            r#"
            [pipeline]
            rolling_window = 4
            [metrics.newCasesByPublishDate]
            fill = "zero"
            rolling_rate = true
            [aliases]
            newCases = "newCasesByPublishDate"
            "#,
        );
        let rows = p
            .run(
                vec![
                    obs("newCases", None, 1, Some(10.0)),
                    obs("newCases", None, 2, None),
                    obs("newCases", None, 3, None),
                    obs("newCases", None, 4, Some(40.0)),
                ],
                None,
            )
            .unwrap();
        let values: Vec<_> = rows
            .iter()
            .map(|r| match &r.payload {
                RowPayload::Single(p) => p.value,
                RowPayload::Banded(_) => None,
            })
            .collect();
        assert_eq!(values, vec![Some(10.0), Some(0.0), Some(0.0), Some(40.0)]);
        assert!(rows.iter().all(|r| r.metric == "newCasesByPublishDate"));
        assert_eq!(
            rows[3].payload.to_json().unwrap(),
            serde_json::json!({ "value": 40.0, "rollingSum": 50.0, "rollingRate": 50.0 })
        );
    }

    #[test]
    fn bands_merge_into_one_row_per_day() {
        let p = pipeline(
            r#"
            [metrics.newCasesBySpecimenDateAgeDemographics]
            incidence_rate = true
            "#,
        );
        let rows = p
            .run(
                vec![
                    obs("newCasesBySpecimenDateAgeDemographics", Some("60+"), 1, Some(3.0)),
                    obs("newCasesBySpecimenDateAgeDemographics", Some("00_59"), 1, Some(5.0)),
                ],
                None,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].payload.to_json().unwrap(),
            serde_json::json!([
                { "band": "00_59", "value": 5.0, "rate": 10.0 },
                { "band": "60+", "value": 3.0 }
            ])
        );
    }

    #[test]
    fn chunk_rows_do_not_depend_on_neighbours() {
        let p = pipeline(
            r#"
            [pipeline]
            rolling_window = 2
            provisional_days = 2
            [metrics.newCasesBySpecimenDate]
            rolling_rate = true
            "#,
        );
        let area = |code: &str, days: u32| -> Vec<MetricObservation> {
            (1..=days)
                .map(|d| MetricObservation {
                    area_code: code.into(),
                    ..obs("newCasesBySpecimenDate", None, d, Some(1.0))
                })
                .collect()
        };
        let short = area("E06000001", 8);
        let all: Vec<_> = short.iter().cloned().chain(area("E06000002", 12)).collect();

        let alone = p.run_within(short, &p.bounds(&all), None).unwrap();
        let together: Vec<_> = p
            .run(all, None)
            .unwrap()
            .into_iter()
            .filter(|r| r.area_code == "E06000001")
            .collect();
        assert_eq!(alone, together);
        // 7 Jan is before the dataset cutoff of 10 Jan
        assert_eq!(alone[6].payload.to_json().unwrap()["rollingSum"], 2.0);
    }

    #[test]
    fn empty_chunk_is_a_data_shape_error() {
        let p = pipeline("");
        assert!(matches!(
            p.run(Vec::new(), None),
            Err(TransformError::EmptyInput)
        ));
    }
}
