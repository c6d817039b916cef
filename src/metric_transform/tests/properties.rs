use std::{collections::BTreeMap, sync::Arc};

use chrono::{Days, NaiveDate};
use metric_transform::{
    change::change_percentage,
    config::{ZeroBaseChange, load_config_str},
    hashing::{DigestSize, RowHasher},
    models::{
        area::AreaType,
        observation::MetricObservation,
        payload::{Direction, TransformedRow},
    },
    normalize::{forward_fill, zero_fill},
    pipeline::ChunkPipeline,
    population::PopulationTable,
    rates::rolling_sum,
};
use proptest::prelude::*;
use secrecy::SecretString;

fn hasher() -> RowHasher {
    RowHasher::new(&SecretString::new("property-key".into()), DigestSize::Short).unwrap()
}

fn base_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()
}

// (day offset, area type, area code, metric id, release id)
type RowIdent = (u16, &'static str, String, i32, i32);

fn row_ident() -> impl Strategy<Value = RowIdent> {
    (
        0u16..800,
        prop::sample::select(vec!["nation", "utla", "ltla", "msoa", "nhsTrust"]),
        "[EWSN][0-9]{8}",
        1i32..500,
        1i32..20,
    )
}

fn sparse_values() -> impl Strategy<Value = Vec<Option<f64>>> {
    prop::collection::vec(prop::option::of(0u32..10_000), 0..60)
        .prop_map(|v| v.into_iter().map(|x| x.map(f64::from)).collect())
}

const AREAS: [&str; 3] = ["E06000001", "E06000002", "E06000003"];

fn pipeline() -> ChunkPipeline {
    let config = load_config_str(
        r#"
        [pipeline]
        rolling_window = 3
        provisional_days = 2

        [metrics.newCasesBySpecimenDate]
        fill = "zero"
        rolling_rate = true
        change = true
        "#,
    )
    .unwrap();
    let mut population = PopulationTable::default();
    for (i, code) in AREAS.iter().enumerate() {
        population.insert(*code, None, 50_000 * (i as u64 + 1));
    }
    ChunkPipeline::new(Arc::new(config), Arc::new(population))
}

/// One observation per (area, day), together with a shuffled copy.
fn snapshot() -> impl Strategy<Value = (Vec<MetricObservation>, Vec<MetricObservation>)> {
    prop::collection::btree_map(
        (0..AREAS.len(), 0u64..30),
        prop::option::of(0u32..500),
        1..60,
    )
    .prop_map(|cells| {
        cells
            .into_iter()
            .map(|((area, day), value)| MetricObservation {
                area_type: AreaType::Utla,
                area_code: AREAS[area].into(),
                area_name: Some(format!("Area {area}")),
                date: base_date() + Days::new(day),
                metric: "newCasesBySpecimenDate".into(),
                value: value.map(f64::from),
                band: None,
            })
            .collect::<Vec<_>>()
    })
    .prop_flat_map(|obs| (Just(obs.clone()), Just(obs).prop_shuffle()))
}

fn keyed(rows: Vec<TransformedRow>) -> BTreeMap<(String, NaiveDate), serde_json::Value> {
    rows.into_iter()
        .map(|r| {
            let payload = r.payload.to_json().unwrap();
            ((r.area_code, r.date), payload)
        })
        .collect()
}

proptest! {
    #[test]
    fn rows_ignore_input_order_and_chunking((obs, shuffled) in snapshot()) {
        let p = pipeline();
        let whole = keyed(p.run(obs.clone(), None).unwrap());
        let reordered = keyed(p.run(shuffled, None).unwrap());

        let bounds = p.bounds(&obs);
        let mut per_area: BTreeMap<&str, Vec<MetricObservation>> = BTreeMap::new();
        for o in &obs {
            per_area.entry(o.area_code.as_str()).or_default().push(o.clone());
        }
        let chunked = keyed(
            per_area
                .into_values()
                .flat_map(|chunk| p.run_within(chunk, &bounds, None).unwrap())
                .collect(),
        );

        prop_assert_eq!(&whole, &reordered);
        prop_assert_eq!(&whole, &chunked);
    }

    #[test]
    fn hashes_are_stable_across_hasher_instances(row in row_ident()) {
        let date = base_date() + Days::new(u64::from(row.0));
        prop_assert_eq!(
            hasher().row_hash(date, row.1, &row.2, row.3, row.4),
            hasher().row_hash(date, row.1, &row.2, row.3, row.4)
        );
    }

    #[test]
    fn fills_never_write_outside_the_observed_span(values in sparse_values()) {
        let span = values
            .iter()
            .position(Option::is_some)
            .zip(values.iter().rposition(Option::is_some));

        for fill in [zero_fill as fn(&mut [Option<f64>]), forward_fill] {
            let mut filled = values.clone();
            fill(&mut filled);
            for (i, v) in filled.iter().enumerate() {
                match span {
                    Some((first, last)) if (first..=last).contains(&i) => prop_assert!(v.is_some()),
                    _ => prop_assert_eq!(*v, values[i]),
                }
            }
        }
    }

    #[test]
    fn rolling_sum_equals_window_total(
        values in prop::collection::vec(0u32..10_000, 7..40),
    ) {
        let values: Vec<Option<f64>> = values.into_iter().map(|x| Some(f64::from(x))).collect();
        let sums = rolling_sum(&values, 7);
        for i in 6..values.len() {
            let expected: f64 = values[i - 6..=i].iter().flatten().sum();
            prop_assert_eq!(sums[i], Some(expected));
        }
        prop_assert!(sums[..6].iter().all(Option::is_none));
    }

    #[test]
    fn drop_to_zero_is_minus_one_hundred(previous in 1u32..1_000_000) {
        prop_assert_eq!(
            change_percentage(0.0, f64::from(previous), ZeroBaseChange::Formula),
            Some(-100.0)
        );
    }

    #[test]
    fn direction_is_same_only_for_zero_change(change in -1_000i32..1_000) {
        let d = Direction::from_change(f64::from(change));
        prop_assert_eq!(d == Direction::Same, change == 0);
    }
}
