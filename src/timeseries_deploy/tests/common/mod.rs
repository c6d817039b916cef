#![allow(dead_code)]

use std::{path::PathBuf, sync::Arc};

use chrono::NaiveDate;
use diesel::QueryableByName;
use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use metric_transform::{
    config::load_config_str,
    hashing::{DigestSize, RowHasher},
    models::{area::AreaType, observation::MetricObservation},
    pipeline::ChunkPipeline,
    population::PopulationTable,
};
use secrecy::SecretString;
use tempfile::TempDir;
use timeseries_deploy::db::{connection, migrate};

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}
#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}

pub struct TestDb {
    _dir: TempDir,    // keep alive for the life of the test
    pub path: String, // <tmpdir>/test.db
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    migrate::run_all(&path).expect("migrations");

    let conn = connection::connect_sqlite(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);
}

pub fn hasher() -> RowHasher {
    RowHasher::new(&SecretString::new("test-hash-key".into()), DigestSize::Short).unwrap()
}

pub const WINDOW_OF_FOUR: &str = r#"
[pipeline]
rolling_window = 4
chunk_size = 2

[metrics.newCasesByPublishDate]
fill = "zero"
rolling_rate = true
"#;

pub fn pipeline(toml: &str) -> ChunkPipeline {
    let mut population = PopulationTable::default();
    population.insert("E06000001", None, 100_000);
    ChunkPipeline::new(Arc::new(load_config_str(toml).unwrap()), Arc::new(population))
}

pub fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 6, d).unwrap()
}

pub fn obs(code: &str, metric: &str, d: u32, value: Option<f64>) -> MetricObservation {
    MetricObservation {
        area_type: AreaType::Utla,
        area_code: code.into(),
        area_name: Some("Hartlepool".into()),
        date: day(d),
        metric: metric.into(),
        value,
        band: None,
    }
}

/// `[10, null, null, 40]` for E06000001 on 1-4 June 2021.
pub fn sparse_series() -> Vec<MetricObservation> {
    vec![
        obs("E06000001", "newCasesByPublishDate", 1, Some(10.0)),
        obs("E06000001", "newCasesByPublishDate", 2, None),
        obs("E06000001", "newCasesByPublishDate", 3, None),
        obs("E06000001", "newCasesByPublishDate", 4, Some(40.0)),
    ]
}
