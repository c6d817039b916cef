//! Bulk deployment of transformed rows into the time-series table.
//!
//! ## What this does
//! - Registers metrics, areas and partitions referenced by the rows (insert-if-absent).
//! - Hashes every row and deduplicates by (release, area, metric, date), keeping the first.
//! - Upserts in chunks of at most `chunk_size` rows, each chunk in one **`BEGIN IMMEDIATE`**
//!   transaction, with `ON CONFLICT (hash, partition_id) DO UPDATE SET payload`.
//!
//! ## Idempotence
//! The hash is a pure function of (date, area type, area code, metric id, release id), so a
//! re-run of the same release hits the same (hash, partition) keys and only rewrites
//! payloads. Rows already written by an earlier, failed attempt stay valid.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::NaiveDate;
use diesel::{SqliteConnection, insert_into, prelude::*, upsert::excluded};
use metric_transform::{
    hashing::{RowHasher, partition_bucket, partition_for},
    io::{ArtifactError, ChunkArtifact},
    models::{
        area::{AreaType, resolve_area_type},
        format_date,
        payload::TransformedRow,
    },
};
use serde::Serialize;

use crate::{
    models::NewTimeSeriesRow,
    registry::{
        MetricIdCache,
        repo::{confirm_or_create_area, ensure_partition, get_or_create_metric},
    },
    schema::time_series as ts,
};

/// Errors assembling a deployment from chunk artifacts.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    /// An artifact could not be decoded.
    #[error("chunk artifact {path} is unreadable")]
    Artifact {
        /// Blob path of the artifact.
        path: String,
        /// Decode failure.
        #[source]
        source: ArtifactError,
    },

    /// An artifact was written by a different run.
    #[error("chunk artifact {path} belongs to run {found}, expected {expected}")]
    RunMismatch {
        /// Blob path of the artifact.
        path: String,
        /// Run being deployed.
        expected: String,
        /// Run recorded in the artifact.
        found: String,
    },
}

/// Decode an artifact and check that it belongs to `run_id`.
pub fn decode_artifact(path: &str, bytes: &[u8], run_id: &str) -> Result<ChunkArtifact, DeployError> {
    let artifact = ChunkArtifact::decode(bytes).map_err(|source| DeployError::Artifact {
        path: path.to_string(),
        source,
    })?;
    if artifact.run_id != run_id {
        return Err(DeployError::RunMismatch {
            path: path.to_string(),
            expected: run_id.to_string(),
            found: artifact.run_id,
        });
    }
    Ok(artifact)
}

/// One row ready for upsert; unique by (hash, partition_id).
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRow {
    /// FK to `metric_reference`.
    pub metric_id: i32,
    /// FK to `area_reference`.
    pub area_id: i32,
    /// `YYYY_MM_DD|bucket`.
    pub partition_id: String,
    /// FK to `release_reference`.
    pub release_id: i32,
    /// Row identity digest.
    pub hash: String,
    /// Observation date.
    pub date: NaiveDate,
    /// JSON payload.
    pub payload: serde_json::Value,
}

/// Counters reported by [`BulkDeployer::deploy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploySummary {
    /// Transformed rows received.
    pub rows_in: usize,
    /// Rows dropped as duplicates of an earlier (release, area, metric, date).
    pub rows_deduplicated: usize,
    /// Rows inserted or updated.
    pub rows_written: usize,
    /// Upsert chunks executed.
    pub chunks: usize,
    /// Metrics registered by this deploy.
    pub metrics_registered: usize,
    /// Areas registered by this deploy.
    pub areas_registered: usize,
    /// Distinct partitions written to.
    pub partitions: usize,
}

impl DeploySummary {
    /// Fold another summary into this one.
    pub fn absorb(&mut self, other: &DeploySummary) {
        self.rows_in += other.rows_in;
        self.rows_deduplicated += other.rows_deduplicated;
        self.rows_written += other.rows_written;
        self.chunks += other.chunks;
        self.metrics_registered += other.metrics_registered;
        self.areas_registered += other.areas_registered;
        self.partitions += other.partitions;
    }
}

/// Keep the first row for each (release, area, metric, date). Returns the kept rows and the
/// number dropped.
pub fn dedup_rows(rows: Vec<DeployRow>) -> (Vec<DeployRow>, usize) {
    let before = rows.len();
    let mut seen = HashSet::with_capacity(before);
    let kept: Vec<DeployRow> = rows
        .into_iter()
        .filter(|r| seen.insert((r.release_id, r.area_id, r.metric_id, r.date)))
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Resolves references, hashes and upserts transformed rows.
#[derive(Debug, Clone)]
pub struct BulkDeployer {
    hasher: RowHasher,
    chunk_size: usize,
    metric_ids: Arc<MetricIdCache>,
}

impl BulkDeployer {
    /// Deployer writing at most `chunk_size` rows per transaction.
    pub fn new(hasher: RowHasher, chunk_size: usize, metric_ids: Arc<MetricIdCache>) -> Self {
        Self {
            hasher,
            chunk_size: chunk_size.max(1),
            metric_ids,
        }
    }

    /// Register references for `rows` and turn them into [`DeployRow`]s.
    pub fn prepare(
        &self,
        conn: &mut SqliteConnection,
        release_id: i32,
        release_date: NaiveDate,
        rows: &[TransformedRow],
        summary: &mut DeploySummary,
    ) -> anyhow::Result<Vec<DeployRow>> {
        let mut area_ids: HashMap<(AreaType, &str), i32> = HashMap::new();
        let mut partitions: HashMap<&'static str, String> = HashMap::new();
        let mut out = Vec::with_capacity(rows.len());

        for row in rows {
            let metric_id = match self.metric_ids.get(&row.metric) {
                Some(id) => id,
                None => {
                    let (id, created) = get_or_create_metric(conn, &row.metric)?;
                    if created {
                        summary.metrics_registered += 1;
                        tracing::info!(metric = %row.metric, metric_id = id, "metric registered");
                    }
                    self.metric_ids.insert(&row.metric, id);
                    id
                }
            };

            let area_type = row
                .area_name
                .as_deref()
                .map_or(row.area_type, |n| resolve_area_type(row.area_type, n));
            let area_id = match area_ids.get(&(area_type, row.area_code.as_str())) {
                Some(&id) => id,
                None => {
                    let (id, created) = confirm_or_create_area(
                        conn,
                        row.area_type,
                        &row.area_code,
                        row.area_name.as_deref(),
                    )?;
                    summary.areas_registered += usize::from(created);
                    area_ids.insert((area_type, row.area_code.as_str()), id);
                    id
                }
            };

            let bucket_key = partition_bucket(area_type.as_str());
            let partition_id = match partitions.get(bucket_key) {
                Some(id) => id.clone(),
                None => {
                    let partition = partition_for(release_date, area_type.as_str());
                    ensure_partition(conn, &partition)?;
                    partitions.insert(partition.bucket, partition.partition_id.clone());
                    partition.partition_id
                }
            };

            out.push(DeployRow {
                metric_id,
                area_id,
                partition_id,
                release_id,
                hash: self.hasher.row_hash(
                    row.date,
                    area_type.as_str(),
                    &row.area_code,
                    metric_id,
                    release_id,
                ),
                date: row.date,
                payload: row.payload.to_json()?,
            });
        }

        summary.partitions += partitions.len();
        Ok(out)
    }

    /// Upsert `rows` chunk by chunk. Returns the number of rows written.
    pub fn upsert(
        &self,
        conn: &mut SqliteConnection,
        rows: &[DeployRow],
        summary: &mut DeploySummary,
    ) -> anyhow::Result<usize> {
        let mut written = 0;
        for (chunk_no, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let n = conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
                let mut n = 0;
                for r in chunk {
                    let payload = serde_json::to_string(&r.payload)?;
                    let date = format_date(r.date);
                    n += insert_into(ts::table)
                        .values(NewTimeSeriesRow {
                            hash: &r.hash,
                            release_id: r.release_id,
                            area_id: r.area_id,
                            metric_id: r.metric_id,
                            partition_id: &r.partition_id,
                            date: &date,
                            payload: &payload,
                        })
                        .on_conflict((ts::hash, ts::partition_id))
                        .do_update()
                        .set(ts::payload.eq(excluded(ts::payload)))
                        .execute(conn)?;
                }
                Ok(n)
            })?;
            tracing::debug!(chunk = chunk_no, rows = n, "chunk upserted");
            written += n;
            summary.chunks += 1;
        }
        summary.rows_written += written;
        Ok(written)
    }

    /// Register, hash, deduplicate and upsert `rows` for one release.
    #[tracing::instrument(skip(self, conn, rows), fields(rows = rows.len()))]
    pub fn deploy(
        &self,
        conn: &mut SqliteConnection,
        release_id: i32,
        release_date: NaiveDate,
        rows: &[TransformedRow],
    ) -> anyhow::Result<DeploySummary> {
        let mut summary = DeploySummary {
            rows_in: rows.len(),
            ..Default::default()
        };
        let prepared = self.prepare(conn, release_id, release_date, rows, &mut summary)?;
        let (deduped, dropped) = dedup_rows(prepared);
        summary.rows_deduplicated = dropped;
        self.upsert(conn, &deduped, &mut summary)?;
        tracing::info!(?summary, "deploy finished");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn row(area_id: i32, date: u32, hash: &str) -> DeployRow {
        DeployRow {
            metric_id: 1,
            area_id,
            partition_id: "2021_06_01|utla".into(),
            release_id: 1,
            hash: hash.into(),
            date: NaiveDate::from_ymd_opt(2021, 5, date).unwrap(),
            payload: serde_json::json!({ "value": date }),
        }
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let (kept, dropped) = dedup_rows(vec![
            row(1, 1, "a"),
            row(1, 1, "b"),
            row(2, 1, "c"),
            row(1, 2, "d"),
        ]);
        assert_eq!(dropped, 1);
        assert_eq!(
            kept.iter().map(|r| r.hash.as_str()).collect::<Vec<_>>(),
            vec!["a", "c", "d"]
        );
    }

    #[test]
    fn artifacts_of_another_run_are_rejected() {
        let bytes = ChunkArtifact {
            run_id: "20210601T000000000Z".into(),
            area_type: AreaType::Utla,
            area_code: "E06000001".into(),
            rows: vec![],
        }
        .encode()
        .unwrap();

        assert!(decode_artifact("a.bin", &bytes, "20210601T000000000Z").is_ok());
        let err = decode_artifact("a.bin", &bytes, "20210602T000000000Z").unwrap_err();
        assert!(matches!(err, DeployError::RunMismatch { .. }));
        assert!(matches!(
            decode_artifact("a.bin", &bytes[..3], "20210601T000000000Z"),
            Err(DeployError::Artifact { .. })
        ));
    }

    #[test]
    fn summaries_add_up() {
        let mut a = DeploySummary {
            rows_in: 3,
            rows_written: 2,
            chunks: 1,
            ..Default::default()
        };
        a.absorb(&DeploySummary {
            rows_in: 1,
            rows_written: 1,
            chunks: 1,
            partitions: 1,
            ..Default::default()
        });
        assert_eq!((a.rows_in, a.rows_written, a.chunks, a.partitions), (4, 3, 2, 1));
    }

    proptest! {
        #[test]
        fn dedup_keeps_one_row_per_key(keys in proptest::collection::vec((1..4i32, 1..5u32), 0..40)) {
            let rows: Vec<DeployRow> = keys
                .iter()
                .enumerate()
                .map(|(i, &(area, day))| row(area, day, &i.to_string()))
                .collect();
            let distinct: HashSet<_> = keys.iter().collect();

            let (kept, dropped) = dedup_rows(rows);
            prop_assert_eq!(kept.len(), distinct.len());
            prop_assert_eq!(kept.len() + dropped, keys.len());
            for r in &kept {
                let first = keys
                    .iter()
                    .position(|&(a, d)| a == r.area_id && NaiveDate::from_ymd_opt(2021, 5, d) == Some(r.date));
                prop_assert_eq!(first.map(|i| i.to_string()), Some(r.hash.clone()));
            }
        }
    }
}
