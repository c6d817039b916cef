//! Activities backed by a [`BlobStore`] and a SQLite time-series store.
//!
//! Diesel calls are synchronous; each one runs on the blocking pool with its own
//! connection, so concurrent chunk activities never share a connection. Transforms are
//! CPU-bound and run on the blocking pool too.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, anyhow};
use diesel::{
    SqliteConnection,
    result::{DatabaseErrorKind, Error as DieselError},
};
use metric_transform::{
    io::{
        BlobError, BlobStore, ChunkArtifact, StorageTier,
        artifact::{ARTIFACT_CONTENT_TYPE, PROCESSED_CONTAINER},
    },
    models::{area::AreaType, format_date, observation::MetricObservation},
    pipeline::{ChunkPipeline, DatasetBounds},
};
use serde_json::json;

use super::{
    Activities, ActivityError, ChunkOutcome, ChunkRef,
    hooks::{HookContext, PostprocessHook},
};
use crate::{
    db::connection::connect_sqlite,
    deploy::{BulkDeployer, DeploySummary, decode_artifact},
    registry::{
        FileStatus, Registration,
        repo::{get_or_create_release, mark_released, register_file, settle_file},
    },
    run::{ChunkHandler, RunRequest},
};

/// Container holding concatenated run datasets.
pub const ARCHIVE_CONTAINER: &str = "archive";

/// Container holding the dispatch token.
pub const DISPATCH_CONTAINER: &str = "dispatch";

/// Path of the dispatch token inside [`DISPATCH_CONTAINER`].
pub const DISPATCH_TOKEN_PATH: &str = "token";

/// Run `f` on the blocking pool with a fresh connection to `database_url`.
///
/// Failures go through [`classify_store`]; a panicking closure is fatal.
pub(crate) async fn blocking_db<T, F>(database_url: &str, f: F) -> Result<T, ActivityError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> anyhow::Result<T> + Send + 'static,
{
    let url = database_url.to_string();
    tokio::task::spawn_blocking(move || {
        let mut conn = connect_sqlite(&url)?;
        f(&mut conn)
    })
    .await
    .map_err(ActivityError::fatal)?
    .map_err(classify_store)
}

/// Constraint violations and (de)serialization failures are fatal; lock contention,
/// connection problems and anything unrecognised are retried.
pub(crate) fn classify_store(e: anyhow::Error) -> ActivityError {
    let fatal = e.chain().any(|cause| {
        if cause.is::<serde_json::Error>() {
            return true;
        }
        match cause.downcast_ref::<DieselError>() {
            Some(DieselError::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::UniqueViolation
                    | DatabaseErrorKind::ForeignKeyViolation
                    | DatabaseErrorKind::NotNullViolation
                    | DatabaseErrorKind::CheckViolation
            ),
            Some(
                DieselError::DeserializationError(_)
                | DieselError::SerializationError(_)
                | DieselError::NotFound,
            ) => true,
            _ => false,
        }
    });
    if fatal {
        ActivityError::fatal(e)
    } else {
        ActivityError::transient(e)
    }
}

/// Missing blobs and bad paths are fatal; I/O failures are retried.
pub(crate) fn classify_blob(e: BlobError) -> ActivityError {
    if e.is_transient() {
        ActivityError::transient(e)
    } else {
        ActivityError::fatal(e)
    }
}

/// Split a raw snapshot into one chunk per (area type, area code), in key order.
///
/// With `only` set, observations of other area types are dropped. Every chunk shares
/// `bounds`.
pub fn split_chunks(
    observations: Vec<MetricObservation>,
    only: Option<AreaType>,
    bounds: &Arc<DatasetBounds>,
) -> Vec<ChunkRef> {
    let mut groups: BTreeMap<(AreaType, String), Vec<MetricObservation>> = BTreeMap::new();
    for obs in observations {
        if only.is_some_and(|t| t != obs.area_type) {
            continue;
        }
        groups
            .entry((obs.area_type, obs.area_code.clone()))
            .or_default()
            .push(obs);
    }
    groups
        .into_iter()
        .map(|((area_type, area_code), observations)| ChunkRef {
            area_type,
            area_code,
            observations,
            bounds: Arc::clone(bounds),
        })
        .collect()
}

/// File name of `data_path` without directory or extension.
fn file_stem(data_path: &str) -> &str {
    let name = data_path.rsplit('/').next().unwrap_or(data_path);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// Production wiring of the run activities.
pub struct LocalActivities {
    blobs: Arc<dyn BlobStore>,
    database_url: String,
    pipeline: ChunkPipeline,
    deployer: BulkDeployer,
    hooks: Vec<Arc<dyn PostprocessHook>>,
}

impl LocalActivities {
    /// Activities over `blobs` and the store at `database_url`, with no postprocessing hooks.
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        database_url: impl Into<String>,
        pipeline: ChunkPipeline,
        deployer: BulkDeployer,
    ) -> Self {
        Self {
            blobs,
            database_url: database_url.into(),
            pipeline,
            deployer,
            hooks: Vec::new(),
        }
    }

    /// Add a postprocessing branch.
    pub fn with_hook(mut self, hook: Arc<dyn PostprocessHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    async fn load_artifacts(
        &self,
        req: &RunRequest,
        artifacts: &[String],
    ) -> Result<Vec<ChunkArtifact>, ActivityError> {
        let run_id = req.run_id();
        let mut out = Vec::with_capacity(artifacts.len());
        for path in artifacts {
            let bytes = self
                .blobs
                .get(PROCESSED_CONTAINER, path)
                .await
                .map_err(classify_blob)?;
            out.push(decode_artifact(path, &bytes, &run_id).map_err(ActivityError::fatal)?);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl Activities for LocalActivities {
    async fn register(&self, req: &RunRequest) -> Result<Registration, ActivityError> {
        let file_path = req.data_path.clone();
        let run_id = req.run_id();
        blocking_db(&self.database_url, move |conn| {
            register_file(conn, &file_path, &run_id)
        })
        .await
    }

    #[tracing::instrument(skip(self, req), fields(data_path = %req.data_path))]
    async fn retrieve(&self, req: &RunRequest) -> Result<Vec<ChunkRef>, ActivityError> {
        let (container, path) = req
            .blob_location()
            .ok_or_else(|| ActivityError::fatal(anyhow!("data path {} has no container", req.data_path)))?;
        let bytes = self.blobs.get(container, path).await.map_err(classify_blob)?;
        let observations: Vec<MetricObservation> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse raw snapshot {}", req.data_path))
            .map_err(ActivityError::fatal)?;
        let bounds = Arc::new(self.pipeline.bounds(&observations));
        tracing::debug!(
            observations = observations.len(),
            calendar = ?bounds.calendar,
            "raw snapshot parsed"
        );
        Ok(split_chunks(observations, req.area_type, &bounds))
    }

    #[tracing::instrument(skip(self, req, chunk), fields(chunk = %chunk.label()))]
    async fn transform_chunk(
        &self,
        req: &RunRequest,
        chunk: &ChunkRef,
    ) -> Result<ChunkOutcome, ActivityError> {
        let handler = match req.handler(chunk.area_type) {
            Ok(h) => h,
            Err(e) => {
                return Ok(ChunkOutcome::NothingToProcess {
                    reason: e.to_string(),
                });
            }
        };
        let cutoff = match handler {
            ChunkHandler::Standard => None,
            ChunkHandler::Banded => {
                if let Some(obs) = chunk.observations.iter().find(|o| o.band.is_none()) {
                    return Err(ActivityError::DataShape(format!(
                        "{} on {} has no band",
                        obs.metric,
                        format_date(obs.date)
                    )));
                }
                Some(req.banded_cutoff(self.pipeline.config().pipeline.provisional_days))
            }
        };

        let pipeline = self.pipeline.clone();
        let observations = chunk.observations.clone();
        let bounds = Arc::clone(&chunk.bounds);
        let rows = tokio::task::spawn_blocking(move || pipeline.run_within(observations, &bounds, cutoff))
            .await
            .map_err(ActivityError::fatal)?
            .map_err(|e| ActivityError::DataShape(e.to_string()))?;
        if rows.is_empty() {
            return Ok(ChunkOutcome::NothingToProcess {
                reason: "no values after transformation".into(),
            });
        }

        let artifact = ChunkArtifact {
            run_id: req.run_id(),
            area_type: chunk.area_type,
            area_code: chunk.area_code.clone(),
            rows,
        };
        let bytes = artifact.encode().map_err(ActivityError::fatal)?;
        let path = artifact.blob_path();
        self.blobs
            .put(
                PROCESSED_CONTAINER,
                &path,
                &bytes,
                ARTIFACT_CONTENT_TYPE,
                StorageTier::Hot,
            )
            .await
            .map_err(classify_blob)?;
        Ok(ChunkOutcome::Processed {
            artifact: path,
            rows: artifact.rows.len(),
        })
    }

    #[tracing::instrument(skip(self, req, artifacts), fields(artifacts = artifacts.len()))]
    async fn deploy(
        &self,
        req: &RunRequest,
        artifacts: &[String],
    ) -> Result<DeploySummary, ActivityError> {
        let rows: Vec<_> = self
            .load_artifacts(req, artifacts)
            .await?
            .into_iter()
            .flat_map(|a| a.rows)
            .collect();
        let deployer = self.deployer.clone();
        let timestamp = req.timestamp;
        let release_date = req.release_date();
        blocking_db(&self.database_url, move |conn| {
            let release_id = get_or_create_release(conn, timestamp)?;
            deployer.deploy(conn, release_id, release_date, &rows)
        })
        .await
    }

    fn postprocess_branches(&self) -> Vec<String> {
        self.hooks.iter().map(|h| h.name().to_string()).collect()
    }

    async fn postprocess(&self, req: &RunRequest, branch: &str) -> Result<(), ActivityError> {
        let hook = self
            .hooks
            .iter()
            .find(|h| h.name() == branch)
            .ok_or_else(|| ActivityError::fatal(anyhow!("unknown postprocessing branch {branch}")))?;
        let ctx = HookContext {
            request: req,
            blobs: self.blobs.as_ref(),
            database_url: &self.database_url,
        };
        hook.run(&ctx).await
    }

    #[tracing::instrument(skip(self, req, artifacts), fields(artifacts = artifacts.len()))]
    async fn archive(&self, req: &RunRequest, artifacts: &[String]) -> Result<(), ActivityError> {
        let records = self
            .load_artifacts(req, artifacts)
            .await?
            .into_iter()
            .flat_map(|a| a.rows)
            .map(|row| {
                Ok(json!({
                    "areaType": row.area_type,
                    "areaCode": row.area_code,
                    "areaName": row.area_name,
                    "metric": row.metric,
                    "date": format_date(row.date),
                    "payload": row.payload.to_json()?,
                }))
            })
            .collect::<serde_json::Result<Vec<serde_json::Value>>>()
            .context("render archive rows")
            .map_err(ActivityError::fatal)?;
        let body = serde_json::to_vec(&records)
            .context("serialize archive")
            .map_err(ActivityError::fatal)?;
        let path = format!("{}/{}.json", format_date(req.release_date()), file_stem(&req.data_path));
        self.blobs
            .put(ARCHIVE_CONTAINER, &path, &body, "application/json", StorageTier::Cool)
            .await
            .map_err(classify_blob)?;

        let token = uuid::Uuid::new_v4().to_string();
        self.blobs
            .put(
                DISPATCH_CONTAINER,
                DISPATCH_TOKEN_PATH,
                token.as_bytes(),
                "text/plain",
                StorageTier::Hot,
            )
            .await
            .map_err(classify_blob)?;

        let timestamp = req.timestamp;
        blocking_db(&self.database_url, move |conn| {
            let release_id = get_or_create_release(conn, timestamp)?;
            mark_released(conn, release_id)
        })
        .await?;
        tracing::info!(%path, rows = records.len(), "dataset archived");
        Ok(())
    }

    async fn settle(&self, req: &RunRequest, status: FileStatus) -> Result<(), ActivityError> {
        let file_path = req.data_path.clone();
        let run_id = req.run_id();
        blocking_db(&self.database_url, move |conn| {
            settle_file(conn, &file_path, &run_id, status)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn obs(area_type: AreaType, code: &str) -> MetricObservation {
        MetricObservation {
            area_type,
            area_code: code.into(),
            area_name: None,
            date: NaiveDate::from_ymd_opt(2021, 6, 1).unwrap(),
            metric: "newCasesBySpecimenDate".into(),
            value: Some(1.0),
            band: None,
        }
    }

    #[test]
    fn chunks_group_by_area() {
        let chunks = split_chunks(
            vec![
                obs(AreaType::Utla, "E06000002"),
                obs(AreaType::Nation, "E92000001"),
                obs(AreaType::Utla, "E06000001"),
                obs(AreaType::Utla, "E06000002"),
            ],
            None,
            &Arc::default(),
        );
        let labels: Vec<_> = chunks.iter().map(ChunkRef::label).collect();
        assert_eq!(labels, vec!["nation/E92000001", "utla/E06000001", "utla/E06000002"]);
        assert_eq!(chunks[2].observations.len(), 2);

        let only = split_chunks(
            vec![obs(AreaType::Utla, "E06000001"), obs(AreaType::Nation, "E92000001")],
            Some(AreaType::Nation),
            &Arc::default(),
        );
        assert_eq!(only.len(), 1);
    }

    fn db_error(kind: DatabaseErrorKind, message: &str) -> anyhow::Error {
        anyhow::Error::from(DieselError::DatabaseError(kind, Box::new(message.to_string())))
            .context("upsert chunk")
    }

    #[test]
    fn store_errors_are_classified() {
        let locked = db_error(DatabaseErrorKind::Unknown, "database is locked");
        assert!(classify_store(locked).is_transient());

        let unique = db_error(DatabaseErrorKind::UniqueViolation, "UNIQUE constraint failed");
        assert!(matches!(classify_store(unique), ActivityError::Fatal(_)));
        let fk = db_error(DatabaseErrorKind::ForeignKeyViolation, "FOREIGN KEY constraint failed");
        assert!(matches!(classify_store(fk), ActivityError::Fatal(_)));

        let decode = anyhow::Error::from(DieselError::DeserializationError("bad date".into()));
        assert!(matches!(classify_store(decode), ActivityError::Fatal(_)));

        let payload = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(
            classify_store(anyhow::Error::from(payload)),
            ActivityError::Fatal(_)
        ));

        assert!(classify_store(anyhow!("open sqlite database /tmp/x.db")).is_transient());
    }

    #[test]
    fn archive_names_follow_the_input_file() {
        assert_eq!(file_stem("raw/2021-06-01/main.json"), "main");
        assert_eq!(file_stem("main"), "main");
    }
}
