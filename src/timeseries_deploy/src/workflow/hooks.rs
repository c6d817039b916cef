//! Postprocessing branches run after deployment.
//!
//! Each hook is one independent branch of the postprocess fan-out: a failing hook is
//! reported on its own and never blocks the others or archival.

use std::collections::BTreeMap;

use async_trait::async_trait;
use diesel::{SqliteConnection, dsl, prelude::*};
use metric_transform::{
    io::{BlobStore, StorageTier},
    models::format_date,
};
use serde::Serialize;

use super::{
    ActivityError,
    local::{blocking_db, classify_blob},
};
use crate::{
    registry::repo::{get_or_create_release, release_timestamp},
    run::RunRequest,
    schema::{metric_reference as mr, time_series as ts},
};

/// Container holding per-release metadata documents.
pub const METADATA_CONTAINER: &str = "metadata";

/// What a hook can reach.
pub struct HookContext<'a> {
    /// Run being postprocessed.
    pub request: &'a RunRequest,
    /// Blob store of the run.
    pub blobs: &'a dyn BlobStore,
    /// Time-series store.
    pub database_url: &'a str,
}

/// One postprocessing branch.
#[async_trait]
pub trait PostprocessHook: Send + Sync {
    /// Branch name; unique among the hooks of one run.
    fn name(&self) -> &str;

    /// Run the branch.
    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), ActivityError>;
}

/// Per-metric statistics of one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricStats {
    /// Rows stored for the metric.
    pub rows: i64,
    /// Latest date with a row, `YYYY-MM-DD`.
    pub latest_date: Option<String>,
}

/// Row count and latest date of every metric in `release_id`.
pub fn release_metric_stats(
    conn: &mut SqliteConnection,
    release_id: i32,
) -> anyhow::Result<BTreeMap<String, MetricStats>> {
    let rows: Vec<(String, i64, Option<String>)> = ts::table
        .inner_join(mr::table)
        .filter(ts::release_id.eq(release_id))
        .group_by(mr::metric)
        .select((mr::metric, dsl::count(ts::hash), dsl::max(ts::date)))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(metric, rows, latest_date)| (metric, MetricStats { rows, latest_date }))
        .collect())
}

async fn write_json<T: Serialize>(
    ctx: &HookContext<'_>,
    name: &str,
    doc: &T,
) -> Result<String, ActivityError> {
    let body = serde_json::to_vec_pretty(doc).map_err(ActivityError::fatal)?;
    let path = format!("{}/{name}", format_date(ctx.request.release_date()));
    ctx.blobs
        .put(METADATA_CONTAINER, &path, &body, "application/json", StorageTier::Hot)
        .await
        .map_err(classify_blob)?;
    Ok(path)
}

/// Refreshes the per-metric statistics document of the release.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataRefreshHook;

#[async_trait]
impl PostprocessHook for MetadataRefreshHook {
    fn name(&self) -> &str {
        "metadata-refresh"
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), ActivityError> {
        let timestamp = ctx.request.timestamp;
        let stats = blocking_db(ctx.database_url, move |conn| {
            let release_id = get_or_create_release(conn, timestamp)?;
            release_metric_stats(conn, release_id)
        })
        .await?;

        #[derive(Serialize)]
        struct Doc {
            release: String,
            metrics: BTreeMap<String, MetricStats>,
        }
        let metrics = stats.len();
        let path = write_json(
            ctx,
            "metrics.json",
            &Doc {
                release: release_timestamp(timestamp),
                metrics: stats,
            },
        )
        .await?;
        tracing::info!(%path, metrics, "metadata refreshed");
        Ok(())
    }
}

/// Publishes the list of area types covered by the release.
#[derive(Debug, Clone, Copy, Default)]
pub struct AreaCoverageHook;

#[async_trait]
impl PostprocessHook for AreaCoverageHook {
    fn name(&self) -> &str {
        "area-coverage"
    }

    async fn run(&self, ctx: &HookContext<'_>) -> Result<(), ActivityError> {
        use crate::schema::area_reference as ar;

        let timestamp = ctx.request.timestamp;
        let coverage: BTreeMap<String, i64> = blocking_db(ctx.database_url, move |conn| {
            let release_id = get_or_create_release(conn, timestamp)?;
            let rows: Vec<(String, i64)> = ts::table
                .inner_join(ar::table)
                .filter(ts::release_id.eq(release_id))
                .group_by(ar::area_type)
                .select((ar::area_type, dsl::count_distinct(ts::area_id)))
                .load(conn)?;
            Ok(rows.into_iter().collect())
        })
        .await?;

        let path = write_json(ctx, "areas.json", &coverage).await?;
        tracing::info!(%path, area_types = coverage.len(), "area coverage published");
        Ok(())
    }
}
