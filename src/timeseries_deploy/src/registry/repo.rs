//! Reference table statements: releases, areas, metrics, partitions, processed files.
//!
//! Every "create" here is an insert-if-absent followed by a lookup, so a second writer
//! that loses a race reads the winner's row instead of failing.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::{
    SqliteConnection, insert_into,
    prelude::*,
    result::{DatabaseErrorKind, Error as DieselError},
};
use metric_transform::{
    hashing::PartitionRef,
    models::{
        area::{AreaType, resolve_area_type},
        format_date,
    },
};
use rand::Rng;

use crate::{
    models::{Area, NewArea, NewPartition, Release},
    schema::{
        area_reference as ar, metric_reference as mr, processed_file as pf,
        release_reference as rr, time_series_partition as tsp,
    },
};

/// Attempts made by [`get_or_create_release`] before giving up.
pub const RELEASE_MAX_ATTEMPTS: u32 = 5;

const RELEASE_BASE_DELAY: Duration = Duration::from_millis(50);

/// Errors specific to reference registration.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    /// Creating the release kept colliding with other writers.
    #[error("release {timestamp} not resolved after {attempts} attempts")]
    ReleaseContention {
        /// Release timestamp.
        timestamp: String,
        /// Attempts made.
        attempts: u32,
    },
}

/// Outcome of [`register_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The (file, run) pair is now claimed by the caller: it was unseen, or its last run
    /// failed.
    New,
    /// Another invocation holds the claim or already completed it.
    AlreadyHandled,
}

/// Lifecycle of a `processed_file` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// A run is working on the file.
    Claimed,
    /// A run finished the file.
    Completed,
    /// The last run gave up; the file may be claimed again.
    Failed,
}

impl FileStatus {
    /// Value stored in `processed_file.status`.
    pub const fn as_str(self) -> &'static str {
        match self {
            FileStatus::Claimed => "claimed",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claimed" => Ok(FileStatus::Claimed),
            "completed" => Ok(FileStatus::Completed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(anyhow::anyhow!("unknown processed file status {other:?}")),
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical text form of a release timestamp: RFC3339 UTC with milliseconds.
pub fn release_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_contention(e: &DieselError) -> bool {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => true,
        DieselError::DatabaseError(_, info) => {
            let msg = info.message();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Look up the release for `ts`, creating it if absent.
///
/// Runs in an immediate transaction; lock or uniqueness collisions with concurrent writers
/// are retried with jittered backoff up to [`RELEASE_MAX_ATTEMPTS`] times.
pub fn get_or_create_release(conn: &mut SqliteConnection, ts: DateTime<Utc>) -> anyhow::Result<i32> {
    let stamp = release_timestamp(ts);

    for attempt in 1..=RELEASE_MAX_ATTEMPTS {
        let res = conn.immediate_transaction::<_, DieselError, _>(|conn| {
            let existing: Option<i32> = rr::table
                .filter(rr::timestamp.eq(&stamp))
                .select(rr::id)
                .first(conn)
                .optional()?;
            if let Some(id) = existing {
                return Ok(id);
            }
            insert_into(rr::table)
                .values(rr::timestamp.eq(&stamp))
                .returning(rr::id)
                .get_result(conn)
        });

        match res {
            Ok(id) => return Ok(id),
            Err(e) if is_contention(&e) && attempt < RELEASE_MAX_ATTEMPTS => {
                let jitter = rand::rng().random_range(0..50);
                let delay = RELEASE_BASE_DELAY * attempt + Duration::from_millis(jitter);
                tracing::warn!(attempt, ?delay, error = %e, "release registration contended; retrying");
                std::thread::sleep(delay);
            }
            Err(e) if is_contention(&e) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Err(RegistryError::ReleaseContention {
        timestamp: stamp,
        attempts: RELEASE_MAX_ATTEMPTS,
    }
    .into())
}

/// Fetch a release by id.
pub fn get_release(conn: &mut SqliteConnection, release_id: i32) -> anyhow::Result<Release> {
    Ok(rr::table
        .find(release_id)
        .select(Release::as_select())
        .first(conn)?)
}

/// Flag a release as published.
pub fn mark_released(conn: &mut SqliteConnection, release_id: i32) -> anyhow::Result<()> {
    let n = diesel::update(rr::table.find(release_id))
        .set(rr::released.eq(true))
        .execute(conn)?;
    if n == 0 {
        anyhow::bail!("release {release_id} does not exist");
    }
    Ok(())
}

/// Look up an area, registering it if unknown. Returns `(id, created)`.
///
/// Trust rows named after a nation are filed under `nation`; see
/// [`resolve_area_type`]. A name is stored only when the area is first registered.
pub fn confirm_or_create_area(
    conn: &mut SqliteConnection,
    area_type: AreaType,
    area_code: &str,
    area_name: Option<&str>,
) -> anyhow::Result<(i32, bool)> {
    let resolved = area_name.map_or(area_type, |n| resolve_area_type(area_type, n));
    let unique_ref = format!("{resolved}|{area_code}");

    let created = insert_into(ar::table)
        .values(NewArea {
            area_type: resolved.as_str(),
            area_code,
            area_name,
            unique_ref: &unique_ref,
        })
        .on_conflict(ar::unique_ref)
        .do_nothing()
        .execute(conn)?
        == 1;

    let area: Area = ar::table
        .filter(ar::unique_ref.eq(&unique_ref))
        .select(Area::as_select())
        .first(conn)?;
    if created {
        tracing::debug!(area_id = area.id, %unique_ref, "area registered");
    }
    Ok((area.id, created))
}

/// Look up a metric id, registering the metric if unknown. Returns `(id, created)`.
pub fn get_or_create_metric(conn: &mut SqliteConnection, metric: &str) -> anyhow::Result<(i32, bool)> {
    let created = insert_into(mr::table)
        .values(mr::metric.eq(metric))
        .on_conflict(mr::metric)
        .do_nothing()
        .execute(conn)?
        == 1;
    let id = mr::table
        .filter(mr::metric.eq(metric))
        .select(mr::id)
        .first(conn)?;
    Ok((id, created))
}

/// All known metric ids by name.
pub fn load_metric_ids(conn: &mut SqliteConnection) -> anyhow::Result<HashMap<String, i32>> {
    let rows: Vec<(String, i32)> = mr::table.select((mr::metric, mr::id)).load(conn)?;
    Ok(rows.into_iter().collect())
}

/// Create the partition if it does not exist yet. Returns whether it was created.
///
/// A concurrent create of the same partition is a no-op, not an error.
pub fn ensure_partition(conn: &mut SqliteConnection, partition: &PartitionRef) -> anyhow::Result<bool> {
    let release_date = format_date(partition.release_date);
    let n = insert_into(tsp::table)
        .values(NewPartition {
            partition_id: &partition.partition_id,
            physical_name: &partition.physical_name,
            release_date: &release_date,
            area_bucket: partition.bucket,
        })
        .on_conflict_do_nothing()
        .execute(conn)?;
    if n == 1 {
        tracing::info!(partition = %partition.physical_name, "partition created");
    }
    Ok(n == 1)
}

/// Claim `(file_path, run_id)` for processing.
///
/// Returns [`Registration::AlreadyHandled`] while another run holds the claim and once a
/// run has completed it. A claim left [`FileStatus::Failed`] is taken over. The lookup and
/// the write share one immediate transaction, so two callers never both get
/// [`Registration::New`].
pub fn register_file(
    conn: &mut SqliteConnection,
    file_path: &str,
    run_id: &str,
) -> anyhow::Result<Registration> {
    conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
        let current = file_status(conn, file_path, run_id)?;
        match current {
            None => {
                insert_into(pf::table)
                    .values((
                        pf::file_path.eq(file_path),
                        pf::run_id.eq(run_id),
                        pf::status.eq(FileStatus::Claimed.as_str()),
                    ))
                    .execute(conn)?;
                Ok(Registration::New)
            }
            Some(FileStatus::Failed) => {
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                diesel::update(
                    pf::table
                        .filter(pf::file_path.eq(file_path))
                        .filter(pf::run_id.eq(run_id)),
                )
                .set((
                    pf::status.eq(FileStatus::Claimed.as_str()),
                    pf::registered_at.eq(now),
                ))
                .execute(conn)?;
                tracing::info!(file_path, run_id, "reclaiming input of a failed run");
                Ok(Registration::New)
            }
            Some(FileStatus::Claimed | FileStatus::Completed) => Ok(Registration::AlreadyHandled),
        }
    })
}

/// Record how the run holding the `(file_path, run_id)` claim ended.
pub fn settle_file(
    conn: &mut SqliteConnection,
    file_path: &str,
    run_id: &str,
    status: FileStatus,
) -> anyhow::Result<()> {
    let n = diesel::update(
        pf::table
            .filter(pf::file_path.eq(file_path))
            .filter(pf::run_id.eq(run_id)),
    )
    .set(pf::status.eq(status.as_str()))
    .execute(conn)?;
    if n == 0 {
        anyhow::bail!("{file_path} was never claimed for run {run_id}");
    }
    Ok(())
}

/// Status of the `(file_path, run_id)` claim, if there is one.
pub fn file_status(
    conn: &mut SqliteConnection,
    file_path: &str,
    run_id: &str,
) -> anyhow::Result<Option<FileStatus>> {
    let status: Option<String> = pf::table
        .filter(pf::file_path.eq(file_path))
        .filter(pf::run_id.eq(run_id))
        .select(pf::status)
        .first(conn)
        .optional()?;
    status.map(|s| s.parse()).transpose()
}
