//! Diesel models mapping to the database schema.
//!
//! These types mirror the tables defined in the embedded migrations and in
//! [`crate::schema`]:
//! - [`crate::schema::release_reference`]: one row per deployment run, keyed by timestamp
//! - [`crate::schema::area_reference`]: areas keyed by `"{area_type}|{area_code}"`
//! - [`crate::schema::metric_reference`]: known metric names
//! - [`crate::schema::time_series_partition`]: partitions created so far
//! - [`crate::schema::time_series`]: one row per (hash, partition)
//! - [`crate::schema::processed_file`]: input files already taken by a run

use diesel::prelude::*;

use crate::schema::*;

/// A row in [`crate::schema::release_reference`].
#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = release_reference, check_for_backend(diesel::sqlite::Sqlite))]
pub struct Release {
    /// Database primary key.
    pub id: i32,
    /// Release timestamp in RFC3339 UTC with milliseconds.
    pub timestamp: String,
    /// Set once the release has been archived.
    pub released: bool,
}

/// A row in [`crate::schema::area_reference`].
#[derive(Debug, Clone, Queryable, Identifiable, Selectable)]
#[diesel(table_name = area_reference, check_for_backend(diesel::sqlite::Sqlite))]
pub struct Area {
    /// Database primary key.
    pub id: i32,
    /// Area type after nation aliasing (e.g., "utla").
    pub area_type: String,
    /// Area code (e.g., "E06000001").
    pub area_code: String,
    /// Optional human-readable name.
    pub area_name: Option<String>,
    /// `"{area_type}|{area_code}"`.
    pub unique_ref: String,
}

/// Insertable form of [`Area`].
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = area_reference)]
pub struct NewArea<'a> {
    /// Area type after nation aliasing.
    pub area_type: &'a str,
    /// Area code.
    pub area_code: &'a str,
    /// Optional human-readable name.
    pub area_name: Option<&'a str>,
    /// `"{area_type}|{area_code}"`.
    pub unique_ref: &'a str,
}

/// Insertable form of a [`crate::schema::time_series_partition`] row.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = time_series_partition)]
pub struct NewPartition<'a> {
    /// `YYYY_MM_DD|bucket`.
    pub partition_id: &'a str,
    /// `YYYY_MM_DD_bucket`.
    pub physical_name: &'a str,
    /// `YYYY-MM-DD`.
    pub release_date: &'a str,
    /// Area type bucket.
    pub area_bucket: &'a str,
}

/// A row in [`crate::schema::time_series`].
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = time_series, check_for_backend(diesel::sqlite::Sqlite))]
pub struct TimeSeriesRow {
    /// Row identity digest (hex).
    pub hash: String,
    /// FK to [`Release::id`].
    pub release_id: i32,
    /// FK to [`Area::id`].
    pub area_id: i32,
    /// FK to `metric_reference.id`.
    pub metric_id: i32,
    /// FK to `time_series_partition.partition_id`.
    pub partition_id: String,
    /// `YYYY-MM-DD`.
    pub date: String,
    /// JSON payload.
    pub payload: String,
}

/// Insertable form of [`TimeSeriesRow`].
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = time_series)]
pub struct NewTimeSeriesRow<'a> {
    /// Row identity digest (hex).
    pub hash: &'a str,
    /// FK to [`Release::id`].
    pub release_id: i32,
    /// FK to [`Area::id`].
    pub area_id: i32,
    /// FK to `metric_reference.id`.
    pub metric_id: i32,
    /// FK to `time_series_partition.partition_id`.
    pub partition_id: &'a str,
    /// `YYYY-MM-DD`.
    pub date: &'a str,
    /// JSON payload.
    pub payload: &'a str,
}
