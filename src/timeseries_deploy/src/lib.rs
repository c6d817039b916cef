//! Storage and orchestration for the metric time-series write path.
//!
//! - [`db`], [`schema`], [`models`]: SQLite store, embedded migrations and Diesel mappings.
//! - [`registry`]: insert-if-absent registration of releases, areas, metrics, partitions
//!   and processed files.
//! - [`deploy`]: hashing, deduplication and chunked upsert of transformed rows.
//! - [`run`]: the run entry payload and chunk handler dispatch.
//! - [`workflow`]: the state machine driving one run, with retrying activities.

#![warn(missing_docs)]

pub mod db;
pub mod deploy;
pub mod models;
pub mod registry;
pub mod run;
pub mod schema;
pub mod telemetry;
pub mod workflow;
