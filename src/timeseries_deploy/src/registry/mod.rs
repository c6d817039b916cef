//! Reference registries backing the write path.
//!
//! - [`repo`] holds the insert-if-absent statements for releases, areas, metrics,
//!   partitions and processed files.
//! - [`cache`] keeps a lock-free snapshot of metric ids so concurrent deploys skip lookups
//!   for metrics they already know.

pub mod cache;
pub mod repo;

pub use cache::MetricIdCache;
pub use repo::{FileStatus, Registration};
