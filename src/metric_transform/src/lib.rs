//! Write-path transformation stages for daily epidemiological metric snapshots.
//!
//! Raw observations flow through the stages in this order:
//!
//! 1. [`homogenize::homogenize_dates`] expands every series onto a contiguous daily calendar.
//! 2. [`normalize::RecordNormalizer`] fills gaps inside each series' observed span.
//! 3. [`rates::RateEngine`] derives rolling sums, rolling rates and incidence rates.
//! 4. [`change::ChangeEngine`] derives week-over-week change, direction and percentage.
//! 5. [`hashing`] provides row identity and partition keys for deployment.
//!
//! [`pipeline::ChunkPipeline`] chains stages 1-4 for one area chunk. Everything here is
//! synchronous and free of I/O except the [`io`] module, which defines the blob-store
//! interface and the chunk artifact codec.

#![warn(missing_docs)]

pub mod change;
pub mod config;
pub mod errors;
pub mod hashing;
pub mod homogenize;
pub mod io;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod population;
pub mod rates;

/// Round half-to-even to one decimal place, the precision every derived rate is published at.
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round_ties_even() / 10.0
}
