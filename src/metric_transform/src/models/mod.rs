//! Typed records flowing between the pipeline stages.

pub mod area;
pub mod observation;
pub mod payload;
pub mod series;

/// Canonical date rendering used in hashes, payload rows and artifact paths.
pub fn format_date(date: chrono::NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
