use thiserror::Error;

/// Data-shape errors raised by the transformation stages.
///
/// These are never retried: the workflow treats them as "nothing to process" for the chunk
/// that produced them.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The stage received no observations at all.
    #[error("no observations to process")]
    EmptyInput,

    /// An area carries more than one distinct non-null name.
    #[error("area {area_type}/{area_code} has inconsistent names: {names:?}")]
    InconsistentAreaName {
        /// Area type of the offending area.
        area_type: String,
        /// Area code of the offending area.
        area_code: String,
        /// All distinct names seen.
        names: Vec<String>,
    },

    /// A date range too large to expand (corrupt input dates).
    #[error("calendar from {start} to {end} is not a valid range")]
    InvalidCalendar {
        /// First date.
        start: chrono::NaiveDate,
        /// Last date.
        end: chrono::NaiveDate,
    },
}
