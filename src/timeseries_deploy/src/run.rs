//! Run entry payload and chunk handler dispatch.
//!
//! Triggers hand the workflow a [`RunRequest`] (`{dataPath, timestamp, areaType?, category?,
//! subcategory?}`). Category and subcategory are closed enums, so an unknown string fails
//! while the payload is parsed, and [`resolve_handler`] covers every combination with an
//! exhaustive `match` instead of a lookup that can silently miss.

use chrono::{DateTime, Days, NaiveDate, Utc};
use clap::ValueEnum;
use metric_transform::models::area::AreaType;
use serde::{Deserialize, Serialize};

/// Dataset family a run processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    /// Plain per-area metrics.
    #[default]
    Main,
    /// Metrics nested by a demographic band.
    Demographics,
}

/// Topic within a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum Subcategory {
    /// Case counts.
    Cases,
    /// Death counts.
    Deaths,
    /// Hospital activity.
    Healthcare,
    /// Testing volumes.
    Testing,
    /// Vaccinations.
    Vaccinations,
}

/// How a chunk is transformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHandler {
    /// Standard per-area pipeline; specimen-date cutoffs come from each metric.
    Standard,
    /// Banded pipeline; every observation needs a band and rolling statistics stop at
    /// a cutoff derived from the release date.
    Banded,
}

/// Error returned for a combination no handler exists for.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("no chunk handler for category {category:?}, area type {area_type}, subcategory {subcategory:?}")]
pub struct UnsupportedChunk {
    /// Requested category.
    pub category: Category,
    /// Chunk area type.
    pub area_type: AreaType,
    /// Requested subcategory.
    pub subcategory: Option<Subcategory>,
}

/// Handler for a (category, area type, subcategory) triple.
pub fn resolve_handler(
    category: Category,
    area_type: AreaType,
    subcategory: Option<Subcategory>,
) -> Result<ChunkHandler, UnsupportedChunk> {
    use AreaType::*;
    use Subcategory::*;

    let unsupported = || UnsupportedChunk {
        category,
        area_type,
        subcategory,
    };
    match (category, area_type, subcategory) {
        (Category::Main, _, _) => Ok(ChunkHandler::Standard),
        // hospital admissions by age are only published for nations and NHS regions
        (Category::Demographics, Overview | Nation | NhsRegion, Some(Healthcare)) => {
            Ok(ChunkHandler::Banded)
        }
        (Category::Demographics, Region | Utla | Ltla | NhsTrust | Msoa, Some(Healthcare)) => {
            Err(unsupported())
        }
        (
            Category::Demographics,
            Overview | Nation | Region | Utla | Ltla,
            None | Some(Cases | Deaths | Testing | Vaccinations),
        ) => Ok(ChunkHandler::Banded),
        (
            Category::Demographics,
            NhsRegion | NhsTrust | Msoa,
            None | Some(Cases | Deaths | Testing | Vaccinations),
        ) => Err(unsupported()),
    }
}

/// Entry payload of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// `<container>/<path>` of the raw snapshot.
    pub data_path: String,
    /// Release timestamp.
    pub timestamp: DateTime<Utc>,
    /// Only process this area type.
    #[serde(default)]
    pub area_type: Option<AreaType>,
    /// Dataset family; `main` when absent.
    #[serde(default)]
    pub category: Option<Category>,
    /// Topic within the category.
    #[serde(default)]
    pub subcategory: Option<Subcategory>,
}

impl RunRequest {
    /// Category, defaulting to [`Category::Main`].
    pub fn category(&self) -> Category {
        self.category.unwrap_or_default()
    }

    /// Release date (UTC calendar day of the timestamp).
    pub fn release_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Identifier shared by every artifact and registration of this run.
    pub fn run_id(&self) -> String {
        self.timestamp.format("%Y%m%dT%H%M%S%3fZ").to_string()
    }

    /// Handler for chunks of `area_type`.
    pub fn handler(&self, area_type: AreaType) -> Result<ChunkHandler, UnsupportedChunk> {
        resolve_handler(self.category(), area_type, self.subcategory)
    }

    /// Last date banded rolling statistics are published for.
    pub fn banded_cutoff(&self, provisional_days: u32) -> NaiveDate {
        self.release_date() - Days::new(u64::from(provisional_days))
    }

    /// Split `data_path` into (container, path).
    pub fn blob_location(&self) -> Option<(&str, &str)> {
        self.data_path
            .split_once('/')
            .filter(|(c, p)| !c.is_empty() && !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_entry_payload() {
        let req: RunRequest = serde_json::from_str(
            r#"{
                "dataPath": "raw/2021-06-01/demographics.json",
                "timestamp": "2021-06-01T15:30:00.123Z",
                "areaType": "utla",
                "category": "demographics",
                "subcategory": "cases"
            }"#,
        )
        .unwrap();
        assert_eq!(req.category(), Category::Demographics);
        assert_eq!(req.area_type, Some(AreaType::Utla));
        assert_eq!(req.run_id(), "20210601T153000123Z");
        assert_eq!(req.blob_location(), Some(("raw", "2021-06-01/demographics.json")));
        assert_eq!(
            req.banded_cutoff(5),
            NaiveDate::from_ymd_opt(2021, 5, 27).unwrap()
        );
        assert_eq!(req.handler(AreaType::Utla), Ok(ChunkHandler::Banded));
    }

    #[test]
    fn unknown_category_is_rejected_at_parse_time() {
        let err = serde_json::from_str::<RunRequest>(
            r#"{"dataPath": "raw/x.json", "timestamp": "2021-06-01T00:00:00Z", "category": "nope"}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn handler_table() {
        assert_eq!(
            resolve_handler(Category::Main, AreaType::Msoa, None),
            Ok(ChunkHandler::Standard)
        );
        assert_eq!(
            resolve_handler(Category::Demographics, AreaType::NhsRegion, Some(Subcategory::Healthcare)),
            Ok(ChunkHandler::Banded)
        );
        assert!(resolve_handler(Category::Demographics, AreaType::Msoa, None).is_err());
        assert!(
            resolve_handler(Category::Demographics, AreaType::Ltla, Some(Subcategory::Healthcare))
                .is_err()
        );
    }
}
