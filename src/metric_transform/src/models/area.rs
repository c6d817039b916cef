//! Area types and the partition buckets they collapse into.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Geographic level of an area (serde camelCase, matching the raw snapshots).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AreaType {
    /// United Kingdom as a whole.
    Overview,
    /// England, Wales, Scotland, Northern Ireland.
    Nation,
    /// English regions.
    Region,
    /// NHS regions.
    NhsRegion,
    /// NHS trusts.
    NhsTrust,
    /// Upper-tier local authorities.
    Utla,
    /// Lower-tier local authorities.
    Ltla,
    /// Middle-layer super output areas.
    Msoa,
}

impl AreaType {
    /// The wire spelling used in snapshots and row hashes.
    pub const fn as_str(self) -> &'static str {
        match self {
            AreaType::Overview => "overview",
            AreaType::Nation => "nation",
            AreaType::Region => "region",
            AreaType::NhsRegion => "nhsRegion",
            AreaType::NhsTrust => "nhsTrust",
            AreaType::Utla => "utla",
            AreaType::Ltla => "ltla",
            AreaType::Msoa => "msoa",
        }
    }
}

impl fmt::Display for AreaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an area type string is not recognised.
#[derive(Debug, thiserror::Error)]
#[error("unknown area type {0:?}")]
pub struct UnknownAreaType(pub String);

impl FromStr for AreaType {
    type Err = UnknownAreaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = match s.trim() {
            "overview" => AreaType::Overview,
            "nation" => AreaType::Nation,
            "region" => AreaType::Region,
            "nhsRegion" => AreaType::NhsRegion,
            "nhsTrust" => AreaType::NhsTrust,
            "utla" => AreaType::Utla,
            "ltla" => AreaType::Ltla,
            "msoa" => AreaType::Msoa,
            other => return Err(UnknownAreaType(other.to_string())),
        };
        Ok(t)
    }
}

/// Nation names that turn a mislabelled trust row into a nation row.
pub const NATION_NAMES: [&str; 4] = ["England", "Northern Ireland", "Scotland", "Wales"];

/// Area type to register for an area, applying the nation aliasing rule.
///
/// Trust-level snapshots carry nation totals under the trust area type; those rows are
/// filed under `nation` when their name is a known country.
pub fn resolve_area_type(area_type: AreaType, area_name: &str) -> AreaType {
    if area_type == AreaType::NhsTrust && NATION_NAMES.contains(&area_name.trim()) {
        AreaType::Nation
    } else {
        area_type
    }
}
