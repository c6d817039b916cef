//! Population reference loaded from JSON.

use std::{collections::HashMap, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::rates::PopulationLookup;

/// Errors loading a population reference.
#[derive(Debug, Error)]
pub enum PopulationError {
    /// The reference file could not be read.
    #[error("read population reference {path}")]
    Read {
        /// File path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The reference is not a JSON array of population entries.
    #[error("parse population reference")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PopulationEntry {
    area_code: String,
    #[serde(default)]
    band: Option<String>,
    population: u64,
}

/// In-memory population lookup keyed by (area code, band).
#[derive(Debug, Default, Clone)]
pub struct PopulationTable {
    entries: HashMap<(String, Option<String>), u64>,
}

impl PopulationTable {
    /// Parse `[{"areaCode": .., "band": .., "population": ..}]`. Later duplicates win.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, PopulationError> {
        let rows: Vec<PopulationEntry> = serde_json::from_slice(bytes)?;
        let mut table = Self::default();
        for e in rows {
            table.insert(e.area_code, e.band.as_deref(), e.population);
        }
        Ok(table)
    }

    /// Read and parse a reference file.
    pub fn load_path(path: impl AsRef<Path>) -> Result<Self, PopulationError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| PopulationError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let table = Self::from_json_slice(&bytes)?;
        tracing::info!(entries = table.len(), path = %path.display(), "population reference loaded");
        Ok(table)
    }

    /// Add or replace one entry.
    pub fn insert(&mut self, area_code: impl Into<String>, band: Option<&str>, population: u64) {
        self.entries
            .insert((area_code.into(), band.map(str::to_string)), population);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PopulationLookup for PopulationTable {
    fn population(&self, area_code: &str, band: Option<&str>) -> Option<u64> {
        self.entries
            .get(&(area_code.to_string(), band.map(str::to_string)))
            .copied()
    }
}
