//! Row identity hashing and partition keys.
//!
//! A row's hash is the keyed digest of `date ‖ areaType ‖ areaCode ‖ metricId ‖ releaseId`,
//! so the same logical row within the same release always hashes identically no matter how
//! the input batch was ordered. The key is a deployment secret and never has a default.

use chrono::NaiveDate;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use shared_utils::env::{MissingEnvVarError, get_env_var};
use thiserror::Error;

use crate::models::format_date;

type HmacSha256 = Hmac<Sha256>;

/// Environment variable holding the row hash key.
pub const HASH_KEY_VAR: &str = "METRIC_HASH_KEY";

/// Errors constructing a [`RowHasher`].
#[derive(Debug, Error)]
pub enum HashError {
    /// The key variable is not set.
    #[error("row hash key unavailable")]
    MissingKey(#[from] MissingEnvVarError),

    /// The key is set but empty after trimming.
    #[error("row hash key is empty")]
    EmptyKey,

    /// The key could not initialise the MAC.
    #[error("row hash key rejected: {0}")]
    InvalidKey(String),
}

/// Digest length in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DigestSize {
    /// 12 bytes (24 hex characters).
    #[default]
    Short,
    /// 32 bytes, the full SHA-256 output.
    Long,
}

impl DigestSize {
    /// Number of digest bytes kept.
    pub const fn bytes(self) -> usize {
        match self {
            DigestSize::Short => 12,
            DigestSize::Long => 32,
        }
    }
}

impl TryFrom<u8> for DigestSize {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        match n {
            12 => Ok(DigestSize::Short),
            32 => Ok(DigestSize::Long),
            other => Err(format!("digest_size must be 12 or 32, got {other}")),
        }
    }
}

impl From<DigestSize> for u8 {
    fn from(d: DigestSize) -> Self {
        d.bytes() as u8
    }
}

/// Keyed hasher producing row identities.
#[derive(Clone)]
pub struct RowHasher {
    mac: HmacSha256,
    size: DigestSize,
}

impl std::fmt::Debug for RowHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowHasher")
            .field("key", &"<redacted>")
            .field("size", &self.size)
            .finish()
    }
}

impl RowHasher {
    /// Hasher keyed with `key`.
    pub fn new(key: &SecretString, size: DigestSize) -> Result<Self, HashError> {
        let raw = key.expose_secret().trim();
        if raw.is_empty() {
            return Err(HashError::EmptyKey);
        }
        let mac = HmacSha256::new_from_slice(raw.as_bytes())
            .map_err(|e| HashError::InvalidKey(e.to_string()))?;
        Ok(Self { mac, size })
    }

    /// Hasher keyed from the process environment variable `var`.
    pub fn from_env(var: &str, size: DigestSize) -> Result<Self, HashError> {
        let key = SecretString::new(get_env_var(var)?.into());
        Self::new(&key, size)
    }

    /// Configured digest size.
    pub fn digest_size(&self) -> DigestSize {
        self.size
    }

    /// Lowercase hex digest identifying one logical row.
    pub fn row_hash(
        &self,
        date: NaiveDate,
        area_type: &str,
        area_code: &str,
        metric_id: i32,
        release_id: i32,
    ) -> String {
        let mut mac = self.mac.clone();
        mac.update(format_date(date).as_bytes());
        mac.update(area_type.as_bytes());
        mac.update(area_code.as_bytes());
        mac.update(metric_id.to_string().as_bytes());
        mac.update(release_id.to_string().as_bytes());
        let digest = mac.finalize().into_bytes();
        hex::encode(&digest[..self.size.bytes()])
    }
}

/// Partition bucket for an area type: fine-grained types get their own bucket, everything
/// else shares `other`.
pub fn partition_bucket(area_type: &str) -> &'static str {
    match area_type.to_ascii_lowercase().as_str() {
        "nhstrust" => "nhstrust",
        "utla" => "utla",
        "ltla" => "ltla",
        "msoa" => "msoa",
        _ => "other",
    }
}

/// Logical and physical identity of one time-series partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionRef {
    /// `YYYY_MM_DD|bucket`, stored on every row.
    pub partition_id: String,
    /// `YYYY_MM_DD_bucket`, the name of the physical partition.
    pub physical_name: String,
    /// Release date.
    pub release_date: NaiveDate,
    /// Area type bucket.
    pub bucket: &'static str,
}

/// Partition receiving rows of `area_type` for the release dated `release_date`.
pub fn partition_for(release_date: NaiveDate, area_type: &str) -> PartitionRef {
    let date = release_date.format("%Y_%m_%d").to_string();
    let bucket = partition_bucket(area_type);
    PartitionRef {
        partition_id: format!("{date}|{bucket}"),
        physical_name: format!("{date}_{bucket}"),
        release_date,
        bucket,
    }
}
