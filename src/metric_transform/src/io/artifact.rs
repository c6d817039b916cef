//! Compact binary artifacts holding one transformed chunk.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{area::AreaType, payload::TransformedRow};

/// Container holding chunk artifacts.
pub const PROCESSED_CONTAINER: &str = "processed";

/// Content type of an encoded artifact.
pub const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";

/// Errors encoding or decoding an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Serialization failed.
    #[error("encode chunk artifact")]
    Encode(#[from] bincode::error::EncodeError),

    /// The bytes are not a valid artifact.
    #[error("decode chunk artifact")]
    Decode(#[from] bincode::error::DecodeError),

    /// Bytes were left over after decoding.
    #[error("chunk artifact has {0} trailing bytes")]
    TrailingBytes(usize),
}

/// The transformed rows of one (area type, area code) chunk of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkArtifact {
    /// Run the chunk belongs to.
    pub run_id: String,
    /// Area type of the chunk.
    pub area_type: AreaType,
    /// Area code of the chunk.
    pub area_code: String,
    /// Transformed rows.
    pub rows: Vec<TransformedRow>,
}

impl ChunkArtifact {
    /// Blob path inside [`PROCESSED_CONTAINER`]: `<run>/<areaType>/<areaCode>.bin`.
    pub fn blob_path(&self) -> String {
        artifact_path(&self.run_id, self.area_type, &self.area_code)
    }

    /// Encode with bincode's standard configuration.
    pub fn encode(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    /// Decode bytes produced by [`ChunkArtifact::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, ArtifactError> {
        let (artifact, read): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        if read != bytes.len() {
            return Err(ArtifactError::TrailingBytes(bytes.len() - read));
        }
        Ok(artifact)
    }
}

/// Blob path of the artifact for one chunk of a run.
pub fn artifact_path(run_id: &str, area_type: AreaType, area_code: &str) -> String {
    format!("{run_id}/{area_type}/{area_code}.bin")
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::models::payload::{BandPayload, Derived, Direction, Payload, RowPayload};

    fn artifact() -> ChunkArtifact {
        let date = NaiveDate::from_ymd_opt(2021, 4, 1).unwrap();
        ChunkArtifact {
            run_id: "run-7".into(),
            area_type: AreaType::NhsTrust,
            area_code: "RX1".into(),
            rows: vec![
                TransformedRow {
                    area_type: AreaType::NhsTrust,
                    area_code: "RX1".into(),
                    area_name: Some("Nottingham University Hospitals".into()),
                    metric: "hospitalCases".into(),
                    date,
                    payload: RowPayload::Single(Payload {
                        value: Some(12.0),
                        derived: Derived {
                            change: Some(-3.0),
                            direction: Some(Direction::Down),
                            ..Default::default()
                        },
                    }),
                },
                TransformedRow {
                    area_type: AreaType::NhsTrust,
                    area_code: "RX1".into(),
                    area_name: None,
                    metric: "admissionsByAge".into(),
                    date,
                    payload: RowPayload::Banded(vec![BandPayload {
                        band: "65_84".into(),
                        payload: Payload::default(),
                    }]),
                },
            ],
        }
    }

    #[test]
    fn encoded_artifact_decodes_to_the_same_chunk() {
        let a = artifact();
        let bytes = a.encode().unwrap();
        assert_eq!(ChunkArtifact::decode(&bytes).unwrap(), a);
        assert_eq!(a.blob_path(), "run-7/nhsTrust/RX1.bin");
    }

    #[test]
    fn truncated_bytes_fail_to_decode() {
        let bytes = artifact().encode().unwrap();
        assert!(ChunkArtifact::decode(&bytes[..bytes.len() / 2]).is_err());
    }
}
