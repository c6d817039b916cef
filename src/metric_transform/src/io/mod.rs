//! Storage-facing pieces: the blob-store interface and the chunk artifact codec.

pub mod artifact;
pub mod blob;

pub use artifact::{ArtifactError, ChunkArtifact};
pub use blob::{BlobError, BlobStore, LocalBlobStore, StorageTier};
