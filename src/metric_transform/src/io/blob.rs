//! Object storage interface and a filesystem-backed implementation.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use snafu::{Backtrace, ResultExt, Snafu};
use uuid::Uuid;

const STAGING_SUFFIX: &str = ".partial";

/// `<name>.<uuid>.partial`: the sibling a blob is written to before being renamed in place.
fn staging_name(file_name: &str) -> String {
    format!("{file_name}.{}{STAGING_SUFFIX}", Uuid::new_v4())
}

fn is_staging_name(name: &str) -> bool {
    name.strip_suffix(STAGING_SUFFIX)
        .and_then(|rest| rest.rsplit_once('.'))
        .is_some_and(|(_, id)| Uuid::try_parse(id).is_ok())
}

/// Access tier requested when writing a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageTier {
    /// Frequently read data (raw snapshots, chunk artifacts).
    #[default]
    Hot,
    /// Rarely read data (archives).
    Cool,
}

impl StorageTier {
    /// Tier name as stored in blob metadata.
    pub const fn as_str(self) -> &'static str {
        match self {
            StorageTier::Hot => "hot",
            StorageTier::Cool => "cool",
        }
    }
}

/// Errors raised by a [`BlobStore`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BlobError {
    /// The requested blob does not exist.
    #[snafu(display("Blob not found: {container}/{path}"))]
    NotFound {
        container: String,
        path: String,
        backtrace: Backtrace,
    },

    /// The path would escape its container.
    #[snafu(display("Invalid blob path: {path}"))]
    InvalidPath { path: String, backtrace: Backtrace },

    /// Reading or writing the underlying storage failed.
    #[snafu(display("Blob I/O error on {container}/{path}: {source}"))]
    Io {
        container: String,
        path: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
}

impl BlobError {
    /// True for failures worth retrying (I/O), false for missing blobs or bad paths.
    pub fn is_transient(&self) -> bool {
        matches!(self, BlobError::Io { .. })
    }
}

/// Containers and paths of raw snapshots, chunk artifacts and archives.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a whole blob.
    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, BlobError>;

    /// Create or replace a blob.
    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        tier: StorageTier,
    ) -> Result<(), BlobError>;

    /// Whether a blob exists.
    async fn exists(&self, container: &str, path: &str) -> Result<bool, BlobError>;

    /// Paths under `prefix`, sorted.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, BlobError>;
}

/// [`BlobStore`] over a local directory; each container is a sub-directory of the root.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Store rooted at `root`. The directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, container: &str, path: &str) -> Result<PathBuf, BlobError> {
        let rel = Path::new(path);
        let safe = !path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            && Path::new(container)
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return InvalidPathSnafu {
                path: format!("{container}/{path}"),
            }
            .fail();
        }
        Ok(self.root.join(container).join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, BlobError> {
        let full = self.resolve(container, path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                NotFoundSnafu { container, path }.fail()
            }
            Err(e) => Err(e).context(IoSnafu { container, path }),
        }
    }

    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        tier: StorageTier,
    ) -> Result<(), BlobError> {
        let full = self.resolve(container, path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(IoSnafu { container, path })?;
        }
        // Write to a sibling then rename so readers never see a partial blob.
        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = full.with_file_name(staging_name(&file_name));
        let staged = match tokio::fs::write(&tmp, bytes).await {
            Ok(()) => tokio::fs::rename(&tmp, &full).await,
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).context(IoSnafu { container, path });
        }
        tracing::debug!(
            container,
            path,
            bytes = bytes.len(),
            content_type,
            tier = tier.as_str(),
            "blob written"
        );
        Ok(())
    }

    async fn exists(&self, container: &str, path: &str) -> Result<bool, BlobError> {
        let full = self.resolve(container, path)?;
        tokio::fs::try_exists(&full)
            .await
            .context(IoSnafu { container, path })
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, BlobError> {
        let base = self.root.join(container);
        let mut out = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(IoSnafu { container, path: prefix }),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .context(IoSnafu { container, path: prefix })?
            {
                let p = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .context(IoSnafu { container, path: prefix })?;
                if file_type.is_dir() {
                    pending.push(p);
                    continue;
                }
                let Ok(rel) = p.strip_prefix(&base) else {
                    continue;
                };
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let staging = p
                    .file_name()
                    .is_some_and(|n| is_staging_name(&n.to_string_lossy()));
                if rel.starts_with(prefix) && !staging {
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_list_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        store
            .put("processed", "run-1/utla/E06000001.bin", b"abc", "application/octet-stream", StorageTier::Hot)
            .await
            .unwrap();
        store
            .put("processed", "run-1/ltla/E07000001.bin", b"def", "application/octet-stream", StorageTier::Hot)
            .await
            .unwrap();
        store
            .put("processed", "run-2/utla/E06000002.bin", b"ghi", "application/octet-stream", StorageTier::Hot)
            .await
            .unwrap();

        assert_eq!(
            store.get("processed", "run-1/utla/E06000001.bin").await.unwrap(),
            b"abc"
        );
        assert!(store.exists("processed", "run-1/ltla/E07000001.bin").await.unwrap());
        assert!(!store.exists("processed", "run-1/ltla/nope.bin").await.unwrap());
        assert_eq!(
            store.list("processed", "run-1/").await.unwrap(),
            vec!["run-1/ltla/E07000001.bin", "run-1/utla/E06000001.bin"]
        );
        assert!(store.list("empty", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blobs_differing_only_in_extension_stay_apart() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());

        let (json, bin) = tokio::join!(
            store.put("archive", "2021-06-05/main.json", b"[]", "application/json", StorageTier::Cool),
            store.put("archive", "2021-06-05/main.bin", b"\x01", "application/octet-stream", StorageTier::Cool),
        );
        json.unwrap();
        bin.unwrap();
        store
            .put("archive", "2021-06-05/upload.partial", b"kept", "text/plain", StorageTier::Cool)
            .await
            .unwrap();

        assert_eq!(store.get("archive", "2021-06-05/main.json").await.unwrap(), b"[]");
        assert_eq!(store.get("archive", "2021-06-05/main.bin").await.unwrap(), b"\x01");
        assert_eq!(
            store.list("archive", "2021-06-05/").await.unwrap(),
            vec!["2021-06-05/main.bin", "2021-06-05/main.json", "2021-06-05/upload.partial"]
        );
    }

    #[test]
    fn staging_names_are_recognised() {
        let staged = staging_name("main.json");
        assert!(staged.starts_with("main.json."));
        assert!(is_staging_name(&staged));
        assert!(!is_staging_name("main.json"));
        assert!(!is_staging_name("upload.partial"));
        assert!(!is_staging_name("x.not-a-uuid.partial"));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        let err = store.get("raw", "missing.json").await.unwrap_err();
        assert!(matches!(err, BlobError::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn paths_cannot_escape_the_container() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path());
        for bad in ["../x", "/etc/passwd", ""] {
            assert!(matches!(
                store.put("raw", bad, b"", "text/plain", StorageTier::Hot).await,
                Err(BlobError::InvalidPath { .. })
            ));
        }
    }
}
