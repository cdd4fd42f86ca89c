//! Filesystem artifact store.
//!
//! Layout under the root directory:
//!
//! ```text
//! blobs/sha256-<hex>          content-addressed blobs
//! refs/<name>/<tag>.json      tag → Artifact record (immutable once written)
//! uploads/<name>@<tag>.part   in-progress pushes
//! ```
//!
//! Writes go to a temporary file and are renamed into place, so a reader
//! never sees a half-written blob or ref.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use keel_core::Artifact;

use crate::error::{GatewayError, GatewayResult};
use crate::traits::{ArtifactStore, PushOutcome};

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join("blobs").join(escape(digest))
    }

    fn ref_path(&self, name: &str, tag: &str) -> PathBuf {
        self.root
            .join("refs")
            .join(escape(name))
            .join(format!("{}.json", escape(tag)))
    }

    fn upload_path(&self, name: &str, tag: &str) -> PathBuf {
        self.root
            .join("uploads")
            .join(format!("{}@{}.part", escape(name), escape(tag)))
    }

    /// Read the recorded artifact for a tag.
    pub async fn get(&self, name: &str, tag: &str) -> GatewayResult<Option<Artifact>> {
        let path = self.ref_path(name, tag);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| GatewayError::Failed(format!("corrupt ref {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn push(&self, artifact: &Artifact, blob: &[u8]) -> GatewayResult<PushOutcome> {
        if let Some(existing) = self.get(&artifact.name, &artifact.tag).await? {
            if existing.digest != artifact.digest {
                warn!(
                    artifact = %artifact.reference(),
                    existing = %existing.digest,
                    pushed = %artifact.digest,
                    "tag already exists with different content; keeping existing"
                );
            }
            return Ok(PushOutcome::AlreadyExists);
        }

        let upload = self.upload_path(&artifact.name, &artifact.tag);
        write_atomic(&upload, &self.blob_path(&artifact.digest), blob).await?;

        let record = serde_json::to_vec_pretty(artifact)
            .map_err(|e| GatewayError::Failed(e.to_string()))?;
        let ref_path = self.ref_path(&artifact.name, &artifact.tag);
        let tmp = ref_path.with_extension("json.tmp");
        write_atomic(&tmp, &ref_path, &record).await?;

        debug!(artifact = %artifact.reference(), digest = %artifact.digest, "artifact pushed");
        Ok(PushOutcome::Pushed)
    }

    async fn exists(&self, name: &str, tag: &str) -> GatewayResult<bool> {
        let path = self.ref_path(name, tag);
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn abort_push(&self, name: &str, tag: &str) -> GatewayResult<()> {
        let upload = self.upload_path(name, tag);
        match tokio::fs::remove_file(&upload).await {
            Ok(()) => {
                debug!(%name, %tag, "removed partial upload");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&upload, e)),
        }
    }
}

/// Write `bytes` to `tmp`, then rename it to `dest`.
async fn write_atomic(tmp: &Path, dest: &Path, bytes: &[u8]) -> GatewayResult<()> {
    for dir in [tmp.parent(), dest.parent()].into_iter().flatten() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| io_err(dir, e))?;
    }
    tokio::fs::write(tmp, bytes)
        .await
        .map_err(|e| io_err(tmp, e))?;
    tokio::fs::rename(tmp, dest)
        .await
        .map_err(|e| io_err(dest, e))
}

/// Make a name safe to use as a single path component.
fn escape(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '/' | ':' | '\\' => '-',
            c => c,
        })
        .collect()
}

fn io_err(path: &Path, e: std::io::Error) -> GatewayError {
    GatewayError::Transient(format!("{}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let artifact = Artifact::from_blob("registry.local/api", "v1-abc", b"image");

        assert!(!store.exists(&artifact.name, &artifact.tag).await.unwrap());
        assert_eq!(store.push(&artifact, b"image").await.unwrap(), PushOutcome::Pushed);
        assert!(store.exists(&artifact.name, &artifact.tag).await.unwrap());

        let stored = store.get(&artifact.name, &artifact.tag).await.unwrap().unwrap();
        assert_eq!(stored, artifact);
        assert!(store.blob_path(&artifact.digest).exists());
    }

    #[tokio::test]
    async fn repeated_push_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let first = Artifact::from_blob("app", "v1", b"one");
        store.push(&first, b"one").await.unwrap();

        let second = Artifact::from_blob("app", "v1", b"two");
        assert_eq!(
            store.push(&second, b"two").await.unwrap(),
            PushOutcome::AlreadyExists
        );
        let stored = store.get("app", "v1").await.unwrap().unwrap();
        assert_eq!(stored.digest, first.digest);
        assert!(!store.blob_path(&second.digest).exists());
    }

    #[tokio::test]
    async fn abort_removes_partial_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let upload = store.upload_path("app", "v1");
        std::fs::create_dir_all(upload.parent().unwrap()).unwrap();
        std::fs::write(&upload, b"partial").unwrap();

        store.abort_push("app", "v1").await.unwrap();
        assert!(!upload.exists());
        // Idempotent.
        store.abort_push("app", "v1").await.unwrap();
    }
}
