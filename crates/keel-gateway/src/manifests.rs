//! Manifest repository backed by the keel state store.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use keel_core::ManifestDocument;
use keel_state::StateStore;

use crate::error::{GatewayError, GatewayResult};
use crate::traits::ManifestRepository;

/// `ManifestRepository` over the redb manifest tables.
#[derive(Clone)]
pub struct StoreManifests {
    store: StateStore,
}

impl StoreManifests {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ManifestRepository for StoreManifests {
    async fn read(&self, workload: &str) -> GatewayResult<(ManifestDocument, u64)> {
        match self.store.read_manifest(workload)? {
            Some(m) => Ok((m.document, m.version)),
            None => Err(GatewayError::NotFound(format!("manifest for {workload}"))),
        }
    }

    async fn write(
        &self,
        document: &ManifestDocument,
        expected_version: u64,
        author: &str,
    ) -> GatewayResult<u64> {
        let version =
            self.store
                .compare_and_swap_manifest(document, expected_version, author, epoch_secs())?;
        Ok(version)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ArtifactRef;

    fn doc(tag: &str) -> ManifestDocument {
        ManifestDocument {
            workload: "api".to_string(),
            artifact: ArtifactRef::new("app", tag),
            scaling: None,
            resources: Vec::new(),
        }
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let repo = StoreManifests::new(StateStore::open_in_memory().unwrap());
        let err = repo.read("api").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn write_maps_conflict() {
        let repo = StoreManifests::new(StateStore::open_in_memory().unwrap());
        assert_eq!(repo.write(&doc("v1"), 0, "ops").await.unwrap(), 1);
        let err = repo.write(&doc("v2"), 0, "ops").await.unwrap_err();
        assert_eq!(err, GatewayError::Conflict { expected: 0, actual: 1 });

        let (current, version) = repo.read("api").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(current.artifact.tag, "v1");
    }
}
