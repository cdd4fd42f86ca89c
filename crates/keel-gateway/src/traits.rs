//! Capability traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use keel_core::{
    Artifact, ManifestDocument, ResourceHealth, ResourceKey, ResourceSelector, ResourceTree,
    Revision, ScanReport, ScanTarget,
};

use crate::error::GatewayResult;

// ── Artifact store ────────────────────────────────────────────────

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushOutcome {
    Pushed,
    /// The tag was already present; nothing was written.
    AlreadyExists,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Push a blob under `(artifact.name, artifact.tag)`. Pushing a tag that
    /// already exists is a no-op returning `AlreadyExists`.
    async fn push(&self, artifact: &Artifact, blob: &[u8]) -> GatewayResult<PushOutcome>;

    async fn exists(&self, name: &str, tag: &str) -> GatewayResult<bool>;

    /// Release anything an interrupted push left behind.
    async fn abort_push(&self, _name: &str, _tag: &str) -> GatewayResult<()> {
        Ok(())
    }
}

// ── Scanners ──────────────────────────────────────────────────────

#[async_trait]
pub trait ScannerGateway: Send + Sync {
    async fn scan(&self, target: &ScanTarget) -> GatewayResult<ScanReport>;
}

// ── Manifest repository ───────────────────────────────────────────

#[async_trait]
pub trait ManifestRepository: Send + Sync {
    /// Current document and its version. `NotFound` if never committed.
    async fn read(&self, workload: &str) -> GatewayResult<(ManifestDocument, u64)>;

    /// Commit `document` if the current version equals `expected_version`.
    /// Returns the new version, or `Conflict` if someone else won.
    async fn write(
        &self,
        document: &ManifestDocument,
        expected_version: u64,
        author: &str,
    ) -> GatewayResult<u64>;
}

// ── Platform ──────────────────────────────────────────────────────

/// Load observed for a workload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkloadLoad {
    pub replicas: u32,
    /// Utilization percentage averaged across replicas.
    pub utilization: f64,
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_observed(&self, selector: &ResourceSelector) -> GatewayResult<ResourceTree>;

    /// Create or update every resource in `tree`. Rejected resources are
    /// reported through `GatewayError::PartialFailure`.
    async fn apply(&self, tree: &ResourceTree) -> GatewayResult<()>;

    async fn delete(&self, keys: &[ResourceKey]) -> GatewayResult<()>;

    async fn health(
        &self,
        keys: &[ResourceKey],
    ) -> GatewayResult<BTreeMap<ResourceKey, ResourceHealth>>;

    async fn set_replicas(&self, workload: &str, count: u32) -> GatewayResult<()>;

    async fn load(&self, workload: &str) -> GatewayResult<WorkloadLoad>;
}

// ── Toolchain ─────────────────────────────────────────────────────

/// Build steps delegated to the external toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTask {
    Checkout,
    Compile,
    Test,
    Package,
    ImageBuild,
}

impl ToolTask {
    pub fn name(self) -> &'static str {
        match self {
            Self::Checkout => "checkout",
            Self::Compile => "compile",
            Self::Test => "test",
            Self::Package => "package",
            Self::ImageBuild => "image_build",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Raw stdout; for `ImageBuild` this is the image blob.
    pub stdout: Vec<u8>,
    pub log: String,
}

#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn run(&self, task: ToolTask, revision: &Revision) -> GatewayResult<ToolOutput>;
}
