//! Domain types shared across keel crates.
//!
//! These types cross crate boundaries and are persisted by `keel-state`,
//! so all of them are serde-serializable.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::KeelError;
use crate::resource::{Resource, ResourceTree};

/// Name of a deployable workload (e.g. `api`).
pub type WorkloadId = String;

/// Resource kinds that carry the workload's container image.
pub const WORKLOAD_KINDS: &[&str] = &["Deployment", "StatefulSet"];

// ── Revision ──────────────────────────────────────────────────────

/// Immutable trigger unit: a source commit plus a build number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Revision {
    pub workload: WorkloadId,
    pub commit: String,
    /// Monotonically increasing per workload.
    pub build_number: u64,
}

impl Revision {
    pub fn new(workload: &str, commit: &str, build_number: u64) -> Self {
        Self {
            workload: workload.to_string(),
            commit: commit.to_string(),
            build_number,
        }
    }

    /// First seven characters of the commit (or the whole commit if shorter).
    pub fn short_commit(&self) -> &str {
        self.commit.get(..7).unwrap_or(&self.commit)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.workload, self.short_commit(), self.build_number)
    }
}

// ── Artifact ──────────────────────────────────────────────────────

/// Reference to an artifact by `(name, tag)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub tag: String,
}

impl ArtifactRef {
    pub fn new(name: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

/// An immutable, content-addressed build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub tag: String,
    /// `sha256:<hex>` digest of the blob.
    pub digest: String,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn from_blob(name: &str, tag: &str, blob: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            digest: content_digest(blob),
            size_bytes: blob.len() as u64,
        }
    }

    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef::new(&self.name, &self.tag)
    }
}

/// Tag for the `sequence`-th artifact of a revision. The sequence is
/// allocated from the store and never reused.
pub fn artifact_tag(sequence: u64, revision: &Revision) -> String {
    format!("v{sequence}-{}", revision.short_commit())
}

/// Compute the `sha256:<hex>` digest of a blob.
pub fn content_digest(blob: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(blob)))
}

// ── Scanning ──────────────────────────────────────────────────────

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for Severity {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(KeelError::Config(format!("unknown severity: {other}"))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A single scanner finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub id: String,
}

impl Finding {
    pub fn new(severity: Severity, id: &str) -> Self {
        Self {
            severity,
            id: id.to_string(),
        }
    }
}

/// What a scanner is asked to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanTarget {
    Source { revision: Revision },
    Dependencies { revision: Revision },
    Image { artifact: ArtifactRef, digest: String },
}

/// Typed scanner result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub findings: Vec<Finding>,
    pub passed: bool,
}

impl ScanReport {
    pub fn clean() -> Self {
        Self {
            findings: Vec::new(),
            passed: true,
        }
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

// ── Manifests ─────────────────────────────────────────────────────

/// Autoscaling bounds and target for a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Target utilization percentage (e.g. CPU averaged across replicas).
    pub target_utilization: f64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            min_replicas: 1,
            max_replicas: 10,
            target_utilization: 70.0,
        }
    }
}

/// Desired-state declaration for one workload.
///
/// The pipeline may only change `artifact`; everything else is owned by
/// whoever edits the manifest repository directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub workload: WorkloadId,
    pub artifact: ArtifactRef,
    #[serde(default)]
    pub scaling: Option<ScalingPolicy>,
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl ManifestDocument {
    /// Copy of this document pointing at a different artifact.
    pub fn with_artifact(&self, artifact: ArtifactRef) -> Self {
        Self {
            artifact,
            ..self.clone()
        }
    }

    /// Render the desired resource tree: the declared resources with the
    /// artifact reference injected into the workload's own resource.
    pub fn render(&self) -> ResourceTree {
        let image = self.artifact.to_string();
        self.resources
            .iter()
            .cloned()
            .map(|mut r| {
                if r.key.name == self.workload && WORKLOAD_KINDS.contains(&r.key.kind.as_str()) {
                    if !r.spec.is_object() {
                        r.spec = serde_json::Value::Object(Default::default());
                    }
                    r.spec["image"] = serde_json::Value::String(image.clone());
                }
                r
            })
            .collect()
    }
}
