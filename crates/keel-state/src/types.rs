//! Persisted records for the keel state store.
//!
//! These are the queryable histories of the three control loops: pipeline
//! runs, reconcile passes and scaling decisions, plus the versioned
//! manifest wrapper used by the manifest repository.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_core::{Artifact, Finding, ManifestDocument, ResourceFailure, ResourceKey, Revision};

/// Identifier of a pipeline run (allocated from the `runs` sequence).
pub type RunId = u64;

// ── Pipeline runs ─────────────────────────────────────────────────

/// Status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Whether a stage failure aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagePolicy {
    #[default]
    Required,
    BestEffort,
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Why a stage (and possibly its run) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient errors persisted past the retry budget.
    RetriesExhausted,
    /// Scanner or quality gate rejected the revision.
    PolicyViolation,
    /// Manifest compare-and-swap kept losing races.
    Conflict,
    /// The stage itself reported failure (build broke, tests failed).
    StageFailed,
    /// Operator cancel or supersession.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Originating stage, if the failure is attributable to one.
    pub stage: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// Per-stage record. Once terminal it is never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub ordinal: u32,
    pub policy: StagePolicy,
    pub status: StageStatus,
    pub attempts: u32,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub failure: Option<FailureReason>,
}

impl StageRecord {
    pub fn pending(name: &str, ordinal: u32, policy: StagePolicy) -> Self {
        Self {
            name: name.to_string(),
            ordinal,
            policy,
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            failure: None,
        }
    }
}

/// Scanner output captured by a stage, kept for the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFindings {
    pub stage: String,
    pub passed: bool,
    pub findings: Vec<Finding>,
}

/// One execution of the stage graph for a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub revision: Revision,
    pub status: RunStatus,
    pub stages: Vec<StageRecord>,
    pub failure: Option<FailureReason>,
    /// Artifact produced by the push stage.
    pub artifact: Option<Artifact>,
    /// Manifest version committed by this run.
    pub manifest_version: Option<u64>,
    pub findings: Vec<StageFindings>,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

impl PipelineRun {
    pub fn new(id: RunId, revision: Revision, stages: Vec<StageRecord>, now: u64) -> Self {
        Self {
            id,
            revision,
            status: RunStatus::Pending,
            stages,
            failure: None,
            artifact: None,
            manifest_version: None,
            findings: Vec::new(),
            created_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Move a stage to `status`. Returns `false` (and changes nothing) if
    /// the stage is unknown or already terminal.
    pub fn transition(
        &mut self,
        name: &str,
        status: StageStatus,
        failure: Option<FailureReason>,
        now: u64,
    ) -> bool {
        let Some(stage) = self.stages.iter_mut().find(|s| s.name == name) else {
            return false;
        };
        if stage.status.is_terminal() {
            return false;
        }
        match status {
            StageStatus::Running => {
                stage.started_at.get_or_insert(now);
                stage.attempts += 1;
            }
            s if s.is_terminal() => {
                stage.finished_at = Some(now);
                stage.failure = failure;
            }
            _ => {}
        }
        stage.status = status;
        true
    }

    /// Mark every non-terminal stage as skipped.
    pub fn skip_remaining(&mut self, now: u64) -> Vec<String> {
        let mut skipped = Vec::new();
        for stage in self.stages.iter_mut().filter(|s| !s.status.is_terminal()) {
            stage.status = StageStatus::Skipped;
            stage.finished_at = Some(now);
            skipped.push(stage.name.clone());
        }
        skipped
    }

    /// Set the terminal outcome. A run that is already terminal is left as is.
    pub fn finish(&mut self, status: RunStatus, failure: Option<FailureReason>, now: u64) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.failure = failure;
        self.finished_at = Some(now);
        true
    }
}

// ── Manifests ─────────────────────────────────────────────────────

/// A manifest document as committed to the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedManifest {
    pub document: ManifestDocument,
    /// Starts at 1 for the first commit; 0 means "no document yet".
    pub version: u64,
    /// Who committed it: `run/<id>` or an operator name.
    pub author: String,
    pub committed_at: u64,
}

// ── Reconcile ─────────────────────────────────────────────────────

/// Sync state of a reconcile set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InSync,
    OutOfSync,
    Progressing,
    Degraded,
    Unknown,
}

/// Field-level drift of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDrift {
    pub key: ResourceKey,
    /// JSON pointers of the differing fields.
    pub paths: Vec<String>,
}

/// Summary of a desired/observed diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Declared but absent on the platform.
    pub missing: Vec<ResourceKey>,
    /// Present on both sides but different.
    pub drifted: Vec<FieldDrift>,
    /// Present on the platform but not declared.
    pub extra: Vec<ResourceKey>,
}

impl DiffSummary {
    /// True when desired state is fully realised (extras do not count).
    pub fn is_converged(&self) -> bool {
        self.missing.is_empty() && self.drifted.is_empty()
    }
}

/// Why an apply happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCause {
    /// Desired state changed (new manifest version) and auto-sync is on.
    ManifestChange,
    /// Live state drifted without a manifest change and self-heal is on.
    SelfHeal,
    /// Operator requested a sync.
    Manual,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSyncRecord {
    pub seq: u64,
    pub set: String,
    pub timestamp: u64,
    pub status: SyncStatus,
    /// Manifest versions the pass worked from.
    pub manifest_versions: BTreeMap<String, u64>,
    pub diff: DiffSummary,
    pub cause: Option<SyncCause>,
    pub applied: Vec<ResourceKey>,
    pub pruned: Vec<ResourceKey>,
    /// Extra resources left untouched.
    pub unmanaged: Vec<ResourceKey>,
    pub failures: Vec<ResourceFailure>,
    pub waves_completed: u32,
    pub message: Option<String>,
}

// ── Autoscaling ───────────────────────────────────────────────────

/// Why a computed change was not applied this tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum HoldReason {
    /// Scale-down blocked by the post-scale-up cooldown.
    Cooldown { remaining_secs: u64 },
    /// Change has not persisted for enough consecutive ticks.
    Stabilizing { streak: u32, required: u32 },
}

/// What the autoscaler did on a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScalingAction {
    NoChange,
    Hold(HoldReason),
    Scaled { from: u32, to: u32 },
    Failed { error: String },
}

/// One autoscaler evaluation. Never modified after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub seq: u64,
    pub workload: String,
    pub timestamp: u64,
    pub observed_metric: f64,
    pub target_metric: f64,
    pub current_replicas: u32,
    /// Proportional result, clamped to the policy bounds.
    pub computed_replicas: u32,
    /// Replica count in effect after this tick.
    pub chosen_replicas: u32,
    pub action: ScalingAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> PipelineRun {
        PipelineRun::new(
            1,
            Revision::new("api", "abc1234", 1),
            vec![
                StageRecord::pending("compile", 0, StagePolicy::Required),
                StageRecord::pending("test", 1, StagePolicy::Required),
            ],
            100,
        )
    }

    #[test]
    fn terminal_stage_is_not_overwritten() {
        let mut run = run();
        assert!(run.transition("compile", StageStatus::Running, None, 101));
        assert!(run.transition("compile", StageStatus::Succeeded, None, 102));
        assert!(!run.transition("compile", StageStatus::Failed, None, 103));

        let stage = run.stage("compile").unwrap();
        assert_eq!(stage.status, StageStatus::Succeeded);
        assert_eq!(stage.finished_at, Some(102));
        assert_eq!(stage.attempts, 1);
    }

    #[test]
    fn skip_remaining_leaves_terminal_stages() {
        let mut run = run();
        run.transition("compile", StageStatus::Running, None, 101);
        run.transition("compile", StageStatus::Failed, None, 102);
        let skipped = run.skip_remaining(103);
        assert_eq!(skipped, vec!["test".to_string()]);
        assert_eq!(run.stage("compile").unwrap().status, StageStatus::Failed);
        assert_eq!(run.stage("test").unwrap().status, StageStatus::Skipped);
    }

    #[test]
    fn finish_is_one_shot() {
        let mut run = run();
        assert!(run.finish(RunStatus::Succeeded, None, 200));
        assert!(!run.finish(RunStatus::Failed, None, 201));
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.finished_at, Some(200));
    }

    #[test]
    fn scaling_action_serializes_tagged() {
        let action = ScalingAction::Hold(HoldReason::Stabilizing {
            streak: 1,
            required: 2,
        });
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "hold");
        assert_eq!(json["reason"], "stabilizing");
    }
}
