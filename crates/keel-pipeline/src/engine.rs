//! Pipeline engine — executes a stage graph for one revision.
//!
//! A run goes through the graph level by level. Within a level all stages
//! start together; the level ends when every stage is terminal, when a
//! required stage fails (in-flight siblings are dropped and skipped), or
//! when the run's cancel signal fires. Every transition is written to the
//! run table before the engine moves on, so the stored record is always
//! the current truth.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{FuturesUnordered, StreamExt};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keel_core::config::{PipelineConfig, WorkloadConfig};
use keel_core::{Artifact, Finding, KeelResult, Revision, ScanReport, ScanTarget, artifact_tag};
use keel_gateway::{
    ArtifactStore, GatewayError, ManifestRepository, PushOutcome, ScannerGateway, ToolTask,
    Toolchain,
};
use keel_state::{
    FailureKind, FailureReason, PipelineRun, RunStatus, StageFindings, StagePolicy, StageStatus,
    StateError, StateStore,
};

use crate::gate::QualityGate;
use crate::retry::RetryPolicy;
use crate::stage::{StageGraph, StageKind, StageSpec};

/// Cancel signal for one run. `Some(reason)` cancels it.
pub type CancelSignal = watch::Receiver<Option<String>>;

/// The external systems a run talks to.
#[derive(Clone)]
pub struct Gateways {
    pub toolchain: Arc<dyn Toolchain>,
    pub scanner: Arc<dyn ScannerGateway>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub manifests: Arc<dyn ManifestRepository>,
}

#[derive(Debug, Error)]
enum StageError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Policy(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Failed(String),
}

impl StageError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn into_reason(self, stage: &str, attempts: u32) -> FailureReason {
        let (kind, message) = match self {
            Self::Transient(m) => (
                FailureKind::RetriesExhausted,
                format!("gave up after {attempts} attempt(s): {m}"),
            ),
            Self::Policy(m) => (FailureKind::PolicyViolation, m),
            Self::Conflict(m) => (FailureKind::Conflict, m),
            Self::Failed(m) => (FailureKind::StageFailed, m),
        };
        FailureReason {
            stage: Some(stage.to_string()),
            kind,
            message,
        }
    }
}

impl From<GatewayError> for StageError {
    fn from(err: GatewayError) -> Self {
        match err {
            e if e.is_transient() => Self::Transient(e.to_string()),
            e @ GatewayError::Conflict { .. } => Self::Conflict(e.to_string()),
            e => Self::Failed(e.to_string()),
        }
    }
}

impl From<StateError> for StageError {
    fn from(err: StateError) -> Self {
        GatewayError::from(err).into()
    }
}

enum StageOutcome {
    Succeeded,
    Failed(FailureReason),
}

enum LevelEnd {
    Completed,
    Aborted(FailureReason),
    Cancelled(String),
}

struct BuiltImage {
    artifact: Artifact,
    blob: Vec<u8>,
}

/// Mutable state shared by the stages of one run.
struct RunContext {
    run: Mutex<PipelineRun>,
    image: Mutex<Option<BuiltImage>>,
}

pub struct PipelineEngine {
    graph: StageGraph,
    gateways: Gateways,
    store: StateStore,
    gate: QualityGate,
    retry: RetryPolicy,
    stage_timeout: Duration,
    conflict_retries: u32,
    best_effort_continue: bool,
    artifact_names: HashMap<String, String>,
    default_artifact: String,
}

impl PipelineEngine {
    pub fn new(
        graph: StageGraph,
        gateways: Gateways,
        store: StateStore,
        config: &PipelineConfig,
    ) -> KeelResult<Self> {
        Ok(Self {
            graph,
            gateways,
            store,
            gate: QualityGate::new(config.severity_threshold),
            retry: RetryPolicy::from_config(&config.retry)?,
            stage_timeout: config.stage_timeout()?,
            conflict_retries: config.manifest_conflict_retries.max(1),
            best_effort_continue: config.best_effort_continue,
            artifact_names: HashMap::new(),
            default_artifact: config.artifact_name.clone(),
        })
    }

    /// Use the configured artifact name for each workload instead of the
    /// workload name.
    pub fn with_workloads(mut self, workloads: &[WorkloadConfig]) -> Self {
        self.artifact_names = workloads
            .iter()
            .filter(|w| !w.artifact.is_empty())
            .map(|w| (w.name.clone(), w.artifact.clone()))
            .collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The workload's own artifact name, then `pipeline.artifact_name`,
    /// then the workload name.
    fn artifact_name(&self, workload: &str) -> String {
        if let Some(name) = self.artifact_names.get(workload) {
            return name.clone();
        }
        if self.default_artifact.is_empty() {
            workload.to_string()
        } else {
            self.default_artifact.clone()
        }
    }

    /// Allocate a run id and store the run as pending.
    pub fn create_run(&self, revision: Revision) -> KeelResult<PipelineRun> {
        let id = self.store.next_sequence("runs")?;
        let run = PipelineRun::new(id, revision, self.graph.records(), epoch_secs());
        self.store.put_run(&run)?;
        debug!(run_id = id, revision = %run.revision, "run created");
        Ok(run)
    }

    /// Create and execute a run to completion.
    pub async fn submit(&self, revision: Revision) -> KeelResult<PipelineRun> {
        let run = self.create_run(revision)?;
        let (_cancel, signal) = watch::channel(None);
        Ok(self.execute(run, signal).await)
    }

    /// Finish a run that never started.
    pub fn cancel_queued(&self, mut run: PipelineRun, reason: &str) -> PipelineRun {
        let now = epoch_secs();
        run.skip_remaining(now);
        run.finish(
            RunStatus::Failed,
            Some(FailureReason {
                stage: None,
                kind: FailureKind::Cancelled,
                message: reason.to_string(),
            }),
            now,
        );
        if let Err(e) = self.store.put_run(&run) {
            error!(run_id = run.id, error = %e, "failed to persist run");
        }
        info!(run_id = run.id, revision = %run.revision, %reason, "queued run cancelled");
        run
    }

    /// Execute a created run. Always returns the terminal record.
    pub async fn execute(&self, run: PipelineRun, cancel: CancelSignal) -> PipelineRun {
        let early = (*cancel.borrow()).clone();
        if let Some(reason) = early {
            return self.cancel_queued(run, &reason);
        }

        let run_id = run.id;
        let revision = run.revision.clone();
        let ctx = RunContext {
            run: Mutex::new(run),
            image: Mutex::new(None),
        };
        let ctx = &ctx;
        self.update(ctx, |run| {
            run.status = RunStatus::Running;
            run.started_at = Some(epoch_secs());
        });
        info!(run_id, %revision, stages = self.graph.len(), "pipeline run started");

        let cancelled = wait_cancelled(cancel);
        tokio::pin!(cancelled);

        for level in self.graph.levels() {
            let mut in_flight: BTreeMap<&str, &StageSpec> =
                level.iter().map(|s| (s.name.as_str(), *s)).collect();
            let mut pending: FuturesUnordered<_> = level
                .iter()
                .map(|&spec| async move { (spec, self.run_stage(ctx, spec).await) })
                .collect();

            let end = loop {
                tokio::select! {
                    next = pending.next() => {
                        let Some((spec, outcome)) = next else {
                            break LevelEnd::Completed;
                        };
                        in_flight.remove(spec.name.as_str());
                        if let StageOutcome::Failed(reason) = outcome {
                            if spec.policy == StagePolicy::BestEffort && self.best_effort_continue {
                                warn!(
                                    run_id,
                                    stage = %spec.name,
                                    reason = %reason.message,
                                    "best-effort stage failed, continuing"
                                );
                            } else {
                                break LevelEnd::Aborted(reason);
                            }
                        }
                    }
                    reason = &mut cancelled => break LevelEnd::Cancelled(reason),
                }
            };
            drop(pending);

            match end {
                LevelEnd::Completed => {}
                LevelEnd::Aborted(reason) => {
                    self.release(ctx, &in_flight).await;
                    return self.fail(ctx, reason);
                }
                LevelEnd::Cancelled(reason) => {
                    self.release(ctx, &in_flight).await;
                    return self.cancel_in_flight(ctx, &in_flight, reason);
                }
            }
        }

        let run = self.update(ctx, |run| {
            run.finish(RunStatus::Succeeded, None, epoch_secs());
            run.clone()
        });
        info!(
            run_id,
            %revision,
            artifact = ?run.artifact.as_ref().map(|a| a.reference().to_string()),
            manifest_version = ?run.manifest_version,
            "pipeline run succeeded"
        );
        run
    }

    fn fail(&self, ctx: &RunContext, reason: FailureReason) -> PipelineRun {
        let now = epoch_secs();
        let (run, skipped) = self.update(ctx, |run| {
            let skipped = run.skip_remaining(now);
            run.finish(RunStatus::Failed, Some(reason.clone()), now);
            (run.clone(), skipped)
        });
        error!(
            run_id = run.id,
            stage = ?reason.stage,
            kind = ?reason.kind,
            skipped = skipped.len(),
            "pipeline run failed: {}",
            reason.message
        );
        run
    }

    fn cancel_in_flight(
        &self,
        ctx: &RunContext,
        in_flight: &BTreeMap<&str, &StageSpec>,
        reason: String,
    ) -> PipelineRun {
        let now = epoch_secs();
        let failure = FailureReason {
            stage: in_flight.keys().next().map(|s| s.to_string()),
            kind: FailureKind::Cancelled,
            message: reason,
        };
        let run = self.update(ctx, |run| {
            for name in in_flight.keys() {
                run.transition(name, StageStatus::Failed, Some(failure.clone()), now);
            }
            run.skip_remaining(now);
            run.finish(RunStatus::Failed, Some(failure.clone()), now);
            run.clone()
        });
        info!(run_id = run.id, stage = ?failure.stage, reason = %failure.message, "pipeline run cancelled");
        run
    }

    /// Release external resources held by stages that were interrupted.
    async fn release(&self, ctx: &RunContext, in_flight: &BTreeMap<&str, &StageSpec>) {
        if in_flight.values().any(|s| s.kind == StageKind::Push) {
            self.abort_push(ctx).await;
        }
    }

    async fn abort_push(&self, ctx: &RunContext) {
        let target = lock(&ctx.image).as_ref().map(|b| b.artifact.reference());
        let Some(target) = target else { return };
        match self
            .gateways
            .artifacts
            .abort_push(&target.name, &target.tag)
            .await
        {
            Ok(()) => info!(artifact = %target, "aborted in-progress push"),
            Err(e) => warn!(artifact = %target, error = %e, "abort_push failed"),
        }
    }

    /// Run one stage with retries; the stage record ends terminal.
    async fn run_stage(&self, ctx: &RunContext, spec: &StageSpec) -> StageOutcome {
        let (run_id, revision) = {
            let run = lock(&ctx.run);
            (run.id, run.revision.clone())
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.update(ctx, |run| {
                run.transition(&spec.name, StageStatus::Running, None, epoch_secs())
            });
            debug!(run_id, stage = %spec.name, attempt, "stage started");

            let result = match tokio::time::timeout(
                self.stage_timeout,
                self.execute_stage(ctx, spec, &revision),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => {
                    if spec.kind == StageKind::Push {
                        self.abort_push(ctx).await;
                    }
                    Err(StageError::Transient(format!(
                        "timed out after {}ms",
                        self.stage_timeout.as_millis()
                    )))
                }
            };

            match result {
                Ok(()) => {
                    self.update(ctx, |run| {
                        run.transition(&spec.name, StageStatus::Succeeded, None, epoch_secs())
                    });
                    info!(run_id, stage = %spec.name, attempt, "stage succeeded");
                    return StageOutcome::Succeeded;
                }
                Err(e) if e.is_retryable() && self.retry.allows_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        run_id,
                        stage = %spec.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let reason = e.into_reason(&spec.name, attempt);
                    self.update(ctx, |run| {
                        run.transition(
                            &spec.name,
                            StageStatus::Failed,
                            Some(reason.clone()),
                            epoch_secs(),
                        )
                    });
                    warn!(
                        run_id,
                        stage = %spec.name,
                        attempt,
                        kind = ?reason.kind,
                        "stage failed: {}",
                        reason.message
                    );
                    return StageOutcome::Failed(reason);
                }
            }
        }
    }

    async fn execute_stage(
        &self,
        ctx: &RunContext,
        spec: &StageSpec,
        revision: &Revision,
    ) -> Result<(), StageError> {
        match spec.kind {
            StageKind::Checkout => self.tool(ToolTask::Checkout, revision).await,
            StageKind::Compile => self.tool(ToolTask::Compile, revision).await,
            StageKind::Test => self.tool(ToolTask::Test, revision).await,
            StageKind::Package => self.tool(ToolTask::Package, revision).await,
            StageKind::ImageBuild => self.build_image(ctx, revision).await,
            StageKind::DependencyScan => {
                let target = ScanTarget::Dependencies {
                    revision: revision.clone(),
                };
                let report = self.gateways.scanner.scan(&target).await?;
                self.record_findings(ctx, spec, &report);
                Ok(())
            }
            StageKind::QualityGate => {
                let target = ScanTarget::Source {
                    revision: revision.clone(),
                };
                let report = self.gateways.scanner.scan(&target).await?;
                let findings = self.record_findings(ctx, spec, &report);
                self.enforce_gate(&findings)
            }
            StageKind::ImageScan => {
                let artifact = built_artifact(ctx)?;
                let target = ScanTarget::Image {
                    artifact: artifact.reference(),
                    digest: artifact.digest.clone(),
                };
                let report = self.gateways.scanner.scan(&target).await?;
                self.record_findings(ctx, spec, &report);
                self.enforce_gate(&report.findings)
            }
            StageKind::Push => self.push(ctx).await,
            StageKind::ManifestUpdate => self.update_manifest(ctx, revision).await,
            StageKind::Commit => self.confirm_commit(ctx, revision).await,
        }
    }

    async fn tool(&self, task: ToolTask, revision: &Revision) -> Result<(), StageError> {
        let output = self.gateways.toolchain.run(task, revision).await?;
        if !output.log.is_empty() {
            debug!(task = task.name(), log = %output.log.trim_end(), "tool output");
        }
        Ok(())
    }

    /// Store the stage's findings on the run; returns every finding
    /// recorded so far.
    fn record_findings(&self, ctx: &RunContext, spec: &StageSpec, report: &ScanReport) -> Vec<Finding> {
        debug!(
            stage = %spec.name,
            findings = report.findings.len(),
            max_severity = ?report.max_severity(),
            "scan completed"
        );
        self.update(ctx, |run| {
            run.findings.retain(|f| f.stage != spec.name);
            run.findings.push(StageFindings {
                stage: spec.name.clone(),
                passed: report.passed,
                findings: report.findings.clone(),
            });
            run.findings
                .iter()
                .flat_map(|f| f.findings.iter().cloned())
                .collect()
        })
    }

    fn enforce_gate(&self, findings: &[Finding]) -> Result<(), StageError> {
        let verdict = self.gate.evaluate(findings);
        if verdict.passed {
            debug!(threshold = %self.gate.threshold, "{}", verdict.message);
            Ok(())
        } else {
            Err(StageError::Policy(verdict.message))
        }
    }

    async fn build_image(&self, ctx: &RunContext, revision: &Revision) -> Result<(), StageError> {
        let output = self
            .gateways
            .toolchain
            .run(ToolTask::ImageBuild, revision)
            .await?;
        let name = self.artifact_name(&revision.workload);
        let sequence = self.store.next_sequence(&format!("artifact:{name}"))?;
        let tag = artifact_tag(sequence, revision);
        let artifact = Artifact::from_blob(&name, &tag, &output.stdout);
        info!(
            artifact = %artifact.reference(),
            digest = %artifact.digest,
            size_bytes = artifact.size_bytes,
            "image built"
        );
        *lock(&ctx.image) = Some(BuiltImage {
            artifact,
            blob: output.stdout,
        });
        Ok(())
    }

    async fn push(&self, ctx: &RunContext) -> Result<(), StageError> {
        let (artifact, blob) = {
            let image = lock(&ctx.image);
            let built = image
                .as_ref()
                .ok_or_else(|| StageError::Failed("no image has been built".to_string()))?;
            (built.artifact.clone(), built.blob.clone())
        };

        match self.gateways.artifacts.push(&artifact, &blob).await? {
            PushOutcome::Pushed => info!(artifact = %artifact.reference(), "artifact pushed"),
            PushOutcome::AlreadyExists => {
                info!(artifact = %artifact.reference(), "artifact already present")
            }
        }
        self.update(ctx, |run| run.artifact = Some(artifact));
        Ok(())
    }

    /// Point the workload's manifest at the pushed artifact with a
    /// compare-and-swap write, re-reading on conflict.
    async fn update_manifest(&self, ctx: &RunContext, revision: &Revision) -> Result<(), StageError> {
        let (run_id, artifact) = {
            let run = lock(&ctx.run);
            (run.id, run.artifact.clone())
        };
        let artifact =
            artifact.ok_or_else(|| StageError::Failed("no artifact has been pushed".to_string()))?;
        let target = artifact.reference();

        if !self
            .gateways
            .artifacts
            .exists(&artifact.name, &artifact.tag)
            .await?
        {
            return Err(StageError::Failed(format!(
                "artifact {target} is not in the artifact store"
            )));
        }

        let workload = revision.workload.as_str();
        let author = format!("pipeline/run-{run_id}");
        for attempt in 1..=self.conflict_retries {
            let (document, version) = self.gateways.manifests.read(workload).await?;
            if document.artifact == target {
                debug!(run_id, %workload, version, "manifest already references artifact");
                self.update(ctx, |run| run.manifest_version = Some(version));
                return Ok(());
            }

            let updated = document.with_artifact(target.clone());
            match self.gateways.manifests.write(&updated, version, &author).await {
                Ok(new_version) => {
                    info!(
                        run_id,
                        %workload,
                        version = new_version,
                        artifact = %target,
                        "manifest updated"
                    );
                    self.update(ctx, |run| run.manifest_version = Some(new_version));
                    return Ok(());
                }
                Err(GatewayError::Conflict { expected, actual }) => {
                    warn!(
                        run_id,
                        %workload,
                        attempt,
                        expected,
                        actual,
                        "manifest write conflict, re-reading"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StageError::Conflict(format!(
            "manifest for {workload} still contended after {} attempt(s)",
            self.conflict_retries
        )))
    }

    /// Confirm the committed manifest version is visible in the repository.
    async fn confirm_commit(&self, ctx: &RunContext, revision: &Revision) -> Result<(), StageError> {
        let (run_id, committed, artifact) = {
            let run = lock(&ctx.run);
            (run.id, run.manifest_version, run.artifact.clone())
        };
        let (Some(committed), Some(artifact)) = (committed, artifact) else {
            return Err(StageError::Failed(
                "no manifest version to commit".to_string(),
            ));
        };

        let (document, current) = self.gateways.manifests.read(&revision.workload).await?;
        if current < committed || (current == committed && document.artifact != artifact.reference())
        {
            return Err(StageError::Failed(format!(
                "manifest version {committed} not visible (repository at {current})"
            )));
        }

        info!(
            run_id,
            workload = %revision.workload,
            version = committed,
            superseded = current > committed,
            "revision promoted"
        );
        Ok(())
    }

    /// Apply `f` to the run under its lock and persist the result.
    fn update<R>(&self, ctx: &RunContext, f: impl FnOnce(&mut PipelineRun) -> R) -> R {
        let mut run = lock(&ctx.run);
        let out = f(&mut run);
        if let Err(e) = self.store.put_run(&run) {
            error!(run_id = run.id, error = %e, "failed to persist run");
        }
        out
    }
}

fn built_artifact(ctx: &RunContext) -> Result<Artifact, StageError> {
    lock(&ctx.image)
        .as_ref()
        .map(|b| b.artifact.clone())
        .ok_or_else(|| StageError::Failed("no image has been built".to_string()))
}

/// Resolves with the cancel reason; never resolves if the sender is gone.
async fn wait_cancelled(mut signal: CancelSignal) -> String {
    let reason = match signal.wait_for(Option::is_some).await {
        Ok(reason) => (*reason).clone(),
        Err(_) => None,
    };
    match reason {
        Some(reason) => reason,
        None => std::future::pending().await,
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
