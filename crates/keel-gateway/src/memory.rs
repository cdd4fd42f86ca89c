//! In-process capability implementations.
//!
//! Each type keeps its state behind a `Mutex` and exposes knobs to inject
//! faults (failed pushes, unreachable platform, rejected resources, slow
//! tools). Tests use them to drive the engine, reconciler and autoscaler
//! through failure paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use keel_core::{
    Artifact, Resource, ResourceFailure, ResourceHealth, ResourceKey, ResourceSelector,
    ResourceTree, Revision, ScanReport, ScanTarget, WORKLOAD_KINDS,
};

use crate::error::{GatewayError, GatewayResult};
use crate::traits::{
    ArtifactStore, Platform, PushOutcome, ScannerGateway, ToolOutput, ToolTask, Toolchain,
    WorkloadLoad,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Artifact store ────────────────────────────────────────────────

#[derive(Default)]
struct ArtifactState {
    artifacts: BTreeMap<(String, String), Artifact>,
    fail_next: u32,
    push_attempts: u32,
    aborted: Vec<(String, String)>,
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct MemoryArtifactStore {
    state: Mutex<ArtifactState>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` pushes fail with a transient error.
    pub fn fail_next_pushes(&self, n: u32) {
        lock(&self.state).fail_next = n;
    }

    /// Every push sleeps this long before writing.
    pub fn set_push_delay(&self, delay: Duration) {
        lock(&self.state).delay = Some(delay);
    }

    pub fn push_attempts(&self) -> u32 {
        lock(&self.state).push_attempts
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        lock(&self.state).artifacts.values().cloned().collect()
    }

    pub fn aborted(&self) -> Vec<(String, String)> {
        lock(&self.state).aborted.clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn push(&self, artifact: &Artifact, _blob: &[u8]) -> GatewayResult<PushOutcome> {
        let delay = {
            let mut state = lock(&self.state);
            state.push_attempts += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(GatewayError::Transient("registry unavailable".to_string()));
            }
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        let key = (artifact.name.clone(), artifact.tag.clone());
        if state.artifacts.contains_key(&key) {
            return Ok(PushOutcome::AlreadyExists);
        }
        state.artifacts.insert(key, artifact.clone());
        Ok(PushOutcome::Pushed)
    }

    async fn exists(&self, name: &str, tag: &str) -> GatewayResult<bool> {
        Ok(lock(&self.state)
            .artifacts
            .contains_key(&(name.to_string(), tag.to_string())))
    }

    async fn abort_push(&self, name: &str, tag: &str) -> GatewayResult<()> {
        lock(&self.state)
            .aborted
            .push((name.to_string(), tag.to_string()));
        Ok(())
    }
}

// ── Scanner ───────────────────────────────────────────────────────

fn target_kind(target: &ScanTarget) -> &'static str {
    match target {
        ScanTarget::Source { .. } => "source",
        ScanTarget::Dependencies { .. } => "dependencies",
        ScanTarget::Image { .. } => "image",
    }
}

#[derive(Default)]
struct ScannerState {
    reports: HashMap<&'static str, ScanReport>,
    errors: HashMap<&'static str, GatewayError>,
    scanned: Vec<ScanTarget>,
}

/// Returns a fixed report per target kind (`source`, `dependencies`,
/// `image`); kinds without a report scan clean.
#[derive(Default)]
pub struct StaticScanner {
    state: Mutex<ScannerState>,
}

impl StaticScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_report(&self, kind: &'static str, report: ScanReport) {
        lock(&self.state).reports.insert(kind, report);
    }

    pub fn fail(&self, kind: &'static str, err: GatewayError) {
        lock(&self.state).errors.insert(kind, err);
    }

    pub fn scanned(&self) -> Vec<ScanTarget> {
        lock(&self.state).scanned.clone()
    }
}

#[async_trait]
impl ScannerGateway for StaticScanner {
    async fn scan(&self, target: &ScanTarget) -> GatewayResult<ScanReport> {
        let mut state = lock(&self.state);
        state.scanned.push(target.clone());
        let kind = target_kind(target);
        if let Some(err) = state.errors.get(kind) {
            return Err(err.clone());
        }
        Ok(state
            .reports
            .get(kind)
            .cloned()
            .unwrap_or_else(ScanReport::clean))
    }
}

// ── Toolchain ─────────────────────────────────────────────────────

#[derive(Default)]
struct ToolchainState {
    failures: HashMap<ToolTask, VecDeque<GatewayError>>,
    always_fail: HashMap<ToolTask, GatewayError>,
    delays: HashMap<ToolTask, Duration>,
    calls: Vec<(ToolTask, Revision)>,
}

/// Succeeds instantly unless told otherwise. `ImageBuild` produces a blob
/// derived from the revision, so identical revisions yield identical
/// digests.
#[derive(Default)]
pub struct ScriptedToolchain {
    state: Mutex<ToolchainState>,
}

impl ScriptedToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next run of `task` once with `err`. Calls queue up.
    pub fn fail_once(&self, task: ToolTask, err: GatewayError) {
        lock(&self.state)
            .failures
            .entry(task)
            .or_default()
            .push_back(err);
    }

    pub fn fail_always(&self, task: ToolTask, err: GatewayError) {
        lock(&self.state).always_fail.insert(task, err);
    }

    pub fn delay(&self, task: ToolTask, delay: Duration) {
        lock(&self.state).delays.insert(task, delay);
    }

    pub fn calls(&self) -> Vec<(ToolTask, Revision)> {
        lock(&self.state).calls.clone()
    }

    pub fn call_count(&self, task: ToolTask) -> usize {
        lock(&self.state)
            .calls
            .iter()
            .filter(|(t, _)| *t == task)
            .count()
    }
}

#[async_trait]
impl Toolchain for ScriptedToolchain {
    async fn run(&self, task: ToolTask, revision: &Revision) -> GatewayResult<ToolOutput> {
        let delay = {
            let mut state = lock(&self.state);
            state.calls.push((task, revision.clone()));
            if let Some(err) = state.failures.get_mut(&task).and_then(VecDeque::pop_front) {
                return Err(err);
            }
            if let Some(err) = state.always_fail.get(&task) {
                return Err(err.clone());
            }
            state.delays.get(&task).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let stdout = match task {
            ToolTask::ImageBuild => {
                format!("image:{}:{}", revision.workload, revision.commit).into_bytes()
            }
            _ => Vec::new(),
        };
        Ok(ToolOutput {
            stdout,
            log: format!("{} ok", task.name()),
        })
    }
}

// ── Platform ──────────────────────────────────────────────────────

#[derive(Default)]
struct PlatformState {
    live: ResourceTree,
    health: BTreeMap<ResourceKey, ResourceHealth>,
    rejected: BTreeMap<ResourceKey, String>,
    unreachable: bool,
    loads: HashMap<String, f64>,
    metrics_down: bool,
    applied: Vec<Vec<ResourceKey>>,
    deleted: Vec<ResourceKey>,
    replica_changes: Vec<(String, u32)>,
}

/// A platform that holds live resources in memory.
///
/// Applying over an existing workload resource keeps its live `replicas`
/// field: replica counts belong to the autoscaler once the resource exists.
/// Newly applied resources report `Healthy` unless overridden with
/// [`set_health`](Self::set_health).
#[derive(Default)]
pub struct MemoryPlatform {
    state: Mutex<PlatformState>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Reject every future apply of `key`.
    pub fn reject(&self, key: ResourceKey, reason: &str) {
        lock(&self.state).rejected.insert(key, reason.to_string());
    }

    pub fn set_health(&self, key: ResourceKey, health: ResourceHealth) {
        lock(&self.state).health.insert(key, health);
    }

    /// Create a live resource out of band (e.g. something keel never applied).
    pub fn insert_live(&self, resource: Resource) {
        lock(&self.state).live.insert(resource);
    }

    /// Overwrite one field of a live resource, simulating a manual edit.
    pub fn tamper(&self, key: &ResourceKey, pointer: &str, value: Value) -> bool {
        let mut state = lock(&self.state);
        let Some(mut resource) = state.live.get(key).cloned() else {
            return false;
        };
        match resource.spec.pointer_mut(pointer) {
            Some(slot) => *slot = value,
            None => {
                let Some(field) = pointer.strip_prefix('/').filter(|f| !f.contains('/')) else {
                    return false;
                };
                if !resource.spec.is_object() {
                    resource.spec = Value::Object(Default::default());
                }
                resource.spec[field] = value;
            }
        }
        state.live.insert(resource);
        true
    }

    pub fn remove_live(&self, key: &ResourceKey) -> Option<Resource> {
        lock(&self.state).live.remove(key)
    }

    /// Utilization (percent) reported for a workload.
    pub fn set_load(&self, workload: &str, utilization: f64) {
        lock(&self.state)
            .loads
            .insert(workload.to_string(), utilization);
    }

    /// Make every `load` call fail until cleared.
    pub fn set_metrics_down(&self, down: bool) {
        lock(&self.state).metrics_down = down;
    }

    pub fn live(&self) -> ResourceTree {
        lock(&self.state).live.clone()
    }

    /// Keys passed to each `apply` call, in call order.
    pub fn applied(&self) -> Vec<Vec<ResourceKey>> {
        lock(&self.state).applied.clone()
    }

    pub fn apply_count(&self) -> usize {
        lock(&self.state).applied.len()
    }

    pub fn deleted(&self) -> Vec<ResourceKey> {
        lock(&self.state).deleted.clone()
    }

    pub fn replica_changes(&self) -> Vec<(String, u32)> {
        lock(&self.state).replica_changes.clone()
    }

    pub fn replicas(&self, workload: &str) -> Option<u32> {
        let state = lock(&self.state);
        state
            .live
            .iter()
            .find(|r| is_workload_resource(r, workload))
            .and_then(|r| r.spec.get("replicas"))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
    }
}

fn is_workload_resource(resource: &Resource, workload: &str) -> bool {
    resource.key.name == workload && WORKLOAD_KINDS.contains(&resource.key.kind.as_str())
}

impl PlatformState {
    fn check_reachable(&self) -> GatewayResult<()> {
        if self.unreachable {
            Err(GatewayError::Unreachable("platform API not responding".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn get_observed(&self, selector: &ResourceSelector) -> GatewayResult<ResourceTree> {
        let state = lock(&self.state);
        state.check_reachable()?;
        Ok(state
            .live
            .iter()
            .filter(|r| selector.matches(&r.key))
            .cloned()
            .collect())
    }

    async fn apply(&self, tree: &ResourceTree) -> GatewayResult<()> {
        let mut state = lock(&self.state);
        state.check_reachable()?;
        state.applied.push(tree.keys().cloned().collect());

        let mut failures = Vec::new();
        for resource in tree.iter() {
            if let Some(reason) = state.rejected.get(&resource.key) {
                failures.push(ResourceFailure::new(resource.key.clone(), reason.clone()));
                continue;
            }
            let mut resource = resource.clone();
            let live_replicas = state
                .live
                .get(&resource.key)
                .filter(|r| WORKLOAD_KINDS.contains(&r.key.kind.as_str()))
                .and_then(|r| r.spec.get("replicas").cloned());
            if let (Some(replicas), Some(spec)) = (live_replicas, resource.spec.as_object_mut()) {
                spec.insert("replicas".to_string(), replicas);
            }
            state.live.insert(resource);
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::PartialFailure(failures))
        }
    }

    async fn delete(&self, keys: &[ResourceKey]) -> GatewayResult<()> {
        let mut state = lock(&self.state);
        state.check_reachable()?;
        for key in keys {
            if state.live.remove(key).is_some() {
                state.deleted.push(key.clone());
            }
        }
        Ok(())
    }

    async fn health(
        &self,
        keys: &[ResourceKey],
    ) -> GatewayResult<BTreeMap<ResourceKey, ResourceHealth>> {
        let state = lock(&self.state);
        state.check_reachable()?;
        Ok(keys
            .iter()
            .map(|key| {
                let health = if state.live.contains(key) {
                    state
                        .health
                        .get(key)
                        .copied()
                        .unwrap_or(ResourceHealth::Healthy)
                } else {
                    ResourceHealth::Missing
                };
                (key.clone(), health)
            })
            .collect())
    }

    async fn set_replicas(&self, workload: &str, count: u32) -> GatewayResult<()> {
        let mut state = lock(&self.state);
        state.check_reachable()?;
        let Some(mut resource) = state
            .live
            .iter()
            .find(|r| is_workload_resource(r, workload))
            .cloned()
        else {
            return Err(GatewayError::NotFound(format!("workload {workload}")));
        };
        if !resource.spec.is_object() {
            resource.spec = Value::Object(Default::default());
        }
        resource.spec["replicas"] = Value::from(count);
        state.live.insert(resource);
        state.replica_changes.push((workload.to_string(), count));
        Ok(())
    }

    async fn load(&self, workload: &str) -> GatewayResult<WorkloadLoad> {
        let state = lock(&self.state);
        state.check_reachable()?;
        if state.metrics_down {
            return Err(GatewayError::Transient("metrics unavailable".to_string()));
        }
        let utilization = *state
            .loads
            .get(workload)
            .ok_or_else(|| GatewayError::NotFound(format!("no metrics for {workload}")))?;
        let replicas = state
            .live
            .iter()
            .find(|r| is_workload_resource(r, workload))
            .and_then(|r| r.spec.get("replicas"))
            .and_then(Value::as_u64)
            .map(|n| n as u32)
            .unwrap_or(1);
        Ok(WorkloadLoad {
            replicas,
            utilization,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(replicas: u32) -> Resource {
        Resource::new(
            ResourceKey::new("Deployment", "prod", "api"),
            json!({"image": "api:v1", "replicas": replicas}),
        )
    }

    #[tokio::test]
    async fn apply_keeps_live_replicas() {
        let platform = MemoryPlatform::new();
        let tree: ResourceTree = [deployment(2)].into_iter().collect();
        platform.apply(&tree).await.unwrap();
        platform.set_replicas("api", 5).await.unwrap();

        platform.apply(&tree).await.unwrap();
        assert_eq!(platform.replicas("api"), Some(5));
        assert_eq!(platform.apply_count(), 2);
    }

    #[tokio::test]
    async fn rejected_resources_are_partial_failure() {
        let platform = MemoryPlatform::new();
        let cm = Resource::new(ResourceKey::new("ConfigMap", "prod", "cfg"), json!({}));
        platform.reject(cm.key.clone(), "quota exceeded");
        let tree: ResourceTree = [deployment(1), cm.clone()].into_iter().collect();

        let err = platform.apply(&tree).await.unwrap_err();
        let GatewayError::PartialFailure(failures) = err else {
            panic!("expected partial failure");
        };
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].key, cm.key);
        assert!(platform.live().contains(&deployment(1).key));
    }

    #[tokio::test]
    async fn unreachable_platform_errors() {
        let platform = MemoryPlatform::new();
        platform.set_unreachable(true);
        let err = platform
            .get_observed(&ResourceSelector::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unreachable(_)));
    }

    #[tokio::test]
    async fn health_reports_missing_and_overrides() {
        let platform = MemoryPlatform::new();
        platform.insert_live(deployment(1));
        let key = deployment(1).key;
        let ghost = ResourceKey::new("Service", "prod", "ghost");

        let health = platform.health(&[key.clone(), ghost.clone()]).await.unwrap();
        assert_eq!(health[&key], ResourceHealth::Healthy);
        assert_eq!(health[&ghost], ResourceHealth::Missing);

        platform.set_health(key.clone(), ResourceHealth::Unhealthy);
        let health = platform.health(&[key.clone()]).await.unwrap();
        assert_eq!(health[&key], ResourceHealth::Unhealthy);
    }

    #[tokio::test]
    async fn tamper_changes_live_field() {
        let platform = MemoryPlatform::new();
        platform.insert_live(deployment(1));
        let key = deployment(1).key;
        assert!(platform.tamper(&key, "/image", json!("api:hotfix")));
        assert_eq!(platform.live().get(&key).unwrap().spec["image"], "api:hotfix");
    }

    #[tokio::test]
    async fn artifact_store_fault_injection() {
        let store = MemoryArtifactStore::new();
        store.fail_next_pushes(1);
        let artifact = Artifact::from_blob("api", "v1-abc", b"x");

        assert!(store.push(&artifact, b"x").await.unwrap_err().is_transient());
        assert_eq!(store.push(&artifact, b"x").await.unwrap(), PushOutcome::Pushed);
        assert_eq!(
            store.push(&artifact, b"x").await.unwrap(),
            PushOutcome::AlreadyExists
        );
        assert_eq!(store.push_attempts(), 3);
        assert_eq!(store.artifacts().len(), 1);
    }

    #[tokio::test]
    async fn scripted_toolchain_fails_once() {
        let toolchain = ScriptedToolchain::new();
        let rev = Revision::new("api", "abc1234", 1);
        toolchain.fail_once(ToolTask::Compile, GatewayError::Transient("flaky".into()));

        assert!(toolchain.run(ToolTask::Compile, &rev).await.is_err());
        assert!(toolchain.run(ToolTask::Compile, &rev).await.is_ok());
        let image = toolchain.run(ToolTask::ImageBuild, &rev).await.unwrap();
        assert_eq!(image.stdout, b"image:api:abc1234");
        assert_eq!(toolchain.call_count(ToolTask::Compile), 2);
    }
}
