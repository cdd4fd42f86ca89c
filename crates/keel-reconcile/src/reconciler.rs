//! Reconciler state machine for one sync set.
//!
//! ```text
//!             diff empty                     apply + waves healthy + verified
//!   Unknown ─────────────→ InSync ←───────────────────────────────┐
//!      ↑                     │ drift                               │
//!      │ unreachable         ↓                                     │
//!      └──────────────── OutOfSync ──(auto-sync/self-heal/manual)→ Progressing
//!                            ↑ waits                               │ wave timeout,
//!                            └─ switches off                       ↓ rejected, drift
//!                                                               Degraded
//! ```
//!
//! A degraded pass is not retried mid-flight; the next tick starts over.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use keel_core::config::{ReconcileConfig, SyncSetConfig};
use keel_core::{
    KeelResult, MANAGED_BY_LABEL, ManifestDocument, Resource, ResourceFailure, ResourceHealth, ResourceKey,
    ResourceSelector, ResourceTree,
};
use keel_gateway::{GatewayError, ManifestRepository, Platform};
use keel_state::{DiffSummary, ReconcileSyncRecord, StateStore, SyncCause, SyncStatus};

use crate::diff::diff_trees;
use crate::waves::Waves;

/// A named group of workloads reconciled together, with its switches
/// resolved against the `[reconcile]` defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSet {
    pub name: String,
    pub workloads: Vec<String>,
    pub auto_sync: bool,
    pub self_heal: bool,
    pub prune: bool,
}

impl SyncSet {
    pub fn from_config(set: &SyncSetConfig, defaults: &ReconcileConfig) -> Self {
        Self {
            name: set.name.clone(),
            workloads: set.workloads.clone(),
            auto_sync: set.auto_sync.unwrap_or(defaults.auto_sync),
            self_heal: set.self_heal.unwrap_or(defaults.self_heal),
            prune: set.prune.unwrap_or(defaults.prune),
        }
    }
}

/// Timing and diff settings shared by every set.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub sync_timeout: Duration,
    pub wave_timeout: Duration,
    pub health_poll: Duration,
    pub history_limit: usize,
    pub ignore_paths: Vec<String>,
    pub waves: Waves,
}

impl ReconcilerSettings {
    pub fn from_config(config: &ReconcileConfig) -> KeelResult<Self> {
        Ok(Self {
            sync_timeout: config.sync_timeout()?,
            wave_timeout: config.wave_timeout()?,
            health_poll: config.health_poll()?,
            history_limit: config.history_limit,
            ignore_paths: config.ignore_paths.clone(),
            waves: Waves::new(config.waves.clone()),
        })
    }
}

#[derive(Default)]
struct SetState {
    status: Option<SyncStatus>,
    /// Manifest versions of the last pass that converged.
    applied_versions: BTreeMap<String, u64>,
    /// Namespaces the set has applied to. Removed resources stay observed
    /// (and prunable) after their namespace leaves the desired tree.
    namespaces: BTreeSet<String>,
}

/// Outcome of the apply phase.
enum ApplyEnd {
    Converged,
    Failed {
        status: SyncStatus,
        failures: Vec<ResourceFailure>,
        message: String,
    },
}

pub struct Reconciler {
    set: SyncSet,
    settings: ReconcilerSettings,
    manifests: Arc<dyn ManifestRepository>,
    platform: Arc<dyn Platform>,
    store: StateStore,
    state: Mutex<SetState>,
    manual: AtomicBool,
    wake: Notify,
}

impl Reconciler {
    pub fn new(
        set: SyncSet,
        settings: ReconcilerSettings,
        manifests: Arc<dyn ManifestRepository>,
        platform: Arc<dyn Platform>,
        store: StateStore,
    ) -> Self {
        Self {
            set,
            settings,
            manifests,
            platform,
            store,
            state: Mutex::new(SetState::default()),
            manual: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn set(&self) -> &SyncSet {
        &self.set
    }

    /// Status after the most recent pass (`Unknown` before the first).
    pub fn status(&self) -> SyncStatus {
        lock(&self.state).status.unwrap_or(SyncStatus::Unknown)
    }

    /// Apply once on the next pass regardless of the auto-sync and
    /// self-heal switches, and wake the loop.
    pub fn request_sync(&self) {
        self.manual.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        info!(set = %self.set.name, "manual sync requested");
    }

    /// Run reconciliation passes until shutdown. Wakes on the interval, on
    /// manifest commits and on manual sync requests.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut manifest_changes: watch::Receiver<u64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            set = %self.set.name,
            workloads = ?self.set.workloads,
            interval_secs = interval.as_secs(),
            "reconciler started"
        );
        let mut watching = true;

        loop {
            tokio::select! {
                result = self.tick() => {
                    if let Err(e) = result {
                        error!(set = %self.set.name, error = %e, "failed to record sync pass");
                    }
                }
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = manifest_changes.changed(), if watching => {
                    match changed {
                        Ok(()) => debug!(set = %self.set.name, "manifest change observed"),
                        Err(_) => watching = false,
                    }
                }
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => break,
            }
        }
        info!(set = %self.set.name, "reconciler shutting down");
    }

    /// One reconciliation pass. The returned record has been appended to
    /// the set's history.
    pub async fn tick(&self) -> KeelResult<ReconcileSyncRecord> {
        let manual = self.manual.swap(false, Ordering::SeqCst);
        let mut record = ReconcileSyncRecord {
            seq: 0,
            set: self.set.name.clone(),
            timestamp: epoch_secs(),
            status: SyncStatus::Unknown,
            manifest_versions: BTreeMap::new(),
            diff: DiffSummary::default(),
            cause: None,
            applied: Vec::new(),
            pruned: Vec::new(),
            unmanaged: Vec::new(),
            failures: Vec::new(),
            waves_completed: 0,
            message: None,
        };

        self.pass(&mut record, manual).await;
        self.finish(record)
    }

    async fn pass(&self, record: &mut ReconcileSyncRecord, manual: bool) {
        let (documents, versions) = match self.read_manifests().await {
            Ok(read) => read,
            Err(e) => {
                record.status = SyncStatus::Unknown;
                record.message = Some(format!("manifest repository unavailable: {e}"));
                return;
            }
        };
        record.manifest_versions = versions.clone();
        let mut desired = self.render(&documents);

        let observed = match self.observe(&desired).await {
            Ok(tree) => tree,
            Err(e) => {
                record.status = SyncStatus::Unknown;
                record.message = Some(format!("platform unreachable: {e}"));
                return;
            }
        };

        let diff = diff_trees(&desired, &observed, &self.settings.ignore_paths);
        let (prunable, unmanaged) = self.split_extras(&diff.extra, &observed);
        record.unmanaged = unmanaged;
        let needs_prune = !prunable.is_empty();
        let converged = diff.is_converged() && !needs_prune;
        record.diff = diff;

        if converged {
            record.status = SyncStatus::InSync;
            self.mark_converged(&versions);
            return;
        }

        let versions_changed = lock(&self.state).applied_versions != versions;
        let cause = if manual {
            Some(SyncCause::Manual)
        } else if versions_changed && self.set.auto_sync {
            Some(SyncCause::ManifestChange)
        } else if !versions_changed && self.set.self_heal {
            Some(SyncCause::SelfHeal)
        } else {
            None
        };

        let Some(cause) = cause else {
            record.status = SyncStatus::OutOfSync;
            record.message = Some("out of sync; waiting for manual sync".to_string());
            return;
        };
        record.cause = Some(cause);
        self.set_status(SyncStatus::Progressing);

        // Never apply a desired state older than the repository: re-read
        // and re-render if anything was committed since the diff.
        match self.read_manifests().await {
            Ok((fresh_docs, fresh_versions)) if fresh_versions != versions => {
                debug!(set = %self.set.name, "manifests changed during pass, re-rendering");
                desired = self.render(&fresh_docs);
                record.manifest_versions = fresh_versions;
            }
            Ok(_) => {}
            Err(e) => {
                record.status = SyncStatus::Unknown;
                record.message = Some(format!("manifest repository unavailable: {e}"));
                return;
            }
        }

        let to_apply: BTreeSet<ResourceKey> = {
            let fresh = diff_trees(&desired, &observed, &self.settings.ignore_paths);
            fresh
                .missing
                .into_iter()
                .chain(fresh.drifted.into_iter().map(|d| d.key))
                .collect()
        };

        info!(
            set = %self.set.name,
            cause = ?cause,
            resources = to_apply.len(),
            prune = needs_prune,
            "syncing"
        );
        lock(&self.state).namespaces.extend(desired.namespaces());

        let end = match tokio::time::timeout(
            self.settings.sync_timeout,
            self.apply_waves(&desired, &to_apply, record),
        )
        .await
        {
            Ok(end) => end,
            Err(_) => ApplyEnd::Failed {
                status: SyncStatus::Degraded,
                failures: Vec::new(),
                message: format!(
                    "sync abandoned after {}s timeout",
                    self.settings.sync_timeout.as_secs()
                ),
            },
        };
        if let ApplyEnd::Failed {
            status,
            failures,
            message,
        } = end
        {
            record.status = status;
            record.failures = failures;
            record.message = Some(message);
            return;
        }

        if needs_prune {
            match self.platform.delete(&prunable).await {
                Ok(()) => {
                    info!(set = %self.set.name, resources = ?prunable, "pruned");
                    record.pruned = prunable;
                }
                Err(e) => {
                    record.status = degraded_or_unknown(&e);
                    record.message = Some(format!("prune failed: {e}"));
                    return;
                }
            }
        }

        // Verify against a fresh observation.
        let verified = match self.observe(&desired).await {
            Ok(tree) => diff_trees(&desired, &tree, &self.settings.ignore_paths),
            Err(e) => {
                record.status = SyncStatus::Unknown;
                record.message = Some(format!("platform unreachable during verification: {e}"));
                return;
            }
        };
        if !verified.is_converged() {
            record.status = SyncStatus::Degraded;
            record.failures = verified
                .missing
                .iter()
                .map(|k| ResourceFailure::new(k.clone(), "missing after apply"))
                .chain(verified.drifted.iter().map(|d| {
                    ResourceFailure::new(
                        d.key.clone(),
                        format!("still drifting at {}", d.paths.join(", ")),
                    )
                }))
                .collect();
            record.message = Some("drift persists after apply".to_string());
            return;
        }

        record.status = SyncStatus::InSync;
        let applied_versions = record.manifest_versions.clone();
        self.mark_converged(&applied_versions);
    }

    /// Apply `to_apply` wave by wave, waiting for each wave to be healthy.
    async fn apply_waves(
        &self,
        desired: &ResourceTree,
        to_apply: &BTreeSet<ResourceKey>,
        record: &mut ReconcileSyncRecord,
    ) -> ApplyEnd {
        for (wave, resources) in self.settings.waves.plan(desired) {
            let batch = resources.subset(resources.keys().filter(|k| to_apply.contains(*k)));
            if !batch.is_empty() {
                debug!(set = %self.set.name, wave, resources = batch.len(), "applying wave");
                match self.platform.apply(&batch).await {
                    Ok(()) => record.applied.extend(batch.keys().cloned()),
                    Err(GatewayError::PartialFailure(failures)) => {
                        record.applied.extend(
                            batch
                                .keys()
                                .filter(|k| failures.iter().all(|f| &f.key != *k))
                                .cloned(),
                        );
                        warn!(set = %self.set.name, wave, rejected = failures.len(), "apply rejected resources");
                        return ApplyEnd::Failed {
                            status: SyncStatus::Degraded,
                            failures,
                            message: format!("wave {wave}: platform rejected resources"),
                        };
                    }
                    Err(e) => {
                        return ApplyEnd::Failed {
                            status: degraded_or_unknown(&e),
                            failures: Vec::new(),
                            message: format!("wave {wave}: apply failed: {e}"),
                        };
                    }
                }
            }

            let keys: Vec<ResourceKey> = resources.keys().cloned().collect();
            if let Err(end) = self.await_healthy(wave, &keys).await {
                return end;
            }
            record.waves_completed += 1;
        }
        ApplyEnd::Converged
    }

    /// Poll health until every key is healthy or the wave timeout elapses.
    async fn await_healthy(&self, wave: u32, keys: &[ResourceKey]) -> Result<(), ApplyEnd> {
        let deadline = tokio::time::Instant::now() + self.settings.wave_timeout;
        loop {
            let health = self.platform.health(keys).await.map_err(|e| ApplyEnd::Failed {
                status: degraded_or_unknown(&e),
                failures: Vec::new(),
                message: format!("wave {wave}: health query failed: {e}"),
            })?;
            let unhealthy: Vec<ResourceFailure> = keys
                .iter()
                .filter_map(|key| match health.get(key) {
                    Some(ResourceHealth::Healthy) => None,
                    Some(other) => Some(ResourceFailure::new(
                        key.clone(),
                        format!("health: {other:?}").to_lowercase(),
                    )),
                    None => Some(ResourceFailure::new(key.clone(), "health: not reported")),
                })
                .collect();

            if unhealthy.is_empty() {
                debug!(set = %self.set.name, wave, "wave healthy");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    set = %self.set.name,
                    wave,
                    unhealthy = unhealthy.len(),
                    "wave did not become healthy"
                );
                return Err(ApplyEnd::Failed {
                    status: SyncStatus::Degraded,
                    message: format!(
                        "wave {wave} not healthy after {}s",
                        self.settings.wave_timeout.as_secs()
                    ),
                    failures: unhealthy,
                });
            }
            tokio::time::sleep(self.settings.health_poll).await;
        }
    }

    async fn read_manifests(
        &self,
    ) -> Result<(Vec<ManifestDocument>, BTreeMap<String, u64>), GatewayError> {
        let mut documents = Vec::new();
        let mut versions = BTreeMap::new();
        for workload in &self.set.workloads {
            match self.manifests.read(workload).await {
                Ok((document, version)) => {
                    documents.push(document);
                    versions.insert(workload.clone(), version);
                }
                Err(GatewayError::NotFound(_)) => {
                    debug!(set = %self.set.name, %workload, "no manifest committed yet");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((documents, versions))
    }

    /// Desired tree of the set; every resource is labelled as owned by it.
    fn render(&self, documents: &[ManifestDocument]) -> ResourceTree {
        documents
            .iter()
            .flat_map(|doc| Vec::<Resource>::from(doc.render()))
            .map(|r| r.with_label(MANAGED_BY_LABEL, &self.set.name))
            .collect()
    }

    async fn observe(&self, desired: &ResourceTree) -> Result<ResourceTree, GatewayError> {
        let mut namespaces = desired.namespaces();
        namespaces.extend(lock(&self.state).namespaces.iter().cloned());
        self.platform
            .get_observed(&ResourceSelector::for_namespaces(namespaces))
            .await
    }

    /// Split extras into resources this set may prune and ones it must
    /// leave alone. With pruning off, everything is unmanaged.
    fn split_extras(
        &self,
        extra: &[ResourceKey],
        observed: &ResourceTree,
    ) -> (Vec<ResourceKey>, Vec<ResourceKey>) {
        if !self.set.prune {
            return (Vec::new(), extra.to_vec());
        }
        extra.iter().cloned().partition(|key| {
            observed
                .get(key)
                .is_some_and(|r| r.is_managed_by(&self.set.name))
        })
    }

    fn mark_converged(&self, versions: &BTreeMap<String, u64>) {
        lock(&self.state).applied_versions = versions.clone();
    }

    fn set_status(&self, status: SyncStatus) {
        let previous = lock(&self.state).status.replace(status);
        if previous != Some(status) {
            info!(set = %self.set.name, from = ?previous, to = ?status, "sync status changed");
        }
    }

    fn finish(&self, mut record: ReconcileSyncRecord) -> KeelResult<ReconcileSyncRecord> {
        self.set_status(record.status);
        match record.status {
            SyncStatus::InSync | SyncStatus::Progressing => {
                debug!(set = %self.set.name, applied = record.applied.len(), "pass complete")
            }
            SyncStatus::OutOfSync => info!(
                set = %self.set.name,
                missing = record.diff.missing.len(),
                drifted = record.diff.drifted.len(),
                "out of sync"
            ),
            SyncStatus::Degraded | SyncStatus::Unknown => warn!(
                set = %self.set.name,
                status = ?record.status,
                failures = ?record.failures,
                message = ?record.message,
                "sync pass failed"
            ),
        }
        self.store
            .append_sync_record(&mut record, self.settings.history_limit)?;
        Ok(record)
    }
}

fn degraded_or_unknown(err: &GatewayError) -> SyncStatus {
    match err {
        GatewayError::Unreachable(_) => SyncStatus::Unknown,
        _ => SyncStatus::Degraded,
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
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

    #[test]
    fn set_switches_fall_back_to_defaults() {
        let defaults = ReconcileConfig::default();
        let set = SyncSetConfig {
            name: "prod".to_string(),
            workloads: vec!["api".to_string()],
            auto_sync: None,
            self_heal: Some(false),
            prune: Some(true),
        };
        let set = SyncSet::from_config(&set, &defaults);
        assert!(set.auto_sync);
        assert!(!set.self_heal);
        assert!(set.prune);
    }

    #[test]
    fn settings_parse_durations() {
        let settings = ReconcilerSettings::from_config(&ReconcileConfig::default()).unwrap();
        assert_eq!(settings.wave_timeout, Duration::from_secs(120));
        assert_eq!(settings.health_poll, Duration::from_secs(2));
        assert_eq!(settings.history_limit, 50);
    }

    #[test]
    fn unreachable_is_unknown_other_errors_degrade() {
        assert_eq!(
            degraded_or_unknown(&GatewayError::Unreachable("down".into())),
            SyncStatus::Unknown
        );
        assert_eq!(
            degraded_or_unknown(&GatewayError::Failed("bad".into())),
            SyncStatus::Degraded
        );
    }
}
