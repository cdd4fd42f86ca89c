//! keel.toml configuration parser.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. Durations are kept as strings and resolved through the
//! accessor methods, which report malformed values as `KeelError::Config`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::parse_duration;
use crate::error::{KeelError, KeelResult};
use crate::types::{ScalingPolicy, Severity};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub pipeline: PipelineConfig,
    pub reconcile: ReconcileConfig,
    pub autoscale: AutoscaleConfig,
    pub toolchain: ToolchainConfig,
    pub scanner: ScannerConfig,
    pub platform: PlatformConfig,
    pub workloads: Vec<WorkloadConfig>,
}

// ── Pipeline ──────────────────────────────────────────────────────

/// What happens when a trigger arrives while a run is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupersedePolicy {
    /// Queue the new revision behind the active run (FIFO).
    #[default]
    Queue,
    /// Cancel the active run and start the newest revision.
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Findings at or above this severity fail the quality gate.
    pub severity_threshold: Severity,
    pub supersede: SupersedePolicy,
    /// Timeout applied to each stage attempt.
    pub stage_timeout: String,
    /// Read-modify-write attempts for the manifest update.
    pub manifest_conflict_retries: u32,
    /// Whether a failed best-effort stage lets the run continue.
    pub best_effort_continue: bool,
    /// Artifact name for workloads that do not set their own. Empty means
    /// the workload name.
    pub artifact_name: String,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            severity_threshold: Severity::High,
            supersede: SupersedePolicy::Queue,
            stage_timeout: "10m".to_string(),
            manifest_conflict_retries: 5,
            best_effort_continue: true,
            artifact_name: String::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> KeelResult<Duration> {
        parse_duration(&self.stage_timeout)
    }
}

/// Bounded exponential backoff for transient errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: String,
    pub max_delay: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: "500ms".to_string(),
            max_delay: "30s".to_string(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> KeelResult<Duration> {
        parse_duration(&self.base_delay)
    }

    pub fn max_delay(&self) -> KeelResult<Duration> {
        parse_duration(&self.max_delay)
    }
}

// ── Reconcile ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub interval: String,
    pub auto_sync: bool,
    pub self_heal: bool,
    pub prune: bool,
    /// Upper bound for one apply pass.
    pub sync_timeout: String,
    /// How long a wave may take to report healthy.
    pub wave_timeout: String,
    /// Health polling period while waiting on a wave.
    pub health_poll: String,
    /// Sync records retained per set.
    pub history_limit: usize,
    /// JSON pointer prefixes excluded from the diff.
    pub ignore_paths: Vec<String>,
    /// Wave overrides per resource kind.
    pub waves: BTreeMap<String, u32>,
    pub sets: Vec<SyncSetConfig>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: "3m".to_string(),
            auto_sync: true,
            self_heal: true,
            prune: false,
            sync_timeout: "5m".to_string(),
            wave_timeout: "2m".to_string(),
            health_poll: "2s".to_string(),
            history_limit: 50,
            ignore_paths: vec![
                "/status".to_string(),
                "/spec/replicas".to_string(),
                "/metadata/ip".to_string(),
            ],
            waves: BTreeMap::new(),
            sets: Vec::new(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> KeelResult<Duration> {
        parse_duration(&self.interval)
    }

    pub fn sync_timeout(&self) -> KeelResult<Duration> {
        parse_duration(&self.sync_timeout)
    }

    pub fn wave_timeout(&self) -> KeelResult<Duration> {
        parse_duration(&self.wave_timeout)
    }

    pub fn health_poll(&self) -> KeelResult<Duration> {
        parse_duration(&self.health_poll)
    }
}

/// A group of workloads reconciled together.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSetConfig {
    pub name: String,
    pub workloads: Vec<String>,
    /// Per-set overrides of the `[reconcile]` switches.
    pub auto_sync: Option<bool>,
    pub self_heal: Option<bool>,
    pub prune: Option<bool>,
}

// ── Autoscale ─────────────────────────────────────────────────────

/// A change must be asked for on at least this many consecutive ticks.
pub const MIN_STABILIZATION_TICKS: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleConfig {
    pub interval: String,
    /// No scale-down within this window after a scale-up.
    pub cooldown: String,
    /// Consecutive ticks a change must persist before it is applied.
    pub stabilization_ticks: u32,
    /// Decisions retained per workload.
    pub decision_history: usize,
    /// Used when a manifest declares no scaling policy.
    pub defaults: ScalingPolicy,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            interval: "30s".to_string(),
            cooldown: "5m".to_string(),
            stabilization_ticks: 2,
            decision_history: 500,
            defaults: ScalingPolicy::default(),
        }
    }
}

impl AutoscaleConfig {
    pub fn interval(&self) -> KeelResult<Duration> {
        parse_duration(&self.interval)
    }

    pub fn cooldown(&self) -> KeelResult<Duration> {
        parse_duration(&self.cooldown)
    }
}

// ── External tools ────────────────────────────────────────────────

/// Commands for the command-backed toolchain. Empty means "no-op success".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub checkout: Vec<String>,
    pub compile: Vec<String>,
    pub test: Vec<String>,
    pub package: Vec<String>,
    /// Its stdout is taken as the image blob.
    pub image_build: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Scanner command; receives the target as JSON on stdin and prints a
    /// `{findings, passed}` report on stdout.
    pub command: Vec<String>,
}

/// Commands for the command-backed platform adapter.
///
/// Resource lists, keys and selectors travel as JSON on stdin; the
/// workload and replica count for `scale` and `load` are passed as
/// `KEEL_WORKLOAD` and `KEEL_REPLICAS`. An empty command leaves that
/// operation unavailable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Timeout for each platform command.
    pub timeout: String,
    /// Prints the live resources matching the selector on stdin.
    pub observe: Vec<String>,
    /// Creates or updates the resources on stdin; may print rejected
    /// resources as `[{key, reason}]`.
    pub apply: Vec<String>,
    /// Deletes the resource keys on stdin.
    pub delete: Vec<String>,
    /// Prints `[{key, health}]` for the resource keys on stdin.
    pub health: Vec<String>,
    pub scale: Vec<String>,
    /// Prints `{replicas, utilization}`.
    pub load: Vec<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            timeout: "30s".to_string(),
            observe: Vec::new(),
            apply: Vec::new(),
            delete: Vec::new(),
            health: Vec::new(),
            scale: Vec::new(),
            load: Vec::new(),
        }
    }
}

impl PlatformConfig {
    pub fn timeout(&self) -> KeelResult<Duration> {
        parse_duration(&self.timeout)
    }

    /// Whether the commands the reconciler needs are configured.
    pub fn can_reconcile(&self) -> bool {
        !self.observe.is_empty() && !self.apply.is_empty() && !self.health.is_empty()
    }

    /// Whether the commands the autoscaler needs are configured.
    pub fn can_scale(&self) -> bool {
        !self.scale.is_empty() && !self.load.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub name: String,
    /// Artifact (image) name pushed for this workload. Empty falls back to
    /// `pipeline.artifact_name`.
    pub artifact: String,
}

impl KeelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KeelConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints and that every duration parses.
    pub fn validate(&self) -> KeelResult<()> {
        non_zero("pipeline.stage_timeout", self.pipeline.stage_timeout()?)?;
        self.pipeline.retry.base_delay()?;
        self.pipeline.retry.max_delay()?;
        if self.pipeline.retry.max_attempts == 0 {
            return Err(KeelError::Config(
                "pipeline.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.pipeline.manifest_conflict_retries == 0 {
            return Err(KeelError::Config(
                "pipeline.manifest_conflict_retries must be at least 1".to_string(),
            ));
        }

        non_zero("reconcile.interval", self.reconcile.interval()?)?;
        non_zero("reconcile.sync_timeout", self.reconcile.sync_timeout()?)?;
        non_zero("reconcile.wave_timeout", self.reconcile.wave_timeout()?)?;
        non_zero("reconcile.health_poll", self.reconcile.health_poll()?)?;

        non_zero("autoscale.interval", self.autoscale.interval()?)?;
        self.autoscale.cooldown()?;
        if self.autoscale.stabilization_ticks < MIN_STABILIZATION_TICKS {
            return Err(KeelError::Config(format!(
                "autoscale.stabilization_ticks must be at least {MIN_STABILIZATION_TICKS}"
            )));
        }
        validate_scaling(&self.autoscale.defaults)?;

        non_zero("platform.timeout", self.platform.timeout()?)?;

        let mut names = BTreeSet::new();
        for w in &self.workloads {
            if w.name.is_empty() {
                return Err(KeelError::Config("workload without a name".to_string()));
            }
            if !names.insert(w.name.as_str()) {
                return Err(KeelError::Config(format!("duplicate workload: {}", w.name)));
            }
        }

        for set in &self.reconcile.sets {
            if set.name.is_empty() {
                return Err(KeelError::Config("reconcile set without a name".to_string()));
            }
            if let Some(w) = set.workloads.iter().find(|w| !names.contains(w.as_str())) {
                return Err(KeelError::Config(format!(
                    "reconcile set {} references undeclared workload {w}",
                    set.name
                )));
            }
        }

        Ok(())
    }

    pub fn workload(&self, name: &str) -> Option<&WorkloadConfig> {
        self.workloads.iter().find(|w| w.name == name)
    }
}

fn non_zero(field: &str, value: Duration) -> KeelResult<()> {
    if value.is_zero() {
        return Err(KeelError::Config(format!("{field} must be greater than zero")));
    }
    Ok(())
}

/// Reject scaling bounds that cannot be honoured.
pub fn validate_scaling(policy: &ScalingPolicy) -> KeelResult<()> {
    if policy.min_replicas > policy.max_replicas {
        return Err(KeelError::Config(format!(
            "min_replicas ({}) exceeds max_replicas ({})",
            policy.min_replicas, policy.max_replicas
        )));
    }
    if policy.target_utilization.is_nan() || policy.target_utilization <= 0.0 {
        return Err(KeelError::Config(
            "target_utilization must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: KeelConfig = toml::from_str("").unwrap();
        assert_eq!(config.pipeline.severity_threshold, Severity::High);
        assert_eq!(config.pipeline.supersede, SupersedePolicy::Queue);
        assert!(config.reconcile.self_heal);
        assert!(!config.reconcile.prune);
        assert_eq!(config.autoscale.stabilization_ticks, 2);
        config.validate().unwrap();
    }

    #[test]
    fn parses_full_config() {
        let toml_str = r#"
[pipeline]
severity_threshold = "critical"
supersede = "cancel"

[pipeline.retry]
max_attempts = 2
base_delay = "100ms"

[reconcile]
prune = true
ignore_paths = ["/status"]

[reconcile.waves]
CustomResourceDefinition = 0

[[reconcile.sets]]
name = "prod"
workloads = ["api"]
self_heal = false

[autoscale.defaults]
min_replicas = 2
max_replicas = 5
target_utilization = 40.0

[[workloads]]
name = "api"
artifact = "registry.local/api"
"#;
        let config: KeelConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pipeline.severity_threshold, Severity::Critical);
        assert_eq!(config.pipeline.supersede, SupersedePolicy::Cancel);
        assert_eq!(config.pipeline.retry.base_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(config.reconcile.sets[0].self_heal, Some(false));
        assert_eq!(config.reconcile.waves["CustomResourceDefinition"], 0);
        assert_eq!(config.autoscale.defaults.max_replicas, 5);
        assert_eq!(config.workload("api").unwrap().artifact, "registry.local/api");
    }

    #[test]
    fn rejects_inverted_bounds() {
        let mut config = KeelConfig::default();
        config.autoscale.defaults.min_replicas = 6;
        config.autoscale.defaults.max_replicas = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_set_with_unknown_workload() {
        let mut config = KeelConfig::default();
        config.reconcile.sets.push(SyncSetConfig {
            name: "prod".to_string(),
            workloads: vec!["ghost".to_string()],
            ..Default::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_bad_duration() {
        let mut config = KeelConfig::default();
        config.reconcile.wave_timeout = "forever".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_single_tick_stabilization() {
        for ticks in [0, 1] {
            let mut config = KeelConfig::default();
            config.autoscale.stabilization_ticks = ticks;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("stabilization_ticks"), "{err}");
        }
        let mut config = KeelConfig::default();
        config.autoscale.stabilization_ticks = 3;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_durations() {
        let cases: [fn(&mut KeelConfig); 4] = [
            |c| c.reconcile.interval = "0s".to_string(),
            |c| c.pipeline.stage_timeout = "0ms".to_string(),
            |c| c.reconcile.sync_timeout = "0m".to_string(),
            |c| c.autoscale.interval = "0s".to_string(),
        ];
        for set in cases {
            let mut config = KeelConfig::default();
            set(&mut config);
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("greater than zero"), "{err}");
        }

        // A zero cooldown is allowed.
        let mut config = KeelConfig::default();
        config.autoscale.cooldown = "0s".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn workload_artifact_is_optional() {
        let toml_str = r#"
[pipeline]
artifact_name = "registry.local/app"

[[workloads]]
name = "worker"
"#;
        let config: KeelConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.pipeline.artifact_name, "registry.local/app");
        assert!(config.workload("worker").unwrap().artifact.is_empty());

        let mut unnamed = KeelConfig::default();
        unnamed.workloads.push(WorkloadConfig::default());
        assert!(unnamed.validate().is_err());
    }

    #[test]
    fn platform_section_parses() {
        let toml_str = r#"
[platform]
timeout = "10s"
observe = ["keel-platform", "observe"]
apply = ["keel-platform", "apply"]
health = ["keel-platform", "health"]
"#;
        let config: KeelConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.platform.timeout().unwrap(), Duration::from_secs(10));
        assert!(config.platform.can_reconcile());
        assert!(!config.platform.can_scale());
        assert!(!KeelConfig::default().platform.can_reconcile());
    }

    #[test]
    fn toml_roundtrip_keeps_threshold() {
        let mut config = KeelConfig::default();
        config.pipeline.severity_threshold = Severity::Medium;
        let text = config.to_toml_string().unwrap();
        let back: KeelConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.pipeline.severity_threshold, Severity::Medium);
    }
}
