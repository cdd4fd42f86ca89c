//! Autoscaler — proportional scaling for one workload.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use keel_core::config::{AutoscaleConfig, MIN_STABILIZATION_TICKS};
use keel_core::{KeelResult, ScalingPolicy};
use keel_gateway::{GatewayError, ManifestRepository, Platform, WorkloadLoad};
use keel_state::{HoldReason, ScalingAction, ScalingDecision, StateStore};

/// Controller settings shared by every workload.
#[derive(Debug, Clone)]
pub struct AutoscalerSettings {
    pub cooldown: Duration,
    /// Never fewer than [`MIN_STABILIZATION_TICKS`]; smaller values are
    /// raised to it.
    pub stabilization_ticks: u32,
    pub decision_history: usize,
    /// Policy for manifests that declare none.
    pub defaults: ScalingPolicy,
}

impl AutoscalerSettings {
    pub fn from_config(config: &AutoscaleConfig) -> KeelResult<Self> {
        Ok(Self {
            cooldown: config.cooldown()?,
            stabilization_ticks: config.stabilization_ticks.max(MIN_STABILIZATION_TICKS),
            decision_history: config.decision_history,
            defaults: config.defaults.clone(),
        })
    }
}

/// Proportional replica count, clamped to the policy bounds.
pub fn desired_replicas(current: u32, observed: f64, policy: &ScalingPolicy) -> u32 {
    let target = policy.target_utilization;
    let raw = if target > 0.0 && observed.is_finite() && observed >= 0.0 {
        (current as f64 * observed / target).ceil()
    } else {
        current as f64
    };
    // Saturating float-to-int cast; min is applied before max so an
    // inverted policy cannot panic.
    (raw as u32).max(policy.min_replicas).min(policy.max_replicas)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Cooldown and stabilization tracking.
#[derive(Debug, Default)]
struct ScaleState {
    last_scale_up: Option<u64>,
    /// Direction of the pending change and how many consecutive ticks
    /// have asked for it.
    pending: Option<(Direction, u32)>,
}

/// What `evaluate` wants done.
#[derive(Debug, Clone, PartialEq)]
enum Plan {
    Keep(ScalingAction),
    ScaleTo(u32),
}

/// The autoscaler evaluates one workload's load and scales it within the
/// bounds of its policy.
pub struct Autoscaler {
    workload: String,
    settings: AutoscalerSettings,
    manifests: Arc<dyn ManifestRepository>,
    platform: Arc<dyn Platform>,
    store: StateStore,
    scale_state: ScaleState,
}

impl Autoscaler {
    pub fn new(
        workload: &str,
        settings: AutoscalerSettings,
        manifests: Arc<dyn ManifestRepository>,
        platform: Arc<dyn Platform>,
        store: StateStore,
    ) -> Self {
        Self {
            workload: workload.to_string(),
            settings,
            manifests,
            platform,
            store,
            scale_state: ScaleState::default(),
        }
    }

    pub fn workload(&self) -> &str {
        &self.workload
    }

    /// One evaluation tick. Returns `None` when the tick was skipped.
    pub async fn tick(&mut self) -> KeelResult<Option<ScalingDecision>> {
        self.tick_at(epoch_secs()).await
    }

    /// One evaluation tick at the given wall-clock second.
    pub async fn tick_at(&mut self, now: u64) -> KeelResult<Option<ScalingDecision>> {
        let Some(policy) = self.policy().await else {
            return Ok(None);
        };

        let load = match self.platform.load(&self.workload).await {
            Ok(load) => load,
            Err(e) => {
                warn!(workload = %self.workload, error = %e, "metric query failed, skipping tick");
                return Ok(None);
            }
        };

        let computed = desired_replicas(load.replicas, load.utilization, &policy);
        let (action, chosen) = match self.evaluate(&policy, load, computed, now) {
            Plan::Keep(action) => (action, load.replicas),
            Plan::ScaleTo(target) => match self.platform.set_replicas(&self.workload, target).await {
                Ok(()) => {
                    if target > load.replicas {
                        self.scale_state.last_scale_up = Some(now);
                    }
                    self.scale_state.pending = None;
                    info!(
                        workload = %self.workload,
                        from = load.replicas,
                        to = target,
                        observed = load.utilization,
                        target_utilization = policy.target_utilization,
                        "scaled"
                    );
                    (
                        ScalingAction::Scaled {
                            from: load.replicas,
                            to: target,
                        },
                        target,
                    )
                }
                Err(e) => {
                    warn!(workload = %self.workload, target, error = %e, "scaling action failed");
                    (
                        ScalingAction::Failed {
                            error: e.to_string(),
                        },
                        load.replicas,
                    )
                }
            },
        };

        let mut decision = ScalingDecision {
            seq: 0,
            workload: self.workload.clone(),
            timestamp: now,
            observed_metric: load.utilization,
            target_metric: policy.target_utilization,
            current_replicas: load.replicas,
            computed_replicas: computed,
            chosen_replicas: chosen,
            action,
        };
        self.store
            .append_scaling_decision(&mut decision, self.settings.decision_history)?;
        Ok(Some(decision))
    }

    fn evaluate(&mut self, policy: &ScalingPolicy, load: WorkloadLoad, computed: u32, now: u64) -> Plan {
        let current = load.replicas;
        if computed == current {
            self.scale_state.pending = None;
            return Plan::Keep(ScalingAction::NoChange);
        }

        // Out-of-bounds counts are corrected without waiting.
        if current < policy.min_replicas || current > policy.max_replicas {
            debug!(workload = %self.workload, current, computed, "replicas outside policy bounds");
            return Plan::ScaleTo(computed);
        }

        let direction = if computed > current {
            Direction::Up
        } else {
            Direction::Down
        };

        if direction == Direction::Down
            && let Some(scaled_up) = self.scale_state.last_scale_up
        {
            let cooldown = self.settings.cooldown.as_secs();
            let elapsed = now.saturating_sub(scaled_up);
            if elapsed < cooldown {
                self.scale_state.pending = None;
                return Plan::Keep(ScalingAction::Hold(HoldReason::Cooldown {
                    remaining_secs: cooldown - elapsed,
                }));
            }
        }

        let streak = match self.scale_state.pending {
            Some((pending, streak)) if pending == direction => streak + 1,
            _ => 1,
        };
        self.scale_state.pending = Some((direction, streak));

        let required = self.settings.stabilization_ticks.max(MIN_STABILIZATION_TICKS);
        if streak < required {
            debug!(workload = %self.workload, streak, required, computed, "change not yet stable");
            return Plan::Keep(ScalingAction::Hold(HoldReason::Stabilizing { streak, required }));
        }
        Plan::ScaleTo(computed)
    }

    /// Policy from the workload's manifest, or the configured defaults.
    /// `None` skips the tick.
    async fn policy(&self) -> Option<ScalingPolicy> {
        match self.manifests.read(&self.workload).await {
            Ok((document, _)) => Some(document.scaling.unwrap_or_else(|| self.settings.defaults.clone())),
            Err(GatewayError::NotFound(_)) => {
                debug!(workload = %self.workload, "no manifest yet, skipping tick");
                None
            }
            Err(e) => {
                warn!(workload = %self.workload, error = %e, "manifest read failed, skipping tick");
                None
            }
        }
    }

    /// Run the autoscaler loop.
    pub async fn run(&mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            workload = %self.workload,
            interval_secs = interval.as_secs(),
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(workload = %self.workload, error = %e, "failed to record scaling decision");
                    }
                }
                _ = shutdown.changed() => {
                    info!(workload = %self.workload, "autoscaler shutting down");
                    break;
                }
            }
        }
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

    fn policy(min: u32, max: u32, target: f64) -> ScalingPolicy {
        ScalingPolicy {
            min_replicas: min,
            max_replicas: max,
            target_utilization: target,
        }
    }

    #[test]
    fn proportional_scale_up() {
        assert_eq!(desired_replicas(2, 80.0, &policy(2, 5, 40.0)), 4);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(desired_replicas(3, 50.0, &policy(1, 10, 40.0)), 4);
    }

    #[test]
    fn clamps_to_max() {
        assert_eq!(desired_replicas(4, 100.0, &policy(1, 5, 20.0)), 5);
    }

    #[test]
    fn clamps_to_min() {
        assert_eq!(desired_replicas(4, 0.0, &policy(2, 10, 50.0)), 2);
    }

    #[test]
    fn scaled_to_zero_comes_back_to_min() {
        assert_eq!(desired_replicas(0, 90.0, &policy(1, 5, 50.0)), 1);
    }

    #[test]
    fn bad_inputs_keep_current_within_bounds() {
        assert_eq!(desired_replicas(3, f64::NAN, &policy(1, 5, 50.0)), 3);
        assert_eq!(desired_replicas(3, 50.0, &policy(1, 5, 0.0)), 3);
        assert_eq!(desired_replicas(9, f64::INFINITY, &policy(1, 5, 50.0)), 5);
    }

    #[test]
    fn inverted_bounds_do_not_panic() {
        assert_eq!(desired_replicas(3, 50.0, &policy(6, 4, 50.0)), 4);
    }

    #[test]
    fn result_always_within_bounds() {
        let p = policy(2, 7, 60.0);
        for current in 0..12 {
            for observed in [0.0, 10.0, 59.9, 60.0, 61.0, 120.0, 500.0] {
                let n = desired_replicas(current, observed, &p);
                assert!((2..=7).contains(&n), "{current} @ {observed} -> {n}");
            }
        }
    }

    #[test]
    fn settings_from_config() {
        let settings = AutoscalerSettings::from_config(&AutoscaleConfig::default()).unwrap();
        assert_eq!(settings.cooldown, Duration::from_secs(300));
        assert_eq!(settings.stabilization_ticks, 2);
    }

    #[test]
    fn settings_raise_single_tick_stabilization() {
        let config = AutoscaleConfig {
            stabilization_ticks: 1,
            ..Default::default()
        };
        let settings = AutoscalerSettings::from_config(&config).unwrap();
        assert_eq!(settings.stabilization_ticks, MIN_STABILIZATION_TICKS);
    }
}
