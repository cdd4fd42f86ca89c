//! Autoscaler ticks against the in-memory platform.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use keel_core::config::AutoscaleConfig;
use keel_core::{ArtifactRef, ManifestDocument, Resource, ResourceKey, ScalingPolicy};
use keel_gateway::manifests::StoreManifests;
use keel_gateway::memory::MemoryPlatform;
use keel_autoscale::{Autoscaler, AutoscalerSettings};
use keel_state::{HoldReason, ScalingAction, StateStore};

fn manifest(scaling: Option<ScalingPolicy>) -> ManifestDocument {
    ManifestDocument {
        workload: "api".to_string(),
        artifact: ArtifactRef::new("api", "v1-abc1234"),
        scaling,
        resources: Vec::new(),
    }
}

fn policy() -> ScalingPolicy {
    ScalingPolicy {
        min_replicas: 2,
        max_replicas: 5,
        target_utilization: 40.0,
    }
}

fn settings(stabilization_ticks: u32) -> AutoscalerSettings {
    AutoscalerSettings {
        cooldown: Duration::from_secs(300),
        stabilization_ticks,
        decision_history: 100,
        defaults: ScalingPolicy::default(),
    }
}

struct Harness {
    store: StateStore,
    platform: Arc<MemoryPlatform>,
    scaler: Autoscaler,
}

fn harness_with(scaling: Option<ScalingPolicy>, settings: AutoscalerSettings, replicas: u32) -> Harness {
    let store = StateStore::open_in_memory().unwrap();
    store
        .compare_and_swap_manifest(&manifest(scaling), 0, "seed", 0)
        .unwrap();
    let platform = Arc::new(MemoryPlatform::new());
    platform.insert_live(Resource::new(
        ResourceKey::new("Deployment", "prod", "api"),
        json!({ "replicas": replicas }),
    ));
    let scaler = Autoscaler::new(
        "api",
        settings,
        Arc::new(StoreManifests::new(store.clone())),
        platform.clone(),
        store.clone(),
    );
    Harness {
        store,
        platform,
        scaler,
    }
}

fn harness() -> Harness {
    harness_with(Some(policy()), settings(2), 2)
}

#[tokio::test]
async fn sustained_load_scales_after_two_ticks() {
    let mut h = harness();
    h.platform.set_load("api", 80.0);

    let first = h.scaler.tick_at(100).await.unwrap().unwrap();
    assert_eq!(first.computed_replicas, 4);
    assert_eq!(first.chosen_replicas, 2);
    assert_eq!(
        first.action,
        ScalingAction::Hold(HoldReason::Stabilizing {
            streak: 1,
            required: 2
        })
    );
    assert_eq!(h.platform.replicas("api"), Some(2));

    let second = h.scaler.tick_at(130).await.unwrap().unwrap();
    assert_eq!(second.action, ScalingAction::Scaled { from: 2, to: 4 });
    assert_eq!(second.chosen_replicas, 4);
    assert_eq!(h.platform.replicas("api"), Some(4));
}

#[tokio::test]
async fn single_spike_does_not_scale() {
    let mut h = harness();
    h.platform.set_load("api", 80.0);
    h.scaler.tick_at(100).await.unwrap();

    h.platform.set_load("api", 40.0);
    let settled = h.scaler.tick_at(130).await.unwrap().unwrap();
    assert_eq!(settled.action, ScalingAction::NoChange);

    h.platform.set_load("api", 80.0);
    let spike = h.scaler.tick_at(160).await.unwrap().unwrap();
    assert!(matches!(
        spike.action,
        ScalingAction::Hold(HoldReason::Stabilizing { streak: 1, .. })
    ));
    assert!(h.platform.replica_changes().is_empty());
}

#[tokio::test]
async fn direction_flip_restarts_stabilization() {
    let mut h = harness_with(Some(policy()), settings(2), 3);
    h.platform.set_load("api", 80.0);
    h.scaler.tick_at(100).await.unwrap();

    h.platform.set_load("api", 10.0);
    let down = h.scaler.tick_at(130).await.unwrap().unwrap();
    assert_eq!(
        down.action,
        ScalingAction::Hold(HoldReason::Stabilizing {
            streak: 1,
            required: 2
        })
    );
    assert!(h.platform.replica_changes().is_empty());
}

#[tokio::test]
async fn single_tick_stabilization_is_raised_to_two() {
    for ticks in [0, 1] {
        let mut h = harness_with(Some(policy()), settings(ticks), 2);
        h.platform.set_load("api", 80.0);

        let first = h.scaler.tick_at(100).await.unwrap().unwrap();
        assert_eq!(
            first.action,
            ScalingAction::Hold(HoldReason::Stabilizing {
                streak: 1,
                required: 2
            })
        );
        assert!(h.platform.replica_changes().is_empty());

        let second = h.scaler.tick_at(130).await.unwrap().unwrap();
        assert_eq!(second.action, ScalingAction::Scaled { from: 2, to: 4 });
    }
}

#[tokio::test]
async fn cooldown_blocks_scale_down_after_scale_up() {
    let mut h = harness();
    h.platform.set_load("api", 80.0);
    h.scaler.tick_at(100).await.unwrap();
    let up = h.scaler.tick_at(130).await.unwrap().unwrap();
    assert_eq!(up.action, ScalingAction::Scaled { from: 2, to: 4 });

    h.platform.set_load("api", 10.0);
    let held = h.scaler.tick_at(230).await.unwrap().unwrap();
    assert_eq!(held.computed_replicas, 2);
    assert_eq!(
        held.action,
        ScalingAction::Hold(HoldReason::Cooldown {
            remaining_secs: 200
        })
    );
    assert_eq!(h.platform.replicas("api"), Some(4));

    // Past the window the scale-down still has to stabilize.
    let first = h.scaler.tick_at(430).await.unwrap().unwrap();
    assert!(matches!(
        first.action,
        ScalingAction::Hold(HoldReason::Stabilizing { streak: 1, .. })
    ));
    let down = h.scaler.tick_at(460).await.unwrap().unwrap();
    assert_eq!(down.action, ScalingAction::Scaled { from: 4, to: 2 });
}

#[tokio::test]
async fn cooldown_does_not_block_further_scale_up() {
    let mut h = harness();
    h.platform.set_load("api", 60.0);
    h.scaler.tick_at(100).await.unwrap();
    h.scaler.tick_at(110).await.unwrap();
    assert_eq!(h.platform.replicas("api"), Some(3));

    h.scaler.tick_at(120).await.unwrap();
    let again = h.scaler.tick_at(130).await.unwrap().unwrap();
    assert_eq!(again.action, ScalingAction::Scaled { from: 3, to: 5 });
}

#[tokio::test]
async fn computed_count_is_clamped() {
    let mut h = harness();
    h.platform.set_load("api", 400.0);
    let first = h.scaler.tick_at(100).await.unwrap().unwrap();
    assert_eq!(first.computed_replicas, 5);
    h.scaler.tick_at(130).await.unwrap();
    assert_eq!(h.platform.replicas("api"), Some(5));
}

#[tokio::test]
async fn out_of_bounds_replicas_are_corrected_immediately() {
    let mut h = harness_with(Some(policy()), settings(2), 8);
    h.platform.set_load("api", 40.0);

    let decision = h.scaler.tick_at(100).await.unwrap().unwrap();
    assert_eq!(decision.action, ScalingAction::Scaled { from: 8, to: 5 });
}

#[tokio::test]
async fn metric_failure_skips_tick() {
    let mut h = harness();
    h.platform.set_load("api", 80.0);
    h.scaler.tick_at(100).await.unwrap();

    h.platform.set_metrics_down(true);
    assert!(h.scaler.tick_at(130).await.unwrap().is_none());
    assert_eq!(h.store.list_scaling_decisions("api", 10).unwrap().len(), 1);

    // The streak survives the skipped tick.
    h.platform.set_metrics_down(false);
    let decision = h.scaler.tick_at(160).await.unwrap().unwrap();
    assert_eq!(decision.action, ScalingAction::Scaled { from: 2, to: 4 });
}

#[tokio::test]
async fn failed_scaling_is_recorded() {
    let mut h = harness();
    h.platform.set_load("api", 80.0);
    h.platform
        .remove_live(&ResourceKey::new("Deployment", "prod", "api"));

    let decision = h.scaler.tick_at(100).await.unwrap().unwrap();
    assert!(matches!(decision.action, ScalingAction::Failed { .. }));
    assert_eq!(decision.chosen_replicas, decision.current_replicas);
}

#[tokio::test]
async fn manifest_without_policy_uses_defaults() {
    let mut h = harness_with(None, settings(2), 2);
    h.platform.set_load("api", 140.0);

    let decision = h.scaler.tick_at(100).await.unwrap().unwrap();
    assert_eq!(decision.target_metric, 70.0);
    assert_eq!(decision.computed_replicas, 4);
}

#[tokio::test]
async fn every_tick_is_recorded_and_history_is_bounded() {
    let mut settings = settings(2);
    settings.decision_history = 3;
    let mut h = harness_with(Some(policy()), settings, 2);
    h.platform.set_load("api", 40.0);

    for t in 0..5 {
        let decision = h.scaler.tick_at(100 + t * 30).await.unwrap().unwrap();
        assert_eq!(decision.action, ScalingAction::NoChange);
    }
    let decisions = h.store.list_scaling_decisions("api", 10).unwrap();
    assert_eq!(decisions.len(), 3);
    assert_eq!(decisions[0].seq, 5);
    assert_eq!(decisions[0].observed_metric, 40.0);
    assert_eq!(decisions[0].target_metric, 40.0);
}

#[tokio::test]
async fn loop_scales_until_shutdown() {
    let settings = AutoscalerSettings::from_config(&AutoscaleConfig::default()).unwrap();
    let mut h = harness_with(Some(policy()), settings, 2);
    h.platform.set_load("api", 80.0);

    let platform = h.platform.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        h.scaler.run(Duration::from_millis(5), shutdown_rx).await;
    });

    let mut scaled = false;
    for _ in 0..200 {
        if platform.replicas("api") == Some(4) {
            scaled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(scaled);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}
