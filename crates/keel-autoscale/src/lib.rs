//! keel-autoscale — metrics-driven replica scaling.
//!
//! One [`Autoscaler`] per workload reads the observed utilization from the
//! platform, compares it with the workload's scaling policy and adjusts
//! the replica count. Every tick that gets a metric is recorded as a
//! `ScalingDecision`, whether or not anything changed.
//!
//! # Scaling Algorithm
//!
//! ```text
//! computed = ceil(current_replicas * observed / target)
//! computed = clamp(computed, min_replicas, max_replicas)
//!
//! computed == current                         → NoChange
//! current outside [min, max]                  → ScaleTo(computed) now
//! scale-down within cooldown of last scale-up → Hold(Cooldown)
//! same direction for < stabilization_ticks    → Hold(Stabilizing)
//! otherwise                                   → ScaleTo(computed)
//! ```
//!
//! A failed metric query skips the tick; bounds and streaks are kept.

pub mod scaler;

pub use scaler::{Autoscaler, AutoscalerSettings, desired_replicas};
