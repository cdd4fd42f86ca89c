//! keel-reconcile — drives live platform state toward the manifests.
//!
//! Each [`Reconciler`] owns one sync set (a group of workloads). A pass
//! renders the set's manifests into a desired resource tree, observes the
//! platform, diffs the two field by field and, when the configured
//! switches allow it, applies the difference in sync waves, prunes
//! resources it owns and verifies the result. Every pass is recorded.

pub mod diff;
pub mod reconciler;
pub mod waves;

pub use diff::{diff_trees, field_diff};
pub use reconciler::{Reconciler, ReconcilerSettings, SyncSet};
pub use waves::Waves;
