//! keel-state — embedded state store for keel.
//!
//! Backed by [redb](https://docs.rs/redb), holds everything the control
//! loops need to answer "what happened and why" after the fact:
//!
//! - the pipeline run table (one record per triggered revision)
//! - the manifest repository with full version history and
//!   compare-and-swap writes
//! - reconcile sync records and scaling decisions, both with bounded
//!   retention
//! - monotonic sequences (build numbers, artifact tags, run ids)
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{workload}:{seq:020}`) keep related records adjacent
//! and ordered.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
