//! keel-pipeline — turns a revision into a promoted artifact.
//!
//! A run walks a validated [`StageGraph`](stage::StageGraph) level by
//! level: stages whose dependencies are satisfied run concurrently, a
//! failed `required` stage skips everything downstream, and transient
//! gateway errors are retried with capped exponential backoff. The last
//! stages push the image and move the workload's manifest to it through
//! a compare-and-swap write.
//!
//! [`Dispatcher`](dispatcher::Dispatcher) serializes runs per workload and
//! applies the supersede policy (queue or cancel).

pub mod dispatcher;
pub mod engine;
pub mod gate;
pub mod retry;
pub mod stage;

pub use dispatcher::Dispatcher;
pub use engine::{Gateways, PipelineEngine};
pub use gate::{GateVerdict, QualityGate};
pub use retry::RetryPolicy;
pub use stage::{StageGraph, StageKind, StageSpec};
