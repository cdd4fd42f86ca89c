//! keel-gateway — narrow interfaces to the systems keel coordinates.
//!
//! The pipeline engine, reconciler and autoscaler never talk to a
//! registry, scanner, git host or cluster directly. They hold trait
//! objects from this crate, so backing implementations are
//! interchangeable:
//!
//! ```text
//! ArtifactStore       push / exists / abort_push     fs::FsArtifactStore, memory
//! ScannerGateway      scan(target) → ScanReport      command::CommandScanner, memory
//! ManifestRepository  read / write(expected_version) manifests::StoreManifests
//! Platform            observe / apply / delete /     command::CommandPlatform, memory
//!                     health / set_replicas / load
//! Toolchain           run(task, revision)            command::CommandToolchain, memory
//! ```
//!
//! `memory` holds in-process implementations with fault injection for
//! tests.

pub mod command;
pub mod error;
pub mod fs;
pub mod manifests;
pub mod memory;
pub mod traits;

pub use error::{GatewayError, GatewayResult};
pub use traits::*;
