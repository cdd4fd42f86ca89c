//! keel-core — shared domain types, error taxonomy, and `keel.toml` parsing.
//!
//! Every other keel crate depends on this one. It carries no I/O beyond
//! reading the config file.

pub mod config;
pub mod duration;
pub mod error;
pub mod resource;
pub mod types;

pub use config::KeelConfig;
pub use duration::parse_duration;
pub use error::{KeelError, KeelResult};
pub use resource::*;
pub use types::*;
