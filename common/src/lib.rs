//! Package identity, distribution and configuration model for the rebuilder.
//!
//! This crate holds the leaves of the system: canonical package identities
//! and version ordering, build-descriptor filename grammars, dist strings,
//! the `BuildTask` and `BuildRecord` data model, and the TOML configuration.

pub mod buildinfo;
pub mod config;
pub mod descriptor;
pub mod dist;
pub mod error;
pub mod identity;
pub mod record;
pub mod task;
pub mod version;

pub use config::{Config, ResolvedProject, TransferConfig};
pub use dist::{DistributionSpec, Ecosystem, EcosystemKind, FULL_PACKAGE_SET, Project};
pub use error::{ConfigError, IdentityError};
pub use identity::PackageIdentity;
pub use record::{BuildRecord, record_key};
pub use task::{BuildStatus, BuildTask, ReproducibilityClass};
