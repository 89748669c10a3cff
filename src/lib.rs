//! Build reproducibility verifier for Debian, Fedora and Qubes OS packages.
//!
//! This crate gathers the data model of `rebuilder-common` and the pipeline
//! of `rebuilder-worker` behind one dependency, and resolves the
//! configuration file the way the `rebuilder` binary does.

pub mod config;

pub use config::{load_config, load_config_with};
pub use rebuilder_common::{
    BuildRecord, BuildStatus, BuildTask, Config, ConfigError, DistributionSpec, Ecosystem,
    PackageIdentity, Project, ReproducibilityClass,
};
pub use rebuilder_worker::dispatcher::Dispatcher;
pub use rebuilder_worker::error::{PipelineError, StageError};
pub use rebuilder_worker::message::{Stage, StageMessage};
pub use rebuilder_worker::stages::PipelineContext;
