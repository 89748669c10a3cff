//! Pipeline stages.
//!
//! Each stage takes one message payload, performs its blocking work and
//! pushes the payload of the next stage onto the queue. Stages never call
//! each other. Failures come back as [`PipelineError`] carrying the partial
//! task, so the dispatcher can still route the package to Report.

pub mod attest;
pub mod discover;
pub mod publish;
pub mod rebuild;
pub mod report;

pub use attest::attest;
pub use discover::discover;
pub use publish::{PublishOutcome, PublishRequest, publish};
pub use rebuild::rebuild;
pub use report::report;

use crate::engine::RebuildEngine;
use crate::error::{PipelineError, StageError};
use crate::executor::CommandExecutor;
use crate::fetch::Fetcher;
use crate::message::Stage;
use crate::queue::TaskQueue;
use crate::signer::SigningTool;
use crate::store::RecordStore;
use rebuilder_common::config::{Config, ResolvedProject};
use rebuilder_common::dist::Ecosystem;
use rebuilder_common::task::BuildTask;
use std::time::{SystemTime, UNIX_EPOCH};

/// Result type of a stage.
pub type StageResult<T> = std::result::Result<T, PipelineError>;

/// Collaborators shared by every stage.
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    /// Process configuration.
    pub config: &'a Config,
    /// Build Record Store.
    pub store: &'a dyn RecordStore,
    /// Per-stage queues.
    pub queue: &'a dyn TaskQueue,
    /// HTTP client for listings and catalogs.
    pub fetcher: &'a dyn Fetcher,
    /// Runner for external commands.
    pub executor: &'a dyn CommandExecutor,
    /// Rebuild toolchain.
    pub engine: &'a dyn RebuildEngine,
    /// Provenance signing tool.
    pub signer: &'a dyn SigningTool,
}

impl PipelineContext<'_> {
    /// Ecosystem and resolved project settings of a task.
    pub(crate) fn project_of(&self, task: &BuildTask) -> Result<(Ecosystem, ResolvedProject), StageError> {
        let ecosystem = Ecosystem::from_distribution(task.identity.distribution())?;
        let project = self.config.project(ecosystem.project());
        Ok((ecosystem, project))
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

/// Wraps a stage failure together with the task it concerns.
pub(crate) fn failed(stage: Stage, task: &BuildTask, cause: impl Into<StageError>) -> PipelineError {
    PipelineError::new(stage, cause.into()).with_task(task.clone())
}
