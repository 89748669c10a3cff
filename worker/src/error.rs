//! Error types for the pipeline workers.
//!
//! Each stage fails with a [`PipelineError`] naming the stage, the underlying
//! [`StageError`] and, when the failure happened after a package entered the
//! pipeline, the partially populated task. The dispatcher reads the task out
//! of the error to route failed packages to Report.

use crate::fetch::FetchError;
use crate::message::Stage;
use camino::Utf8PathBuf;
use rebuilder_common::error::{ConfigError, IdentityError};
use rebuilder_common::task::BuildTask;
use thiserror::Error;

/// Failure causes raised by the pipeline stages.
#[derive(Debug, Error)]
pub enum StageError {
    /// A dist string or distribution name could not be parsed.
    #[error(transparent)]
    DistributionParse(#[from] IdentityError),

    /// An upstream listing or catalog could not be fetched.
    #[error("repository fetch failed for {source_url}: {reason}")]
    RepositoryFetch {
        /// The listing that failed.
        source_url: String,
        /// Description of the failure.
        reason: String,
    },

    /// The rebuild engine failed or did not produce the expected output.
    #[error("build failed for {package}: {reason}")]
    BuildFailure {
        /// Canonical string of the package.
        package: String,
        /// Description of the failure.
        reason: String,
    },

    /// Attestation could not be produced.
    #[error("attestation failed for {package}: {reason}")]
    Attestation {
        /// Canonical string of the package, or the link file concerned.
        package: String,
        /// Description of the failure.
        reason: String,
    },

    /// A durable file could not be relocated.
    #[error("report failed for {package}: expected file {path} is missing")]
    Report {
        /// Canonical string of the package.
        package: String,
        /// The missing file.
        path: Utf8PathBuf,
    },

    /// Publishing to the remote mirror failed.
    #[error("publish failed: {reason}")]
    Publish {
        /// Description of the failure.
        reason: String,
    },

    /// The record store could not be read or written.
    #[error("record store error: {reason}")]
    Store {
        /// Description of the failure.
        reason: String,
    },

    /// The task queue could not be read or written.
    #[error("task queue error: {reason}")]
    Queue {
        /// Description of the failure.
        reason: String,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Test stub received an unexpected or mismatched command invocation.
    #[cfg(any(test, feature = "test-support"))]
    #[error("stub mismatch: {message}")]
    StubMismatch {
        /// Description of what was expected versus what was received.
        message: String,
    },
}

impl StageError {
    /// Returns `true` when the failure is worth retrying.
    ///
    /// Parse and publish failures need an operator and are never retried.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebuilder_worker::error::StageError;
    ///
    /// let transient = StageError::Attestation {
    ///     package: "bash-5.1-2+b3.amd64".to_owned(),
    ///     reason: "link missing".to_owned(),
    /// };
    /// assert!(transient.is_retryable());
    ///
    /// let fatal = StageError::Publish { reason: "no SSH key".to_owned() };
    /// assert!(!fatal.is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::DistributionParse(_) | Self::Publish { .. } => false,
            #[cfg(any(test, feature = "test-support"))]
            Self::StubMismatch { .. } => false,
            Self::RepositoryFetch { .. }
            | Self::BuildFailure { .. }
            | Self::Attestation { .. }
            | Self::Report { .. }
            | Self::Store { .. }
            | Self::Queue { .. }
            | Self::Io(_) => true,
        }
    }

    pub(crate) fn repository_fetch(source_url: &str, reason: impl ToString) -> Self {
        Self::RepositoryFetch {
            source_url: source_url.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn store(reason: impl ToString) -> Self {
        Self::Store {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn queue(reason: impl ToString) -> Self {
        Self::Queue {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn build(task: &BuildTask, reason: impl Into<String>) -> Self {
        Self::BuildFailure {
            package: task.canonical(),
            reason: reason.into(),
        }
    }

    pub(crate) fn attestation(task: &BuildTask, reason: impl Into<String>) -> Self {
        Self::Attestation {
            package: task.canonical(),
            reason: reason.into(),
        }
    }
}

impl From<FetchError> for StageError {
    fn from(err: FetchError) -> Self {
        Self::repository_fetch(err.url(), &err)
    }
}

/// A stage failure, carrying the partial task when one exists.
#[derive(Debug, Error)]
#[error("{stage} stage failed: {cause}")]
pub struct PipelineError {
    /// Stage that failed.
    pub stage: Stage,
    /// Partially populated task, so the failure can still be reported.
    pub task: Option<Box<BuildTask>>,
    /// Underlying cause.
    #[source]
    pub cause: StageError,
}

impl PipelineError {
    /// Creates an error without task state.
    #[must_use]
    pub const fn new(stage: Stage, cause: StageError) -> Self {
        Self {
            stage,
            task: None,
            cause,
        }
    }

    /// Attaches the partial task.
    #[must_use]
    pub fn with_task(mut self, task: BuildTask) -> Self {
        self.task = Some(Box::new(task));
        self
    }

    /// Returns `true` when the cause is worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.cause.is_retryable()
    }
}

/// Result type for worker operations.
pub type Result<T, E = StageError> = std::result::Result<T, E>;

/// Failures of the `rebuilder` command line.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A dist string given on the command line is malformed.
    #[error(transparent)]
    Distribution(#[from] IdentityError),

    /// The record store or the queues could not be used.
    #[error(transparent)]
    Stage(#[from] StageError),

    /// Records could not be serialised.
    #[error("cannot serialise records: {0}")]
    Json(#[from] serde_json::Error),

    /// Output could not be written.
    #[error("cannot write output: {0}")]
    Output(#[from] std::io::Error),
}
