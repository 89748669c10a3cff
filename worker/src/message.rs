//! Typed messages exchanged between pipeline stages.

use clap::ValueEnum;
use rebuilder_common::task::BuildTask;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages; each owns one queue.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Resolve a distribution and submit packages needing a rebuild.
    Discover,
    /// Run the rebuild engine for one package.
    Rebuild,
    /// Sign provenance links for the rebuilt products.
    Attest,
    /// Move logs into durable storage and record the result.
    Report,
    /// Transfer durable trees to the remote mirror.
    Publish,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Self; 5] = [
        Self::Discover,
        Self::Rebuild,
        Self::Attest,
        Self::Report,
        Self::Publish,
    ];

    /// Lowercase stage name, also used as the queue name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Rebuild => "rebuild",
            Self::Attest => "attest",
            Self::Report => "report",
            Self::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work item for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageMessage {
    /// Discover packages of a dist string.
    Discover {
        /// Dist string, e.g. `bullseye+essential.amd64`.
        dist: String,
        /// Resubmit packages whose record says `failure`.
        #[serde(default)]
        force_retry: bool,
    },
    /// Rebuild one package.
    Rebuild {
        /// Task to rebuild.
        task: BuildTask,
    },
    /// Attest the products of a rebuild.
    Attest {
        /// Rebuilt task.
        task: BuildTask,
    },
    /// Record the outcome of an attempt.
    Report {
        /// Task to report.
        task: BuildTask,
    },
    /// Publish durable trees.
    Publish {
        /// Task whose outcome triggered the publish, if any.
        #[serde(default)]
        task: Option<BuildTask>,
        /// Project to publish when no task is given.
        #[serde(default)]
        project: Option<String>,
        /// Also transfer rendered results.
        #[serde(default)]
        upload_results: bool,
    },
}

impl StageMessage {
    /// Stage that consumes this message.
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Discover { .. } => Stage::Discover,
            Self::Rebuild { .. } => Stage::Rebuild,
            Self::Attest { .. } => Stage::Attest,
            Self::Report { .. } => Stage::Report,
            Self::Publish { .. } => Stage::Publish,
        }
    }

    /// Task carried by the message, if any.
    #[must_use]
    pub const fn task(&self) -> Option<&BuildTask> {
        match self {
            Self::Rebuild { task } | Self::Attest { task } | Self::Report { task } => Some(task),
            Self::Publish { task, .. } => task.as_ref(),
            Self::Discover { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuilder_common::identity::PackageIdentity;
    use rstest::rstest;

    #[rstest]
    fn messages_are_tagged_by_stage() {
        let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "unstable");
        let message = StageMessage::Rebuild {
            task: BuildTask::new(identity, "https://example.test/bash.buildinfo"),
        };
        let value = serde_json::to_value(&message).expect("serialise");
        assert_eq!(value["stage"], "rebuild");
        assert_eq!(value["task"]["name"], "bash");

        let back: StageMessage = serde_json::from_value(value).expect("deserialise");
        assert_eq!(back.stage(), Stage::Rebuild);
    }

    #[rstest]
    fn discover_defaults_force_retry() {
        let back: StageMessage =
            serde_json::from_str(r#"{"stage":"discover","dist":"unstable.amd64"}"#)
                .expect("deserialise");
        assert_eq!(
            back,
            StageMessage::Discover {
                dist: "unstable.amd64".to_owned(),
                force_retry: false,
            }
        );
    }
}
