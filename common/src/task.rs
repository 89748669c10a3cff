//! Build tasks flowing through the pipeline.
//!
//! A [`BuildTask`] extends a [`PackageIdentity`] with the mutable state each
//! stage fills in: descriptor locators, status, attestation paths, produced
//! files, log paths and the retry counter.

use crate::identity::PackageIdentity;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a build task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    /// Discovered, not yet rebuilt.
    #[default]
    Pending,
    /// Rebuild in progress.
    Running,
    /// Rebuild matched the distributed artifacts.
    Reproducible,
    /// Rebuild differed from the distributed artifacts.
    Unreproducible,
    /// Rebuild failed and retries are exhausted.
    Failure,
    /// Rebuild failed and a retry is scheduled.
    Retry,
}

impl BuildStatus {
    /// All statuses in display order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Running,
        Self::Reproducible,
        Self::Unreproducible,
        Self::Failure,
        Self::Retry,
    ];

    /// Lowercase name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Reproducible => "reproducible",
            Self::Unreproducible => "unreproducible",
            Self::Failure => "failure",
            Self::Retry => "retry",
        }
    }

    /// Returns `true` for statuses that end a package lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Reproducible | Self::Unreproducible | Self::Failure)
    }

    /// Returns `true` when the rebuild produced output worth attesting.
    #[must_use]
    pub const fn is_attestable(self) -> bool {
        matches!(self, Self::Reproducible | Self::Unreproducible)
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown build status: {value}"))
    }
}

/// Outcome class used to split products and signing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReproducibilityClass {
    /// Rebuilt products identical to the reference.
    Reproducible,
    /// Rebuilt products that differ from the reference.
    Unreproducible,
}

impl ReproducibilityClass {
    /// Both classes, reproducible first.
    pub const ALL: [Self; 2] = [Self::Reproducible, Self::Unreproducible];

    /// Lowercase name of the class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reproducible => "reproducible",
            Self::Unreproducible => "unreproducible",
        }
    }

    /// Attestation tree below the distribution directory.
    #[must_use]
    pub const fn sources_dir(self) -> &'static str {
        match self {
            Self::Reproducible => "sources",
            Self::Unreproducible => "unreproducible/sources",
        }
    }
}

/// Build-descriptor locators of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRefs {
    /// Locator of the distributed build descriptor the rebuild starts from.
    pub old: String,
    /// Path of the descriptor produced by the rebuild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Utf8PathBuf>,
}

/// Final merged attestation per class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRefs {
    /// Link covering the reproducible products.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reproducible: Option<Utf8PathBuf>,
    /// Link covering the unreproducible products.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreproducible: Option<Utf8PathBuf>,
}

impl MetadataRefs {
    /// Returns the link recorded for `class`.
    #[must_use]
    pub const fn get(&self, class: ReproducibilityClass) -> Option<&Utf8PathBuf> {
        match class {
            ReproducibilityClass::Reproducible => self.reproducible.as_ref(),
            ReproducibilityClass::Unreproducible => self.unreproducible.as_ref(),
        }
    }

    /// Records the link for `class`.
    pub fn set(&mut self, class: ReproducibilityClass, path: Utf8PathBuf) {
        match class {
            ReproducibilityClass::Reproducible => self.reproducible = Some(path),
            ReproducibilityClass::Unreproducible => self.unreproducible = Some(path),
        }
    }
}

/// Binary package names attributed to each class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedFiles {
    /// Binaries whose rebuilt artifacts matched.
    #[serde(default)]
    pub reproducible: Vec<String>,
    /// Binaries whose rebuilt artifacts differed.
    #[serde(default)]
    pub unreproducible: Vec<String>,
}

impl ProducedFiles {
    /// Returns the binaries attributed to `class`.
    #[must_use]
    pub fn get(&self, class: ReproducibilityClass) -> &[String] {
        match class {
            ReproducibilityClass::Reproducible => &self.reproducible,
            ReproducibilityClass::Unreproducible => &self.unreproducible,
        }
    }

    /// Replaces the binaries attributed to `class`.
    pub fn set(&mut self, class: ReproducibilityClass, binaries: Vec<String>) {
        match class {
            ReproducibilityClass::Reproducible => self.reproducible = binaries,
            ReproducibilityClass::Unreproducible => self.unreproducible = binaries,
        }
    }
}

/// Mutable pipeline state of one package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTask {
    /// Identity of the package being rebuilt.
    #[serde(flatten)]
    pub identity: PackageIdentity,
    /// Descriptor locators.
    #[serde(rename = "buildinfos")]
    pub descriptors: DescriptorRefs,
    /// Current status.
    #[serde(default)]
    pub status: BuildStatus,
    /// Merged attestation per class.
    #[serde(default)]
    pub metadata: MetadataRefs,
    /// Binaries per class.
    #[serde(default)]
    pub files: ProducedFiles,
    /// Durable (after Report) or per-attempt (before Report) log path.
    #[serde(default)]
    pub log: Option<Utf8PathBuf>,
    /// Diff report for unreproducible rebuilds.
    #[serde(default)]
    pub diffoscope: Option<Utf8PathBuf>,
    /// Ephemeral artifacts directory, present while build output is held.
    #[serde(default)]
    pub artifacts: Option<Utf8PathBuf>,
    /// Number of retries consumed so far.
    #[serde(default)]
    pub retries: u32,
}

impl BuildTask {
    /// Creates a pending task for a resolved descriptor.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebuilder_common::identity::PackageIdentity;
    /// use rebuilder_common::task::{BuildStatus, BuildTask};
    ///
    /// let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "unstable");
    /// let task = BuildTask::new(identity, "https://example.test/bash_5.1-2+b3_amd64.buildinfo");
    /// assert_eq!(task.status, BuildStatus::Pending);
    /// assert_eq!(task.retries, 0);
    /// ```
    #[must_use]
    pub fn new(identity: PackageIdentity, old_descriptor: impl Into<String>) -> Self {
        Self {
            identity,
            descriptors: DescriptorRefs {
                old: old_descriptor.into(),
                new: None,
            },
            status: BuildStatus::Pending,
            metadata: MetadataRefs::default(),
            files: ProducedFiles::default(),
            log: None,
            diffoscope: None,
            artifacts: None,
            retries: 0,
        }
    }

    /// Canonical string of the task's identity.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.identity.canonical()
    }

    /// Deep equality of the full payload, distribution included.
    ///
    /// Identity equality only looks at the canonical string; queue guards
    /// use this stricter comparison so that stale retries are recognised.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        self.identity.distribution() == other.identity.distribution() && self == other
    }
}

impl fmt::Display for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.identity, self.status)
    }
}
