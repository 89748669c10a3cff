//! Canonical package identity.
//!
//! A [`PackageIdentity`] is derived once from a resolved build descriptor and
//! never mutated. Its canonical string `[epoch:]name-version.arch` is the
//! deduplication key used by the record store and the queue guards, so
//! equality and hashing are defined on that string alone. Version strings
//! are compared verbatim; semantically equal spellings stay distinct.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Immutable identity of one package build.
///
/// # Examples
///
/// ```
/// use rebuilder_common::identity::PackageIdentity;
///
/// let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
/// assert_eq!(identity.canonical(), "bash-5.1-2+b3.amd64");
///
/// let with_epoch = PackageIdentity::new("apt", Some(1), "2.2.4", "amd64", "bullseye");
/// assert_eq!(with_epoch.to_string(), "1:apt-2.2.4.amd64");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageIdentity {
    name: String,
    #[serde(default)]
    epoch: Option<u32>,
    version: String,
    arch: String,
    distribution: String,
}

impl PackageIdentity {
    /// Creates an identity. An epoch of zero is normalised to `None`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        epoch: Option<u32>,
        version: impl Into<String>,
        arch: impl Into<String>,
        distribution: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            epoch: epoch.filter(|value| *value != 0),
            version: version.into(),
            arch: arch.into(),
            distribution: distribution.into(),
        }
    }

    /// Source package name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Epoch, when non-zero.
    #[must_use]
    pub const fn epoch(&self) -> Option<u32> {
        self.epoch
    }

    /// Version without epoch.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Build architecture.
    #[must_use]
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Distribution name, e.g. `bullseye` or `qubes-4.1-vm-bullseye`.
    #[must_use]
    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    /// Returns the canonical `[epoch:]name-version.arch` string.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self.epoch {
            Some(epoch) => format!("{epoch}:{}-{}.{}", self.name, self.version, self.arch),
            None => format!("{}-{}.{}", self.name, self.version, self.arch),
        }
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl PartialEq for PackageIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for PackageIdentity {}

impl Hash for PackageIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;

    #[rstest]
    fn equality_ignores_distribution() {
        let a = PackageIdentity::new("bash", None, "5.1-2", "amd64", "bullseye");
        let b = PackageIdentity::new("bash", None, "5.1-2", "amd64", "unstable");
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[rstest]
    fn semantically_equal_versions_stay_distinct() {
        let a = PackageIdentity::new("zlib", None, "1.01", "amd64", "sid");
        let b = PackageIdentity::new("zlib", None, "1.1", "amd64", "sid");
        assert_ne!(a, b);
    }

    #[rstest]
    fn zero_epoch_is_dropped() {
        let identity = PackageIdentity::new("apt", Some(0), "2.2.4", "amd64", "sid");
        assert_eq!(identity.epoch(), None);
        assert_eq!(identity.canonical(), "apt-2.2.4.amd64");
    }
}
