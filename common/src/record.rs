//! Durable projection of a build task.

use crate::identity::PackageIdentity;
use crate::task::{BuildStatus, BuildTask, DescriptorRefs, MetadataRefs, ProducedFiles};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content-addressed key of a package identity: hex SHA-256 of its canonical
/// string.
///
/// # Examples
///
/// ```
/// use rebuilder_common::identity::PackageIdentity;
/// use rebuilder_common::record::record_key;
///
/// let a = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
/// let b = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "unstable");
/// assert_eq!(record_key(&a), record_key(&b));
/// assert_eq!(record_key(&a).len(), 64);
/// ```
#[must_use]
pub fn record_key(identity: &PackageIdentity) -> String {
    let digest = Sha256::digest(identity.canonical().as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// What the record store keeps for one package identity.
///
/// The ephemeral artifacts directory is not part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Store key, see [`record_key`].
    pub key: String,
    /// Identity of the package.
    #[serde(flatten)]
    pub identity: PackageIdentity,
    /// Descriptor locators.
    pub buildinfos: DescriptorRefs,
    /// Last recorded status.
    pub status: BuildStatus,
    /// Merged attestation per class.
    #[serde(default)]
    pub metadata: MetadataRefs,
    /// Binaries per class.
    #[serde(default)]
    pub files: ProducedFiles,
    /// Durable log path.
    #[serde(default)]
    pub log: Option<Utf8PathBuf>,
    /// Durable diff report path.
    #[serde(default)]
    pub diffoscope: Option<Utf8PathBuf>,
    /// Retries consumed when the record was written.
    #[serde(default)]
    pub retries: u32,
}

impl BuildRecord {
    /// Projects a task onto a fresh record.
    #[must_use]
    pub fn from_task(task: &BuildTask) -> Self {
        Self {
            key: record_key(&task.identity),
            identity: task.identity.clone(),
            buildinfos: task.descriptors.clone(),
            status: task.status,
            metadata: task.metadata.clone(),
            files: task.files.clone(),
            log: task.log.clone(),
            diffoscope: task.diffoscope.clone(),
            retries: task.retries,
        }
    }

    /// Canonical string of the recorded identity.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.identity.canonical()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task() -> BuildTask {
        let identity = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
        let mut task = BuildTask::new(identity, "bash_5.1-2+b3_amd64.buildinfo");
        task.status = BuildStatus::Unreproducible;
        task.retries = 1;
        task.files.unreproducible = vec!["bash-static".to_owned()];
        task.artifacts = Some(Utf8PathBuf::from("/tmp/artifacts/bash"));
        task
    }

    #[rstest]
    fn records_copy_everything_but_the_artifacts() {
        let task = task();
        let record = BuildRecord::from_task(&task);

        assert_eq!(record.key, record_key(&task.identity));
        assert_eq!(record.status, BuildStatus::Unreproducible);
        assert_eq!(record.retries, 1);
        assert_eq!(record.files.unreproducible, ["bash-static"]);
        assert_eq!(record.canonical(), "bash-5.1-2+b3.amd64");

        let json = serde_json::to_value(&record).expect("serialise");
        assert!(json.get("artifacts").is_none());
        assert_eq!(json.get("name").and_then(|v| v.as_str()), Some("bash"));
        assert_eq!(json.get("status").and_then(|v| v.as_str()), Some("unreproducible"));
    }

    #[rstest]
    fn records_survive_serialisation() {
        let record = BuildRecord::from_task(&task());
        let text = serde_json::to_string(&record).expect("serialise");
        let back: BuildRecord = serde_json::from_str(&text).expect("deserialise");
        assert_eq!(back, record);
    }

    #[rstest]
    #[case::epoch(Some(1))]
    #[case::no_epoch(None)]
    fn keys_follow_the_canonical_string(#[case] epoch: Option<u32>) {
        let a = PackageIdentity::new("apt", epoch, "2.2.4", "amd64", "bullseye");
        let b = PackageIdentity::new("apt", epoch, "2.2.4", "arm64", "bullseye");
        assert_ne!(record_key(&a), record_key(&b));
        assert!(record_key(&a).chars().all(|c| c.is_ascii_hexdigit()));
    }
}
