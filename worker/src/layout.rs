//! Filesystem layout of the ephemeral artifacts tree and the durable
//! per-project trees.
//!
//! ```text
//! {artifacts_dir}/{distdir}/{canonical}-{ts}.log
//! {artifacts_dir}/{distdir}/{scratch-id}/...
//! {rebuild_dir}/{project}/logs/
//! {rebuild_dir}/{project}/buildinfos/
//! {rebuild_dir}/{distdir}/sources/{name}/{version}/rebuild.{key}.{arch}.link
//! {rebuild_dir}/{distdir}/unreproducible/sources/{name}/{version}/...
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use rebuilder_common::dist::{Ecosystem, Project};
use rebuilder_common::identity::PackageIdentity;
use rebuilder_common::task::ReproducibilityClass;

/// Name of the stable pointer to the merged link.
pub const METADATA_LINK: &str = "metadata";

/// Per-attempt build output root of an ecosystem.
#[must_use]
pub fn artifacts_base(artifacts_dir: &Utf8Path, ecosystem: &Ecosystem) -> Utf8PathBuf {
    artifacts_dir.join(ecosystem.distdir())
}

/// Durable root of a project.
#[must_use]
pub fn project_root(rebuild_dir: &Utf8Path, project: Project) -> Utf8PathBuf {
    rebuild_dir.join(project.as_str())
}

/// Durable log directory of a project.
#[must_use]
pub fn logs_dir(rebuild_dir: &Utf8Path, project: Project) -> Utf8PathBuf {
    project_root(rebuild_dir, project).join("logs")
}

/// Durable build-info archive of a project.
#[must_use]
pub fn buildinfos_dir(rebuild_dir: &Utf8Path, project: Project) -> Utf8PathBuf {
    project_root(rebuild_dir, project).join("buildinfos")
}

/// Root of the attestation tree of `class`; binary symlinks live here.
#[must_use]
pub fn sources_root(
    rebuild_dir: &Utf8Path,
    ecosystem: &Ecosystem,
    class: ReproducibilityClass,
) -> Utf8PathBuf {
    rebuild_dir
        .join(ecosystem.distdir())
        .join(class.sources_dir())
}

/// Attestation directory of one package version.
#[must_use]
pub fn package_metadata_dir(sources_root: &Utf8Path, identity: &PackageIdentity) -> Utf8PathBuf {
    sources_root.join(identity.name()).join(identity.version())
}

/// Per-attempt log file name.
///
/// # Examples
///
/// ```
/// use rebuilder_common::identity::PackageIdentity;
/// use rebuilder_worker::layout::log_file_name;
///
/// let bash = PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye");
/// assert_eq!(log_file_name(&bash, 1_650_000_000), "bash-5.1-2+b3.amd64-1650000000.log");
/// ```
#[must_use]
pub fn log_file_name(identity: &PackageIdentity, timestamp: u64) -> String {
    format!("{}-{timestamp}.log", identity.canonical())
}

/// Diff report path belonging to a log: `{stem}.diffoscope.log` next to it.
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use rebuilder_worker::layout::diffoscope_path;
///
/// let log = Utf8Path::new("/rebuild/debian/logs/bash-5.1-2+b3.amd64-1650000000.log");
/// assert_eq!(
///     diffoscope_path(log),
///     "/rebuild/debian/logs/bash-5.1-2+b3.amd64-1650000000.diffoscope.log"
/// );
/// ```
#[must_use]
pub fn diffoscope_path(log: &Utf8Path) -> Utf8PathBuf {
    let stem = log.file_stem().unwrap_or_default();
    log.with_file_name(format!("{stem}.diffoscope.log"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn bash() -> PackageIdentity {
        PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye")
    }

    #[rstest]
    #[case::debian("bullseye", "debian")]
    #[case::qubes("qubes-4.1-vm-bullseye", "qubesos/deb/r4.1/vm")]
    fn artifacts_follow_distdir(#[case] distribution: &str, #[case] distdir: &str) {
        let ecosystem = Ecosystem::from_distribution(distribution).expect("known distribution");
        assert_eq!(
            artifacts_base(Utf8Path::new("/artifacts"), &ecosystem),
            Utf8Path::new("/artifacts").join(distdir)
        );
    }

    #[rstest]
    fn unreproducible_tree_is_nested(bash: PackageIdentity) {
        let ecosystem = Ecosystem::from_distribution("bullseye").expect("debian");
        let root = sources_root(
            Utf8Path::new("/rebuild"),
            &ecosystem,
            ReproducibilityClass::Unreproducible,
        );
        assert_eq!(root, "/rebuild/debian/unreproducible/sources");
        assert_eq!(
            package_metadata_dir(&root, &bash),
            "/rebuild/debian/unreproducible/sources/bash/5.1-2+b3"
        );
    }
}
