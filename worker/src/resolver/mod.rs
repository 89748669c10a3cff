//! Repository Resolver.
//!
//! Each ecosystem adapter lists the build descriptors published for a
//! distribution and architecture, keeps the candidates whose architecture
//! is compatible with the request, and answers package-set membership
//! queries. [`Repository::resolve`] reduces the candidates to the latest
//! version of each package and applies the requested package sets.
//!
//! Listing and catalog failures never propagate: they are logged and yield
//! an empty result so that one unavailable source cannot abort discovery.

mod debian;
mod fedora;
mod qubes;

pub use debian::DebianRepository;
pub use fedora::FedoraRepository;
pub use qubes::QubesRepository;

use crate::executor::CommandExecutor;
use crate::fetch::Fetcher;
use rebuilder_common::config::ResolvedProject;
use rebuilder_common::dist::{DistributionSpec, EcosystemKind, FULL_PACKAGE_SET};
use rebuilder_common::identity::PackageIdentity;
use rebuilder_common::task::BuildTask;
use rebuilder_common::version::compare_for_latest;
use std::collections::{BTreeMap, BTreeSet};

/// Candidate tasks keyed by package name, in listing order.
pub type Candidates = BTreeMap<String, Vec<BuildTask>>;

/// Per-ecosystem listing adapter.
pub trait Repository {
    /// Lists every compatible build descriptor of `spec`.
    fn list_candidates(&self, spec: &DistributionSpec) -> Candidates;

    /// Names in the package set `name`; empty when the catalog is
    /// unavailable.
    fn package_set(&self, spec: &DistributionSpec, name: &str) -> BTreeSet<String>;

    /// Latest candidate of every package, restricted to the requested
    /// package sets unless one of them is `full`.
    fn resolve(&self, spec: &DistributionSpec) -> Vec<BuildTask> {
        let latest = latest_per_package(self.list_candidates(spec));
        let names: BTreeSet<String> = if spec.is_full() {
            BTreeSet::new()
        } else {
            spec.package_sets()
                .iter()
                .flat_map(|set| self.package_set(spec, set))
                .collect()
        };
        filter_by_package_set(latest, spec.package_sets(), &names)
    }
}

/// Version string including the epoch, as ordered by the version model.
#[must_use]
pub fn full_version(identity: &PackageIdentity) -> String {
    identity.epoch().map_or_else(
        || identity.version().to_owned(),
        |epoch| format!("{epoch}:{}", identity.version()),
    )
}

/// Keeps the greatest version of every package name.
///
/// # Examples
///
/// ```
/// use rebuilder_common::identity::PackageIdentity;
/// use rebuilder_common::task::BuildTask;
/// use rebuilder_worker::resolver::{Candidates, latest_per_package};
///
/// let task = |version: &str| {
///     let identity = PackageIdentity::new("bash", None, version, "amd64", "bullseye");
///     BuildTask::new(identity, format!("bash_{version}_amd64.buildinfo"))
/// };
/// let mut candidates = Candidates::new();
/// candidates.insert("bash".to_owned(), vec![task("5.1-2"), task("5.1-10"), task("5.0-4")]);
///
/// let latest = latest_per_package(candidates);
/// assert_eq!(latest.len(), 1);
/// assert_eq!(latest[0].identity.version(), "5.1-10");
/// ```
#[must_use]
pub fn latest_per_package(candidates: Candidates) -> Vec<BuildTask> {
    candidates
        .into_values()
        .filter_map(|tasks| {
            tasks.into_iter().max_by(|left, right| {
                compare_for_latest(&full_version(&left.identity), &full_version(&right.identity))
            })
        })
        .collect()
}

/// Restricts `latest` to `names`, the union of the requested package sets.
/// Everything is kept when one of the sets is `full`.
#[must_use]
pub fn filter_by_package_set(
    latest: Vec<BuildTask>,
    package_sets: &[String],
    names: &BTreeSet<String>,
) -> Vec<BuildTask> {
    if package_sets.iter().any(|set| set == FULL_PACKAGE_SET) {
        return latest;
    }
    latest
        .into_iter()
        .filter(|task| names.contains(task.identity.name()))
        .collect()
}

/// Builds the adapter for the ecosystem of `spec`.
#[must_use]
pub fn for_spec<'a>(
    spec: &DistributionSpec,
    project: &ResolvedProject,
    fetcher: &'a dyn Fetcher,
    executor: &'a dyn CommandExecutor,
) -> Box<dyn Repository + 'a> {
    match spec.ecosystem().kind() {
        EcosystemKind::Debian => Box::new(DebianRepository::new(fetcher, project)),
        EcosystemKind::Fedora => Box::new(FedoraRepository::new(fetcher, project)),
        EcosystemKind::QubesDebian | EcosystemKind::QubesFedora => {
            Box::new(QubesRepository::new(executor, fetcher, project))
        }
    }
}

/// Splits a line-oriented catalog into trimmed, non-empty, unique names.
pub(crate) fn parse_name_list(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Appends a task to its package's candidate list.
pub(crate) fn push_candidate(candidates: &mut Candidates, task: BuildTask) {
    candidates
        .entry(task.identity.name().to_owned())
        .or_default()
        .push(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn task(name: &str, epoch: Option<u32>, version: &str) -> BuildTask {
        let identity = PackageIdentity::new(name, epoch, version, "amd64", "bullseye");
        BuildTask::new(identity, format!("{name}_{version}_amd64.buildinfo"))
    }

    fn candidates(tasks: Vec<BuildTask>) -> Candidates {
        let mut out = Candidates::new();
        for task in tasks {
            push_candidate(&mut out, task);
        }
        out
    }

    #[rstest]
    #[case::numeric(vec!["1.9-1", "1.10-1"], "1.10-1")]
    #[case::tilde(vec!["2.0~rc1-1", "2.0-1"], "2.0-1")]
    #[case::revision(vec!["5.1-2", "5.1-2+b3", "5.1-2+b1"], "5.1-2+b3")]
    fn latest_is_the_greatest_version(#[case] versions: Vec<&str>, #[case] expected: &str) {
        let tasks = versions.into_iter().map(|v| task("bash", None, v)).collect();
        let latest = latest_per_package(candidates(tasks));
        assert_eq!(latest.len(), 1);
        assert_eq!(latest.first().map(|t| t.identity.version()), Some(expected));
    }

    #[rstest]
    fn epoch_outranks_version() {
        let latest = latest_per_package(candidates(vec![
            task("apt", None, "9.0"),
            task("apt", Some(1), "2.2.4"),
        ]));
        assert_eq!(latest.first().and_then(|t| t.identity.epoch()), Some(1));
    }

    #[rstest]
    fn equal_versions_break_ties_lexically() {
        let latest = latest_per_package(candidates(vec![
            task("zlib", None, "1.2.11.dfsg-2"),
            task("zlib", None, "1.2.11.dfsg-02"),
        ]));
        assert_eq!(latest.first().map(|t| t.identity.version()), Some("1.2.11.dfsg-2"));
    }

    #[rstest]
    fn one_entry_per_name() {
        let latest = latest_per_package(candidates(vec![
            task("bash", None, "5.1-2"),
            task("dash", None, "0.5.11"),
            task("bash", None, "5.1-3"),
        ]));
        let names: Vec<_> = latest.iter().map(|t| t.identity.name().to_owned()).collect();
        assert_eq!(names, ["bash", "dash"]);
    }

    #[rstest]
    #[case::full(&[FULL_PACKAGE_SET], 2)]
    #[case::essential(&["essential"], 1)]
    #[case::full_among_others(&["essential", FULL_PACKAGE_SET], 2)]
    fn package_sets_filter_by_name(#[case] sets: &[&str], #[case] expected: usize) {
        let latest = vec![task("bash", None, "5.1-2"), task("vim", None, "8.2")];
        let sets: Vec<String> = sets.iter().map(|set| (*set).to_owned()).collect();
        let names = parse_name_list(" bash \n\ncoreutils\nbash\n");
        assert_eq!(names.len(), 2);
        assert_eq!(filter_by_package_set(latest, &sets, &names).len(), expected);
    }

    struct FixedRepository;

    impl Repository for FixedRepository {
        fn list_candidates(&self, _spec: &DistributionSpec) -> Candidates {
            candidates(vec![
                task("bash", None, "5.1-2"),
                task("bash", None, "5.1-3"),
                task("dash", None, "0.5.11"),
                task("vim", None, "8.2"),
            ])
        }

        fn package_set(&self, _spec: &DistributionSpec, name: &str) -> BTreeSet<String> {
            match name {
                "essential" => parse_name_list("bash\n"),
                "build_essential" => parse_name_list("dash\nmake\n"),
                _ => BTreeSet::new(),
            }
        }
    }

    #[rstest]
    #[case::union("bullseye+essential+build_essential.amd64", &["bash", "dash"])]
    #[case::single("bullseye+essential.amd64", &["bash"])]
    #[case::full("bullseye.amd64", &["bash", "dash", "vim"])]
    fn resolve_keeps_latest_members_of_requested_sets(
        #[case] dist: &str,
        #[case] expected: &[&str],
    ) {
        let spec = DistributionSpec::parse(dist).expect("valid dist");
        let resolved = FixedRepository.resolve(&spec);
        let names: Vec<&str> = resolved.iter().map(|t| t.identity.name()).collect();
        assert_eq!(names, expected);
        let bash = resolved.iter().find(|t| t.identity.name() == "bash");
        assert_eq!(bash.map(|t| t.identity.version()), Some("5.1-3"));
    }
}
