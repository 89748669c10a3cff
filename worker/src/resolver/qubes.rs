//! Qubes OS repository adapter.
//!
//! The Qubes mirrors are listed over rsync. Debian templates publish
//! `.buildinfo` records below `deb/r{release}/{package_set}/`; each record is
//! fetched to learn which architecture it builds, because Qubes does not
//! distinguish `all` from `amd64` in record names. Fedora templates publish
//! build-info records or `-buildinfo` RPMs below
//! `yum/r{release}/{repo}/{package_set}/{base}/` for three repositories.

use super::{Candidates, Repository, push_candidate};
use crate::error::StageError;
use crate::executor::{CommandExecutor, CommandOptions, failure_reason};
use crate::fetch::Fetcher;
use log::{debug, warn};
use rebuilder_common::buildinfo::BuildInfo;
use rebuilder_common::config::ResolvedProject;
use rebuilder_common::descriptor::{parse_deb_descriptor, parse_rpm_descriptor};
use rebuilder_common::dist::{
    DistributionSpec, EcosystemKind, QubesRelease, debian_arch, debian_release,
};
use rebuilder_common::task::BuildTask;
use std::collections::BTreeSet;
use std::time::Duration;

const RPM_REPOSITORIES: [&str; 3] = ["current", "current-testing", "security-testing"];
const RSYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Listing adapter for the Qubes OS mirrors.
pub struct QubesRepository<'a> {
    executor: &'a dyn CommandExecutor,
    fetcher: &'a dyn Fetcher,
    rsync_baseurl: String,
    deb_baseurl: String,
    yum_baseurl: String,
}

impl<'a> QubesRepository<'a> {
    /// Creates the adapter from the project settings.
    #[must_use]
    pub fn new(
        executor: &'a dyn CommandExecutor,
        fetcher: &'a dyn Fetcher,
        project: &ResolvedProject,
    ) -> Self {
        let trim = |url: &str| url.trim_end_matches('/').to_owned();
        Self {
            executor,
            fetcher,
            rsync_baseurl: trim(&project.rsync_baseurl),
            deb_baseurl: trim(&project.deb_baseurl),
            yum_baseurl: trim(&project.yum_baseurl),
        }
    }

    /// Lists the files below an rsync URL, skipping directories.
    fn rsync_files(&self, url: &str) -> Result<Vec<String>, StageError> {
        let args = ["--list-only", "--recursive", "--exclude=all-versions", url];
        let output = self
            .executor
            .run("rsync", &args, &CommandOptions::with_timeout(RSYNC_TIMEOUT))
            .map_err(|err| StageError::repository_fetch(url, err))?;
        if !output.status.success() {
            return Err(StageError::repository_fetch(url, failure_reason(&output)));
        }
        Ok(parse_rsync_listing(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Like [`Self::rsync_files`], logging a failed listing as empty.
    fn listed_files(&self, spec: &DistributionSpec, url: &str) -> Vec<String> {
        self.rsync_files(url).unwrap_or_else(|err| {
            warn!("{spec}: listing nothing: {err}");
            Vec::new()
        })
    }

    fn debian_candidates(&self, spec: &DistributionSpec, qubes: &QubesRelease) -> Candidates {
        let mut candidates = Candidates::new();
        let Some(release) = debian_release(&qubes.base) else {
            return candidates;
        };
        let suffix = security_suffix(release);
        let arch = debian_arch(spec.arch());
        let relative = format!("r{}/{}", qubes.release, qubes.package_set);
        let url = format!("{}/deb/{relative}/", self.rsync_baseurl);

        for file in self.listed_files(spec, &url) {
            if !file.ends_with(".buildinfo") {
                continue;
            }
            let locator = format!("{}/{relative}/{file}", self.deb_baseurl);
            let parsed = match parse_deb_descriptor(&locator) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("{spec}: skipping {file}: {err}");
                    continue;
                }
            };
            let info = match self
                .fetcher
                .fetch_text(&locator)
                .map_err(|err| err.to_string())
                .and_then(|text| BuildInfo::parse(&locator, &text).map_err(|err| err.to_string()))
            {
                Ok(info) => info,
                Err(err) => {
                    debug!("{spec}: skipping {file}: {err}");
                    continue;
                }
            };
            if build_arch(&info.architectures()) != Some(arch) {
                continue;
            }
            let version = info.version().unwrap_or_default();
            if suffix.as_deref().is_some_and(|suffix| !version.contains(suffix)) {
                continue;
            }
            let identity = parsed.into_identity(arch, spec.distribution());
            push_candidate(&mut candidates, BuildTask::new(identity, locator));
        }
        candidates
    }

    fn fedora_candidates(&self, spec: &DistributionSpec, qubes: &QubesRelease) -> Candidates {
        let mut candidates = Candidates::new();
        for repo in RPM_REPOSITORIES {
            let relative = format!(
                "r{}/{repo}/{}/{}",
                qubes.release, qubes.package_set, qubes.base
            );
            let url = format!("{}/yum/{relative}/", self.rsync_baseurl);
            for file in self.listed_files(spec, &url) {
                if !is_rpm_buildinfo(&file) {
                    continue;
                }
                let locator = format!("{}/{relative}/{file}", self.yum_baseurl);
                let parsed = match parse_rpm_descriptor(&locator) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!("{spec}: skipping {file}: {err}");
                        continue;
                    }
                };
                let Some(declared) = parsed.single_arch() else {
                    continue;
                };
                if declared != "noarch" && declared != spec.arch() {
                    continue;
                }
                let identity = parsed.into_identity(spec.arch(), spec.distribution());
                push_candidate(&mut candidates, BuildTask::new(identity, locator));
            }
        }
        candidates
    }
}

impl Repository for QubesRepository<'_> {
    fn list_candidates(&self, spec: &DistributionSpec) -> Candidates {
        let ecosystem = spec.ecosystem();
        let Some(qubes) = ecosystem.qubes() else {
            return Candidates::new();
        };
        match ecosystem.kind() {
            EcosystemKind::QubesDebian => self.debian_candidates(spec, qubes),
            EcosystemKind::QubesFedora => self.fedora_candidates(spec, qubes),
            EcosystemKind::Debian | EcosystemKind::Fedora => Candidates::new(),
        }
    }

    /// Qubes publishes no package-set catalog; every set is empty.
    fn package_set(&self, spec: &DistributionSpec, name: &str) -> BTreeSet<String> {
        warn!("{spec}: Qubes OS has no package set {name}");
        BTreeSet::new()
    }
}

/// Architecture a Debian build-info record builds: `amd64` when it lists a
/// binary architecture, `all` when it only lists `all`.
fn build_arch(architectures: &[String]) -> Option<&'static str> {
    if architectures
        .iter()
        .any(|arch| arch != "source" && arch != "all")
    {
        Some("amd64")
    } else if architectures.iter().any(|arch| arch == "all") {
        Some("all")
    } else {
        None
    }
}

/// Version marker of packages built for a numbered Debian release, e.g.
/// `+deb11u`. Unnumbered releases (`sid`) carry none.
fn security_suffix(release: &str) -> Option<String> {
    release
        .chars()
        .all(|c| c.is_ascii_digit())
        .then(|| format!("+deb{release}u"))
}

fn is_rpm_buildinfo(file: &str) -> bool {
    file.ends_with(".buildinfo")
        || (file.ends_with(".rpm")
            && file
                .rsplit('/')
                .next()
                .is_some_and(|name| name.contains("-buildinfo")))
}

/// File paths of an `rsync --list-only` listing, directories excluded.
fn parse_rsync_listing(listing: &str) -> Vec<String> {
    listing
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let mode = fields.next()?;
            if mode.starts_with('d') {
                return None;
            }
            fields.last().map(str::to_owned)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ExpectedCall, FakeFetcher, StubExecutor, failure_output, stdout_output};
    use camino::Utf8Path;
    use rebuilder_common::config::Config;
    use rebuilder_common::dist::Project;
    use rstest::{fixture, rstest};

    const DEB_RSYNC: &str = "rsync://ftp.qubes-os.org/qubes-mirror/repo/deb/r4.1/vm/";
    const DEB_HTTP: &str = "https://deb.qubes-os.org/r4.1/vm";

    #[fixture]
    fn project() -> ResolvedProject {
        Config::from_toml_str(Utf8Path::new("t.toml"), "")
            .expect("config")
            .project(Project::QubesOs)
    }

    fn rsync(url: &str, listing: &str) -> ExpectedCall {
        ExpectedCall::new(
            "rsync",
            &["--list-only", "--recursive", "--exclude=all-versions", url],
            Ok(stdout_output(listing)),
        )
    }

    fn buildinfo(architecture: &str, version: &str) -> String {
        format!("Format: 1.0\nSource: qubes-core\nArchitecture: {architecture}\nVersion: {version}\n")
    }

    #[rstest]
    fn debian_records_are_filtered_by_arch_and_release(project: ResolvedProject) {
        let listing = "\
drwxr-xr-x          4,096 2021/05/01 10:00:00 dists
-rw-r--r--          1,024 2021/05/01 10:00:00 pool/main/q/qubes-core_4.1.1-1+deb11u1_amd64.buildinfo
-rw-r--r--          1,024 2021/05/01 10:00:00 pool/main/q/qubes-doc_1.0-1+deb11u1_amd64.buildinfo
-rw-r--r--          1,024 2021/05/01 10:00:00 pool/main/q/qubes-old_1.0-1+deb10u1_amd64.buildinfo
-rw-r--r--          1,024 2021/05/01 10:00:00 pool/main/q/qubes-core_4.1.1-1+deb11u1_amd64.deb
";
        let executor = StubExecutor::new(vec![rsync(DEB_RSYNC, listing)]);
        let fetcher = FakeFetcher::new()
            .with_document(
                format!("{DEB_HTTP}/pool/main/q/qubes-core_4.1.1-1+deb11u1_amd64.buildinfo"),
                buildinfo("source amd64", "4.1.1-1+deb11u1"),
            )
            .with_document(
                format!("{DEB_HTTP}/pool/main/q/qubes-doc_1.0-1+deb11u1_amd64.buildinfo"),
                buildinfo("source all", "1.0-1+deb11u1"),
            )
            .with_document(
                format!("{DEB_HTTP}/pool/main/q/qubes-old_1.0-1+deb10u1_amd64.buildinfo"),
                buildinfo("amd64", "1.0-1+deb10u1"),
            );
        let repo = QubesRepository::new(&executor, &fetcher, &project);

        let spec: DistributionSpec = "qubes-4.1-vm-bullseye.amd64".parse().expect("dist");
        let candidates = repo.list_candidates(&spec);
        let names: Vec<_> = candidates.keys().cloned().collect();
        assert_eq!(names, ["qubes-core"]);
        let core = candidates
            .get("qubes-core")
            .and_then(|tasks| tasks.first())
            .expect("candidate");
        assert_eq!(core.identity.distribution(), "qubes-4.1-vm-bullseye");
        assert_eq!(core.identity.arch(), "amd64");
        executor.assert_finished();
    }

    #[rstest]
    fn all_records_need_the_all_arch(project: ResolvedProject) {
        let listing = "-rw-r--r-- 1,024 2021/05/01 10:00:00 pool/qubes-doc_1.0-1+deb11u1_amd64.buildinfo\n";
        let executor = StubExecutor::new(vec![rsync(DEB_RSYNC, listing)]);
        let fetcher = FakeFetcher::new().with_document(
            format!("{DEB_HTTP}/pool/qubes-doc_1.0-1+deb11u1_amd64.buildinfo"),
            buildinfo("all source", "1.0-1+deb11u1"),
        );
        let repo = QubesRepository::new(&executor, &fetcher, &project);

        let spec: DistributionSpec = "qubes-4.1-vm-bullseye.noarch".parse().expect("dist");
        let candidates = repo.list_candidates(&spec);
        let doc = candidates
            .get("qubes-doc")
            .and_then(|tasks| tasks.first())
            .expect("all candidate");
        assert_eq!(doc.identity.arch(), "all");
    }

    #[rstest]
    fn fedora_lists_three_repositories(project: ResolvedProject) {
        let base = "rsync://ftp.qubes-os.org/qubes-mirror/repo/yum/r4.1";
        let executor = StubExecutor::new(vec![
            rsync(
                &format!("{base}/current/vm/fc32/"),
                "-rw-r--r-- 1 2021/05/01 10:00:00 rpm/qubes-core-4.1.1-1.fc32.x86_64.buildinfo\n\
                 -rw-r--r-- 1 2021/05/01 10:00:00 rpm/qubes-core-4.1.1-1.fc32.x86_64.rpm\n",
            ),
            rsync(
                &format!("{base}/current-testing/vm/fc32/"),
                "-rw-r--r-- 1 2021/05/01 10:00:00 rpm/qubes-doc-1.0-1.fc32.noarch-buildinfo.rpm\n\
                 -rw-r--r-- 1 2021/05/01 10:00:00 rpm/qubes-arm-1.0-1.fc32.aarch64.buildinfo\n",
            ),
            ExpectedCall::any("rsync", Ok(failure_output("@ERROR: access denied"))),
        ]);
        let fetcher = FakeFetcher::new();
        let repo = QubesRepository::new(&executor, &fetcher, &project);

        let spec: DistributionSpec = "qubes-4.1-vm-fc32.x86_64".parse().expect("dist");
        let candidates = repo.list_candidates(&spec);
        let names: Vec<_> = candidates.keys().cloned().collect();
        assert_eq!(names, ["qubes-core", "qubes-doc"]);
        let doc = candidates
            .get("qubes-doc")
            .and_then(|tasks| tasks.first())
            .expect("doc");
        assert!(doc.descriptors.old.starts_with("https://yum.qubes-os.org/r4.1/current-testing/"));
        executor.assert_finished();
    }

    #[rstest]
    fn rsync_failures_yield_no_candidates(project: ResolvedProject) {
        let executor = StubExecutor::new(vec![ExpectedCall::any(
            "rsync",
            Ok(failure_output("rsync: connection refused")),
        )]);
        let fetcher = FakeFetcher::new();
        let repo = QubesRepository::new(&executor, &fetcher, &project);
        let spec: DistributionSpec = "qubes-4.1-vm-bullseye.amd64".parse().expect("dist");
        assert!(repo.list_candidates(&spec).is_empty());
    }

    #[rstest]
    fn rsync_failures_name_the_listing(project: ResolvedProject) {
        let executor = StubExecutor::new(vec![ExpectedCall::any(
            "rsync",
            Ok(failure_output("@ERROR: access denied")),
        )]);
        let fetcher = FakeFetcher::new();
        let repo = QubesRepository::new(&executor, &fetcher, &project);

        let err = repo.rsync_files(DEB_RSYNC).expect_err("rsync failed");
        let StageError::RepositoryFetch { source_url, reason } = &err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(source_url, DEB_RSYNC);
        assert!(reason.contains("access denied"), "reason: {reason}");
        assert!(err.is_retryable());
    }

    #[rstest]
    #[case::bullseye("11", Some("+deb11u"))]
    #[case::unstable("unstable", None)]
    #[case::sid("sid", None)]
    fn only_numbered_releases_need_a_suffix(#[case] release: &str, #[case] expected: Option<&str>) {
        assert_eq!(security_suffix(release).as_deref(), expected);
    }

    #[rstest]
    fn sid_records_skip_the_release_check(project: ResolvedProject) {
        let listing = "-rw-r--r-- 1,024 2021/05/01 10:00:00 pool/qubes-core_4.1.1-1_amd64.buildinfo\n";
        let executor = StubExecutor::new(vec![rsync(DEB_RSYNC, listing)]);
        let fetcher = FakeFetcher::new().with_document(
            format!("{DEB_HTTP}/pool/qubes-core_4.1.1-1_amd64.buildinfo"),
            buildinfo("source amd64", "4.1.1-1"),
        );
        let repo = QubesRepository::new(&executor, &fetcher, &project);

        let spec: DistributionSpec = "qubes-4.1-vm-sid.amd64".parse().expect("dist");
        let candidates = repo.list_candidates(&spec);
        assert_eq!(candidates.keys().cloned().collect::<Vec<_>>(), ["qubes-core"]);
        executor.assert_finished();
    }

    #[rstest]
    #[case::binary(&["source", "amd64"], Some("amd64"))]
    #[case::arch_independent(&["all", "source"], Some("all"))]
    #[case::source_only(&["source"], None)]
    fn build_arch_follows_architecture_field(
        #[case] architectures: &[&str],
        #[case] expected: Option<&str>,
    ) {
        let owned: Vec<String> = architectures.iter().map(|a| (*a).to_owned()).collect();
        assert_eq!(build_arch(&owned), expected);
    }
}
