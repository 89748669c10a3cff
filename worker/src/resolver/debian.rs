//! Debian archive adapter.
//!
//! Build-info records are listed in a pool file,
//! `{base}/buildinfo-pool_{distribution}_{arch}.list`, one absolute path per
//! line; package sets are plain name lists at
//! `{sets}/{distribution}/{set}.pkgset`.

use super::{Candidates, Repository, parse_name_list, push_candidate};
use crate::error::StageError;
use crate::fetch::Fetcher;
use log::{debug, warn};
use rebuilder_common::config::ResolvedProject;
use rebuilder_common::descriptor::parse_deb_descriptor;
use rebuilder_common::dist::{DistributionSpec, debian_arch};
use rebuilder_common::task::BuildTask;
use std::collections::BTreeSet;

/// Listing adapter for the Debian build-info pool.
pub struct DebianRepository<'a> {
    fetcher: &'a dyn Fetcher,
    buildinfos_baseurl: Option<String>,
    package_sets_baseurl: String,
}

impl<'a> DebianRepository<'a> {
    /// Creates the adapter from the project settings.
    #[must_use]
    pub fn new(fetcher: &'a dyn Fetcher, project: &ResolvedProject) -> Self {
        Self {
            fetcher,
            buildinfos_baseurl: project
                .buildinfos_baseurl
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_owned()),
            package_sets_baseurl: project
                .package_sets_baseurl
                .trim_end_matches('/')
                .to_owned(),
        }
    }

    /// URL of the pool listing of `spec`.
    fn pool_url(&self, base: &str, spec: &DistributionSpec) -> String {
        format!(
            "{base}/buildinfo-pool_{}_{}.list",
            spec.distribution(),
            debian_arch(spec.arch())
        )
    }
}

impl Repository for DebianRepository<'_> {
    fn list_candidates(&self, spec: &DistributionSpec) -> Candidates {
        let mut candidates = Candidates::new();
        let Some(base) = self.buildinfos_baseurl.as_deref() else {
            warn!("{spec}: no build-info listing configured");
            return candidates;
        };
        let url = self.pool_url(base, spec);
        let listing = match self.fetcher.fetch_text(&url) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("{spec}: listing nothing: {}", StageError::from(err));
                return candidates;
            }
        };

        let arch = debian_arch(spec.arch());
        for entry in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let locator = format!("{base}{entry}");
            let parsed = match parse_deb_descriptor(&locator) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("{spec}: skipping {entry}: {err}");
                    continue;
                }
            };
            if parsed.single_arch() != Some(arch) {
                continue;
            }
            let identity = parsed.into_identity(arch, spec.distribution());
            push_candidate(&mut candidates, BuildTask::new(identity, locator));
        }
        candidates
    }

    fn package_set(&self, spec: &DistributionSpec, name: &str) -> BTreeSet<String> {
        let url = format!(
            "{}/{}/{name}.pkgset",
            self.package_sets_baseurl,
            spec.distribution()
        );
        match self.fetcher.fetch_text(&url) {
            Ok(text) => parse_name_list(&text),
            Err(err) => {
                warn!("{spec}: package set {name} is empty: {}", StageError::from(err));
                BTreeSet::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::latest_per_package;
    use crate::test_utils::FakeFetcher;
    use camino::Utf8Path;
    use rebuilder_common::config::Config;
    use rebuilder_common::dist::Project;
    use rstest::{fixture, rstest};

    const LISTING: &str = "https://buildinfos.example/buildinfo-pool_bullseye_amd64.list";

    #[fixture]
    fn project() -> ResolvedProject {
        Config::from_toml_str(
            Utf8Path::new("t.toml"),
            "[project.debian]\nbuildinfos_baseurl = \"https://buildinfos.example/\"\npackage_sets_baseurl = \"https://sets.example\"\n",
        )
        .expect("config")
        .project(Project::Debian)
    }

    fn spec(raw: &str) -> DistributionSpec {
        raw.parse().expect("dist string")
    }

    #[rstest]
    fn keeps_single_arch_matching_records(project: ResolvedProject) {
        let fetcher = FakeFetcher::new().with_document(
            LISTING,
            "/buildinfo-pool/b/bash/bash_5.1-2+b3_amd64.buildinfo\n\
             /buildinfo-pool/b/bash/bash_5.1-2+b1_amd64.buildinfo\n\
             /buildinfo-pool/b/bash/bash_5.1-2_amd64-source.buildinfo\n\
             /buildinfo-pool/b/bash/bash_5.1-2_all.buildinfo\n\
             /buildinfo-pool/a/apt/apt_1%3a2.2.4_amd64.buildinfo\n\
             /buildinfo-pool/broken.buildinfo\n",
        );
        let repo = DebianRepository::new(&fetcher, &project);

        let candidates = repo.list_candidates(&spec("bullseye.amd64"));
        assert_eq!(candidates.get("bash").map(Vec::len), Some(2));
        let apt = candidates.get("apt").and_then(|tasks| tasks.first()).expect("apt");
        assert_eq!(apt.identity.epoch(), Some(1));
        assert_eq!(apt.canonical(), "1:apt-2.2.4.amd64");

        let latest = latest_per_package(candidates);
        let bash = latest.iter().find(|t| t.identity.name() == "bash").expect("bash");
        assert_eq!(
            bash.descriptors.old,
            "https://buildinfos.example/buildinfo-pool/b/bash/bash_5.1-2+b3_amd64.buildinfo"
        );
    }

    #[rstest]
    fn listing_failures_yield_no_candidates(project: ResolvedProject) {
        let fetcher = FakeFetcher::new().with_failure(LISTING);
        let repo = DebianRepository::new(&fetcher, &project);
        assert!(repo.list_candidates(&spec("bullseye.amd64")).is_empty());
    }

    #[rstest]
    fn package_sets_are_fetched_per_distribution(project: ResolvedProject) {
        let fetcher = FakeFetcher::new()
            .with_document(LISTING, "/p/bash_5.1-2+b3_amd64.buildinfo\n/p/vim_8.2_amd64.buildinfo\n")
            .with_document("https://sets.example/bullseye/essential.pkgset", "bash\n");
        let repo = DebianRepository::new(&fetcher, &project);

        let resolved = repo.resolve(&spec("bullseye+essential.amd64"));
        let names: Vec<_> = resolved.iter().map(|t| t.identity.name().to_owned()).collect();
        assert_eq!(names, ["bash"]);
    }

    #[rstest]
    fn missing_package_set_filters_everything(project: ResolvedProject) {
        let fetcher = FakeFetcher::new().with_document(LISTING, "/p/bash_5.1-2+b3_amd64.buildinfo\n");
        let repo = DebianRepository::new(&fetcher, &project);
        assert!(repo.resolve(&spec("bullseye+essential.amd64")).is_empty());
    }
}
