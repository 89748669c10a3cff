//! Fedora adapter.
//!
//! Fedora publishes no upstream build-info pool, so listing only works
//! against a configured mirror exposing
//! `{base}/buildinfo-pool_{distribution}_{arch}.list` with one path per line.
//! There is no package-set catalog.

use super::{Candidates, Repository, push_candidate};
use crate::error::StageError;
use crate::fetch::Fetcher;
use log::{debug, warn};
use rebuilder_common::config::ResolvedProject;
use rebuilder_common::descriptor::parse_rpm_descriptor;
use rebuilder_common::dist::DistributionSpec;
use rebuilder_common::task::BuildTask;
use std::collections::BTreeSet;

/// Listing adapter for Fedora build-info mirrors.
pub struct FedoraRepository<'a> {
    fetcher: &'a dyn Fetcher,
    buildinfos_baseurl: Option<String>,
}

impl<'a> FedoraRepository<'a> {
    /// Creates the adapter from the project settings.
    #[must_use]
    pub fn new(fetcher: &'a dyn Fetcher, project: &ResolvedProject) -> Self {
        Self {
            fetcher,
            buildinfos_baseurl: project
                .buildinfos_baseurl
                .as_deref()
                .map(|url| url.trim_end_matches('/').to_owned()),
        }
    }
}

impl Repository for FedoraRepository<'_> {
    fn list_candidates(&self, spec: &DistributionSpec) -> Candidates {
        let mut candidates = Candidates::new();
        let Some(base) = self.buildinfos_baseurl.as_deref() else {
            warn!("{spec}: no Fedora build-info mirror configured");
            return candidates;
        };
        let url = format!(
            "{base}/buildinfo-pool_{}_{}.list",
            spec.distribution(),
            spec.arch()
        );
        let listing = match self.fetcher.fetch_text(&url) {
            Ok(listing) => listing,
            Err(err) => {
                warn!("{spec}: listing nothing: {}", StageError::from(err));
                return candidates;
            }
        };

        for entry in listing.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let locator = format!("{base}{entry}");
            let parsed = match parse_rpm_descriptor(&locator) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("{spec}: skipping {entry}: {err}");
                    continue;
                }
            };
            match parsed.single_arch() {
                Some(arch) if arch == "noarch" || arch == spec.arch() => {}
                _ => continue,
            }
            let identity = parsed.into_identity(spec.arch(), spec.distribution());
            push_candidate(&mut candidates, BuildTask::new(identity, locator));
        }
        candidates
    }

    fn package_set(&self, spec: &DistributionSpec, name: &str) -> BTreeSet<String> {
        warn!("{spec}: Fedora has no package set {name}");
        BTreeSet::new()
    }
}
