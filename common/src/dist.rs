//! Distribution strings and ecosystem classification.
//!
//! A dist string has the form `{distribution}[+package_set]*.{arch}`, for
//! example `bullseye+essential+build_essential.all`, `unstable.amd64` or
//! `qubes-4.1-vm-bullseye.amd64`. Qubes OS distributions encode the Qubes
//! release, the Qubes package set (`vm`, `dom0`) and the underlying template
//! distribution.

use crate::error::{IdentityError, Result};
use std::fmt;
use std::str::FromStr;

/// Package set sentinel meaning "no filtering".
pub const FULL_PACKAGE_SET: &str = "full";

const DEBIAN_RELEASES: &[(&str, &str)] = &[
    ("buster", "10"),
    ("bullseye", "11"),
    ("bookworm", "12"),
    ("trixie", "13"),
    ("sid", "unstable"),
    ("unstable", "sid"),
];

const ARCH_ALIASES: &[(&str, &str)] = &[("x86_64", "amd64"), ("noarch", "all")];

/// Returns the Debian release number (or alias) for a codename.
///
/// # Examples
///
/// ```
/// use rebuilder_common::dist::debian_release;
///
/// assert_eq!(debian_release("bullseye"), Some("11"));
/// assert_eq!(debian_release("fc32"), None);
/// ```
#[must_use]
pub fn debian_release(codename: &str) -> Option<&'static str> {
    DEBIAN_RELEASES
        .iter()
        .find(|(name, _)| *name == codename)
        .map(|(_, release)| *release)
}

/// Maps RPM-style architecture names onto their Debian spelling.
///
/// # Examples
///
/// ```
/// use rebuilder_common::dist::debian_arch;
///
/// assert_eq!(debian_arch("x86_64"), "amd64");
/// assert_eq!(debian_arch("noarch"), "all");
/// assert_eq!(debian_arch("arm64"), "arm64");
/// ```
#[must_use]
pub fn debian_arch(arch: &str) -> &str {
    ARCH_ALIASES
        .iter()
        .find(|(alias, _)| *alias == arch)
        .map_or(arch, |(_, target)| target)
}

/// Returns `true` for Qubes OS distribution names.
#[must_use]
pub fn is_qubes(distribution: &str) -> bool {
    distribution.starts_with("qubes")
}

/// Returns `true` for Fedora distribution names (`fedora-33`, `fc32`).
#[must_use]
pub fn is_fedora(distribution: &str) -> bool {
    distribution.starts_with("fedora") || distribution.starts_with("fc")
}

/// Returns `true` for Debian codenames known to the release table.
#[must_use]
pub fn is_debian(distribution: &str) -> bool {
    debian_release(distribution).is_some()
}

/// Project a distribution belongs to; names the per-project directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Project {
    /// Debian archive rebuilds.
    Debian,
    /// Fedora rebuilds.
    Fedora,
    /// Qubes OS repository rebuilds.
    QubesOs,
}

impl Project {
    /// All known projects.
    pub const ALL: [Self; 3] = [Self::Debian, Self::Fedora, Self::QubesOs];

    /// Directory and configuration name of the project.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Fedora => "fedora",
            Self::QubesOs => "qubesos",
        }
    }
}

impl fmt::Display for Project {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Project {
    type Err = IdentityError;

    fn from_str(value: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|project| project.as_str() == value)
            .ok_or_else(|| IdentityError::UnsupportedDistribution {
                name: value.to_owned(),
            })
    }
}

/// Ecosystem families, each with its own descriptor grammar and arch rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcosystemKind {
    /// Debian archive, Format A descriptors.
    Debian,
    /// Fedora, Format B descriptors.
    Fedora,
    /// Qubes OS packages built for a Debian template.
    QubesDebian,
    /// Qubes OS packages built for a Fedora template.
    QubesFedora,
}

impl EcosystemKind {
    /// Returns `true` for ecosystems using Debian tooling.
    #[must_use]
    pub const fn is_debian_family(self) -> bool {
        matches!(self, Self::Debian | Self::QubesDebian)
    }
}

/// Release coordinates carried by Qubes OS distribution names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QubesRelease {
    /// Qubes release, e.g. `4.1`.
    pub release: String,
    /// Qubes package set, e.g. `vm` or `dom0`.
    pub package_set: String,
    /// Underlying template distribution, e.g. `bullseye` or `fc32`.
    pub base: String,
}

/// Ecosystem classification of a distribution name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecosystem {
    kind: EcosystemKind,
    qubes: Option<QubesRelease>,
}

impl Ecosystem {
    /// Classifies a distribution name.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::DistributionParse`] for Qubes names that do
    /// not split into release, package set and base distribution, and
    /// [`IdentityError::UnsupportedDistribution`] for unknown names.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebuilder_common::dist::{Ecosystem, EcosystemKind};
    ///
    /// let qubes = Ecosystem::from_distribution("qubes-4.1-vm-bullseye")?;
    /// assert_eq!(qubes.kind(), EcosystemKind::QubesDebian);
    /// assert_eq!(qubes.distdir(), "qubesos/deb/r4.1/vm");
    /// # Ok::<(), rebuilder_common::error::IdentityError>(())
    /// ```
    pub fn from_distribution(distribution: &str) -> Result<Self> {
        if is_qubes(distribution) {
            let qubes = parse_qubes(distribution)?;
            let kind = if is_debian(&qubes.base) {
                EcosystemKind::QubesDebian
            } else if is_fedora(&qubes.base) {
                EcosystemKind::QubesFedora
            } else {
                return Err(IdentityError::UnsupportedDistribution {
                    name: distribution.to_owned(),
                });
            };
            return Ok(Self {
                kind,
                qubes: Some(qubes),
            });
        }

        let kind = if is_fedora(distribution) {
            EcosystemKind::Fedora
        } else if is_debian(distribution) {
            EcosystemKind::Debian
        } else {
            return Err(IdentityError::UnsupportedDistribution {
                name: distribution.to_owned(),
            });
        };
        Ok(Self { kind, qubes: None })
    }

    /// Ecosystem family.
    #[must_use]
    pub const fn kind(&self) -> EcosystemKind {
        self.kind
    }

    /// Qubes release coordinates, for Qubes ecosystems.
    #[must_use]
    pub const fn qubes(&self) -> Option<&QubesRelease> {
        self.qubes.as_ref()
    }

    /// Owning project.
    #[must_use]
    pub const fn project(&self) -> Project {
        match self.kind {
            EcosystemKind::Debian => Project::Debian,
            EcosystemKind::Fedora => Project::Fedora,
            EcosystemKind::QubesDebian | EcosystemKind::QubesFedora => Project::QubesOs,
        }
    }

    /// Directory, relative to the artifacts and rebuild roots, that holds
    /// this ecosystem's build output and attestation trees.
    #[must_use]
    pub fn distdir(&self) -> String {
        match (&self.kind, &self.qubes) {
            (EcosystemKind::QubesDebian, Some(q)) => {
                format!("qubesos/deb/r{}/{}", q.release, q.package_set)
            }
            (EcosystemKind::QubesFedora, Some(q)) => {
                format!("qubesos/rpm/r{}/{}", q.release, q.package_set)
            }
            _ => self.project().as_str().to_owned(),
        }
    }
}

fn parse_qubes(distribution: &str) -> Result<QubesRelease> {
    let parse_error = || IdentityError::DistributionParse {
        dist: distribution.to_owned(),
        reason: "expected qubes-{release}-{package_set}-{distribution}".to_owned(),
    };
    let rest = distribution.strip_prefix("qubes-").ok_or_else(parse_error)?;
    let mut parts = rest.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(release), Some(package_set), Some(base))
            if !release.is_empty() && !package_set.is_empty() && !base.is_empty() =>
        {
            Ok(QubesRelease {
                release: release.to_owned(),
                package_set: package_set.to_owned(),
                base: base.to_owned(),
            })
        }
        _ => Err(parse_error()),
    }
}

/// A parsed dist string.
///
/// # Examples
///
/// ```
/// use rebuilder_common::dist::DistributionSpec;
///
/// let spec: DistributionSpec = "bullseye+essential+build_essential.all".parse()?;
/// assert_eq!(spec.distribution(), "bullseye");
/// assert_eq!(spec.arch(), "all");
/// assert_eq!(spec.package_sets(), ["essential", "build_essential"]);
///
/// let full: DistributionSpec = "unstable.amd64".parse()?;
/// assert_eq!(full.package_sets(), ["full"]);
/// # Ok::<(), rebuilder_common::error::IdentityError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionSpec {
    raw: String,
    distribution: String,
    arch: String,
    package_sets: Vec<String>,
    ecosystem: Ecosystem,
}

impl DistributionSpec {
    /// Parses a dist string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::DistributionParse`] when the string lacks an
    /// architecture or distribution name, and
    /// [`IdentityError::UnsupportedDistribution`] when the distribution is not
    /// part of a supported ecosystem.
    pub fn parse(raw: &str) -> Result<Self> {
        let parse_error = |reason: &str| IdentityError::DistributionParse {
            dist: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let (with_sets, arch) = raw
            .rsplit_once('.')
            .ok_or_else(|| parse_error("missing .{arch} suffix"))?;
        if arch.is_empty() {
            return Err(parse_error("empty architecture"));
        }

        let mut segments = with_sets.split('+');
        let distribution = segments.next().unwrap_or_default();
        if distribution.is_empty() {
            return Err(parse_error("empty distribution name"));
        }

        let mut package_sets: Vec<String> = segments
            .filter(|set| !set.is_empty())
            .map(str::to_owned)
            .collect();
        if package_sets.is_empty() {
            package_sets.push(FULL_PACKAGE_SET.to_owned());
        }

        let ecosystem = Ecosystem::from_distribution(distribution)?;

        Ok(Self {
            raw: raw.to_owned(),
            distribution: distribution.to_owned(),
            arch: arch.to_owned(),
            package_sets,
            ecosystem,
        })
    }

    /// The dist string this spec was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Distribution name without package sets or architecture.
    #[must_use]
    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    /// Requested architecture as written in the dist string.
    #[must_use]
    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Requested package sets; `["full"]` when none were named.
    #[must_use]
    pub fn package_sets(&self) -> &[String] {
        &self.package_sets
    }

    /// Returns `true` when no package-set filtering applies.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.package_sets.iter().any(|set| set == FULL_PACKAGE_SET)
    }

    /// Ecosystem classification.
    #[must_use]
    pub const fn ecosystem(&self) -> &Ecosystem {
        &self.ecosystem
    }

    /// Owning project.
    #[must_use]
    pub const fn project(&self) -> Project {
        self.ecosystem.project()
    }
}

impl FromStr for DistributionSpec {
    type Err = IdentityError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

impl fmt::Display for DistributionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::debian("bullseye.amd64", EcosystemKind::Debian, Project::Debian, "debian")]
    #[case::unstable("unstable+single.amd64", EcosystemKind::Debian, Project::Debian, "debian")]
    #[case::fedora("fedora-33.x86_64", EcosystemKind::Fedora, Project::Fedora, "fedora")]
    #[case::qubes_deb(
        "qubes-4.1-vm-bullseye.amd64",
        EcosystemKind::QubesDebian,
        Project::QubesOs,
        "qubesos/deb/r4.1/vm"
    )]
    #[case::qubes_rpm(
        "qubes-4.1-vm-fc32.noarch",
        EcosystemKind::QubesFedora,
        Project::QubesOs,
        "qubesos/rpm/r4.1/vm"
    )]
    fn classifies_dist_strings(
        #[case] raw: &str,
        #[case] kind: EcosystemKind,
        #[case] project: Project,
        #[case] distdir: &str,
    ) {
        let spec = DistributionSpec::parse(raw).expect("valid dist");
        assert_eq!(spec.ecosystem().kind(), kind);
        assert_eq!(spec.project(), project);
        assert_eq!(spec.ecosystem().distdir(), distdir);
    }

    #[rstest]
    fn qubes_dist_keeps_dotted_release() {
        let spec = DistributionSpec::parse("qubes-4.1-vm-bullseye.amd64").expect("valid dist");
        assert_eq!(spec.distribution(), "qubes-4.1-vm-bullseye");
        assert_eq!(spec.arch(), "amd64");
        let qubes = spec.ecosystem().qubes().expect("qubes coordinates");
        assert_eq!(qubes.release, "4.1");
        assert_eq!(qubes.package_set, "vm");
        assert_eq!(qubes.base, "bullseye");
    }

    #[rstest]
    fn empty_package_sets_mean_full() {
        let spec = DistributionSpec::parse("bullseye++.all").expect("valid dist");
        assert_eq!(spec.package_sets(), [FULL_PACKAGE_SET]);
        assert!(spec.is_full());
    }

    #[rstest]
    #[case::no_arch("bullseye")]
    #[case::empty_arch("bullseye.")]
    #[case::empty_name("+essential.amd64")]
    #[case::short_qubes("qubes-4.1.amd64")]
    fn rejects_malformed_dist_strings(#[case] raw: &str) {
        assert!(matches!(
            DistributionSpec::parse(raw),
            Err(IdentityError::DistributionParse { .. })
        ));
    }

    #[rstest]
    #[case::unknown_codename("jessie.amd64")]
    #[case::unknown_qubes_base("qubes-4.1-vm-centos8.amd64")]
    fn rejects_unsupported_distributions(#[case] raw: &str) {
        assert!(matches!(
            DistributionSpec::parse(raw),
            Err(IdentityError::UnsupportedDistribution { .. })
        ));
    }

    #[rstest]
    fn project_names_round_trip() {
        for project in Project::ALL {
            assert_eq!(project.as_str().parse::<Project>(), Ok(project));
        }
    }
}
