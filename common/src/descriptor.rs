//! Build-descriptor filename grammars.
//!
//! Debian-family build-info records are named `name_version_arch.buildinfo`
//! (Format A) while RPM-family records follow the `name-version-release.arch`
//! NVRA convention (Format B), optionally wrapped in a `-buildinfo` RPM. Both
//! parsers accept full locators (URLs or paths) and only look at the basename.

use crate::error::{IdentityError, Result};
use crate::identity::PackageIdentity;
use crate::version::Version;

const BUILDINFO_SUFFIX: &str = ".buildinfo";

/// Fields extracted from a build-descriptor filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    /// Source package name.
    pub name: String,
    /// Epoch encoded in the version, if any.
    pub epoch: Option<u32>,
    /// Version without its epoch prefix.
    pub version: String,
    /// Architecture tokens, e.g. `["amd64", "source"]`.
    pub arches: Vec<String>,
}

impl ParsedDescriptor {
    /// Returns the architecture when the descriptor names exactly one.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebuilder_common::descriptor::parse_deb_descriptor;
    ///
    /// let single = parse_deb_descriptor("bash_5.1-2+b3_amd64.buildinfo")?;
    /// assert_eq!(single.single_arch(), Some("amd64"));
    ///
    /// let multi = parse_deb_descriptor("bash_5.1-2_amd64-source.buildinfo")?;
    /// assert_eq!(multi.single_arch(), None);
    /// # Ok::<(), rebuilder_common::error::IdentityError>(())
    /// ```
    #[must_use]
    pub fn single_arch(&self) -> Option<&str> {
        match self.arches.as_slice() {
            [arch] => Some(arch.as_str()),
            _ => None,
        }
    }

    /// Builds the identity for this descriptor.
    #[must_use]
    pub fn into_identity(self, arch: &str, distribution: &str) -> PackageIdentity {
        PackageIdentity::new(self.name, self.epoch, self.version, arch, distribution)
    }
}

/// Returns the final path segment of a locator.
#[must_use]
pub fn basename(locator: &str) -> &str {
    locator.rsplit('/').next().unwrap_or(locator)
}

/// Parses a Format A descriptor: `name_version_arch[.buildinfo]`.
///
/// The version may carry an epoch either literally (`1:2.3`) or URL-encoded
/// (`1%3a2.3`), as found in mirror listings.
///
/// # Errors
///
/// Returns [`IdentityError::MalformedDescriptor`] when the basename does not
/// split into exactly three `_`-separated fields or the version is empty,
/// and [`IdentityError::MalformedVersion`] when the version does not parse.
pub fn parse_deb_descriptor(locator: &str) -> Result<ParsedDescriptor> {
    let filename = basename(locator);
    let stem = filename.strip_suffix(BUILDINFO_SUFFIX).unwrap_or(filename);

    let fields: Vec<&str> = stem.split('_').collect();
    let [name, raw_version, arch] = fields.as_slice() else {
        return Err(malformed(filename, "expected name_version_arch"));
    };
    if name.is_empty() || arch.is_empty() {
        return Err(malformed(filename, "empty name or architecture"));
    }
    if raw_version.is_empty() {
        return Err(malformed(filename, "empty version"));
    }

    let decoded = raw_version.replace("%3a", ":").replace("%3A", ":");
    let version = Version::parse(&decoded)?;

    Ok(ParsedDescriptor {
        name: (*name).to_owned(),
        epoch: non_zero(version.epoch()),
        version: version.without_epoch(),
        arches: arch.split('-').map(str::to_owned).collect(),
    })
}

/// Parses a Format B descriptor: `[epoch:]name-version-release.arch`.
///
/// `.buildinfo`, `-buildinfo` and `.rpm` markers are removed before the NVRA
/// quadruple is validated; the release is folded into the version as
/// `version-release`.
///
/// # Errors
///
/// Returns [`IdentityError::MalformedDescriptor`] when any of the name,
/// version, release or arch fields is missing or malformed.
pub fn parse_rpm_descriptor(locator: &str) -> Result<ParsedDescriptor> {
    let filename = basename(locator);
    let cleaned = filename
        .replace(BUILDINFO_SUFFIX, "")
        .replace("-buildinfo", "");
    let nvra = cleaned.strip_suffix(".rpm").unwrap_or(&cleaned);

    let (nvr, arch) = nvra
        .rsplit_once('.')
        .ok_or_else(|| malformed(filename, "missing architecture"))?;
    let (nv, release) = nvr
        .rsplit_once('-')
        .ok_or_else(|| malformed(filename, "missing release"))?;
    let (raw_name, version) = nv
        .rsplit_once('-')
        .ok_or_else(|| malformed(filename, "missing version"))?;

    let (epoch, name) = match raw_name.split_once(':') {
        Some((epoch, name)) => {
            let value = epoch
                .parse::<u32>()
                .map_err(|_| malformed(filename, "epoch is not numeric"))?;
            (non_zero(value), name)
        }
        None => (None, raw_name),
    };

    validate_nvra(filename, name, version, release, arch)?;

    Ok(ParsedDescriptor {
        name: name.to_owned(),
        epoch,
        version: format!("{version}-{release}"),
        arches: vec![arch.to_owned()],
    })
}

fn validate_nvra(filename: &str, name: &str, version: &str, release: &str, arch: &str) -> Result<()> {
    if name.is_empty() {
        return Err(malformed(filename, "empty name"));
    }
    if version.is_empty() || version.contains(':') {
        return Err(malformed(filename, "invalid version"));
    }
    if release.is_empty() {
        return Err(malformed(filename, "empty release"));
    }
    if arch.is_empty() || !arch.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(malformed(filename, "invalid architecture"));
    }
    Ok(())
}

const fn non_zero(epoch: u32) -> Option<u32> {
    if epoch == 0 { None } else { Some(epoch) }
}

fn malformed(filename: &str, reason: &'static str) -> IdentityError {
    IdentityError::MalformedDescriptor {
        filename: filename.to_owned(),
        reason,
    }
}
