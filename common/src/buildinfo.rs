//! Minimal deb822 reader for `.buildinfo` records.
//!
//! Only the first paragraph is read. Clear-signed records are accepted: the
//! armour header and trailing signature block are skipped.

use crate::error::{IdentityError, Result};
use std::collections::BTreeMap;

/// A parsed `.buildinfo` paragraph.
///
/// # Examples
///
/// ```
/// use rebuilder_common::buildinfo::BuildInfo;
///
/// let text = "Source: bash\nBinary: bash bash-static\nArchitecture: amd64\nVersion: 5.1-2+b3\n";
/// let info = BuildInfo::parse("bash.buildinfo", text)?;
/// assert_eq!(info.binaries(), ["bash", "bash-static"]);
/// assert_eq!(info.version(), Some("5.1-2+b3"));
/// # Ok::<(), rebuilder_common::error::IdentityError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildInfo {
    fields: BTreeMap<String, String>,
}

/// One entry of the `Checksums-Sha256` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Hex SHA-256 digest.
    pub sha256: String,
    /// File size in bytes.
    pub size: u64,
    /// File name.
    pub file: String,
}

impl BuildInfo {
    /// Parses deb822 text. `origin` names the record in errors.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MalformedDescriptor`] when the text holds no
    /// field or a line is neither a field nor a continuation.
    pub fn parse(origin: &str, text: &str) -> Result<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        let mut current: Option<String> = None;

        for line in paragraph_lines(text) {
            if line.starts_with(' ') || line.starts_with('\t') {
                let key = current
                    .as_ref()
                    .ok_or_else(|| malformed(origin, "continuation before any field"))?;
                if let Some(value) = fields.get_mut(key) {
                    value.push('\n');
                    value.push_str(line.trim());
                }
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| malformed(origin, "line is not a deb822 field"))?;
            let key = key.trim().to_owned();
            fields.insert(key.clone(), value.trim().to_owned());
            current = Some(key);
        }

        if fields.is_empty() {
            return Err(malformed(origin, "no deb822 fields"));
        }
        Ok(Self { fields })
    }

    /// Returns a raw field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// `Source` field.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.field("Source")
    }

    /// `Version` field.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.field("Version")
    }

    /// Binary package names from the `Binary` field.
    #[must_use]
    pub fn binaries(&self) -> Vec<String> {
        split_words(self.field("Binary"))
    }

    /// Architecture tokens from the `Architecture` field.
    #[must_use]
    pub fn architectures(&self) -> Vec<String> {
        split_words(self.field("Architecture"))
    }

    /// Entries of the `Checksums-Sha256` field; malformed lines are skipped.
    #[must_use]
    pub fn checksums_sha256(&self) -> Vec<ChecksumEntry> {
        self.field("Checksums-Sha256")
            .unwrap_or_default()
            .lines()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                let sha256 = words.next()?.to_owned();
                let size = words.next()?.parse().ok()?;
                let file = words.next()?.to_owned();
                Some(ChecksumEntry { sha256, size, file })
            })
            .collect()
    }
}

fn paragraph_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut lines = text.lines().peekable();
    if lines
        .peek()
        .is_some_and(|line| line.starts_with("-----BEGIN PGP SIGNED MESSAGE"))
    {
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
        }
    }
    lines
        .skip_while(|line| line.trim().is_empty())
        .take_while(|line| !line.trim().is_empty() && !line.starts_with("-----BEGIN PGP SIGNATURE"))
}

fn split_words(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_owned)
        .collect()
}

fn malformed(origin: &str, reason: &'static str) -> IdentityError {
    IdentityError::MalformedDescriptor {
        filename: origin.to_owned(),
        reason,
    }
}
