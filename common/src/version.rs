//! Package version ordering.
//!
//! Versions follow the `[epoch:]upstream[-revision]` shape shared by dpkg and
//! RPM `version-release` strings. Comparison uses the dpkg algorithm: runs of
//! non-digits compare character by character with `~` sorting before
//! everything (even the end of the string) and letters before other symbols,
//! while runs of digits compare numerically.

use crate::error::{IdentityError, Result};
use std::cmp::Ordering;
use std::fmt;
use std::iter::Peekable;
use std::str::Bytes;

/// A parsed package version.
///
/// # Examples
///
/// ```
/// use rebuilder_common::version::Version;
///
/// let old = Version::parse("5.1-2")?;
/// let new = Version::parse("5.1-2+b3")?;
/// assert!(new > old);
/// # Ok::<(), rebuilder_common::error::IdentityError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    epoch: u32,
    upstream: String,
    revision: String,
}

impl Version {
    /// Parses a version string.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::MalformedVersion`] when the string is empty,
    /// when the epoch is not numeric, or when the upstream part is empty.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(malformed(raw, "empty version"));
        }

        let (epoch, rest) = match trimmed.split_once(':') {
            Some((epoch, rest)) => {
                let value = epoch
                    .parse::<u32>()
                    .map_err(|_| malformed(raw, "epoch is not numeric"))?;
                (value, rest)
            }
            None => (0, trimmed),
        };

        let (upstream, revision) = match rest.rsplit_once('-') {
            Some((upstream, revision)) => (upstream, revision),
            None => (rest, ""),
        };
        if upstream.is_empty() {
            return Err(malformed(raw, "empty upstream version"));
        }

        Ok(Self {
            raw: trimmed.to_owned(),
            epoch,
            upstream: upstream.to_owned(),
            revision: revision.to_owned(),
        })
    }

    /// Returns the epoch, zero when absent.
    #[must_use]
    pub const fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Returns the version text without the epoch prefix.
    #[must_use]
    pub fn without_epoch(&self) -> String {
        if self.revision.is_empty() {
            self.upstream.clone()
        } else {
            format!("{}-{}", self.upstream, self.revision)
        }
    }

    /// Returns the string the version was parsed from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_fragment(&self.upstream, &other.upstream))
            .then_with(|| compare_fragment(&self.revision, &other.revision))
    }
}

fn malformed(raw: &str, reason: &'static str) -> IdentityError {
    IdentityError::MalformedVersion {
        version: raw.to_owned(),
        reason,
    }
}

/// Compares two raw version strings.
///
/// Strings that fail to parse sort before any parseable version and compare
/// lexically among themselves, so the order stays total.
///
/// # Examples
///
/// ```
/// use rebuilder_common::version::compare_versions;
/// use std::cmp::Ordering;
///
/// assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
/// assert_eq!(compare_versions("1.0~rc1", "1.0"), Ordering::Less);
/// assert_eq!(compare_versions("1:0.9", "2.0"), Ordering::Greater);
/// ```
#[must_use]
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    match (Version::parse(left), Version::parse(right)) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => left.cmp(right),
    }
}

/// Orders two versions for "latest" selection.
///
/// Versions that compare equal are tie-broken by the raw string so that the
/// lexically greatest spelling wins deterministically.
#[must_use]
pub fn compare_for_latest(left: &str, right: &str) -> Ordering {
    compare_versions(left, right).then_with(|| left.cmp(right))
}

fn char_order(byte: Option<u8>) -> i32 {
    match byte {
        None => 0,
        Some(b'~') => -1,
        Some(b) if b.is_ascii_digit() => 0,
        Some(b) if b.is_ascii_alphabetic() => i32::from(b),
        Some(b) => i32::from(b) + 256,
    }
}

fn is_digit(byte: Option<&u8>) -> bool {
    byte.is_some_and(u8::is_ascii_digit)
}

fn compare_fragment(left: &str, right: &str) -> Ordering {
    let mut l = left.bytes().peekable();
    let mut r = right.bytes().peekable();

    while l.peek().is_some() || r.peek().is_some() {
        if let Some(ordering) = compare_non_digits(&mut l, &mut r) {
            return ordering;
        }
        if let Some(ordering) = compare_digits(&mut l, &mut r) {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_non_digits(l: &mut Peekable<Bytes<'_>>, r: &mut Peekable<Bytes<'_>>) -> Option<Ordering> {
    while (l.peek().is_some() && !is_digit(l.peek())) || (r.peek().is_some() && !is_digit(r.peek()))
    {
        let lc = char_order(l.peek().copied());
        let rc = char_order(r.peek().copied());
        if lc != rc {
            return Some(lc.cmp(&rc));
        }
        l.next();
        r.next();
    }
    None
}

fn compare_digits(l: &mut Peekable<Bytes<'_>>, r: &mut Peekable<Bytes<'_>>) -> Option<Ordering> {
    while l.peek() == Some(&b'0') {
        l.next();
    }
    while r.peek() == Some(&b'0') {
        r.next();
    }

    let mut first_diff = Ordering::Equal;
    while is_digit(l.peek()) && is_digit(r.peek()) {
        if first_diff == Ordering::Equal {
            first_diff = l.peek().cmp(&r.peek());
        }
        l.next();
        r.next();
    }

    if is_digit(l.peek()) {
        return Some(Ordering::Greater);
    }
    if is_digit(r.peek()) {
        return Some(Ordering::Less);
    }
    (first_diff != Ordering::Equal).then_some(first_diff)
}
