//! Error types for the identity, distribution and configuration model.
//!
//! Parsing errors are raised at the edges (descriptor filenames, dist strings
//! and config files) so that downstream stages only ever see validated values.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while deriving identities and distribution specs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// A build-descriptor filename does not match the expected grammar.
    #[error("malformed build descriptor {filename}: {reason}")]
    MalformedDescriptor {
        /// Basename of the rejected descriptor.
        filename: String,
        /// Description of the grammar violation.
        reason: &'static str,
    },

    /// A version string could not be parsed.
    #[error("malformed version {version}: {reason}")]
    MalformedVersion {
        /// The rejected version string.
        version: String,
        /// Description of the parse failure.
        reason: &'static str,
    },

    /// A dist string such as `bullseye+essential.amd64` could not be parsed.
    #[error("cannot parse dist {dist}: {reason}")]
    DistributionParse {
        /// The rejected dist string.
        dist: String,
        /// Description of the parse failure.
        reason: String,
    },

    /// The distribution name does not belong to a supported ecosystem.
    #[error("unsupported distribution: {name}")]
    UnsupportedDistribution {
        /// The unrecognised distribution name.
        name: String,
    },
}

/// Errors raised while loading the rebuilder configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration {path}")]
    Read {
        /// Path of the configuration file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML or has unknown keys.
    #[error("invalid configuration {path}: {reason}")]
    Parse {
        /// Path of the configuration file.
        path: Utf8PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// A `[project.<name>]` table names a project the rebuilder does not know.
    #[error("unknown project {name}; expected one of debian, fedora, qubesos")]
    UnknownProject {
        /// The unrecognised project name.
        name: String,
    },
}

/// Result type for identity and distribution parsing.
pub type Result<T, E = IdentityError> = std::result::Result<T, E>;
