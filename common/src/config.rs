//! Rebuilder configuration.
//!
//! Settings live in one TOML file with a `[common]` table and one
//! `[project.<name>]` table per project (`debian`, `fedora`, `qubesos`).
//! Scheduling, retry and snapshot values missing from a project table fall
//! back to `[common]`; [`Config::project`] performs that resolution once so
//! that stages only ever see concrete values. The configuration is built once
//! at start-up and passed by reference.

use crate::dist::Project;
use crate::error::ConfigError;
use crate::task::ReproducibilityClass;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "PACKAGE_REBUILDER_CONF";

/// Configuration file used when neither a flag nor the environment names one.
pub const DEFAULT_CONFIG_FILE: &str = "rebuilder.toml";

const DEFAULT_SNAPSHOT: &str = "http://snapshot.notset.fr";
const DEBIAN_BUILDINFOS: &str = "https://buildinfos.debian.net";
const DEBIAN_PACKAGE_SETS: &str =
    "https://jenkins.debian.net/userContent/reproducible/debian/pkg-sets";
const QUBES_RSYNC: &str = "rsync://ftp.qubes-os.org/qubes-mirror/repo";
const QUBES_DEB: &str = "https://deb.qubes-os.org";
const QUBES_YUM: &str = "https://yum.qubes-os.org";
const DEBREBUILD: &[&str] = &[
    "python3",
    "/opt/debrebuild/debrebuild.py",
    "--debug",
    "--use-metasnap",
    "--builder=mmdebstrap",
];
const QUBES_DEBREBUILD_ARGS: &[&str] = &[
    "--gpg-verify",
    "--gpg-verify-key=/opt/debrebuild/tests/keys/qubes-debian-r4.asc",
    "--extra-repository-file=/opt/debrebuild/tests/repos/qubes-r4.list",
    "--extra-repository-key=/opt/debrebuild/tests/keys/qubes-debian-r4.asc",
];

/// Resolves the configuration file path.
///
/// An explicit path wins, then [`CONFIG_ENV`], then [`DEFAULT_CONFIG_FILE`]
/// in the working directory.
#[must_use]
pub fn config_path(explicit: Option<&Utf8Path>) -> Utf8PathBuf {
    if let Some(path) = explicit {
        return path.to_owned();
    }
    std::env::var(CONFIG_ENV)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map_or_else(|| Utf8PathBuf::from(DEFAULT_CONFIG_FILE), Utf8PathBuf::from)
}

/// Top-level configuration file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Defaults shared by all projects.
    pub common: CommonConfig,
    /// Per-project settings keyed by project name.
    pub project: BTreeMap<String, ProjectConfig>,
}

/// `[common]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CommonConfig {
    /// Maximum number of rebuild retries before a task fails.
    pub max_retries: u32,
    /// Fixed delay before a retried stage runs again.
    pub retry_delay_seconds: u64,
    /// Interval between periodic Discover submissions.
    pub schedule_discover: u64,
    /// Interval between periodic Publish submissions.
    pub schedule_report: u64,
    /// Snapshot mirror used by the rebuild engine.
    pub snapshot: String,
    /// Root of the ephemeral per-attempt build output.
    pub artifacts_dir: Utf8PathBuf,
    /// Root of the durable per-project trees.
    pub rebuild_dir: Utf8PathBuf,
    /// Root of the record store and queue spool.
    pub state_dir: Utf8PathBuf,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_seconds: 60,
            schedule_discover: 1800,
            schedule_report: 300,
            snapshot: DEFAULT_SNAPSHOT.to_owned(),
            artifacts_dir: Utf8PathBuf::from("/var/lib/rebuilder/artifacts"),
            rebuild_dir: Utf8PathBuf::from("/var/lib/rebuilder/rebuild"),
            state_dir: Utf8PathBuf::from("/var/lib/rebuilder/state"),
        }
    }
}

/// `[project.<name>]` table.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectConfig {
    /// Dist strings rebuilt periodically, e.g. `bullseye+essential.amd64`.
    pub dist: Vec<String>,
    /// Overrides `common.max_retries`.
    pub max_retries: Option<u32>,
    /// Overrides `common.retry_delay_seconds`.
    pub retry_delay_seconds: Option<u64>,
    /// Overrides `common.schedule_discover`.
    pub schedule_discover: Option<u64>,
    /// Overrides `common.schedule_report`.
    pub schedule_report: Option<u64>,
    /// Overrides `common.snapshot`.
    pub snapshot: Option<String>,
    /// Key fingerprint signing reproducible attestations.
    pub in_toto_sign_key_fpr: Option<String>,
    /// Key fingerprint signing unreproducible attestations.
    pub in_toto_sign_key_unreproducible_fpr: Option<String>,
    /// SSH key used for transfers; a bare name is looked up in `~/.ssh`.
    pub repo_ssh_key: Option<String>,
    /// Remote `user@host` receiving published trees.
    pub repo_remote_ssh_host: Option<String>,
    /// Remote base directory receiving published trees.
    pub repo_remote_ssh_basedir: Option<String>,
    /// Base URL of the build-info listing.
    pub buildinfos_baseurl: Option<String>,
    /// Base URL of the package-set catalog.
    pub package_sets_baseurl: Option<String>,
    /// Base rsync URL of the Qubes OS mirror.
    pub rsync_baseurl: Option<String>,
    /// Rebuild engine command line, without per-task arguments.
    pub rebuild_command: Option<Vec<String>>,
    /// Extra arguments appended to every engine invocation; replaces the
    /// project default when set.
    pub rebuild_extra_args: Option<Vec<String>>,
}

/// Remote transfer settings; present only when complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferConfig {
    /// SSH key name or path.
    pub ssh_key: String,
    /// Remote `user@host`.
    pub host: String,
    /// Remote base directory.
    pub basedir: String,
}

/// Fully resolved settings of one project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedProject {
    /// The project.
    pub project: Project,
    /// Dist strings rebuilt periodically.
    pub dists: Vec<String>,
    /// Maximum number of rebuild retries.
    pub max_retries: u32,
    /// Delay before a retried stage runs again.
    pub retry_delay: Duration,
    /// Interval between periodic Discover submissions.
    pub schedule_discover: Duration,
    /// Interval between periodic Publish submissions.
    pub schedule_report: Duration,
    /// Snapshot query and mirror URL.
    pub snapshot: String,
    /// Key for reproducible attestations.
    pub sign_key: Option<String>,
    /// Key for unreproducible attestations.
    pub unreproducible_sign_key: Option<String>,
    /// Transfer settings, `None` unless key, host and base dir are all set.
    pub transfer: Option<TransferConfig>,
    /// Base URL of the build-info listing, when the project has one.
    pub buildinfos_baseurl: Option<String>,
    /// Base URL of the package-set catalog.
    pub package_sets_baseurl: String,
    /// Qubes OS rsync mirror.
    pub rsync_baseurl: String,
    /// Qubes OS Debian repository.
    pub deb_baseurl: String,
    /// Qubes OS yum repository.
    pub yum_baseurl: String,
    /// Engine command; empty when no engine is configured.
    pub rebuild_command: Vec<String>,
    /// Extra engine arguments.
    pub rebuild_extra_args: Vec<String>,
}

impl ResolvedProject {
    /// Signing key configured for `class`.
    #[must_use]
    pub fn signing_key(&self, class: ReproducibilityClass) -> Option<&str> {
        match class {
            ReproducibilityClass::Reproducible => self.sign_key.as_deref(),
            ReproducibilityClass::Unreproducible => self.unreproducible_sign_key.as_deref(),
        }
    }
}

impl Config {
    /// Loads and validates the configuration file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read,
    /// [`ConfigError::Parse`] for invalid TOML or unknown keys, and
    /// [`ConfigError::UnknownProject`] for unsupported project tables.
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(path, &contents)
    }

    /// Parses configuration text; `path` is only used in error messages.
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    ///
    /// # Examples
    ///
    /// ```
    /// use camino::Utf8Path;
    /// use rebuilder_common::config::Config;
    /// use rebuilder_common::dist::Project;
    ///
    /// let text = "[common]\nmax_retries = 4\n\n[project.debian]\ndist = [\"bullseye.amd64\"]\n";
    /// let config = Config::from_toml_str(Utf8Path::new("inline.toml"), text)?;
    /// let debian = config.project(Project::Debian);
    /// assert_eq!(debian.max_retries, 4);
    /// assert_eq!(debian.dists, ["bullseye.amd64"]);
    /// # Ok::<(), rebuilder_common::error::ConfigError>(())
    /// ```
    pub fn from_toml_str(path: &Utf8Path, contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            reason: err.to_string(),
        })?;

        if let Some(name) = config
            .project
            .keys()
            .find(|name| name.parse::<Project>().is_err())
        {
            return Err(ConfigError::UnknownProject { name: name.clone() });
        }
        Ok(config)
    }

    /// Resolves the settings of `project`, applying `[common]` fallbacks.
    #[must_use]
    pub fn project(&self, project: Project) -> ResolvedProject {
        let fallback = ProjectConfig::default();
        let table = self.project.get(project.as_str()).unwrap_or(&fallback);
        let common = &self.common;

        ResolvedProject {
            project,
            dists: table.dist.clone(),
            max_retries: table.max_retries.unwrap_or(common.max_retries),
            retry_delay: Duration::from_secs(
                table.retry_delay_seconds.unwrap_or(common.retry_delay_seconds),
            ),
            schedule_discover: Duration::from_secs(
                table.schedule_discover.unwrap_or(common.schedule_discover),
            ),
            schedule_report: Duration::from_secs(
                table.schedule_report.unwrap_or(common.schedule_report),
            ),
            snapshot: table
                .snapshot
                .clone()
                .unwrap_or_else(|| common.snapshot.clone()),
            sign_key: non_blank(table.in_toto_sign_key_fpr.as_deref()),
            unreproducible_sign_key: non_blank(
                table.in_toto_sign_key_unreproducible_fpr.as_deref(),
            ),
            transfer: transfer_config(table),
            buildinfos_baseurl: table
                .buildinfos_baseurl
                .clone()
                .or_else(|| (project == Project::Debian).then(|| DEBIAN_BUILDINFOS.to_owned())),
            package_sets_baseurl: table
                .package_sets_baseurl
                .clone()
                .unwrap_or_else(|| DEBIAN_PACKAGE_SETS.to_owned()),
            rsync_baseurl: table
                .rsync_baseurl
                .clone()
                .unwrap_or_else(|| QUBES_RSYNC.to_owned()),
            deb_baseurl: QUBES_DEB.to_owned(),
            yum_baseurl: QUBES_YUM.to_owned(),
            rebuild_command: table
                .rebuild_command
                .clone()
                .unwrap_or_else(|| default_rebuild_command(project)),
            rebuild_extra_args: table
                .rebuild_extra_args
                .clone()
                .unwrap_or_else(|| default_rebuild_extra_args(project)),
        }
    }

    /// Resolved settings of every project with a configuration table.
    #[must_use]
    pub fn projects(&self) -> Vec<ResolvedProject> {
        Project::ALL
            .into_iter()
            .filter(|project| self.project.contains_key(project.as_str()))
            .map(|project| self.project(project))
            .collect()
    }
}

fn default_rebuild_command(project: Project) -> Vec<String> {
    match project {
        Project::Debian | Project::QubesOs => {
            DEBREBUILD.iter().map(|arg| (*arg).to_owned()).collect()
        }
        Project::Fedora => Vec::new(),
    }
}

/// The Qubes default verifies template packages against the Qubes signing
/// key and adds the Qubes repository.
fn default_rebuild_extra_args(project: Project) -> Vec<String> {
    match project {
        Project::QubesOs => QUBES_DEBREBUILD_ARGS
            .iter()
            .map(|arg| (*arg).to_owned())
            .collect(),
        Project::Debian | Project::Fedora => Vec::new(),
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}

fn transfer_config(table: &ProjectConfig) -> Option<TransferConfig> {
    Some(TransferConfig {
        ssh_key: non_blank(table.repo_ssh_key.as_deref())?,
        host: non_blank(table.repo_remote_ssh_host.as_deref())?,
        basedir: non_blank(table.repo_remote_ssh_basedir.as_deref())?,
    })
}
