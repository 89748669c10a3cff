//! Configuration entry point for embedders.
//!
//! The rebuilder keeps its settings in one TOML file. [`load_config`] finds
//! that file the same way the `rebuilder` binary does: an explicit path,
//! then `PACKAGE_REBUILDER_CONF`, then `rebuilder.toml` in the working
//! directory. [`load_config_with`] takes the reader as a parameter so that
//! callers can supply the file contents without touching the file system.

use camino::Utf8Path;
use rebuilder_common::config::{Config, config_path};
use rebuilder_common::error::ConfigError;

/// Loads the rebuilder configuration.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] when the resolved file cannot be read and
/// the parse and validation errors of [`Config::from_toml_str`].
///
/// # Examples
///
/// ```no_run
/// use rebuilder::load_config;
///
/// let config = load_config(None)?;
/// println!("{} project(s) configured", config.projects().len());
/// # Ok::<(), rebuilder::ConfigError>(())
/// ```
pub fn load_config(explicit: Option<&Utf8Path>) -> Result<Config, ConfigError> {
    load_config_with(explicit, |path| std::fs::read_to_string(path))
}

/// Loads the configuration, reading the resolved path with `read`.
///
/// # Errors
///
/// See [`load_config`].
///
/// # Examples
///
/// ```
/// use camino::Utf8Path;
/// use rebuilder::{Project, load_config_with};
///
/// let config = load_config_with(Some(Utf8Path::new("site.toml")), |path| {
///     assert_eq!(path, "site.toml");
///     Ok("[project.fedora]\nmax_retries = 5\n".to_owned())
/// })?;
/// assert_eq!(config.project(Project::Fedora).max_retries, 5);
/// # Ok::<(), rebuilder::ConfigError>(())
/// ```
pub fn load_config_with<F>(explicit: Option<&Utf8Path>, read: F) -> Result<Config, ConfigError>
where
    F: FnOnce(&Utf8Path) -> std::io::Result<String>,
{
    let path = config_path(explicit);
    let contents = read(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Config::from_toml_str(&path, &contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuilder_common::dist::Project;
    use rstest::rstest;
    use std::io::{Error, ErrorKind};

    #[rstest]
    fn reader_receives_the_explicit_path() {
        let config = load_config_with(Some(Utf8Path::new("/etc/rebuilder.toml")), |path| {
            assert_eq!(path, "/etc/rebuilder.toml");
            Ok(String::new())
        })
        .expect("empty configuration is valid");
        assert!(config.projects().is_empty());
    }

    #[rstest]
    fn read_failures_name_the_path() {
        let err = load_config_with(Some(Utf8Path::new("missing.toml")), |_| {
            Err(Error::from(ErrorKind::NotFound))
        })
        .expect_err("read failure");
        assert!(matches!(err, ConfigError::Read { ref path, .. } if path == "missing.toml"));
    }

    #[rstest]
    fn project_tables_are_resolved() {
        let config = load_config_with(Some(Utf8Path::new("r.toml")), |_| {
            Ok("[common]\nmax_retries = 7\n\n[project.debian]\n".to_owned())
        })
        .expect("valid configuration");
        assert_eq!(config.project(Project::Debian).max_retries, 7);
    }
}
