//! Log subscriber for the `rebuilder` binary.
//!
//! The crate logs through the `log` macros; `init` installs a
//! `tracing-subscriber` formatter on stderr, and its `log` bridge forwards
//! those records. The filter comes from the `-v` count when given, else from
//! `REBUILDER_LOG`, else `info`.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding the filter directives.
pub const LOG_ENV: &str = "REBUILDER_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

/// Resolves the filter directives from the `-v` count and the environment
/// value.
///
/// Any `EnvFilter` directive list is accepted from the environment, so
/// `REBUILDER_LOG=rebuilder_worker::dispatcher=debug` narrows the output to
/// one module.
///
/// # Examples
///
/// ```
/// use rebuilder_worker::logging::filter_directives;
///
/// assert_eq!(filter_directives(0, None), "info");
/// assert_eq!(filter_directives(0, Some("warn")), "warn");
/// assert_eq!(filter_directives(2, Some("warn")), "trace");
/// ```
#[must_use]
pub fn filter_directives(verbosity: u8, env: Option<&str>) -> String {
    match verbosity {
        0 => env
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_DIRECTIVE)
            .to_owned(),
        1 => "debug".to_owned(),
        _ => "trace".to_owned(),
    }
}

/// Builds the filter, falling back to `info` when the directives are
/// malformed.
#[must_use]
pub fn build_filter(verbosity: u8, env: Option<&str>) -> EnvFilter {
    EnvFilter::try_new(filter_directives(verbosity, env))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Installs the stderr subscriber and the `log` bridge.
///
/// Returns `false` when a global subscriber or logger is already installed,
/// in which case the existing one is kept.
pub fn init(verbosity: u8) -> bool {
    let env = std::env::var(LOG_ENV).ok();
    tracing_subscriber::registry()
        .with(build_filter(verbosity, env.as_deref()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::default(0, None, "info")]
    #[case::env(0, Some("debug"), "debug")]
    #[case::env_trimmed(0, Some("  warn \n"), "warn")]
    #[case::env_blank(0, Some("   "), "info")]
    #[case::env_module(0, Some("rebuilder_worker=debug"), "rebuilder_worker=debug")]
    #[case::verbose(1, Some("error"), "debug")]
    #[case::very_verbose(3, None, "trace")]
    fn directive_resolution(
        #[case] verbosity: u8,
        #[case] env: Option<&str>,
        #[case] expected: &str,
    ) {
        assert_eq!(filter_directives(verbosity, env), expected);
    }

    #[rstest]
    #[case::default(0, None)]
    #[case::module(0, Some("rebuilder_worker::dispatcher=debug,warn"))]
    #[case::verbose(2, None)]
    fn resolved_directives_parse(#[case] verbosity: u8, #[case] env: Option<&str>) {
        assert!(EnvFilter::try_new(filter_directives(verbosity, env)).is_ok());
    }
}
