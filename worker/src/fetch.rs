//! HTTP retrieval of listings, package-set catalogs and build-info records.
//!
//! Provides a trait-based abstraction so that repository adapters can be
//! tested without network access.

use std::sync::OnceLock;
use std::time::Duration;

/// Network timeout for listing and record downloads.
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Trait for fetching text documents.
#[cfg_attr(test, mockall::automock)]
pub trait Fetcher: Send + Sync {
    /// Downloads `url` and returns the body as text.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the document does not exist.
    fn fetch_text(&self, url: &str) -> Result<String, FetchError>;
}

/// Errors arising from fetch operations.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// HTTP request failed.
    #[error("download failed for {url}: {reason}")]
    Http {
        /// The URL that was requested.
        url: String,
        /// A human-readable description of the failure.
        reason: String,
    },

    /// The requested document was not found (HTTP 404).
    #[error("document not found: {url}")]
    NotFound {
        /// The URL that returned 404.
        url: String,
    },
}

impl FetchError {
    /// URL of the failed request.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Http { url, .. } | Self::NotFound { url } => url,
        }
    }
}

/// HTTP-based fetcher using `ureq`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let response = http_agent()
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;
        response
            .into_body()
            .read_to_string()
            .map_err(|e| FetchError::Http {
                url: url.to_owned(),
                reason: e.to_string(),
            })
    }
}

/// Shared `ureq` agent with request timeout configuration.
fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

fn map_ureq_error(url: &str, err: &ureq::Error) -> FetchError {
    match err {
        ureq::Error::StatusCode(404) => FetchError::NotFound {
            url: url.to_owned(),
        },
        other => FetchError::Http {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_ureq_error_maps_404_to_not_found() {
        let err = ureq::Error::StatusCode(404);
        let mapped = map_ureq_error("https://example.test/list", &err);
        assert!(matches!(mapped, FetchError::NotFound { .. }));
        assert_eq!(mapped.url(), "https://example.test/list");
    }

    #[test]
    fn map_ureq_error_maps_other_status_to_http_error() {
        let err = ureq::Error::StatusCode(503);
        let mapped = map_ureq_error("https://example.test/list", &err);
        assert!(matches!(mapped, FetchError::Http { .. }));
    }
}
