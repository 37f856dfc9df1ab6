use stromdb_core::ErrorCategory;
use thiserror::Error;

/// Failures building the HTTP client or a source URL. Fatal at startup.
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid source URL \"{url}\": {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Why a single page fetch failed. Recovered per target by the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("page not found: {url}")]
    NotFound { url: String },

    #[error("blocked by source (HTTP {status}) at {url}")]
    Blocked {
        url: String,
        status: u16,
        retry_after_secs: Option<u64>,
    },

    #[error("request timed out: {url}")]
    Timeout { url: String },

    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("unexpected failure fetching {url}: {reason}")]
    Unknown { url: String, reason: String },
}

impl FetchError {
    /// Error-log category for this failure.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            FetchError::NotFound { .. } => ErrorCategory::NotFound,
            FetchError::Blocked { .. } => ErrorCategory::Blocked,
            FetchError::Timeout { .. } => ErrorCategory::Timeout,
            FetchError::Network { .. } => ErrorCategory::Network,
            FetchError::Unknown { .. } => ErrorCategory::Unknown,
        }
    }

    /// `NotFound` is a legitimate empty result for minor locations; every
    /// other kind may clear up on a later attempt.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        !matches!(self, FetchError::NotFound { .. })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            FetchError::NotFound { url }
            | FetchError::Blocked { url, .. }
            | FetchError::Timeout { url }
            | FetchError::Network { url, .. }
            | FetchError::Unknown { url, .. } => url,
        }
    }

    /// Classifies a transport-level `reqwest` failure.
    #[must_use]
    pub fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let url = url.to_owned();
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if err.is_connect() || err.is_request() {
            FetchError::Network {
                url,
                reason: err.to_string(),
            }
        } else {
            FetchError::Unknown {
                url,
                reason: err.to_string(),
            }
        }
    }
}

/// Why a fetched page is unusable before extraction is attempted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("empty response body")]
    Empty,

    #[error("page text too short ({chars} chars)")]
    TooShort { chars: usize },

    #[error("page contains no per-kWh price content")]
    NoPriceContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_retriable() {
        let err = FetchError::NotFound {
            url: "https://example.test/x".to_owned(),
        };
        assert!(!err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn other_kinds_are_retriable() {
        let url = "https://example.test/x".to_owned();
        let errors = [
            FetchError::Blocked {
                url: url.clone(),
                status: 429,
                retry_after_secs: Some(30),
            },
            FetchError::Timeout { url: url.clone() },
            FetchError::Network {
                url: url.clone(),
                reason: "connection reset".to_owned(),
            },
            FetchError::Unknown {
                url,
                reason: "HTTP 502".to_owned(),
            },
        ];
        for err in &errors {
            assert!(err.is_retriable(), "{err} should be retriable");
            assert_eq!(err.url(), "https://example.test/x");
        }
    }
}
