//! HTTP transport for the price source.

mod url;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{FetchError, ScraperError};

pub use url::source_url;

/// A successfully fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub html: String,
    pub status_code: u16,
}

/// Retrieves one page. Implementations issue exactly one request per call;
/// retry and pacing belong to the caller.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// [`Fetcher`] backed by `reqwest`.
///
/// Status mapping: 404/410 → [`FetchError::NotFound`]; 403/429 →
/// [`FetchError::Blocked`]; any other non-2xx → [`FetchError::Unknown`].
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates an `HttpFetcher` with the configured timeout and `User-Agent`.
    ///
    /// # Errors
    ///
    /// Returns [`ScraperError::Http`] if the underlying `reqwest::Client`
    /// cannot be constructed.
    pub fn new(timeout_secs: u64, user_agent: &str) -> Result<Self, ScraperError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8",
            )
            .header(reqwest::header::ACCEPT_LANGUAGE, "de-DE,de;q=0.9,en;q=0.5")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(FetchError::NotFound {
                url: url.to_owned(),
            });
        }

        if status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok());
            return Err(FetchError::Blocked {
                url: url.to_owned(),
                status: status.as_u16(),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            return Err(FetchError::Unknown {
                url: url.to_owned(),
                reason: format!("unexpected HTTP status {}", status.as_u16()),
            });
        }

        let html = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(url, &e))?;

        tracing::debug!(url, bytes = html.len(), "fetched page");

        Ok(FetchedPage {
            url: url.to_owned(),
            html,
            status_code: status.as_u16(),
        })
    }
}
