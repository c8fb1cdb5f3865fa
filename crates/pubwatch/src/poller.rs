//! Feed poller.
//!
//! One fetch per call, always bounded by a timeout, never an error: every
//! outcome becomes a [`FeedSnapshot`]. Sources hand back the raw body; decoding
//! and validation happen here, so an upstream answering with garbage is a
//! malformed payload rather than a transport failure.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::feed::FeedDefinition;
use crate::snapshot::{FeedSnapshot, FetchStatus};

/// Where feed payloads come from.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// The response body of a successful request, undecoded.
    async fn fetch(&self, feed: &FeedDefinition) -> Result<String, TransportError>;
}

/// Fetches feeds over HTTP from the upstream API.
pub struct HttpFeedSource {
    client: reqwest::Client,
    base_url: Option<String>,
}

impl HttpFeedSource {
    pub fn new(
        base_url: Option<String>,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::Request(format!("invalid API token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
        })
    }

    /// Absolute sources are used as-is, paths are joined to the base URL.
    pub fn url_for(&self, feed: &FeedDefinition) -> Result<String, TransportError> {
        let source = feed.source.trim();
        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(source.to_string());
        }
        let base = self.base_url.as_deref().ok_or_else(|| {
            TransportError::Request(format!(
                "feed '{}' has a relative source but no api.base_url is configured",
                feed.id
            ))
        })?;
        Ok(format!("{base}/{}", source.trim_start_matches('/')))
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, feed: &FeedDefinition) -> Result<String, TransportError> {
        let url = self.url_for(feed)?;
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }

        Ok(response.text().await?)
    }
}

/// Turns fetches into snapshots.
pub struct Poller {
    source: Arc<dyn FeedSource>,
    timeout: Duration,
}

impl Poller {
    pub fn new(source: Arc<dyn FeedSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub async fn poll(&self, feed: &FeedDefinition) -> FeedSnapshot {
        let fetched = tokio::time::timeout(self.timeout, self.source.fetch(feed)).await;
        let now = Utc::now();

        let snapshot = match fetched {
            Ok(Ok(body)) => FeedSnapshot::from_body(&feed.id, now, &body),
            Ok(Err(e)) => FeedSnapshot::transport_error(&feed.id, now, e.to_string()),
            Err(_) => FeedSnapshot::transport_error(
                &feed.id,
                now,
                TransportError::Timeout(self.timeout).to_string(),
            ),
        };

        match snapshot.status {
            FetchStatus::Ok => debug!(
                feed = %feed.id,
                published = snapshot.publication.is_some(),
                "Feed polled"
            ),
            FetchStatus::TransportError | FetchStatus::Malformed => warn!(
                feed = %feed.id,
                status = ?snapshot.status,
                error = snapshot.error.as_deref().unwrap_or_default(),
                "Feed poll failed"
            ),
        }
        snapshot
    }
}
