use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::error::FetchError;
use super::types::CrawlerConfig;

#[derive(Debug, Clone)]
pub enum PageRequest {
    Get(Url),
    PostForm { url: Url, form: Vec<(String, String)> },
}

impl PageRequest {
    pub fn url(&self) -> &Url {
        match self {
            PageRequest::Get(url) | PageRequest::PostForm { url, .. } => url,
        }
    }
}

/// Fetches raw page bodies. Implementations must keep session cookies between
/// calls on the same instance.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &CrawlerConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(config.fetch_timeout)
            .pool_max_idle_per_host(config.concurrency.max(1));
        if let Some(ua) = &config.user_agent {
            builder = builder.user_agent(ua.clone());
        }
        Ok(Self {
            client: builder.build()?,
            timeout: config.fetch_timeout,
        })
    }

    async fn send(&self, request: PageRequest) -> Result<Vec<u8>, FetchError> {
        let response = match request {
            PageRequest::Get(url) => self.client.get(url).send().await?,
            PageRequest::PostForm { url, form } => self.client.post(url).form(&form).send().await?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
            });
        }

        // Buffer the whole body inside the deadline so a stalled stream also times out.
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        request: PageRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let url = request.url().to_string();
        debug!(url = %url, "fetching page");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.send(request)) => {
                result.unwrap_or_else(|_| Err(FetchError::Timeout(self.timeout)))
            }
        }
    }
}
