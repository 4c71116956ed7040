//! Forwarding of drained batches to another edge server.

use iotedge_shared::protocol::http::{Output, URI_SAVE_TIMESERIES};
use iotedge_shared::Series;
use std::time::Duration;

pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("{url} rejected the batch: {status}")]
    Rejected { url: String, status: String },
}

/// HTTP client posting batches to `<base>/timeseries/save`.
#[derive(Debug, Clone)]
pub struct RedirectClient {
    client: reqwest::Client,
    url: String,
}

impl RedirectClient {
    pub fn new(base: &str) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base, FORWARD_TIMEOUT)
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}{}", base.trim_end_matches('/'), URI_SAVE_TIMESERIES),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post one batch. Not retried; the caller logs and moves on.
    pub async fn forward(&self, batch: &[Series]) -> Result<(), ForwardError> {
        let request_err = |source| ForwardError::Request {
            url: self.url.clone(),
            source,
        };

        let response = self
            .client
            .post(&self.url)
            .json(batch)
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForwardError::Status {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let output: Output = response.json().await.map_err(request_err)?;
        if !output.is_ok() {
            return Err(ForwardError::Rejected {
                url: self.url.clone(),
                status: output.status,
            });
        }
        tracing::debug!(url = %self.url, series = batch.len(), answer = %output.answer, "batch forwarded");
        Ok(())
    }
}
