// HTTP forwarder: delivers a message body to a jobber's target URL

use crate::errors::ForwardError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Successful forward response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub status: u16,
    pub body: String,
}

/// Forwarder trait defines how a delivery body reaches its target
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// POST `body` to `url`; anything but HTTP 200 is a failure
    async fn forward(&self, url: &str, body: &[u8]) -> Result<ForwardResponse, ForwardError>;
}

/// HttpForwarder posts raw message bodies with reqwest
pub struct HttpForwarder {
    client: Client,
}

impl HttpForwarder {
    /// Create a new HttpForwarder with the specified timeout
    pub fn new(timeout_seconds: u64) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ForwardError::Client(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    #[tracing::instrument(skip(self, body), fields(bytes = body.len()))]
    async fn forward(&self, url: &str, body: &[u8]) -> Result<ForwardResponse, ForwardError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| ForwardError::Request(e.to_string()))?;

        let status = response.status();
        tracing::debug!(status = status.as_u16(), "Forward response received");

        let text = response.text().await.unwrap_or_default();

        if status != StatusCode::OK {
            return Err(ForwardError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        Ok(ForwardResponse {
            status: status.as_u16(),
            body: text,
        })
    }
}
