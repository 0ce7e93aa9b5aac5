//! Delivery provider adapter.
//!
//! The rest of the server only sees the [`DeliveryProvider`] trait. The
//! production implementation posts JSON to a Resend-style `/emails` endpoint
//! and expects `{ "id": "..." }` back.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One fully rendered message, ready for the wire.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Transport(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

#[async_trait]
pub trait DeliveryProvider: Send + Sync {
    /// Hand one message to the provider. Returns the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String, ProviderError>;
}

#[derive(Deserialize)]
struct SendResponse {
    id: String,
}

/// Resend-compatible HTTP provider.
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpProvider {
    pub fn new(
        api_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/emails", api_url.trim_end_matches('/')),
            api_key,
        })
    }
}

#[async_trait]
impl DeliveryProvider for HttpProvider {
    async fn send(&self, email: &OutboundEmail) -> Result<String, ProviderError> {
        let mut request = self.client.post(&self.endpoint).json(email);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SendResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        if parsed.id.is_empty() {
            return Err(ProviderError::MalformedResponse("empty message id".into()));
        }
        Ok(parsed.id)
    }
}
