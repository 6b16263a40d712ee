//! Discrete inference calls
//!
//! One-shot generate requests against the service's HTTP API. Every call from the
//! bridge goes through [`InferenceClient::generate_queued`] so it shares the
//! process-wide pacing and retry policy of the [`ThrottleQueue`].

use serde::Serialize;

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::queue::ThrottleQueue;
use crate::{Error, Result};

/// Generate request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl GenerateRequest {
    /// Single user turn containing `prompt`
    #[must_use]
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![TextPart {
                    text: prompt.into(),
                }],
            }],
        }
    }
}

/// HTTP client for discrete generate calls
#[derive(Clone)]
pub struct InferenceClient {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    model: String,
    queue: ThrottleQueue,
}

impl std::fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceClient")
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl InferenceClient {
    /// Client for `service` whose queued calls go through `queue`
    #[must_use]
    pub fn new(service: &ServiceConfig, queue: ThrottleQueue) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: service.api_base.trim_end_matches('/').to_string(),
            api_key: service.api_key.clone(),
            model: service.model.clone(),
            queue,
        }
    }

    /// Generate endpoint for the configured model
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}/models/{}:generate", self.api_base, self.model)
    }

    /// One attempt, bypassing the queue
    ///
    /// Returns the raw response body.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] classified from the HTTP status or transport failure
    pub async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> std::result::Result<Vec<u8>, ServiceError> {
        let mut builder = self.client.post(self.endpoint()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            tracing::debug!(error = %e, "generate request failed");
            ServiceError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, body = %body, "generate returned error status");
            return Err(ServiceError::from_status(status.as_u16(), &body));
        }

        let bytes = response.bytes().await.map_err(ServiceError::from)?;
        tracing::debug!(status = %status, bytes = bytes.len(), "generate succeeded");
        Ok(bytes.to_vec())
    }

    /// Submit a generate call through the shared queue
    ///
    /// # Errors
    ///
    /// Returns [`Error::Service`] with the final classified failure once the queue
    /// gives up or the failure is permanent
    pub async fn generate_queued(&self, request: GenerateRequest) -> Result<Vec<u8>> {
        let client = self.clone();
        let handle = self.queue.submit(move || {
            let client = client.clone();
            let request = request.clone();
            async move { client.generate(&request).await }
        });

        tracing::debug!(seq = handle.seq(), "generate queued");
        handle.await.map_err(Error::from)
    }
}
