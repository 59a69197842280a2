//! HTTP client for a remote retrieval service.
//!
//! Wire format: `POST {base_url}/retrieve` with `{question, kbId, k}`,
//! answered by `{passages: [{content, source, confidence}]}`.

use super::KnowledgeRetriever;
use crate::config::{RetryConfig, RetrieverConfig};
use crate::error::RetrieverError;
use crate::providers::with_retry;
use crate::types::KbPassage;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveRequest<'a> {
    question: &'a str,
    kb_id: &'a str,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct RetrieveResponse {
    #[serde(default)]
    passages: Vec<KbPassage>,
}

/// Retriever backed by a remote HTTP service.
pub struct HttpRetriever {
    client: Client,
    base_url: String,
    timeout_secs: u64,
    retry: RetryConfig,
}

impl HttpRetriever {
    pub fn new(config: &RetrieverConfig) -> Result<Self, RetrieverError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RetrieverError::Unavailable {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout_secs: config.timeout_secs,
            retry: config.retry.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn map_transport_error(&self, err: reqwest::Error) -> RetrieverError {
        if err.is_timeout() {
            RetrieverError::Timeout {
                timeout_secs: self.timeout_secs,
            }
        } else {
            RetrieverError::Unavailable {
                message: err.to_string(),
            }
        }
    }

    fn map_status(status: reqwest::StatusCode, body: &str) -> RetrieverError {
        if status.is_server_error() || status.as_u16() == 429 {
            RetrieverError::Unavailable {
                message: format!("HTTP {}: {}", status, body),
            }
        } else {
            RetrieverError::InvalidResponse {
                message: format!("HTTP {}: {}", status, body),
            }
        }
    }

    async fn retrieve_once(
        &self,
        question: &str,
        kb_id: &str,
        k: usize,
    ) -> Result<Vec<KbPassage>, RetrieverError> {
        let url = format!("{}/retrieve", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&RetrieveRequest { question, kb_id, k })
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        if !status.is_success() {
            return Err(Self::map_status(status, &body));
        }

        let parsed: RetrieveResponse =
            serde_json::from_str(&body).map_err(|e| RetrieverError::InvalidResponse {
                message: format!("Invalid JSON: {}", e),
            })?;
        Ok(parsed.passages)
    }
}

#[async_trait]
impl KnowledgeRetriever for HttpRetriever {
    async fn retrieve(
        &self,
        question: &str,
        kb_id: &str,
        k: usize,
    ) -> Result<Vec<KbPassage>, RetrieverError> {
        debug!(url = %self.base_url, kb_id = %kb_id, k, "Retrieving KB passages");
        with_retry(&self.retry, || self.retrieve_once(question, kb_id, k)).await
    }

    async fn health_check(&self) -> Result<(), RetrieverError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(RetrieverError::Unavailable {
                message: format!("health check returned HTTP {}", status),
            })
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}
