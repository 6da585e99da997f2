//! Client for the external prompt-to-command translation service.

use reqwest::{Client, StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslatorError {
    #[error("translator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("translator returned status {0}")]
    Status(StatusCode),
}

/// Plain request/response collaborator: POST `{prompt}`, get back a
/// structured command object that is forwarded unchanged. No retries; a
/// failure surfaces once to the requesting viewer.
#[derive(Debug, Clone)]
pub struct TranslatorClient {
    client: Client,
    endpoint: String,
}

impl TranslatorClient {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: Client::new(),
            endpoint,
        }
    }

    pub async fn translate(&self, prompt: &str) -> Result<serde_json::Value, TranslatorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TranslatorError::Status(response.status()));
        }
        Ok(response.json().await?)
    }
}
