//! Ephemeral credential acquisition.
//!
//! Exactly one key is fetched per connect attempt. Anything other than a
//! well-formed `{ "client_secret": { "value": "..." } }` body is a failure.

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tracing::{debug, error};

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CredentialError {
    #[error("Credential request failed: {0}")]
    Request(String),
    #[error("Credential endpoint returned status {0}")]
    Status(u16),
    #[error("Credential response was not valid JSON: {0}")]
    InvalidResponse(String),
    #[error("No ephemeral key provided by the server")]
    MissingKey,
}

/// Issues a short-lived key for one connection attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_key(&self) -> Result<SecretString, CredentialError>;
}

/// Extracts `client_secret.value` from a session response body.
pub fn parse_session_response(body: &Value) -> Result<SecretString, CredentialError> {
    body.get("client_secret")
        .and_then(|s| s.get("value"))
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(|v| SecretString::from(v.to_string()))
        .ok_or(CredentialError::MissingKey)
}

/// Fetches keys from the backend's `GET /api/session` endpoint.
pub struct HttpCredentialProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialProvider {
    /// `base_url` is the backend origin, e.g. `http://localhost:3000`.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("{}/api/session", base_url.trim_end_matches('/')),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch_key(&self) -> Result<SecretString, CredentialError> {
        debug!(url = %self.url, "fetch_session_token_request");
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            error!(status = status.as_u16(), "Credential endpoint returned an error");
            return Err(CredentialError::Status(status.as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        debug!("fetch_session_token_response");

        parse_session_response(&body).inspect_err(|_| {
            error!("No ephemeral key provided by the server");
        })
    }
}
