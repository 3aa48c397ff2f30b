//! JSON-over-HTTP client for the remote sync service.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::remote::{
    PullRequest, PullResponse, PushRequest, PushResponse, RemoteError, RemoteResult, RemoteSync,
};
use crate::util::{compact_text, is_http_url, normalize_text_option};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of the bearer token sent with every request
pub trait CredentialProvider: Send + Sync {
    /// Current token, or `None` when the user is signed out or the token expired
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, typically from configuration
#[derive(Clone, PartialEq, Eq)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_tuple("StaticToken")
            .field(&"[REDACTED]")
            .finish()
    }
}

impl CredentialProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        normalize_text_option(Some(self.0.clone()))
    }
}

/// [`RemoteSync`] over `POST {base_url}/sync/pull` and `POST {base_url}/sync/push`
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        credentials: Arc<dyn CredentialProvider>,
    ) -> RemoteResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            client,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> RemoteResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let token = self.credentials.bearer_token().ok_or_else(|| {
            RemoteError::Unauthorized("no credentials available".to_string())
        })?;

        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, parse_api_error(status, &body)));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|error| RemoteError::InvalidPayload(format!("{error}: {}", compact_text(&body))))
    }
}

impl RemoteSync for HttpRemote {
    async fn pull(&self, request: PullRequest) -> RemoteResult<PullResponse> {
        tracing::debug!(
            entity_type = %request.entity_type,
            since = ?request.since,
            "Pulling remote changes"
        );
        self.post("/sync/pull", &request).await
    }

    async fn push(&self, request: PushRequest) -> RemoteResult<PushResponse> {
        tracing::debug!(operations = request.operations.len(), "Pushing local changes");
        self.post("/sync/push", &request).await
    }
}

fn classify_status(status: StatusCode, message: String) -> RemoteError {
    match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Network(message),
        status if status.is_server_error() => RemoteError::Network(message),
        _ => RemoteError::Rejected(message),
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> RemoteResult<String> {
    let base_url = normalize_text_option(Some(raw)).ok_or_else(|| {
        RemoteError::InvalidConfiguration("remote base URL must not be empty".to_string())
    })?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(RemoteError::InvalidConfiguration(
            "remote base URL must include http:// or https://".to_string(),
        ))
    }
}
