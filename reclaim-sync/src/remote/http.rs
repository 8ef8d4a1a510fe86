/// HTTP remote applier
///
/// POSTs each operation's payload to `<base_url>/<kind>` with an
/// `Idempotency-Key` header so the backend can drop replays of an ambiguous
/// failure. The response body is expected to carry the created record's `id`.

use async_trait::async_trait;
use serde::Deserialize;

use crate::idempotency::IdempotencyKey;
use crate::operation::Operation;
use crate::remote::{RemoteApply, RemoteError, RemoteId};

/// Header carrying the idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    id: serde_json::Value,
}

/// Remote applier backed by a JSON REST endpoint
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    /// Send a bearer token with every request
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Use a preconfigured client (proxies, TLS roots, ...)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn endpoint(&self, operation: &Operation) -> String {
        format!("{}/{}", self.base_url, operation.kind())
    }
}

/// Map a non-success HTTP status to a remote error
pub fn classify_status(status: u16, body: &str) -> RemoteError {
    let detail = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };

    match status {
        408 | 425 | 429 => RemoteError::Transient(detail),
        400..=499 => RemoteError::Permanent(detail),
        _ => RemoteError::Transient(detail),
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_connect() {
        RemoteError::NetworkLost(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}

#[async_trait]
impl RemoteApply for HttpRemote {
    async fn apply(&self, operation: &Operation, key: &IdempotencyKey) -> Result<RemoteId, RemoteError> {
        let body = operation
            .payload_json()
            .map_err(|e| RemoteError::Permanent(format!("unserializable payload: {}", e)))?;

        let mut request = self
            .client
            .post(self.endpoint(operation))
            .header(IDEMPOTENCY_HEADER, key.as_str())
            .json(&body);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let created: CreatedResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Transient(format!("unreadable response: {}", e)))?;

        let id = match created.id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(RemoteId(id))
    }
}
