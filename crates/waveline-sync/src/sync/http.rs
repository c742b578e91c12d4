//! HTTP transport for the remote backend's per-entity endpoints.
//!
//! `GET {base}/{entity}?scope={key}&since={cursor}` for incremental pull and
//! `POST {base}/{entity}/batch` for push. Responses are JSON envelopes:
//! `{"records": [...]}` and `{"results": [...]}`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;

use crate::entity::UNSCOPED_KEY;
use crate::error::TransportError;
use crate::types::RemoteRecord;

use super::types::{SyncTransport, UpsertOutcome};

const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone)]
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
    bearer: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TransportError> {
        let base = normalize_base_url(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::network(e.to_string()))?;
        Ok(Self {
            base,
            client,
            bearer: None,
        })
    }

    /// Attach a bearer token to every request.
    #[must_use]
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = parse_api_error(status, &body);
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::auth(message),
            s if s.is_server_error()
                || s == StatusCode::REQUEST_TIMEOUT
                || s == StatusCode::TOO_MANY_REQUESTS =>
            {
                TransportError::network(message)
            }
            _ => TransportError::permanent(message),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn list(
        &self,
        entity: &str,
        scope_key: &str,
        since: i64,
    ) -> Result<Vec<RemoteRecord>, TransportError> {
        let mut req = self
            .client
            .get(format!("{}/{entity}", self.base))
            .query(&[("since", since.to_string())]);
        if scope_key != UNSCOPED_KEY {
            req = req.query(&[("scope", scope_key)]);
        }

        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = Self::check_status(response).await?;
        let payload = response
            .json::<ListResponse>()
            .await
            .map_err(|e| TransportError::permanent(format!("invalid list payload: {e}")))?;
        Ok(payload.records)
    }

    async fn upsert_batch(
        &self,
        entity: &str,
        records: &[RemoteRecord],
    ) -> Result<Vec<UpsertOutcome>, TransportError> {
        let req = self
            .client
            .post(format!("{}/{entity}/batch", self.base))
            .json(&json!({ "records": records }));

        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let response = Self::check_status(response).await?;
        let payload = response
            .json::<UpsertResponse>()
            .await
            .map_err(|e| TransportError::permanent(format!("invalid batch payload: {e}")))?;
        Ok(payload.results)
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    records: Vec<RemoteRecord>,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    results: Vec<UpsertOutcome>,
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
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    TransportError::network(e.to_string())
}

fn normalize_base_url(raw: String) -> Result<String, TransportError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TransportError::permanent("base URL must not be empty"));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        Ok(trimmed.trim_end_matches('/').to_string())
    } else {
        Err(TransportError::permanent(
            "base URL must include http:// or https://",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url("https://api.example.com/".to_string()).unwrap(),
            "https://api.example.com"
        );
    }

    #[test]
    fn api_error_prefers_structured_message() {
        let msg = parse_api_error(
            StatusCode::BAD_REQUEST,
            r#"{"message": "scope is required"}"#,
        );
        assert_eq!(msg, "scope is required (400)");

        let msg = parse_api_error(StatusCode::INTERNAL_SERVER_ERROR, "");
        assert_eq!(msg, "HTTP 500");
    }
}
