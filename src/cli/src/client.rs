//! HTTP client for communicating with the Speedline server.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// API response wrapper matching the server's ApiResponse format.
#[derive(Debug, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub error_code: Option<String>,
}

/// Failures the commands react to specifically.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("version conflict: {message} (server is at version {current_version})")]
    Conflict {
        message: String,
        current_version: u64,
        current: Value,
    },

    #[error("API error ({status}): {message}")]
    Api { status: StatusCode, message: String },
}

/// HTTP client for the Speedline API.
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client pointing at the given base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Return the configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a GET request and deserialize the response data.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;

        unwrap_response(status, &body)
    }

    /// Perform a POST request with a JSON body and deserialize the response data.
    ///
    /// A `409` becomes [`ClientError::Conflict`] carrying the server's
    /// current state.
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read response from {}", url))?;

        unwrap_response(status, &body)
    }

    /// Perform a raw GET request and return the full JSON value (for health endpoint).
    pub async fn get_raw(&self, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }
}

/// Turn a status and body into the `data` payload or a typed error.
fn unwrap_response<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T> {
    let parsed: Option<ApiResponse<Value>> = serde_json::from_str(body).ok();

    if status == StatusCode::CONFLICT {
        let parsed = parsed.unwrap_or(ApiResponse {
            success: false,
            data: None,
            error: None,
            error_code: None,
        });
        let current = parsed.data.unwrap_or(Value::Null);
        return Err(ClientError::Conflict {
            message: parsed.error.unwrap_or_else(|| "state is out of date".into()),
            current_version: current.get("version").and_then(Value::as_u64).unwrap_or(0),
            current,
        }
        .into());
    }

    let Some(api_resp) = parsed else {
        return Err(ClientError::Api {
            status,
            message: body.trim().to_string(),
        }
        .into());
    };

    if !status.is_success() || !api_resp.success {
        let message = api_resp.error.unwrap_or_else(|| "Unknown error".into());
        return Err(ClientError::Api {
            status,
            message: match api_resp.error_code {
                Some(code) => format!("[{code}] {message}"),
                None => message,
            },
        }
        .into());
    }

    let data = api_resp
        .data
        .ok_or_else(|| anyhow::anyhow!("API returned success but no data"))?;
    serde_json::from_value(data).context("Unexpected response shape")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_unwraps_data() {
        let body = r#"{"success":true,"data":{"version":3}}"#;
        let value: Value = unwrap_response(StatusCode::OK, body).unwrap();
        assert_eq!(value["version"], 3);
    }

    #[test]
    fn test_conflict_carries_current_version() {
        let body = r#"{"success":false,"data":{"version":9,"lines":[]},"error":"State is out of date","error_code":"VERSION_CONFLICT"}"#;
        let err = unwrap_response::<Value>(StatusCode::CONFLICT, body).unwrap_err();

        match err.downcast_ref::<ClientError>() {
            Some(ClientError::Conflict {
                current_version, ..
            }) => assert_eq!(*current_version, 9),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_error_envelope_is_reported() {
        let body = r#"{"success":false,"error":"lines[0].name: must be a non-empty string","error_code":"VALIDATION_ERROR"}"#;
        let err = unwrap_response::<Value>(StatusCode::UNPROCESSABLE_ENTITY, body).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("VALIDATION_ERROR"));
        assert!(text.contains("lines[0].name"));
    }

    #[test]
    fn test_non_json_body() {
        let err = unwrap_response::<Value>(StatusCode::BAD_GATEWAY, "upstream down").unwrap_err();
        assert!(err.to_string().contains("upstream down"));
    }
}
