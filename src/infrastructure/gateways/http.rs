use crate::config::GatewaySettings;
use crate::error::GatewayError;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);
/// Backoff stops doubling after this many retries (6.4s).
const MAX_BACKOFF_DOUBLINGS: u32 = 6;

/// Shared HTTP plumbing for live adapters: per-call timeout, error
/// classification and a bounded retry budget for transient failures.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl HttpTransport {
    pub fn new(settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| GatewayError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sends the request built by `build`, retrying timeouts, connection
    /// errors and 5xx responses up to `max_retries` times. The closure runs
    /// once per attempt.
    pub async fn send<F>(&self, operation: &str, build: F) -> Result<serde_json::Value, GatewayError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let result = self.send_once(build(&self.client)).await;
            match result {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "retrying provider call");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                other => return other,
            }
        }
    }

    async fn send_once(&self, request: RequestBuilder) -> Result<serde_json::Value, GatewayError> {
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let body = response.text().await.map_err(classify)?;
        debug!(%status, bytes = body.len(), "provider response");

        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(GatewayError::Network(format!("HTTP {}", status.as_u16())));
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(GatewayError::Auth(truncate(&body)));
        }
        if !status.is_success() {
            return Err(GatewayError::Rejected {
                code: format!("HTTP_{}", status.as_u16()),
                message: truncate(&body),
            });
        }
        serde_json::from_str(&body).map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }
}

/// Delay before retry number `attempt` (1-based).
fn backoff(attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(MAX_BACKOFF_DOUBLINGS);
    RETRY_BASE_DELAY.saturating_mul(1 << doublings)
}

fn classify(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else if err.is_decode() {
        GatewayError::MalformedResponse(err.to_string())
    } else {
        GatewayError::Network(err.to_string())
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}

/// String field of a provider payload, if present and non-empty.
pub fn field<'a>(value: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    value
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

pub fn required_field(value: &serde_json::Value, name: &str) -> Result<String, GatewayError> {
    field(value, name)
        .map(str::to_string)
        .ok_or_else(|| GatewayError::MalformedResponse(format!("missing `{name}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_url_joining() {
        let settings = GatewaySettings {
            base_url: "https://provider.example/api/".to_string(),
            ..GatewaySettings::default()
        };
        let transport = HttpTransport::new(&settings).unwrap();
        assert_eq!(
            transport.url("/checkout/create"),
            "https://provider.example/api/checkout/create"
        );
    }

    #[test]
    fn test_field_helpers() {
        let payload = json!({"paymentID": "P1", "empty": "", "n": 3});
        assert_eq!(field(&payload, "paymentID"), Some("P1"));
        assert_eq!(field(&payload, "empty"), None);
        assert_eq!(field(&payload, "n"), None);
        assert!(matches!(
            required_field(&payload, "trxID"),
            Err(GatewayError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(1), Duration::from_millis(100));
        assert_eq!(backoff(3), Duration::from_millis(400));
        assert_eq!(backoff(7), Duration::from_millis(6400));
        assert_eq!(backoff(32), Duration::from_millis(6400));
        assert_eq!(backoff(u32::MAX), Duration::from_millis(6400));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        let settings = GatewaySettings {
            base_url: "http://127.0.0.1:1".to_string(),
            timeout_ms: 500,
            max_retries: 1,
            ..GatewaySettings::default()
        };
        let transport = HttpTransport::new(&settings).unwrap();
        let err = transport
            .send("status", |client| client.get(transport.url("status")))
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
