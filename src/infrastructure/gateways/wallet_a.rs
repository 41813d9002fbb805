//! Mobile wallet A: tokenized checkout.
//!
//! Every call carries an `id_token` obtained from the grant endpoint. Tokens
//! are cached in the injected token store and renewed with their refresh
//! token once they come within the configured margin of expiry.

use super::http::{HttpTransport, field, required_field};
use super::signing::verify_hmac_sha256_hex;
use crate::config::WalletAConfig;
use crate::domain::gateway::{
    CallbackEnvelope, GatewayStatus, InitiateRequest, Initiated, PaymentGateway, QueryResult,
    RefundOutcome, RefundRequest, RefundResult,
};
use crate::domain::money::{AmountBounds, Currency};
use crate::domain::ports::{AccessToken, TokenStoreRef};
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

const SUCCESS_CODE: &str = "0000";
const GRANT_PATH: &str = "tokenized/checkout/token/grant";
const REFRESH_PATH: &str = "tokenized/checkout/token/refresh";
/// Default token lifetime when the grant response omits `expires_in`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 3600;

pub struct WalletAGateway {
    config: WalletAConfig,
    transport: HttpTransport,
    tokens: TokenStoreRef,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "paymentID")]
    payment_id: String,
    status: String,
    #[serde(rename = "merchantInvoiceNumber")]
    invoice: Option<String>,
    #[serde(rename = "trxID")]
    trx_id: Option<String>,
}

/// Maps the provider's `transactionStatus` vocabulary. Anything not known to
/// be final stays `Processing`.
pub fn map_status(status: &str) -> GatewayStatus {
    match status.to_ascii_lowercase().as_str() {
        "completed" | "success" => GatewayStatus::Completed,
        "cancelled" | "canceled" | "cancel" => GatewayStatus::Cancelled,
        "failed" | "failure" | "expired" | "declined" => GatewayStatus::Failed,
        _ => GatewayStatus::Processing,
    }
}

fn check_status_code(body: &Value) -> Result<(), GatewayError> {
    match field(body, "statusCode") {
        None | Some(SUCCESS_CODE) => Ok(()),
        Some(code) => Err(GatewayError::Rejected {
            code: code.to_string(),
            message: field(body, "statusMessage").unwrap_or("").to_string(),
        }),
    }
}

impl WalletAGateway {
    pub fn new(config: WalletAConfig, tokens: TokenStoreRef) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.settings)?;
        Ok(Self {
            config,
            transport,
            tokens,
        })
    }

    fn token_key(&self) -> String {
        format!("wallet_a:{}", self.config.app_key)
    }

    /// A cached token outside the expiry margin, else a refreshed one, else
    /// a fresh grant. A failed refresh falls back to the grant.
    async fn access_token(&self) -> Result<String, GatewayError> {
        let margin = Duration::from_secs(self.config.token_expiry_margin_secs);
        let key = self.token_key();
        let cached = self
            .tokens
            .get(&key)
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        let refresh_token = match cached {
            Some(token) if token.is_fresh(margin, Utc::now()) => return Ok(token.value),
            Some(token) => token.refresh_token,
            None => None,
        };

        let refreshed = match refresh_token {
            Some(refresh) => self
                .request_token("refresh_token", REFRESH_PATH, Some(refresh.as_str()))
                .await
                .inspect_err(|e| {
                    warn!(error = %e, "wallet A token refresh failed; requesting a new grant")
                })
                .ok(),
            None => None,
        };
        let token = match refreshed {
            Some(token) => token,
            None => self.request_token("grant_token", GRANT_PATH, None).await?,
        };
        self.tokens
            .put(&key, token.clone())
            .await
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        info!(expires_at = %token.expires_at, "wallet A token issued");
        Ok(token.value)
    }

    async fn request_token(
        &self,
        operation: &str,
        path: &str,
        refresh_token: Option<&str>,
    ) -> Result<AccessToken, GatewayError> {
        let mut payload = json!({
            "app_key": self.config.app_key,
            "app_secret": self.config.app_secret,
        });
        if let Some(refresh) = refresh_token {
            payload["refresh_token"] = json!(refresh);
        }
        let body = self
            .transport
            .send(operation, |client| {
                client
                    .post(self.transport.url(path))
                    .header("username", &self.config.username)
                    .header("password", &self.config.password)
                    .json(&payload)
            })
            .await?;
        check_status_code(&body).map_err(|e| GatewayError::Auth(e.to_string()))?;

        let ttl = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS);
        Ok(AccessToken {
            value: required_field(&body, "id_token")?,
            refresh_token: field(&body, "refresh_token")
                .or(refresh_token)
                .map(str::to_string),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl),
        })
    }

    async fn call(&self, operation: &str, path: &str, payload: Value) -> Result<Value, GatewayError> {
        let token = self.access_token().await?;
        let url = self.transport.url(path);
        let body = self
            .transport
            .send(operation, |client| {
                client
                    .post(&url)
                    .header("Authorization", &token)
                    .header("X-App-Key", &self.config.app_key)
                    .json(&payload)
            })
            .await?;
        check_status_code(&body)?;
        Ok(body)
    }

    fn to_query_result(body: Value) -> Result<QueryResult, GatewayError> {
        let status = map_status(&required_field(&body, "transactionStatus")?);
        Ok(QueryResult {
            status,
            gateway_transaction_id: field(&body, "paymentID").map(str::to_string),
            bank_reference: field(&body, "trxID").map(str::to_string),
            raw: body,
        })
    }

    fn payment_id(tx: &PaymentTransaction) -> Result<&str, GatewayError> {
        tx.gateway_transaction_id
            .as_deref()
            .ok_or_else(|| GatewayError::Rejected {
                code: "NO_PAYMENT_ID".to_string(),
                message: format!("transaction {} was never initiated", tx.id),
            })
    }
}

#[async_trait]
impl PaymentGateway for WalletAGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::WalletA
    }

    fn bounds(&self) -> AmountBounds {
        self.config.settings.bounds()
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.config.settings.currencies.contains(&currency)
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let body = self
            .call(
                "create",
                "tokenized/checkout/create",
                json!({
                    "mode": "0011",
                    "payerReference": request.order_reference,
                    "callbackURL": request.return_url.clone().unwrap_or_default(),
                    "amount": request.amount.to_string(),
                    "currency": request.currency.to_string(),
                    "intent": "sale",
                    "merchantInvoiceNumber": request.order_reference,
                }),
            )
            .await?;
        debug!(order = %request.order_reference, "wallet A checkout created");
        Ok(Initiated {
            gateway_transaction_id: required_field(&body, "paymentID")?,
            redirect_url: field(&body, "checkoutURL").map(str::to_string),
            raw: body,
        })
    }

    async fn query(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        let body = self
            .call(
                "status",
                "tokenized/checkout/payment/status",
                json!({ "paymentID": Self::payment_id(tx)? }),
            )
            .await?;
        Self::to_query_result(body)
    }

    /// Executes the authorised payment. A payment that was already executed
    /// is rejected by the provider; its status is read back instead.
    async fn execute(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        let executed = self
            .call(
                "execute",
                "tokenized/checkout/execute",
                json!({ "paymentID": Self::payment_id(tx)? }),
            )
            .await;
        match executed {
            Ok(body) => Self::to_query_result(body),
            Err(GatewayError::Rejected { code, .. }) => {
                debug!(%code, "execute rejected, reading status");
                self.query(tx).await
            }
            Err(err) => Err(err),
        }
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, GatewayError> {
        let payment_id = request
            .gateway_transaction_id
            .clone()
            .ok_or_else(|| GatewayError::MalformedResponse("missing paymentID".to_string()))?;
        let body = self
            .call(
                "refund",
                "tokenized/checkout/payment/refund",
                json!({
                    "paymentID": payment_id,
                    "trxID": request.bank_reference,
                    "amount": request.amount.to_string(),
                    "sku": request.refund_id,
                    "reason": request.reason,
                }),
            )
            .await?;
        let outcome = match field(&body, "transactionStatus").map(map_status) {
            Some(GatewayStatus::Completed) => RefundOutcome::Completed,
            Some(GatewayStatus::Processing) => RefundOutcome::Processing,
            _ => RefundOutcome::Failed,
        };
        Ok(RefundResult {
            outcome,
            gateway_refund_id: field(&body, "refundTrxID").map(str::to_string),
            raw: body,
        })
    }

    fn parse_callback(&self, raw: &[u8]) -> Result<CallbackEnvelope, GatewayError> {
        let body: CallbackBody = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let payload =
            serde_json::from_slice(raw).map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        Ok(CallbackEnvelope {
            provider_transaction_id: body.payment_id,
            order_reference: body.invoice,
            event_type: "payment".to_string(),
            status: map_status(&body.status),
            bank_reference: body.trx_id,
            payload,
        })
    }

    /// Redirect callbacks are unsigned unless a webhook secret is configured;
    /// unsigned ones are always confirmed through a status query.
    fn verify_callback(&self, raw: &[u8], signature: Option<&str>) -> bool {
        match (&self.config.settings.webhook_secret, signature) {
            (Some(secret), Some(signature)) => {
                verify_hmac_sha256_hex(secret.as_bytes(), raw, signature)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::TokenStore;
    use crate::infrastructure::gateways::signing::hmac_sha256_hex;
    use crate::infrastructure::in_memory::InMemoryTokenStore;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn gateway(secret: Option<&str>) -> WalletAGateway {
        let mut config = WalletAConfig::default();
        config.settings.webhook_secret = secret.map(str::to_string);
        WalletAGateway::new(config, Arc::new(InMemoryTokenStore::new())).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("Completed"), GatewayStatus::Completed);
        assert_eq!(map_status("success"), GatewayStatus::Completed);
        assert_eq!(map_status("Cancelled"), GatewayStatus::Cancelled);
        assert_eq!(map_status("failure"), GatewayStatus::Failed);
        assert_eq!(map_status("Initiated"), GatewayStatus::Processing);
        assert_eq!(map_status("something-new"), GatewayStatus::Processing);
    }

    #[test]
    fn test_status_code_check() {
        assert!(check_status_code(&json!({"statusCode": "0000"})).is_ok());
        assert!(check_status_code(&json!({"paymentID": "P1"})).is_ok());
        assert_eq!(
            check_status_code(&json!({"statusCode": "2023", "statusMessage": "Insufficient Balance"})),
            Err(GatewayError::Rejected {
                code: "2023".into(),
                message: "Insufficient Balance".into()
            })
        );
    }

    #[test]
    fn test_parse_callback() {
        let raw = br#"{"paymentID":"P1","status":"success","merchantInvoiceNumber":"ORD-1","trxID":"TRX9"}"#;
        let envelope = gateway(None).parse_callback(raw).unwrap();
        assert_eq!(envelope.provider_transaction_id, "P1");
        assert_eq!(envelope.order_reference.as_deref(), Some("ORD-1"));
        assert_eq!(envelope.status, GatewayStatus::Completed);
        assert_eq!(envelope.bank_reference.as_deref(), Some("TRX9"));
        assert!(gateway(None).parse_callback(b"status=success").is_err());
    }

    #[test]
    fn test_verify_callback_requires_secret() {
        let raw = br#"{"paymentID":"P1","status":"success"}"#;
        let signature = hmac_sha256_hex(b"hook-secret", raw).unwrap();

        assert!(!gateway(None).verify_callback(raw, Some(&signature)));
        assert!(gateway(Some("hook-secret")).verify_callback(raw, Some(&signature)));
        assert!(!gateway(Some("hook-secret")).verify_callback(raw, None));
    }

    #[tokio::test]
    async fn test_cached_token_skips_grant() {
        let tokens = Arc::new(InMemoryTokenStore::new());
        let gateway = WalletAGateway::new(WalletAConfig::default(), tokens.clone()).unwrap();
        tokens
            .put(
                &gateway.token_key(),
                AccessToken {
                    value: "cached".into(),
                    refresh_token: None,
                    expires_at: Utc::now() + chrono::Duration::seconds(600),
                },
            )
            .await
            .unwrap();
        assert_eq!(gateway.access_token().await.unwrap(), "cached");
    }

    /// Serves canned token responses on a local port and records the
    /// request paths it saw.
    async fn token_server() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let paths = Arc::new(Mutex::new(Vec::new()));
        let seen = paths.clone();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let request = read_request(&mut stream).await;
                let path = request.split_whitespace().nth(1).unwrap_or("").to_string();
                let body = if path.ends_with("/refresh") {
                    r#"{"id_token":"refreshed","expires_in":3600}"#
                } else {
                    r#"{"id_token":"granted","refresh_token":"r-1","expires_in":3600}"#
                };
                seen.lock().unwrap().push(path);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.ok();
            }
        });
        (base_url, paths)
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap())
                    })
                    .unwrap_or(0);
                if buf.len() >= end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    async fn live_gateway(base_url: String, tokens: Arc<InMemoryTokenStore>) -> WalletAGateway {
        let mut config = WalletAConfig::default();
        config.settings.base_url = base_url;
        config.settings.max_retries = 0;
        config.token_expiry_margin_secs = 60;
        WalletAGateway::new(config, tokens).unwrap()
    }

    #[tokio::test]
    async fn test_token_inside_expiry_margin_is_not_reused() {
        let (base_url, paths) = token_server().await;
        let tokens = Arc::new(InMemoryTokenStore::new());
        let gateway = live_gateway(base_url, tokens.clone()).await;
        tokens
            .put(
                &gateway.token_key(),
                AccessToken {
                    value: "expiring".into(),
                    refresh_token: None,
                    expires_at: Utc::now() + chrono::Duration::seconds(30),
                },
            )
            .await
            .unwrap();

        assert_eq!(gateway.access_token().await.unwrap(), "granted");
        assert_eq!(
            *paths.lock().unwrap(),
            ["/tokenized/checkout/token/grant".to_string()]
        );

        // The new grant is cached with its refresh token.
        let stored = tokens.get(&gateway.token_key()).await.unwrap().unwrap();
        assert_eq!(stored.value, "granted");
        assert_eq!(stored.refresh_token.as_deref(), Some("r-1"));
        assert_eq!(gateway.access_token().await.unwrap(), "granted");
        assert_eq!(paths.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_renewed_with_refresh_token() {
        let (base_url, paths) = token_server().await;
        let tokens = Arc::new(InMemoryTokenStore::new());
        let gateway = live_gateway(base_url, tokens.clone()).await;
        tokens
            .put(
                &gateway.token_key(),
                AccessToken {
                    value: "expired".into(),
                    refresh_token: Some("r-0".into()),
                    expires_at: Utc::now() - chrono::Duration::seconds(5),
                },
            )
            .await
            .unwrap();

        assert_eq!(gateway.access_token().await.unwrap(), "refreshed");
        assert_eq!(
            *paths.lock().unwrap(),
            ["/tokenized/checkout/token/refresh".to_string()]
        );
        let stored = tokens.get(&gateway.token_key()).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token.as_deref(), Some("r-0"));
    }
}
