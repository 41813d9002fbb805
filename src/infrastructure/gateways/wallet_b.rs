//! Mobile wallet B: merchant-signed checkout. Every request carries the
//! merchant id, a timestamp and an HMAC-SHA256 over `timestamp + body`.
//! The provider offers no refund API.

use super::http::{HttpTransport, field, required_field};
use super::signing::{hmac_sha256_hex, verify_hmac_sha256_hex};
use crate::config::WalletBConfig;
use crate::domain::gateway::{
    CallbackEnvelope, GatewayStatus, InitiateRequest, Initiated, PaymentGateway, QueryResult,
    RefundRequest, RefundResult,
};
use crate::domain::money::{AmountBounds, Currency};
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

pub struct WalletBGateway {
    config: WalletBConfig,
    transport: HttpTransport,
}

#[derive(Debug, Deserialize)]
struct CallbackForm {
    payment_ref_id: String,
    status: String,
    order_id: Option<String>,
    issuer_payment_ref: Option<String>,
}

pub fn map_status(status: &str) -> GatewayStatus {
    match status.to_ascii_lowercase().as_str() {
        "success" => GatewayStatus::Completed,
        "aborted" | "cancelled" | "canceled" => GatewayStatus::Cancelled,
        "failed" | "fraud" | "invalidrequest" | "expired" => GatewayStatus::Failed,
        _ => GatewayStatus::Processing,
    }
}

impl WalletBGateway {
    pub fn new(config: WalletBConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.settings)?;
        Ok(Self { config, transport })
    }

    /// `(timestamp, signature)` headers for a request body.
    fn sign(&self, body: &str) -> Result<(String, String), GatewayError> {
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
        let signature = hmac_sha256_hex(
            self.config.signing_key.as_bytes(),
            format!("{timestamp}{body}").as_bytes(),
        )?;
        Ok((timestamp, signature))
    }

    async fn signed_post(
        &self,
        operation: &str,
        path: &str,
        payload: &Value,
    ) -> Result<Value, GatewayError> {
        let body = payload.to_string();
        let (timestamp, signature) = self.sign(&body)?;
        let url = self.transport.url(path);
        let response = self
            .transport
            .send(operation, |client| {
                client
                    .post(&url)
                    .header("Content-Type", "application/json")
                    .header("X-Merchant-Id", &self.config.merchant_id)
                    .header("X-Timestamp", &timestamp)
                    .header("X-Signature", &signature)
                    .body(body.clone())
            })
            .await?;
        Self::check(&response)?;
        Ok(response)
    }

    async fn signed_get(&self, operation: &str, path: &str) -> Result<Value, GatewayError> {
        let (timestamp, signature) = self.sign("")?;
        let url = self.transport.url(path);
        let response = self
            .transport
            .send(operation, |client| {
                client
                    .get(&url)
                    .header("X-Merchant-Id", &self.config.merchant_id)
                    .header("X-Timestamp", &timestamp)
                    .header("X-Signature", &signature)
            })
            .await?;
        Self::check(&response)?;
        Ok(response)
    }

    /// Rejections come back as `{"reason": ..., "message": ...}` with a 2xx status.
    fn check(body: &Value) -> Result<(), GatewayError> {
        match field(body, "reason") {
            Some(code) => Err(GatewayError::Rejected {
                code: code.to_string(),
                message: field(body, "message").unwrap_or("").to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PaymentGateway for WalletBGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::WalletB
    }

    fn bounds(&self) -> AmountBounds {
        self.config.settings.bounds()
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.config.settings.currencies.contains(&currency)
    }

    fn supports_refund(&self) -> bool {
        false
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let path = format!(
            "check-out/initialize/{}/{}",
            self.config.merchant_id, request.order_reference
        );
        let body = self
            .signed_post(
                "initialize",
                &path,
                &json!({
                    "merchantId": self.config.merchant_id,
                    "orderId": request.order_reference,
                    "amount": request.amount.to_string(),
                    "currencyCode": request.currency.to_string(),
                    "merchantCallbackURL": request.return_url,
                }),
            )
            .await?;
        debug!(order = %request.order_reference, "wallet B checkout initialised");
        Ok(Initiated {
            gateway_transaction_id: required_field(&body, "paymentReferenceId")?,
            redirect_url: field(&body, "callBackUrl").map(str::to_string),
            raw: body,
        })
    }

    async fn query(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        let reference = tx.gateway_transaction_id.as_deref().ok_or_else(|| {
            GatewayError::Rejected {
                code: "NO_PAYMENT_REF".to_string(),
                message: format!("transaction {} was never initiated", tx.id),
            }
        })?;
        let body = self
            .signed_get("verify", &format!("verify/payment/{reference}"))
            .await?;
        Ok(QueryResult {
            status: map_status(&required_field(&body, "status")?),
            gateway_transaction_id: field(&body, "paymentRefId").map(str::to_string),
            bank_reference: field(&body, "issuerPaymentRefNo").map(str::to_string),
            raw: body,
        })
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<RefundResult, GatewayError> {
        Err(GatewayError::Unsupported("wallet B refunds".to_string()))
    }

    fn parse_callback(&self, raw: &[u8]) -> Result<CallbackEnvelope, GatewayError> {
        let form: CallbackForm = serde_urlencoded::from_bytes(raw)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let payload = json!({
            "payment_ref_id": form.payment_ref_id,
            "status": form.status,
            "order_id": form.order_id,
            "issuer_payment_ref": form.issuer_payment_ref,
        });
        Ok(CallbackEnvelope {
            status: map_status(&form.status),
            provider_transaction_id: form.payment_ref_id,
            order_reference: form.order_id,
            event_type: "payment".to_string(),
            bank_reference: form.issuer_payment_ref,
            payload,
        })
    }

    fn verify_callback(&self, raw: &[u8], signature: Option<&str>) -> bool {
        match (&self.config.settings.webhook_secret, signature) {
            (Some(secret), Some(signature)) => {
                verify_hmac_sha256_hex(secret.as_bytes(), raw, signature)
            }
            _ => false,
        }
    }
}
