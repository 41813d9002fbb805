//! Card aggregator: hosted payment page, transaction-id validation API and
//! form-encoded IPN deliveries authenticated by `verify_sign`.

use super::http::{HttpTransport, field, required_field};
use super::signing::{constant_time_eq, md5_hex};
use crate::config::CardConfig;
use crate::domain::gateway::{
    CallbackEnvelope, GatewayStatus, InitiateRequest, Initiated, PaymentGateway, QueryResult,
    RefundOutcome, RefundRequest, RefundResult,
};
use crate::domain::money::{AmountBounds, Currency};
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::error::GatewayError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

const SESSION_PATH: &str = "gwprocess/v4/api.php";
const VALIDATION_PATH: &str = "validator/api/merchantTransIDvalidationAPI.php";

pub struct CardGateway {
    config: CardConfig,
    transport: HttpTransport,
}

pub fn map_status(status: &str) -> GatewayStatus {
    match status.to_ascii_uppercase().as_str() {
        "VALID" | "VALIDATED" => GatewayStatus::Completed,
        "CANCELLED" => GatewayStatus::Cancelled,
        "FAILED" | "EXPIRED" | "UNATTEMPTED" => GatewayStatus::Failed,
        _ => GatewayStatus::Processing,
    }
}

/// The aggregator's IPN hash: the fields listed in `verify_key` plus the MD5
/// of the store password, sorted by name, joined as `k=v&...` and MD5-hashed.
/// Returns `None` when a listed field is missing.
pub fn ipn_signature(fields: &BTreeMap<String, String>, store_password: &str) -> Option<String> {
    let keys = fields.get("verify_key")?;
    let mut signed = BTreeMap::new();
    for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
        signed.insert(key.to_string(), fields.get(key)?.clone());
    }
    signed.insert("store_passwd".to_string(), md5_hex(store_password.as_bytes()));
    let message = signed
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    Some(md5_hex(message.as_bytes()))
}

impl CardGateway {
    pub fn new(config: CardConfig) -> Result<Self, GatewayError> {
        let transport = HttpTransport::new(&config.settings)?;
        Ok(Self { config, transport })
    }

    fn credentials(&self) -> [(&'static str, &str); 3] {
        [
            ("store_id", self.config.store_id.as_str()),
            ("store_passwd", self.config.store_password.as_str()),
            ("format", "json"),
        ]
    }

    async fn validation_call(
        &self,
        operation: &str,
        params: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let url = self.transport.url(VALIDATION_PATH);
        let body = self
            .transport
            .send(operation, |client| {
                client.get(&url).query(params).query(&self.credentials())
            })
            .await?;
        match field(&body, "APIConnect") {
            Some("DONE") => Ok(body),
            Some("INVALID_REQUEST") | Some("INACTIVE") => Err(GatewayError::Auth(
                field(&body, "APIConnect").unwrap_or_default().to_string(),
            )),
            other => Err(GatewayError::Rejected {
                code: other.unwrap_or("UNKNOWN").to_string(),
                message: field(&body, "errorReason").unwrap_or("").to_string(),
            }),
        }
    }

    fn parse_form(raw: &[u8]) -> Result<BTreeMap<String, String>, GatewayError> {
        serde_urlencoded::from_bytes(raw).map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for CardGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::CardAggregator
    }

    fn bounds(&self) -> AmountBounds {
        self.config.settings.bounds()
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.config.settings.currencies.contains(&currency)
    }

    /// Opens a hosted-page session. The local transaction id doubles as the
    /// aggregator's `tran_id`, so IPNs resolve by provider reference.
    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        let tran_id = request.transaction_id.to_string();
        let return_url = request.return_url.clone().unwrap_or_default();
        let cancel_url = request.cancel_url.clone().unwrap_or_else(|| return_url.clone());
        let form = [
            ("store_id", self.config.store_id.clone()),
            ("store_passwd", self.config.store_password.clone()),
            ("total_amount", request.amount.to_string()),
            ("currency", request.currency.to_string()),
            ("tran_id", tran_id.clone()),
            ("value_a", request.order_reference.clone()),
            ("success_url", return_url.clone()),
            ("fail_url", return_url),
            ("cancel_url", cancel_url),
            ("shipping_method", "NO".to_string()),
            ("product_profile", "general".to_string()),
        ];
        let url = self.transport.url(SESSION_PATH);
        let body = self
            .transport
            .send("session", |client| client.post(&url).form(&form))
            .await?;

        if field(&body, "status") != Some("SUCCESS") {
            return Err(GatewayError::Rejected {
                code: "SESSION_FAILED".to_string(),
                message: field(&body, "failedreason").unwrap_or("").to_string(),
            });
        }
        debug!(%tran_id, "card session opened");
        Ok(Initiated {
            gateway_transaction_id: tran_id,
            redirect_url: Some(required_field(&body, "GatewayPageURL")?),
            raw: body,
        })
    }

    async fn query(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        let tran_id = tx
            .gateway_transaction_id
            .clone()
            .unwrap_or_else(|| tx.id.to_string());
        let body = self
            .validation_call("validate", &[("tran_id", tran_id.clone())])
            .await?;

        let elements = body
            .get("element")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        // A transaction id can carry several attempts; a validated one wins.
        let element = elements
            .iter()
            .find(|e| field(e, "status").map(map_status) == Some(GatewayStatus::Completed))
            .or_else(|| elements.first());

        let (status, bank_reference) = match element {
            Some(element) => (
                map_status(field(element, "status").unwrap_or("")),
                field(element, "bank_tran_id").map(str::to_string),
            ),
            None => (GatewayStatus::Processing, None),
        };
        Ok(QueryResult {
            status,
            gateway_transaction_id: Some(tran_id),
            bank_reference,
            raw: body,
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, GatewayError> {
        let body = self
            .validation_call(
                "refund",
                &[
                    ("bank_tran_id", request.bank_reference.clone()),
                    ("refund_amount", request.amount.to_string()),
                    ("refund_remarks", request.reason.clone()),
                    ("refe_id", request.refund_id.clone()),
                ],
            )
            .await?;
        let outcome = match field(&body, "status").map(str::to_ascii_lowercase).as_deref() {
            Some("success") => RefundOutcome::Completed,
            Some("processing") => RefundOutcome::Processing,
            _ => RefundOutcome::Failed,
        };
        Ok(RefundResult {
            outcome,
            gateway_refund_id: field(&body, "refund_ref_id").map(str::to_string),
            raw: body,
        })
    }

    fn parse_callback(&self, raw: &[u8]) -> Result<CallbackEnvelope, GatewayError> {
        let fields = Self::parse_form(raw)?;
        let tran_id = fields
            .get("tran_id")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| GatewayError::MalformedResponse("missing `tran_id`".to_string()))?;
        let status = fields
            .get("status")
            .map(|s| map_status(s))
            .ok_or_else(|| GatewayError::MalformedResponse("missing `status`".to_string()))?;
        Ok(CallbackEnvelope {
            provider_transaction_id: tran_id,
            order_reference: fields.get("value_a").cloned(),
            event_type: "ipn".to_string(),
            status,
            bank_reference: fields.get("bank_tran_id").cloned(),
            payload: serde_json::to_value(&fields)
                .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?,
        })
    }

    /// The signature travels inside the form as `verify_sign`.
    fn verify_callback(&self, raw: &[u8], _signature: Option<&str>) -> bool {
        let Ok(fields) = Self::parse_form(raw) else {
            return false;
        };
        let (Some(expected), Some(provided)) = (
            ipn_signature(&fields, &self.config.store_password),
            fields.get("verify_sign"),
        ) else {
            return false;
        };
        constant_time_eq(expected.as_bytes(), provided.to_ascii_lowercase().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> CardGateway {
        let mut config = CardConfig::default();
        config.store_id = "store".to_string();
        config.store_password = "s3cret".to_string();
        CardGateway::new(config).unwrap()
    }

    fn signed_ipn(status: &str, password: &str) -> String {
        let mut fields = BTreeMap::new();
        fields.insert("tran_id".to_string(), "T-1".to_string());
        fields.insert("status".to_string(), status.to_string());
        fields.insert("amount".to_string(), "500.00".to_string());
        fields.insert("bank_tran_id".to_string(), "B-77".to_string());
        fields.insert("value_a".to_string(), "ORD-5".to_string());
        fields.insert(
            "verify_key".to_string(),
            "amount,bank_tran_id,status,tran_id,value_a".to_string(),
        );
        let sign = ipn_signature(&fields, password).unwrap();
        fields.insert("verify_sign".to_string(), sign);
        serde_urlencoded::to_string(&fields).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("VALID"), GatewayStatus::Completed);
        assert_eq!(map_status("validated"), GatewayStatus::Completed);
        assert_eq!(map_status("CANCELLED"), GatewayStatus::Cancelled);
        assert_eq!(map_status("UNATTEMPTED"), GatewayStatus::Failed);
        assert_eq!(map_status("PENDING"), GatewayStatus::Processing);
    }

    #[test]
    fn test_ipn_signature_matches_aggregator_scheme() {
        let mut fields = BTreeMap::new();
        for (k, v) in [
            ("tran_id", "T-1"),
            ("status", "VALID"),
            ("amount", "500.00"),
            ("bank_tran_id", "B-77"),
            ("value_a", "ORD-5"),
            ("verify_key", "amount,bank_tran_id,status,tran_id,value_a"),
        ] {
            fields.insert(k.to_string(), v.to_string());
        }
        assert_eq!(
            ipn_signature(&fields, "s3cret").as_deref(),
            Some("a2c0c83707d526e0cbba88ed33220a43")
        );

        // As delivered by the aggregator, upper-case hex included.
        fields.insert(
            "verify_sign".to_string(),
            "A2C0C83707D526E0CBBA88ED33220A43".to_string(),
        );
        let form = serde_urlencoded::to_string(&fields).unwrap();
        assert!(gateway().verify_callback(form.as_bytes(), None));
    }

    #[test]
    fn test_ipn_signature_verification() {
        let gateway = gateway();
        let genuine = signed_ipn("VALID", "s3cret");
        assert!(gateway.verify_callback(genuine.as_bytes(), None));

        let wrong_key = signed_ipn("VALID", "guess");
        assert!(!gateway.verify_callback(wrong_key.as_bytes(), None));

        let tampered = genuine.replace("status=VALID", "status=FAILED");
        assert!(!gateway.verify_callback(tampered.as_bytes(), None));
        assert!(!gateway.verify_callback(b"tran_id=T-1&status=VALID", None));
    }

    #[test]
    fn test_parse_ipn() {
        let envelope = gateway()
            .parse_callback(signed_ipn("FAILED", "s3cret").as_bytes())
            .unwrap();
        assert_eq!(envelope.provider_transaction_id, "T-1");
        assert_eq!(envelope.status, GatewayStatus::Failed);
        assert_eq!(envelope.event_type, "ipn");
        assert_eq!(envelope.order_reference.as_deref(), Some("ORD-5"));
        assert_eq!(envelope.bank_reference.as_deref(), Some("B-77"));
        assert!(gateway().parse_callback(b"status=VALID").is_err());
    }
}
