use crate::domain::money::Currency;
use crate::domain::transaction::{PaymentMethod, PaymentStatus};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = PaymentError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("payment method `{0}` is not supported")]
    UnsupportedMethod(String),
    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: String },
    #[error("currency {currency} is not accepted by {method}")]
    UnsupportedCurrency {
        currency: Currency,
        method: PaymentMethod,
    },
    #[error("payment transaction {0} not found")]
    PaymentNotFound(String),
    #[error("order {order_reference} already has an open payment attempt ({transaction_id})")]
    PaymentInProgress {
        order_reference: String,
        transaction_id: Uuid,
    },
    #[error("payment transaction {transaction_id} is {status}; operation not allowed")]
    IneligibleStatus {
        transaction_id: Uuid,
        status: PaymentStatus,
    },
    #[error("refund of {requested} exceeds the remaining refundable amount {remaining}")]
    RefundExceedsRemaining {
        requested: Decimal,
        remaining: Decimal,
    },
    #[error("payment method {0} does not support refunds")]
    RefundNotSupported(PaymentMethod),
    #[error("malformed callback: {0}")]
    MalformedCallback(String),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl PaymentError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(message.into().into())
    }
}

impl From<serde_json::Error> for PaymentError {
    fn from(e: serde_json::Error) -> Self {
        Self::InternalError(Box::new(e))
    }
}

/// Failures talking to a payment provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("provider call timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("provider authentication failed: {0}")]
    Auth(String),
    #[error("provider rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("operation not supported by this gateway: {0}")]
    Unsupported(String),
    #[error("invalid signature")]
    InvalidSignature,
}

impl GatewayError {
    /// Transient errors may succeed on retry and never justify guessing an outcome.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Timeout | GatewayError::Network(_))
    }

    pub fn code(&self) -> String {
        match self {
            GatewayError::Timeout => "GATEWAY_TIMEOUT".to_string(),
            GatewayError::Network(_) => "NETWORK_ERROR".to_string(),
            GatewayError::Auth(_) => "AUTH_FAILED".to_string(),
            GatewayError::Rejected { code, .. } => code.clone(),
            GatewayError::MalformedResponse(_) => "MALFORMED_RESPONSE".to_string(),
            GatewayError::Unsupported(_) => "UNSUPPORTED".to_string(),
            GatewayError::InvalidSignature => "INVALID_SIGNATURE".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::Network("reset".into()).is_transient());
        assert!(!GatewayError::Auth("bad key".into()).is_transient());
        assert!(
            !GatewayError::Rejected {
                code: "2023".into(),
                message: "insufficient balance".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn test_gateway_error_converts_into_payment_error() {
        let err: PaymentError = GatewayError::Timeout.into();
        assert!(matches!(err, PaymentError::Gateway(GatewayError::Timeout)));
        assert_eq!(err.to_string(), "gateway error: provider call timed out");
    }
}
