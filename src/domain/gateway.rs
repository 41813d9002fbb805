//! The contract every payment provider adapter implements.
//!
//! Adapters hide provider authentication, request signing and wire formats,
//! and translate provider vocabularies into [`GatewayStatus`]. The engine
//! never branches on which provider it is talking to.

use crate::domain::money::{AmountBounds, Currency};
use crate::domain::transaction::{GatewayKind, PaymentMethod, PaymentStatus, PaymentTransaction};
use crate::error::GatewayError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Provider outcomes, normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GatewayStatus {
    Completed,
    Failed,
    Cancelled,
    Processing,
}

impl GatewayStatus {
    pub fn as_payment_status(self) -> PaymentStatus {
        match self {
            GatewayStatus::Completed => PaymentStatus::Completed,
            GatewayStatus::Failed => PaymentStatus::Failed,
            GatewayStatus::Cancelled => PaymentStatus::Cancelled,
            GatewayStatus::Processing => PaymentStatus::Processing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub transaction_id: Uuid,
    pub order_reference: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

impl From<&PaymentTransaction> for InitiateRequest {
    fn from(tx: &PaymentTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            order_reference: tx.order_reference.clone(),
            amount: tx.amount.value(),
            currency: tx.currency,
            return_url: tx.return_url.clone(),
            cancel_url: tx.cancel_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Initiated {
    pub gateway_transaction_id: String,
    pub redirect_url: Option<String>,
    pub raw: serde_json::Value,
}

/// Authoritative provider view of a payment.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub status: GatewayStatus,
    pub gateway_transaction_id: Option<String>,
    pub bank_reference: Option<String>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RefundRequest {
    pub refund_id: String,
    pub gateway_transaction_id: Option<String>,
    pub bank_reference: String,
    pub amount: Decimal,
    pub original_amount: Decimal,
    pub currency: Currency,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefundOutcome {
    Completed,
    Processing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RefundResult {
    pub outcome: RefundOutcome,
    pub gateway_refund_id: Option<String>,
    pub raw: serde_json::Value,
}

/// A callback decoded into the shared vocabulary. The status here is what the
/// payload *claims*; it is only trusted once the signature verifies.
#[derive(Debug, Clone)]
pub struct CallbackEnvelope {
    pub provider_transaction_id: String,
    pub order_reference: Option<String>,
    pub event_type: String,
    pub status: GatewayStatus,
    pub bank_reference: Option<String>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn kind(&self) -> GatewayKind;

    fn bounds(&self) -> AmountBounds;

    fn supports_currency(&self, currency: Currency) -> bool;

    fn supports_refund(&self) -> bool {
        true
    }

    /// Payments settle when created, with no provider round trip.
    fn settles_on_creation(&self) -> bool {
        false
    }

    /// Customer-facing URL for a provider session, when the provider uses one.
    fn redirect_url(&self, initiated: &Initiated) -> Option<String> {
        initiated.redirect_url.clone()
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError>;

    async fn query(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError>;

    /// Client-driven completion. Providers without an explicit execute step
    /// answer with their authoritative status.
    async fn execute(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        self.query(tx).await
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, GatewayError>;

    fn parse_callback(&self, raw: &[u8]) -> Result<CallbackEnvelope, GatewayError>;

    fn verify_callback(&self, raw: &[u8], signature: Option<&str>) -> bool;
}

pub type GatewayRef = Arc<dyn PaymentGateway>;

/// Method and gateway lookup, built once at startup.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    by_method: HashMap<PaymentMethod, GatewayKind>,
    gateways: HashMap<GatewayKind, GatewayRef>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: PaymentMethod, gateway: GatewayRef) {
        self.by_method.insert(method, gateway.kind());
        self.gateways.insert(gateway.kind(), gateway);
    }

    pub fn for_method(&self, method: PaymentMethod) -> Option<GatewayRef> {
        self.by_method
            .get(&method)
            .and_then(|kind| self.gateways.get(kind))
            .cloned()
    }

    pub fn get(&self, kind: GatewayKind) -> Option<GatewayRef> {
        self.gateways.get(&kind).cloned()
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        self.by_method.keys().copied().collect()
    }
}
