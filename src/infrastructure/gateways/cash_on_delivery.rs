use crate::config::CashOnDeliveryConfig;
use crate::domain::gateway::{
    CallbackEnvelope, InitiateRequest, Initiated, PaymentGateway, QueryResult, RefundRequest,
    RefundResult,
};
use crate::domain::money::{AmountBounds, Currency};
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::error::GatewayError;
use async_trait::async_trait;

/// Cash collected by the courier. Settles at creation; there is no provider
/// to call, notify or refund through.
pub struct CashOnDeliveryGateway {
    config: CashOnDeliveryConfig,
}

impl CashOnDeliveryGateway {
    pub fn new(config: CashOnDeliveryConfig) -> Self {
        Self { config }
    }

    fn no_provider(operation: &str) -> GatewayError {
        GatewayError::Unsupported(format!("cash on delivery has no provider {operation}"))
    }
}

#[async_trait]
impl PaymentGateway for CashOnDeliveryGateway {
    fn kind(&self) -> GatewayKind {
        GatewayKind::CashOnDelivery
    }

    fn bounds(&self) -> AmountBounds {
        AmountBounds::new(self.config.min_amount, self.config.max_amount)
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.config.currencies.contains(&currency)
    }

    fn supports_refund(&self) -> bool {
        false
    }

    fn settles_on_creation(&self) -> bool {
        true
    }

    async fn initiate(&self, _request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        Err(Self::no_provider("initiate"))
    }

    async fn query(&self, _tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        Err(Self::no_provider("query"))
    }

    async fn refund(&self, _request: &RefundRequest) -> Result<RefundResult, GatewayError> {
        Err(Self::no_provider("refund"))
    }

    fn parse_callback(&self, _raw: &[u8]) -> Result<CallbackEnvelope, GatewayError> {
        Err(Self::no_provider("callbacks"))
    }

    fn verify_callback(&self, _raw: &[u8], _signature: Option<&str>) -> bool {
        false
    }
}
