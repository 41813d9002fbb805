//! In-process stand-in for the payment providers.
//!
//! A [`SimulatedProvider`] keeps the provider-side truth for every payment it
//! has opened. Tests and the replay CLI settle those payments explicitly and
//! build signed callbacks from them; a [`SimulatedGateway`] per provider kind
//! answers engine calls from the same ledger. Nothing here is ever used as a
//! fallback for a live adapter.

use super::signing::{hmac_sha256_hex, verify_hmac_sha256_hex};
use crate::config::GatewaySettings;
use crate::domain::gateway::{
    CallbackEnvelope, GatewayStatus, InitiateRequest, Initiated, PaymentGateway, QueryResult,
    RefundOutcome, RefundRequest, RefundResult,
};
use crate::domain::money::{AmountBounds, Currency};
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::error::GatewayError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_SIMULATOR_SECRET: &str = "simulated-provider-secret";

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedPayment {
    pub gateway: GatewayKind,
    pub provider_id: String,
    pub order_reference: String,
    pub amount: Decimal,
    pub status: GatewayStatus,
    pub bank_reference: Option<String>,
    pub refunded: Decimal,
    /// Status reads served for this payment.
    pub queries: usize,
    sequence: u64,
}

/// A callback body plus the signature a genuine provider would attach.
#[derive(Debug, Clone)]
pub struct SignedCallback {
    pub payload: Vec<u8>,
    pub signature: String,
}

#[derive(Default)]
struct Ledger {
    payments: HashMap<String, SimulatedPayment>,
    sequence: u64,
    faults: HashMap<GatewayKind, VecDeque<GatewayError>>,
}

impl Ledger {
    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}

pub struct SimulatedProvider {
    secret: String,
    ledger: RwLock<Ledger>,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(DEFAULT_SIMULATOR_SECRET)
    }
}

impl SimulatedProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ledger: RwLock::new(Ledger::default()),
        }
    }

    async fn open(&self, gateway: GatewayKind, request: &InitiateRequest) -> SimulatedPayment {
        let mut ledger = self.ledger.write().await;
        let sequence = ledger.next_sequence();
        let payment = SimulatedPayment {
            gateway,
            provider_id: format!("SIM-{}-{sequence:06}", gateway.to_string().to_uppercase()),
            order_reference: request.order_reference.clone(),
            amount: request.amount,
            status: GatewayStatus::Processing,
            bank_reference: None,
            refunded: Decimal::ZERO,
            queries: 0,
            sequence,
        };
        ledger
            .payments
            .insert(payment.provider_id.clone(), payment.clone());
        payment
    }

    /// Records the provider-side outcome of a payment.
    pub async fn settle(&self, provider_id: &str, status: GatewayStatus) -> Result<(), GatewayError> {
        let mut ledger = self.ledger.write().await;
        let sequence = ledger.next_sequence();
        let payment = ledger
            .payments
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        payment.status = status;
        if status == GatewayStatus::Completed && payment.bank_reference.is_none() {
            payment.bank_reference = Some(format!("SIMBANK-{sequence:06}"));
        }
        debug!(provider_id, %status, "simulated payment settled");
        Ok(())
    }

    /// Settles the most recent payment opened for the order.
    pub async fn settle_order(
        &self,
        order_reference: &str,
        status: GatewayStatus,
    ) -> Result<String, GatewayError> {
        let provider_id = self
            .latest_for_order(order_reference)
            .await
            .map(|p| p.provider_id)
            .ok_or_else(|| not_found(order_reference))?;
        self.settle(&provider_id, status).await?;
        Ok(provider_id)
    }

    pub async fn payment(&self, provider_id: &str) -> Option<SimulatedPayment> {
        self.ledger.read().await.payments.get(provider_id).cloned()
    }

    pub async fn latest_for_order(&self, order_reference: &str) -> Option<SimulatedPayment> {
        self.ledger
            .read()
            .await
            .payments
            .values()
            .filter(|p| p.order_reference == order_reference)
            .max_by_key(|p| p.sequence)
            .cloned()
    }

    /// Makes the next call against `gateway` fail with `error`.
    pub async fn inject_fault(&self, gateway: GatewayKind, error: GatewayError) {
        self.ledger
            .write()
            .await
            .faults
            .entry(gateway)
            .or_default()
            .push_back(error);
    }

    async fn take_fault(&self, gateway: GatewayKind) -> Result<(), GatewayError> {
        let mut ledger = self.ledger.write().await;
        match ledger.faults.get_mut(&gateway).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    pub fn sign(&self, payload: &[u8]) -> Result<String, GatewayError> {
        hmac_sha256_hex(self.secret.as_bytes(), payload)
    }

    /// Builds the callback the provider would send for `provider_id`,
    /// claiming `status`. The claim need not match the settled status.
    pub async fn callback(
        &self,
        provider_id: &str,
        status: GatewayStatus,
    ) -> Result<SignedCallback, GatewayError> {
        let payment = self
            .payment(provider_id)
            .await
            .ok_or_else(|| not_found(provider_id))?;
        let payload = json!({
            "transaction_id": payment.provider_id,
            "order_reference": payment.order_reference,
            "event": "payment",
            "status": status.to_string(),
            "bank_reference": payment.bank_reference,
        })
        .to_string()
        .into_bytes();
        let signature = self.sign(&payload)?;
        Ok(SignedCallback { payload, signature })
    }

    fn verify(&self, payload: &[u8], signature: &str) -> bool {
        verify_hmac_sha256_hex(self.secret.as_bytes(), payload, signature)
    }
}

fn not_found(reference: &str) -> GatewayError {
    GatewayError::Rejected {
        code: "NOT_FOUND".to_string(),
        message: format!("no simulated payment for {reference}"),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    transaction_id: String,
    order_reference: Option<String>,
    #[serde(default = "default_event")]
    event: String,
    status: String,
    bank_reference: Option<String>,
}

fn default_event() -> String {
    "payment".to_string()
}

/// Answers engine calls for one provider kind from a shared
/// [`SimulatedProvider`].
pub struct SimulatedGateway {
    kind: GatewayKind,
    bounds: AmountBounds,
    currencies: Vec<Currency>,
    refunds: bool,
    provider: Arc<SimulatedProvider>,
}

impl SimulatedGateway {
    pub fn new(kind: GatewayKind, settings: &GatewaySettings, provider: Arc<SimulatedProvider>) -> Self {
        Self {
            kind,
            bounds: settings.bounds(),
            currencies: settings.currencies.clone(),
            refunds: true,
            provider,
        }
    }

    pub fn without_refunds(mut self) -> Self {
        self.refunds = false;
        self
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    fn kind(&self) -> GatewayKind {
        self.kind
    }

    fn bounds(&self) -> AmountBounds {
        self.bounds
    }

    fn supports_currency(&self, currency: Currency) -> bool {
        self.currencies.contains(&currency)
    }

    fn supports_refund(&self) -> bool {
        self.refunds
    }

    async fn initiate(&self, request: &InitiateRequest) -> Result<Initiated, GatewayError> {
        self.provider.take_fault(self.kind).await?;
        let payment = self.provider.open(self.kind, request).await;
        Ok(Initiated {
            redirect_url: Some(format!(
                "https://simulator.invalid/{}/checkout/{}",
                self.kind, payment.provider_id
            )),
            raw: json!({ "provider_id": payment.provider_id, "status": "processing" }),
            gateway_transaction_id: payment.provider_id,
        })
    }

    async fn query(&self, tx: &PaymentTransaction) -> Result<QueryResult, GatewayError> {
        self.provider.take_fault(self.kind).await?;
        let provider_id = tx
            .gateway_transaction_id
            .as_deref()
            .ok_or_else(|| not_found(&tx.order_reference))?;

        let mut ledger = self.provider.ledger.write().await;
        let payment = ledger
            .payments
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        payment.queries += 1;
        Ok(QueryResult {
            status: payment.status,
            gateway_transaction_id: Some(payment.provider_id.clone()),
            bank_reference: payment.bank_reference.clone(),
            raw: json!({
                "provider_id": payment.provider_id,
                "status": payment.status.to_string(),
            }),
        })
    }

    async fn refund(&self, request: &RefundRequest) -> Result<RefundResult, GatewayError> {
        if !self.refunds {
            return Err(GatewayError::Unsupported(format!("{} refunds", self.kind)));
        }
        self.provider.take_fault(self.kind).await?;
        let provider_id = request
            .gateway_transaction_id
            .as_deref()
            .ok_or_else(|| not_found(&request.refund_id))?;

        let mut ledger = self.provider.ledger.write().await;
        let sequence = ledger.next_sequence();
        let payment = ledger
            .payments
            .get_mut(provider_id)
            .ok_or_else(|| not_found(provider_id))?;
        if payment.status != GatewayStatus::Completed {
            return Err(GatewayError::Rejected {
                code: "NOT_SETTLED".to_string(),
                message: format!("{provider_id} is {}", payment.status),
            });
        }
        if payment.refunded + request.amount > payment.amount {
            return Err(GatewayError::Rejected {
                code: "REFUND_EXCEEDS".to_string(),
                message: format!("{provider_id} has {} left", payment.amount - payment.refunded),
            });
        }
        payment.refunded += request.amount;
        let refund_id = format!("SIM-RF-{sequence:06}");
        Ok(RefundResult {
            outcome: RefundOutcome::Completed,
            raw: json!({ "refund_id": refund_id, "amount": request.amount.to_string() }),
            gateway_refund_id: Some(refund_id),
        })
    }

    fn parse_callback(&self, raw: &[u8]) -> Result<CallbackEnvelope, GatewayError> {
        let body: CallbackBody = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        let status = GatewayStatus::from_str(&body.status)
            .map_err(|_| GatewayError::MalformedResponse(format!("unknown status {}", body.status)))?;
        let payload =
            serde_json::from_slice(raw).map_err(|e| GatewayError::MalformedResponse(e.to_string()))?;
        Ok(CallbackEnvelope {
            provider_transaction_id: body.transaction_id,
            order_reference: body.order_reference,
            event_type: body.event,
            status,
            bank_reference: body.bank_reference,
            payload,
        })
    }

    fn verify_callback(&self, raw: &[u8], signature: Option<&str>) -> bool {
        signature.is_some_and(|signature| self.provider.verify(raw, signature))
    }
}
