use super::order::{Order, OrderPaymentStatus, OrderStatus};
use super::refund::RefundTransaction;
use super::transaction::{GatewayKind, PaymentTransaction};
use super::webhook::{PaymentWebhook, WebhookClaim};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// The order already has a non-terminal attempt; nothing was written.
    ActiveAttemptExists(PaymentTransaction),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    Swapped(PaymentTransaction),
    /// The stored version moved on; carries the current record.
    Conflict(PaymentTransaction),
}

#[async_trait]
pub trait PaymentTransactionStore: Send + Sync {
    /// Inserts unless the order already has a non-terminal attempt.
    async fn insert(&self, tx: PaymentTransaction) -> Result<InsertOutcome>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>>;

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>>;

    /// All attempts for an order, oldest first.
    async fn find_by_order_reference(&self, order_reference: &str)
    -> Result<Vec<PaymentTransaction>>;

    /// Writes `tx` only if the stored version equals `expected_version`.
    /// The stored record gets `expected_version + 1`.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        tx: PaymentTransaction,
    ) -> Result<CasOutcome>;

    async fn get_all(&self) -> Result<Vec<PaymentTransaction>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefundReservation {
    Opened,
    Exceeds { remaining: Decimal },
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    /// Atomically checks that all balance-reserving refunds for the payment
    /// plus this one stay within `limit`, and inserts it if so.
    async fn open(&self, refund: RefundTransaction, limit: Decimal) -> Result<RefundReservation>;

    /// Records a terminal outcome. Refunds already terminal are left untouched.
    async fn finalize(&self, refund: RefundTransaction) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<RefundTransaction>>;

    async fn list_for_payment(&self, payment_transaction_id: Uuid)
    -> Result<Vec<RefundTransaction>>;
}

#[async_trait]
pub trait WebhookLedger: Send + Sync {
    /// Appends the delivery to the audit log and tries to claim its key.
    async fn record(&self, webhook: PaymentWebhook, lease: Duration) -> Result<WebhookClaim>;

    async fn mark_processed(&self, id: Uuid) -> Result<()>;

    /// Gives up a claim without processing so a later delivery can retry.
    async fn release(&self, id: Uuid) -> Result<()>;

    async fn history(
        &self,
        gateway: GatewayKind,
        transaction_id: &str,
    ) -> Result<Vec<PaymentWebhook>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub value: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn is_fresh(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        self.expires_at - margin > now
    }
}

/// Provider access tokens, keyed by gateway and credential.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<AccessToken>>;
    async fn put(&self, key: &str, token: AccessToken) -> Result<()>;
}

/// The order service, owned elsewhere.
#[async_trait]
pub trait OrderCollaborator: Send + Sync {
    async fn find_by_reference(&self, order_number: &str) -> Result<Option<Order>>;
    async fn find_by_id(&self, id: &str) -> Result<Option<Order>>;
    async fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<()>;
    async fn set_payment_status(&self, order_id: &str, status: OrderPaymentStatus) -> Result<()>;
}

/// The product catalog's stock counters.
#[async_trait]
pub trait CatalogCollaborator: Send + Sync {
    async fn increment_stock(&self, item_id: &str, quantity: u32) -> Result<bool>;
}

pub type PaymentStoreBox = Box<dyn PaymentTransactionStore>;
pub type RefundStoreBox = Box<dyn RefundStore>;
pub type WebhookLedgerBox = Box<dyn WebhookLedger>;
pub type TokenStoreRef = Arc<dyn TokenStore>;
pub type OrderCollaboratorRef = Arc<dyn OrderCollaborator>;
pub type CatalogCollaboratorRef = Arc<dyn CatalogCollaborator>;

/// Builds a fresh payment store, e.g. one per test or per shard.
pub type PaymentStoreFactory = Box<dyn Fn() -> PaymentStoreBox + Send + Sync>;
