use crate::domain::ports::{
    AccessToken, CasOutcome, InsertOutcome, PaymentTransactionStore, RefundReservation,
    RefundStore, TokenStore, WebhookLedger,
};
use crate::domain::refund::RefundTransaction;
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::domain::webhook::{PaymentWebhook, WebhookClaim, WebhookKey};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct PaymentTables {
    by_id: HashMap<Uuid, PaymentTransaction>,
    by_order: HashMap<String, Vec<Uuid>>,
    by_gateway: HashMap<(GatewayKind, String), Uuid>,
}

impl PaymentTables {
    fn index_gateway(&mut self, tx: &PaymentTransaction) {
        if let Some(reference) = &tx.gateway_transaction_id {
            self.by_gateway.insert((tx.gateway, reference.clone()), tx.id);
        }
    }
}

/// A thread-safe in-memory store for payment transactions.
///
/// All tables live behind one `RwLock` so the conditional insert and the
/// compare-and-swap observe and update the indexes atomically.
#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    tables: Arc<RwLock<PaymentTables>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentTransactionStore for InMemoryPaymentStore {
    async fn insert(&self, tx: PaymentTransaction) -> Result<InsertOutcome> {
        let mut tables = self.tables.write().await;
        let active = tables
            .by_order
            .get(&tx.order_reference)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.by_id.get(id))
            .find(|existing| !existing.status.is_terminal())
            .cloned();
        if let Some(existing) = active {
            return Ok(InsertOutcome::ActiveAttemptExists(existing));
        }

        tables.index_gateway(&tx);
        tables
            .by_order
            .entry(tx.order_reference.clone())
            .or_default()
            .push(tx.id);
        tables.by_id.insert(tx.id, tx);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables.by_id.get(&id).cloned())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_gateway
            .get(&(gateway, gateway_transaction_id.to_string()))
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn find_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_order
            .get(order_reference)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.by_id.get(id))
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut tx: PaymentTransaction,
    ) -> Result<CasOutcome> {
        let mut tables = self.tables.write().await;
        let current = match tables.by_id.get(&tx.id) {
            Some(current) => current.clone(),
            None => {
                return Err(PaymentError::PaymentNotFound(tx.id.to_string()));
            }
        };
        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(current));
        }

        tx.version = expected_version + 1;
        tables.index_gateway(&tx);
        tables.by_id.insert(tx.id, tx.clone());
        Ok(CasOutcome::Swapped(tx))
    }

    async fn get_all(&self) -> Result<Vec<PaymentTransaction>> {
        let tables = self.tables.read().await;
        let mut all: Vec<_> = tables.by_id.values().cloned().collect();
        all.sort_by_key(|tx| tx.created_at);
        Ok(all)
    }
}

/// A thread-safe in-memory refund ledger.
#[derive(Default, Clone)]
pub struct InMemoryRefundStore {
    refunds: Arc<RwLock<HashMap<Uuid, RefundTransaction>>>,
}

impl InMemoryRefundStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RefundStore for InMemoryRefundStore {
    async fn open(&self, refund: RefundTransaction, limit: Decimal) -> Result<RefundReservation> {
        let mut refunds = self.refunds.write().await;
        let reserved: Decimal = refunds
            .values()
            .filter(|r| r.payment_transaction_id == refund.payment_transaction_id)
            .filter(|r| r.status.reserves_balance())
            .map(|r| r.amount.value())
            .sum();
        if reserved + refund.amount.value() > limit {
            return Ok(RefundReservation::Exceeds {
                remaining: (limit - reserved).max(Decimal::ZERO),
            });
        }
        refunds.insert(refund.id, refund);
        Ok(RefundReservation::Opened)
    }

    async fn finalize(&self, refund: RefundTransaction) -> Result<()> {
        let mut refunds = self.refunds.write().await;
        if refunds
            .get(&refund.id)
            .is_some_and(|existing| existing.status.is_terminal())
        {
            return Ok(());
        }
        refunds.insert(refund.id, refund);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RefundTransaction>> {
        let refunds = self.refunds.read().await;
        Ok(refunds.get(&id).cloned())
    }

    async fn list_for_payment(
        &self,
        payment_transaction_id: Uuid,
    ) -> Result<Vec<RefundTransaction>> {
        let refunds = self.refunds.read().await;
        let mut list: Vec<_> = refunds
            .values()
            .filter(|r| r.payment_transaction_id == payment_transaction_id)
            .cloned()
            .collect();
        list.sort_by_key(|r| r.created_at);
        Ok(list)
    }
}

#[derive(Default)]
struct WebhookTables {
    deliveries: Vec<PaymentWebhook>,
    /// Delivery currently owning each key.
    owners: HashMap<WebhookKey, usize>,
    positions: HashMap<Uuid, usize>,
    by_transaction: HashMap<(GatewayKind, String), Vec<usize>>,
}

impl WebhookTables {
    fn delivery_mut(&mut self, id: Uuid) -> Option<&mut PaymentWebhook> {
        let index = *self.positions.get(&id)?;
        self.deliveries.get_mut(index)
    }
}

/// A thread-safe in-memory webhook audit log and idempotency ledger.
#[derive(Default, Clone)]
pub struct InMemoryWebhookLedger {
    tables: Arc<RwLock<WebhookTables>>,
}

impl InMemoryWebhookLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<PaymentWebhook> {
        self.tables.read().await.deliveries.clone()
    }
}

#[async_trait]
impl WebhookLedger for InMemoryWebhookLedger {
    async fn record(&self, mut webhook: PaymentWebhook, lease: Duration) -> Result<WebhookClaim> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let now = Utc::now();
        let key = webhook.key();

        let claim = match tables.owners.get(&key).map(|&i| &tables.deliveries[i]) {
            Some(owner) if owner.processed => WebhookClaim::AlreadyProcessed,
            Some(owner) if owner.holds_live_claim(now) => WebhookClaim::InFlight,
            _ => WebhookClaim::Claimed(webhook.id),
        };

        let index = tables.deliveries.len();
        if matches!(claim, WebhookClaim::Claimed(_)) {
            let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
            webhook.claimed_until = Some(now + lease);
            tables.owners.insert(key, index);
        }
        tables.positions.insert(webhook.id, index);
        tables
            .by_transaction
            .entry((webhook.gateway, webhook.transaction_id.clone()))
            .or_default()
            .push(index);
        tables.deliveries.push(webhook);
        Ok(claim)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(webhook) = tables.delivery_mut(id) {
            webhook.processed = true;
            webhook.processed_at = Some(Utc::now());
            webhook.claimed_until = None;
        }
        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(webhook) = tables.delivery_mut(id) {
            webhook.claimed_until = None;
        }
        Ok(())
    }

    async fn history(
        &self,
        gateway: GatewayKind,
        transaction_id: &str,
    ) -> Result<Vec<PaymentWebhook>> {
        let tables = self.tables.read().await;
        let indexes = tables
            .by_transaction
            .get(&(gateway, transaction_id.to_string()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(indexes
            .iter()
            .filter_map(|&i| tables.deliveries.get(i))
            .cloned()
            .collect())
    }
}

/// Provider access tokens held in process memory.
#[derive(Default, Clone)]
pub struct InMemoryTokenStore {
    tokens: Arc<RwLock<HashMap<String, AccessToken>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<AccessToken>> {
        Ok(self.tokens.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, token: AccessToken) -> Result<()> {
        self.tokens.write().await.insert(key.to_string(), token);
        Ok(())
    }
}
