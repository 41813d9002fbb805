use crate::domain::ports::{
    AccessToken, CasOutcome, InsertOutcome, PaymentTransactionStore, RefundReservation,
    RefundStore, TokenStore, WebhookLedger,
};
use crate::domain::refund::RefundTransaction;
use crate::domain::transaction::{GatewayKind, PaymentTransaction};
use crate::domain::webhook::{PaymentWebhook, WebhookClaim};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CF_PAYMENTS: &str = "payments";
/// `order_reference | created_at | id` -> empty.
pub const CF_PAYMENTS_BY_ORDER: &str = "payments_by_order";
/// `gateway | provider transaction id` -> payment id.
pub const CF_PAYMENTS_BY_GATEWAY: &str = "payments_by_gateway";
pub const CF_REFUNDS: &str = "refunds";
/// `payment id | refund id` -> empty.
pub const CF_REFUNDS_BY_PAYMENT: &str = "refunds_by_payment";
pub const CF_WEBHOOKS: &str = "webhooks";
/// Encoded webhook key -> id of the delivery owning the claim.
pub const CF_WEBHOOK_CLAIMS: &str = "webhook_claims";
pub const CF_TOKENS: &str = "tokens";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_PAYMENTS,
    CF_PAYMENTS_BY_ORDER,
    CF_PAYMENTS_BY_GATEWAY,
    CF_REFUNDS,
    CF_REFUNDS_BY_PAYMENT,
    CF_WEBHOOKS,
    CF_WEBHOOK_CLAIMS,
    CF_TOKENS,
];

const SEP: u8 = 0x1f;

/// A persistent store implementation using RocksDB.
///
/// Implements every storage port over one database, one column family per
/// collection plus the secondary indexes. Read-check-write operations
/// (conditional insert, compare-and-swap, refund reservation, webhook
/// claims) run under a single writer lock and commit through a `WriteBatch`
/// so the record and its index entries land together.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    writer: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path, creating
    /// any missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            writer: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::internal(format!("column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys of `cf` starting with `prefix`, in byte order.
    fn keys_with_prefix(&self, cf: &str, prefix: &[u8]) -> Result<Vec<Box<[u8]>>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        let mut keys = Vec::new();
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn values<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(serde_json::from_slice(&value)?);
        }
        Ok(values)
    }

    fn put_json<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        batch.put_cf(self.cf(cf)?, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn index_payment(&self, batch: &mut WriteBatch, tx: &PaymentTransaction) -> Result<()> {
        self.put_json(batch, CF_PAYMENTS, tx.id.as_bytes(), tx)?;
        if let Some(reference) = &tx.gateway_transaction_id {
            batch.put_cf(
                self.cf(CF_PAYMENTS_BY_GATEWAY)?,
                gateway_key(tx.gateway, reference),
                tx.id.as_bytes(),
            );
        }
        Ok(())
    }
}

fn order_prefix(order_reference: &str) -> Vec<u8> {
    let mut key = order_reference.as_bytes().to_vec();
    key.push(SEP);
    key
}

fn order_key(tx: &PaymentTransaction) -> Vec<u8> {
    let mut key = order_prefix(&tx.order_reference);
    key.extend_from_slice(&tx.created_at.timestamp_micros().to_be_bytes());
    key.extend_from_slice(tx.id.as_bytes());
    key
}

fn gateway_key(gateway: GatewayKind, reference: &str) -> Vec<u8> {
    let mut key = gateway.to_string().into_bytes();
    key.push(SEP);
    key.extend_from_slice(reference.as_bytes());
    key
}

/// Trailing 16 bytes of an index key.
fn trailing_uuid(key: &[u8]) -> Result<Uuid> {
    key.len()
        .checked_sub(16)
        .and_then(|start| Uuid::from_slice(&key[start..]).ok())
        .ok_or_else(|| PaymentError::internal("corrupt index key"))
}

#[async_trait]
impl PaymentTransactionStore for RocksDBStore {
    async fn insert(&self, tx: PaymentTransaction) -> Result<InsertOutcome> {
        let _guard = self.writer.lock().await;

        for key in self.keys_with_prefix(CF_PAYMENTS_BY_ORDER, &order_prefix(&tx.order_reference))? {
            let id = trailing_uuid(&key)?;
            if let Some(existing) = self.read::<PaymentTransaction>(CF_PAYMENTS, id.as_bytes())? {
                if !existing.status.is_terminal() {
                    return Ok(InsertOutcome::ActiveAttemptExists(existing));
                }
            }
        }

        let mut batch = WriteBatch::default();
        self.index_payment(&mut batch, &tx)?;
        batch.put_cf(self.cf(CF_PAYMENTS_BY_ORDER)?, order_key(&tx), b"");
        self.db.write(batch)?;
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        self.read(CF_PAYMENTS, id.as_bytes())
    }

    async fn find_by_gateway_reference(
        &self,
        gateway: GatewayKind,
        gateway_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let key = gateway_key(gateway, gateway_transaction_id);
        match self.db.get_cf(self.cf(CF_PAYMENTS_BY_GATEWAY)?, key)? {
            Some(id) => self.read(CF_PAYMENTS, &id),
            None => Ok(None),
        }
    }

    async fn find_by_order_reference(
        &self,
        order_reference: &str,
    ) -> Result<Vec<PaymentTransaction>> {
        let mut attempts = Vec::new();
        for key in self.keys_with_prefix(CF_PAYMENTS_BY_ORDER, &order_prefix(order_reference))? {
            let id = trailing_uuid(&key)?;
            if let Some(tx) = self.read(CF_PAYMENTS, id.as_bytes())? {
                attempts.push(tx);
            }
        }
        Ok(attempts)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        mut tx: PaymentTransaction,
    ) -> Result<CasOutcome> {
        let _guard = self.writer.lock().await;

        let current: PaymentTransaction = self
            .read(CF_PAYMENTS, tx.id.as_bytes())?
            .ok_or_else(|| PaymentError::PaymentNotFound(tx.id.to_string()))?;
        if current.version != expected_version {
            return Ok(CasOutcome::Conflict(current));
        }

        tx.version = expected_version + 1;
        let mut batch = WriteBatch::default();
        self.index_payment(&mut batch, &tx)?;
        self.db.write(batch)?;
        Ok(CasOutcome::Swapped(tx))
    }

    async fn get_all(&self) -> Result<Vec<PaymentTransaction>> {
        let mut all: Vec<PaymentTransaction> = self.values(CF_PAYMENTS)?;
        all.sort_by_key(|tx| tx.created_at);
        Ok(all)
    }
}

#[async_trait]
impl RefundStore for RocksDBStore {
    async fn open(&self, refund: RefundTransaction, limit: Decimal) -> Result<RefundReservation> {
        let _guard = self.writer.lock().await;

        let reserved: Decimal = self
            .list_for_payment(refund.payment_transaction_id)
            .await?
            .iter()
            .filter(|r| r.status.reserves_balance())
            .map(|r| r.amount.value())
            .sum();
        if reserved + refund.amount.value() > limit {
            return Ok(RefundReservation::Exceeds {
                remaining: (limit - reserved).max(Decimal::ZERO),
            });
        }

        let mut index_key = refund.payment_transaction_id.as_bytes().to_vec();
        index_key.extend_from_slice(refund.id.as_bytes());

        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_REFUNDS, refund.id.as_bytes(), &refund)?;
        batch.put_cf(self.cf(CF_REFUNDS_BY_PAYMENT)?, index_key, b"");
        self.db.write(batch)?;
        Ok(RefundReservation::Opened)
    }

    async fn finalize(&self, refund: RefundTransaction) -> Result<()> {
        let _guard = self.writer.lock().await;

        let existing: Option<RefundTransaction> = self.read(CF_REFUNDS, refund.id.as_bytes())?;
        if existing.is_some_and(|r| r.status.is_terminal()) {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_REFUNDS, refund.id.as_bytes(), &refund)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RefundTransaction>> {
        self.read(CF_REFUNDS, id.as_bytes())
    }

    async fn list_for_payment(
        &self,
        payment_transaction_id: Uuid,
    ) -> Result<Vec<RefundTransaction>> {
        let mut refunds = Vec::new();
        for key in self.keys_with_prefix(CF_REFUNDS_BY_PAYMENT, payment_transaction_id.as_bytes())? {
            let id = trailing_uuid(&key)?;
            if let Some(refund) = self.read(CF_REFUNDS, id.as_bytes())? {
                refunds.push(refund);
            }
        }
        refunds.sort_by_key(|r: &RefundTransaction| r.created_at);
        Ok(refunds)
    }
}

#[async_trait]
impl WebhookLedger for RocksDBStore {
    async fn record(&self, mut webhook: PaymentWebhook, lease: Duration) -> Result<WebhookClaim> {
        let _guard = self.writer.lock().await;
        let now = Utc::now();
        let claim_key = webhook.key().encode();

        let owner: Option<PaymentWebhook> =
            match self.db.get_cf(self.cf(CF_WEBHOOK_CLAIMS)?, claim_key.as_bytes())? {
                Some(id) => self.read(CF_WEBHOOKS, &id)?,
                None => None,
            };
        let claim = match owner {
            Some(owner) if owner.processed => WebhookClaim::AlreadyProcessed,
            Some(owner) if owner.holds_live_claim(now) => WebhookClaim::InFlight,
            _ => WebhookClaim::Claimed(webhook.id),
        };

        let mut batch = WriteBatch::default();
        if matches!(claim, WebhookClaim::Claimed(_)) {
            let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
            webhook.claimed_until = Some(now + lease);
            batch.put_cf(
                self.cf(CF_WEBHOOK_CLAIMS)?,
                claim_key.as_bytes(),
                webhook.id.as_bytes(),
            );
        }
        self.put_json(&mut batch, CF_WEBHOOKS, webhook.id.as_bytes(), &webhook)?;
        self.db.write(batch)?;
        Ok(claim)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        if let Some(mut webhook) = self.read::<PaymentWebhook>(CF_WEBHOOKS, id.as_bytes())? {
            webhook.processed = true;
            webhook.processed_at = Some(Utc::now());
            webhook.claimed_until = None;
            let mut batch = WriteBatch::default();
            self.put_json(&mut batch, CF_WEBHOOKS, id.as_bytes(), &webhook)?;
            self.db.write(batch)?;
        }
        Ok(())
    }

    async fn release(&self, id: Uuid) -> Result<()> {
        let _guard = self.writer.lock().await;
        if let Some(mut webhook) = self.read::<PaymentWebhook>(CF_WEBHOOKS, id.as_bytes())? {
            webhook.claimed_until = None;
            let mut batch = WriteBatch::default();
            self.put_json(&mut batch, CF_WEBHOOKS, id.as_bytes(), &webhook)?;
            self.db.write(batch)?;
        }
        Ok(())
    }

    async fn history(
        &self,
        gateway: GatewayKind,
        transaction_id: &str,
    ) -> Result<Vec<PaymentWebhook>> {
        let mut deliveries: Vec<PaymentWebhook> = self
            .values::<PaymentWebhook>(CF_WEBHOOKS)?
            .into_iter()
            .filter(|w| w.gateway == gateway && w.transaction_id == transaction_id)
            .collect();
        deliveries.sort_by_key(|w| w.received_at);
        Ok(deliveries)
    }
}

#[async_trait]
impl TokenStore for RocksDBStore {
    async fn get(&self, key: &str) -> Result<Option<AccessToken>> {
        self.read(CF_TOKENS, key.as_bytes())
    }

    async fn put(&self, key: &str, token: AccessToken) -> Result<()> {
        let mut batch = WriteBatch::default();
        self.put_json(&mut batch, CF_TOKENS, key.as_bytes(), &token)?;
        self.db.write(batch)?;
        Ok(())
    }
}
