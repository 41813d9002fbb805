use crate::application::compensation::{CompensationDispatcher, CompensationReport};
use crate::config::EngineConfig;
use crate::domain::gateway::{GatewayRef, GatewayRegistry, InitiateRequest, QueryResult};
use crate::domain::money::{Amount, Currency};
use crate::domain::order::{Order, OrderPaymentStatus, OrderStatus};
use crate::domain::ports::{
    CasOutcome, InsertOutcome, OrderCollaboratorRef, PaymentStoreBox, RefundStoreBox,
    WebhookLedgerBox,
};
use crate::domain::refund::RefundTransaction;
use crate::domain::transaction::{GatewayKind, PaymentMethod, PaymentStatus, PaymentTransaction};
use crate::domain::webhook::PaymentWebhook;
use crate::error::{GatewayError, PaymentError, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Input of [`ReconciliationEngine::create_payment`].
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub order_reference: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: Currency,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
}

impl CreatePayment {
    pub fn new(
        order_reference: impl Into<String>,
        method: PaymentMethod,
        amount: Decimal,
        currency: Currency,
    ) -> Self {
        Self {
            order_reference: order_reference.into(),
            method,
            amount,
            currency,
            return_url: None,
            cancel_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreatedPayment {
    pub transaction_id: Uuid,
    pub status: PaymentStatus,
    pub redirect_url: Option<String>,
}

/// Result of a verification or reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentOutcome {
    pub transaction_id: Uuid,
    pub status: PaymentStatus,
    pub provider_reference: Option<String>,
    pub amount: Decimal,
    pub currency: Currency,
}

impl From<&PaymentTransaction> for PaymentOutcome {
    fn from(tx: &PaymentTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            status: tx.status,
            provider_reference: tx
                .gateway_reference
                .clone()
                .or_else(|| tx.gateway_transaction_id.clone()),
            amount: tx.amount.value(),
            currency: tx.currency,
        }
    }
}

/// Provider data that accompanies a status change.
#[derive(Debug, Clone, Default)]
pub(crate) struct Evidence {
    pub gateway_transaction_id: Option<String>,
    pub bank_reference: Option<String>,
    pub raw: Option<serde_json::Value>,
}

impl From<QueryResult> for Evidence {
    fn from(result: QueryResult) -> Self {
        Self {
            gateway_transaction_id: result.gateway_transaction_id,
            bank_reference: result.bank_reference,
            raw: Some(result.raw),
        }
    }
}

/// How an attempted transition ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    /// This call committed the transition and ran its side effects.
    Transitioned(PaymentTransaction),
    /// The transaction already had the requested status.
    Unchanged(PaymentTransaction),
    /// The requested status is not reachable from the current one.
    Discarded(PaymentTransaction),
}

impl Applied {
    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            Applied::Transitioned(tx) | Applied::Unchanged(tx) | Applied::Discarded(tx) => tx,
        }
    }
}

/// The payment state-machine driver.
///
/// Every status change goes through a versioned compare-and-swap on the
/// payment store, so concurrent verify calls and callbacks for the same
/// transaction commit at most one transition. Order updates and stock
/// restoration run only in the call that won that swap.
pub struct ReconciliationEngine {
    pub(crate) payments: PaymentStoreBox,
    pub(crate) refunds: RefundStoreBox,
    pub(crate) webhooks: WebhookLedgerBox,
    pub(crate) gateways: GatewayRegistry,
    pub(crate) orders: OrderCollaboratorRef,
    pub(crate) compensation: CompensationDispatcher,
    pub(crate) config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        payments: PaymentStoreBox,
        refunds: RefundStoreBox,
        webhooks: WebhookLedgerBox,
        gateways: GatewayRegistry,
        orders: OrderCollaboratorRef,
        compensation: CompensationDispatcher,
    ) -> Self {
        Self {
            payments,
            refunds,
            webhooks,
            gateways,
            orders,
            compensation,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Validates, records a pending attempt and starts it with the provider.
    ///
    /// Methods that settle on creation complete immediately. A transient
    /// provider failure leaves the attempt pending with the error recorded;
    /// any other provider failure marks it failed. Both are returned to the
    /// caller.
    pub async fn create_payment(&self, request: CreatePayment) -> Result<CreatedPayment> {
        let gateway = self
            .gateways
            .for_method(request.method)
            .ok_or_else(|| PaymentError::UnsupportedMethod(request.method.to_string()))?;
        let amount = Amount::new(request.amount)?;
        gateway.bounds().check(amount)?;
        if !gateway.supports_currency(request.currency) {
            return Err(PaymentError::UnsupportedCurrency {
                currency: request.currency,
                method: request.method,
            });
        }

        let tx = PaymentTransaction::new(
            request.order_reference,
            request.method,
            amount,
            request.currency,
        )
        .with_urls(request.return_url, request.cancel_url);
        self.insert_attempt(tx.clone()).await?;
        info!(
            transaction_id = %tx.id,
            order = %tx.order_reference,
            method = %tx.method,
            amount = %tx.amount.value(),
            "payment attempt created"
        );

        if gateway.settles_on_creation() {
            let applied = self
                .apply_status(tx.id, PaymentStatus::Completed, Evidence::default())
                .await?;
            return Ok(CreatedPayment {
                transaction_id: tx.id,
                status: applied.transaction().status,
                redirect_url: None,
            });
        }

        match gateway.initiate(&InitiateRequest::from(&tx)).await {
            Ok(initiated) => {
                let redirect_url = gateway.redirect_url(&initiated);
                let mut started = tx.clone();
                started.gateway_transaction_id = Some(initiated.gateway_transaction_id);
                started.gateway_response = Some(initiated.raw);
                started.advance(PaymentStatus::Processing);
                let status = match self.payments.compare_and_swap(tx.version, started).await? {
                    CasOutcome::Swapped(tx) => tx.status,
                    CasOutcome::Conflict(current) => {
                        warn!(transaction_id = %current.id, status = %current.status, "attempt changed while initiating");
                        current.status
                    }
                };
                Ok(CreatedPayment {
                    transaction_id: tx.id,
                    status,
                    redirect_url,
                })
            }
            Err(err) => {
                self.record_initiate_failure(tx, &err).await?;
                Err(err.into())
            }
        }
    }

    /// Inserts `tx`, replacing a stale pending attempt for the same order.
    ///
    /// An attempt is stale when its provider call failed transiently before
    /// the provider assigned an id. It is cancelled like any other attempt,
    /// so the order is cancelled and its stock restored before the new
    /// attempt takes over.
    async fn insert_attempt(&self, tx: PaymentTransaction) -> Result<()> {
        for _ in 0..=self.config.cas_retries {
            let existing = match self.payments.insert(tx.clone()).await? {
                InsertOutcome::Inserted => return Ok(()),
                InsertOutcome::ActiveAttemptExists(existing) => existing,
            };
            let stale = existing.status == PaymentStatus::Pending
                && existing.gateway_transaction_id.is_none()
                && existing.error_code.is_some()
                && existing.retry_count > 0;
            if !stale {
                return Err(PaymentError::PaymentInProgress {
                    order_reference: existing.order_reference,
                    transaction_id: existing.id,
                });
            }
            if let Applied::Transitioned(_) = self
                .apply_status(existing.id, PaymentStatus::Cancelled, Evidence::default())
                .await?
            {
                info!(transaction_id = %existing.id, "stale pending attempt cancelled");
            }
        }
        Err(PaymentError::internal("could not record payment attempt"))
    }

    /// Records the provider error on the attempt. A refusal then fails the
    /// attempt through the state machine so the order is cancelled and its
    /// stock restored.
    async fn record_initiate_failure(
        &self,
        tx: PaymentTransaction,
        err: &GatewayError,
    ) -> Result<()> {
        let mut recorded = tx.clone();
        recorded.record_error(err.code(), err.to_string());
        if err.is_transient() {
            recorded.retry_count += 1;
            warn!(transaction_id = %tx.id, error = %err, "provider unavailable; attempt left pending");
        } else {
            warn!(transaction_id = %tx.id, error = %err, "provider refused payment attempt");
        }
        if let CasOutcome::Conflict(current) =
            self.payments.compare_and_swap(tx.version, recorded).await?
        {
            debug!(transaction_id = %current.id, "attempt changed before failure was recorded");
        }
        if !err.is_transient() {
            self.apply_status(tx.id, PaymentStatus::Failed, Evidence::default())
                .await?;
        }
        Ok(())
    }

    /// Client-driven verification. Terminal transactions answer from the
    /// store; others ask the provider to execute or report the payment.
    pub async fn verify_payment(&self, transaction_id: Uuid) -> Result<PaymentOutcome> {
        let tx = self.load(transaction_id).await?;
        if tx.status.is_terminal() {
            return Ok(PaymentOutcome::from(&tx));
        }
        let gateway = self.gateway_for(&tx)?;
        let result = gateway.execute(&tx).await;
        self.reconcile_with(tx, result).await
    }

    /// Re-reads the provider's view of the latest attempt for an order.
    /// The fallback when callbacks never arrive.
    pub async fn reconcile_order(&self, order_reference: &str) -> Result<PaymentOutcome> {
        let tx = self.latest_attempt(order_reference).await?;
        if tx.status.is_terminal() {
            return Ok(PaymentOutcome::from(&tx));
        }
        let gateway = self.gateway_for(&tx)?;
        let result = gateway.query(&tx).await;
        self.reconcile_with(tx, result).await
    }

    async fn reconcile_with(
        &self,
        tx: PaymentTransaction,
        result: std::result::Result<QueryResult, GatewayError>,
    ) -> Result<PaymentOutcome> {
        let result = match result {
            Ok(result) => result,
            Err(err) => {
                self.record_query_failure(tx.id, &err).await?;
                return Err(err.into());
            }
        };
        let next = result.status.as_payment_status();
        let applied = self.apply_status(tx.id, next, result.into()).await?;
        Ok(PaymentOutcome::from(applied.transaction()))
    }

    async fn record_query_failure(&self, transaction_id: Uuid, err: &GatewayError) -> Result<()> {
        warn!(%transaction_id, error = %err, "could not confirm payment with provider");
        let current = self.load(transaction_id).await?;
        let mut updated = current.clone();
        updated.retry_count += 1;
        updated.record_error(err.code(), err.to_string());
        self.payments
            .compare_and_swap(current.version, updated)
            .await?;
        Ok(())
    }

    /// Moves a transaction to `next` if the state graph allows it.
    ///
    /// Re-reads and retries on a lost compare-and-swap, up to
    /// `cas_retries` times. The call that commits the transition also
    /// propagates it to the order.
    pub(crate) async fn apply_status(
        &self,
        transaction_id: Uuid,
        next: PaymentStatus,
        evidence: Evidence,
    ) -> Result<Applied> {
        for _ in 0..=self.config.cas_retries {
            let current = self.load(transaction_id).await?;
            if current.status == next {
                return Ok(Applied::Unchanged(current));
            }
            if !current.status.can_transition_to(next) {
                warn!(
                    %transaction_id,
                    current = %current.status,
                    requested = %next,
                    "discarding transition not reachable from current status"
                );
                return Ok(Applied::Discarded(current));
            }

            let mut updated = current.clone();
            if updated.gateway_transaction_id.is_none() {
                updated.gateway_transaction_id = evidence.gateway_transaction_id.clone();
            }
            if evidence.bank_reference.is_some() {
                updated.gateway_reference = evidence.bank_reference.clone();
            }
            if let Some(raw) = &evidence.raw {
                updated.gateway_response = Some(raw.clone());
            }
            updated.advance(next);

            match self.payments.compare_and_swap(current.version, updated).await? {
                CasOutcome::Swapped(tx) => {
                    info!(
                        %transaction_id,
                        from = %current.status,
                        to = %tx.status,
                        "payment transition applied"
                    );
                    self.propagate(&tx).await;
                    return Ok(Applied::Transitioned(tx));
                }
                CasOutcome::Conflict(_) => {
                    debug!(%transaction_id, "lost compare-and-swap, re-reading");
                }
            }
        }
        Err(PaymentError::internal(format!(
            "transaction {transaction_id} kept changing; gave up after {} attempts",
            self.config.cas_retries + 1
        )))
    }

    /// Carries a committed transition over to the order. Collaborator
    /// failures are logged; the payment transition stands.
    pub(crate) async fn propagate(&self, tx: &PaymentTransaction) -> Option<CompensationReport> {
        let (order_status, payment_status) = match tx.status {
            PaymentStatus::Completed => (OrderStatus::Confirmed, OrderPaymentStatus::Completed),
            PaymentStatus::Failed | PaymentStatus::Cancelled => {
                (OrderStatus::Cancelled, OrderPaymentStatus::Failed)
            }
            PaymentStatus::Refunded => (OrderStatus::Refunded, OrderPaymentStatus::Refunded),
            _ => return None,
        };
        let order = match self.resolve_order(&tx.order_reference).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                warn!(order = %tx.order_reference, "order not found; status not propagated");
                return None;
            }
            Err(e) => {
                error!(order = %tx.order_reference, error = %e, "order lookup failed");
                return None;
            }
        };

        if let Err(e) = self.orders.set_status(&order.id, order_status).await {
            error!(order_id = %order.id, error = %e, "could not update order status");
        }
        if let Err(e) = self.orders.set_payment_status(&order.id, payment_status).await {
            error!(order_id = %order.id, error = %e, "could not update order payment status");
        }

        if tx.status.is_negative() {
            Some(self.compensation.restore_stock(&order).await)
        } else {
            None
        }
    }

    /// Order number first, then the internal order id.
    pub(crate) async fn resolve_order(&self, reference: &str) -> Result<Option<Order>> {
        if let Some(order) = self.orders.find_by_reference(reference).await? {
            return Ok(Some(order));
        }
        self.orders.find_by_id(reference).await
    }

    pub(crate) async fn load(&self, transaction_id: Uuid) -> Result<PaymentTransaction> {
        self.payments
            .get(transaction_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(transaction_id.to_string()))
    }

    pub(crate) fn gateway_for(&self, tx: &PaymentTransaction) -> Result<GatewayRef> {
        self.gateways
            .get(tx.gateway)
            .ok_or_else(|| PaymentError::UnsupportedMethod(tx.method.to_string()))
    }

    pub async fn transaction(&self, transaction_id: Uuid) -> Result<Option<PaymentTransaction>> {
        self.payments.get(transaction_id).await
    }

    pub async fn latest_attempt(&self, order_reference: &str) -> Result<PaymentTransaction> {
        self.payments
            .find_by_order_reference(order_reference)
            .await?
            .pop()
            .ok_or_else(|| PaymentError::PaymentNotFound(order_reference.to_string()))
    }

    /// Every attempt, oldest first.
    pub async fn transactions(&self) -> Result<Vec<PaymentTransaction>> {
        self.payments.get_all().await
    }

    pub async fn refunds_for(&self, transaction_id: Uuid) -> Result<Vec<RefundTransaction>> {
        self.refunds.list_for_payment(transaction_id).await
    }

    pub async fn webhook_history(
        &self,
        gateway: GatewayKind,
        provider_transaction_id: &str,
    ) -> Result<Vec<PaymentWebhook>> {
        self.webhooks.history(gateway, provider_transaction_id).await
    }

    /// Drains queued compensation retries.
    pub async fn shutdown(&self) {
        self.compensation.shutdown().await;
    }
}
