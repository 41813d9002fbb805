use crate::application::engine::ReconciliationEngine;
use crate::domain::gateway::{GatewayRef, RefundOutcome, RefundRequest};
use crate::domain::money::Amount;
use crate::domain::ports::{CasOutcome, RefundReservation};
use crate::domain::refund::RefundTransaction;
use crate::domain::transaction::{PaymentStatus, PaymentTransaction};
use crate::error::{GatewayError, PaymentError, Result};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl ReconciliationEngine {
    /// Refunds part or all of a settled payment.
    ///
    /// The refund is reserved against the payment's balance before the
    /// provider is called, so concurrent refunds can never jointly exceed
    /// the original amount. A transient provider failure keeps the
    /// reservation and leaves the refund pending; any other failure
    /// releases it.
    pub async fn refund_payment(
        &self,
        transaction_id: Uuid,
        amount: Decimal,
        reason: impl Into<String>,
    ) -> Result<RefundTransaction> {
        let tx = self.load(transaction_id).await?;
        let gateway = self.gateway_for(&tx)?;
        if !gateway.supports_refund() {
            return Err(PaymentError::RefundNotSupported(tx.method));
        }
        if !tx.status.is_refundable() {
            return Err(PaymentError::IneligibleStatus {
                transaction_id,
                status: tx.status,
            });
        }
        let amount = Amount::new(amount)?;
        if amount.value() > tx.refundable_remaining() {
            return Err(PaymentError::RefundExceedsRemaining {
                requested: amount.value(),
                remaining: tx.refundable_remaining(),
            });
        }

        let bank_reference = self.settlement_reference(&gateway, &tx).await?;

        let mut refund = RefundTransaction::new(tx.id, amount, reason);
        if let RefundReservation::Exceeds { remaining } =
            self.refunds.open(refund.clone(), tx.amount.value()).await?
        {
            return Err(PaymentError::RefundExceedsRemaining {
                requested: amount.value(),
                remaining,
            });
        }

        let request = RefundRequest {
            refund_id: refund.refund_id.clone(),
            gateway_transaction_id: tx.gateway_transaction_id.clone(),
            bank_reference,
            amount: amount.value(),
            original_amount: tx.amount.value(),
            currency: tx.currency,
            reason: refund.reason.clone(),
        };
        let result = match gateway.refund(&request).await {
            Ok(result) => result,
            Err(e) if e.is_transient() => {
                warn!(%transaction_id, refund_id = %refund.refund_id, error = %e, "refund outcome unknown; left pending");
                return Err(e.into());
            }
            Err(e) => {
                warn!(%transaction_id, refund_id = %refund.refund_id, error = %e, "provider refused refund");
                refund.fail(e.to_string());
                self.refunds.finalize(refund).await?;
                return Err(e.into());
            }
        };

        match result.outcome {
            RefundOutcome::Completed => {
                refund.complete(result.gateway_refund_id, result.raw);
                self.refunds.finalize(refund.clone()).await?;
                self.book_refund(transaction_id, amount.value()).await?;
            }
            RefundOutcome::Processing => {
                refund.mark_processing(result.gateway_refund_id, result.raw);
                self.refunds.finalize(refund.clone()).await?;
                info!(%transaction_id, refund_id = %refund.refund_id, "refund accepted, settlement pending");
            }
            RefundOutcome::Failed => {
                refund.fail("provider reported refund failure");
                self.refunds.finalize(refund.clone()).await?;
                warn!(%transaction_id, refund_id = %refund.refund_id, "refund failed");
            }
        }
        Ok(refund)
    }

    /// The bank reference providers refund against. Read from the
    /// transaction, or fetched once from the provider and cached.
    async fn settlement_reference(
        &self,
        gateway: &GatewayRef,
        tx: &PaymentTransaction,
    ) -> Result<String> {
        if let Some(reference) = &tx.gateway_reference {
            return Ok(reference.clone());
        }
        let result = gateway.query(tx).await?;
        let reference = result
            .bank_reference
            .or_else(|| tx.gateway_transaction_id.clone())
            .ok_or_else(|| {
                GatewayError::MalformedResponse("provider reported no settlement reference".into())
            })?;

        let mut cached = tx.clone();
        cached.gateway_reference = Some(reference.clone());
        if let CasOutcome::Conflict(_) = self.payments.compare_and_swap(tx.version, cached).await? {
            debug!(transaction_id = %tx.id, "settlement reference not cached; transaction moved on");
        }
        Ok(reference)
    }

    /// Adds a completed refund to the payment and derives its status.
    async fn book_refund(&self, transaction_id: Uuid, amount: Decimal) -> Result<()> {
        for _ in 0..=self.config.cas_retries {
            let current = self.load(transaction_id).await?;
            let mut updated = current.clone();
            let next = updated.apply_refund(amount);
            if !current.status.can_transition_to(next) || updated.refunded_amount > current.amount.value() {
                return Err(PaymentError::internal(format!(
                    "refund of {amount} cannot be booked on {transaction_id} ({})",
                    current.status
                )));
            }
            if let CasOutcome::Swapped(tx) = self
                .payments
                .compare_and_swap(current.version, updated)
                .await?
            {
                info!(
                    %transaction_id,
                    refunded = %tx.refunded_amount,
                    status = %tx.status,
                    "refund booked"
                );
                if tx.status == PaymentStatus::Refunded {
                    self.propagate(&tx).await;
                }
                return Ok(());
            }
        }
        Err(PaymentError::internal(format!(
            "transaction {transaction_id} kept changing while booking a refund"
        )))
    }
}

#[cfg(test)]
mod tests {
    use crate::application::compensation::CompensationDispatcher;
    use crate::application::engine::{CreatePayment, ReconciliationEngine};
    use crate::domain::gateway::GatewayStatus;
    use crate::domain::money::Currency;
    use crate::domain::order::{Order, OrderItem, OrderPaymentStatus, OrderStatus};
    use crate::domain::ports::CasOutcome;
    use crate::domain::refund::RefundStatus;
    use crate::domain::transaction::{GatewayKind, PaymentMethod, PaymentStatus};
    use crate::error::{GatewayError, PaymentError};
    use crate::infrastructure::collaborators::InMemoryOrderBook;
    use crate::infrastructure::collaborators::InMemoryCatalog;
    use crate::infrastructure::gateways::build_registry;
    use crate::infrastructure::gateways::simulated::SimulatedProvider;
    use crate::infrastructure::in_memory::{
        InMemoryPaymentStore, InMemoryRefundStore, InMemoryTokenStore, InMemoryWebhookLedger,
    };
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use uuid::Uuid;

    struct Fixture {
        engine: ReconciliationEngine,
        provider: Arc<SimulatedProvider>,
        orders: Arc<InMemoryOrderBook>,
    }

    async fn fixture() -> Fixture {
        let provider = Arc::new(SimulatedProvider::default());
        let orders = Arc::new(InMemoryOrderBook::new());
        orders
            .add(Order::new("3", "ORD-3", vec![OrderItem::new("sku", 1)]))
            .await;
        let registry = build_registry(
            &Default::default(),
            Arc::new(InMemoryTokenStore::new()),
            provider.clone(),
        )
        .unwrap();
        let engine = ReconciliationEngine::new(
            Box::new(InMemoryPaymentStore::new()),
            Box::new(InMemoryRefundStore::new()),
            Box::new(InMemoryWebhookLedger::new()),
            registry,
            orders.clone(),
            CompensationDispatcher::new(Arc::new(InMemoryCatalog::new())),
        );
        Fixture {
            engine,
            provider,
            orders,
        }
    }

    async fn completed_payment(f: &Fixture, method: PaymentMethod) -> Uuid {
        let created = f
            .engine
            .create_payment(CreatePayment::new("ORD-3", method, dec!(500), Currency::Bdt))
            .await
            .unwrap();
        f.provider
            .settle_order("ORD-3", GatewayStatus::Completed)
            .await
            .unwrap();
        let outcome = f.engine.verify_payment(created.transaction_id).await.unwrap();
        assert_eq!(outcome.status, PaymentStatus::Completed);
        created.transaction_id
    }

    #[tokio::test]
    async fn test_partial_then_excess_refund() {
        let f = fixture().await;
        let id = completed_payment(&f, PaymentMethod::WalletA).await;

        let refund = f.engine.refund_payment(id, dec!(300), "damaged").await.unwrap();
        assert_eq!(refund.status, RefundStatus::Completed);
        assert!(refund.gateway_refund_id.unwrap().starts_with("SIM-RF-"));
        let tx = f.engine.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::PartiallyRefunded);
        assert_eq!(tx.refunded_amount, dec!(300));

        match f.engine.refund_payment(id, dec!(300), "again").await {
            Err(PaymentError::RefundExceedsRemaining {
                requested,
                remaining,
            }) => {
                assert_eq!(requested, dec!(300));
                assert_eq!(remaining, dec!(200));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Order stays confirmed until the payment is fully refunded.
        assert_eq!(f.orders.get("3").await.unwrap().status, OrderStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_full_refund_marks_order_refunded() {
        let f = fixture().await;
        let id = completed_payment(&f, PaymentMethod::Card).await;

        f.engine.refund_payment(id, dec!(200), "a").await.unwrap();
        f.engine.refund_payment(id, dec!(300), "b").await.unwrap();

        let tx = f.engine.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Refunded);
        assert_eq!(tx.refunded_amount, tx.amount.value());
        let order = f.orders.get("3").await.unwrap();
        assert_eq!(order.status, OrderStatus::Refunded);
        assert_eq!(order.payment_status, OrderPaymentStatus::Refunded);
        assert_eq!(f.engine.refunds_for(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_refund_preconditions() {
        let f = fixture().await;
        let created = f
            .engine
            .create_payment(CreatePayment::new(
                "ORD-3",
                PaymentMethod::WalletA,
                dec!(500),
                Currency::Bdt,
            ))
            .await
            .unwrap();
        assert!(matches!(
            f.engine
                .refund_payment(created.transaction_id, dec!(10), "early")
                .await,
            Err(PaymentError::IneligibleStatus {
                status: PaymentStatus::Processing,
                ..
            })
        ));
        assert!(matches!(
            f.engine.refund_payment(Uuid::new_v4(), dec!(10), "x").await,
            Err(PaymentError::PaymentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_method_without_refunds() {
        let f = fixture().await;
        let created = f
            .engine
            .create_payment(CreatePayment::new(
                "ORD-3",
                PaymentMethod::CashOnDelivery,
                dec!(500),
                Currency::Bdt,
            ))
            .await
            .unwrap();
        assert!(matches!(
            f.engine
                .refund_payment(created.transaction_id, dec!(100), "x")
                .await,
            Err(PaymentError::RefundNotSupported(PaymentMethod::CashOnDelivery))
        ));
    }

    #[tokio::test]
    async fn test_transient_refund_failure_keeps_reservation() {
        let f = fixture().await;
        let id = completed_payment(&f, PaymentMethod::WalletA).await;
        f.provider
            .inject_fault(GatewayKind::WalletA, GatewayError::Timeout)
            .await;

        assert!(f.engine.refund_payment(id, dec!(400), "x").await.is_err());
        let refunds = f.engine.refunds_for(id).await.unwrap();
        assert_eq!(refunds[0].status, RefundStatus::Pending);
        // The pending 400 still counts against the balance.
        assert!(matches!(
            f.engine.refund_payment(id, dec!(200), "y").await,
            Err(PaymentError::RefundExceedsRemaining { .. })
        ));
        let tx = f.engine.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.status, PaymentStatus::Completed);
        assert_eq!(tx.refunded_amount, dec!(0));
    }

    #[tokio::test]
    async fn test_rejected_refund_releases_balance() {
        let f = fixture().await;
        let id = completed_payment(&f, PaymentMethod::WalletA).await;
        f.provider
            .inject_fault(
                GatewayKind::WalletA,
                GatewayError::Rejected {
                    code: "2071".into(),
                    message: "refund window closed".into(),
                },
            )
            .await;

        assert!(f.engine.refund_payment(id, dec!(500), "x").await.is_err());
        assert_eq!(
            f.engine.refunds_for(id).await.unwrap()[0].status,
            RefundStatus::Failed
        );
        let refund = f.engine.refund_payment(id, dec!(500), "retry").await.unwrap();
        assert_eq!(refund.status, RefundStatus::Completed);
    }

    #[tokio::test]
    async fn test_missing_settlement_reference_is_fetched_once() {
        let f = fixture().await;
        let id = completed_payment(&f, PaymentMethod::WalletA).await;
        let tx = f.engine.transaction(id).await.unwrap().unwrap();
        let provider_id = tx.gateway_transaction_id.clone().unwrap();
        let bank_reference = tx.gateway_reference.clone().unwrap();

        let mut cleared = tx.clone();
        cleared.gateway_reference = None;
        assert!(matches!(
            f.engine.payments.compare_and_swap(tx.version, cleared).await.unwrap(),
            CasOutcome::Swapped(_)
        ));
        let queries = f.provider.payment(&provider_id).await.unwrap().queries;

        f.engine.refund_payment(id, dec!(100), "a").await.unwrap();
        assert_eq!(
            f.provider.payment(&provider_id).await.unwrap().queries,
            queries + 1
        );
        let tx = f.engine.transaction(id).await.unwrap().unwrap();
        assert_eq!(tx.gateway_reference, Some(bank_reference));

        f.engine.refund_payment(id, dec!(100), "b").await.unwrap();
        assert_eq!(
            f.provider.payment(&provider_id).await.unwrap().queries,
            queries + 1
        );
        assert_eq!(
            f.engine.transaction(id).await.unwrap().unwrap().refunded_amount,
            dec!(200)
        );
    }
}
