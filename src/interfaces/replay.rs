//! Drives the engine from a replay script.
//!
//! Orders and stock live in in-process collaborators, and provider-side
//! outcomes come from the shared [`SimulatedProvider`]: `settle` decides
//! what the provider will report, `callback` and `forged` push
//! notifications the way the provider would.

use crate::application::compensation::CompensationDispatcher;
use crate::application::engine::{CreatePayment, ReconciliationEngine};
use crate::config::AppConfig;
use crate::domain::gateway::GatewayStatus;
use crate::domain::money::Currency;
use crate::domain::order::{Order, OrderItem};
use crate::domain::ports::{PaymentStoreBox, RefundStoreBox, TokenStoreRef, WebhookLedgerBox};
use crate::domain::transaction::PaymentTransaction;
use crate::error::{PaymentError, Result};
use crate::infrastructure::collaborators::{InMemoryCatalog, InMemoryOrderBook};
use crate::infrastructure::gateways::build_registry;
use crate::infrastructure::gateways::simulated::SimulatedProvider;
use crate::interfaces::csv::command_reader::{ScriptCommand, ScriptOp};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Storage backends handed to the runner.
pub struct Stores {
    pub payments: PaymentStoreBox,
    pub refunds: RefundStoreBox,
    pub webhooks: WebhookLedgerBox,
    pub tokens: TokenStoreRef,
}

pub struct ScriptRunner {
    engine: ReconciliationEngine,
    provider: Arc<SimulatedProvider>,
    orders: Arc<InMemoryOrderBook>,
    catalog: Arc<InMemoryCatalog>,
    next_order_id: u64,
}

impl ScriptRunner {
    /// Wires an engine from configuration. Must be called inside a tokio
    /// runtime when compensation retries are enabled.
    pub fn build(config: &AppConfig, stores: Stores) -> Result<Self> {
        let provider = Arc::new(SimulatedProvider::default());
        let orders = Arc::new(InMemoryOrderBook::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let registry = build_registry(&config.gateways, stores.tokens, provider.clone())?;
        let engine = ReconciliationEngine::new(
            stores.payments,
            stores.refunds,
            stores.webhooks,
            registry,
            orders.clone(),
            CompensationDispatcher::with_config(catalog.clone(), &config.compensation),
        )
        .with_config(config.engine.clone());

        Ok(Self {
            engine,
            provider,
            orders,
            catalog,
            next_order_id: 1,
        })
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn catalog(&self) -> &InMemoryCatalog {
        &self.catalog
    }

    pub async fn run(&mut self, command: ScriptCommand) -> Result<()> {
        debug!(op = ?command.op, reference = %command.reference, "replaying command");
        match command.op {
            ScriptOp::Order => {
                let items = parse_items(command.detail.as_deref().unwrap_or(""))?;
                let id = self.next_order_id.to_string();
                self.next_order_id += 1;
                self.orders
                    .add(Order::new(id, command.reference.clone(), items))
                    .await;
            }
            ScriptOp::Create => {
                let method = command.method.ok_or_else(|| {
                    PaymentError::ValidationError("create needs a method".to_string())
                })?;
                let request = CreatePayment::new(
                    command.reference.clone(),
                    method,
                    command.amount()?,
                    command.currency.unwrap_or(Currency::Bdt),
                );
                self.engine.create_payment(request).await?;
            }
            ScriptOp::Settle => {
                let status = parse_status(command.detail()?)?;
                self.provider
                    .settle_order(&command.reference, status)
                    .await?;
            }
            ScriptOp::Callback | ScriptOp::Forged => {
                let status = parse_status(command.detail()?)?;
                let payment = self
                    .provider
                    .latest_for_order(&command.reference)
                    .await
                    .ok_or_else(|| PaymentError::PaymentNotFound(command.reference.clone()))?;
                let callback = self.provider.callback(&payment.provider_id, status).await?;
                let signature = match command.op {
                    ScriptOp::Callback => Some(callback.signature.as_str()),
                    _ => None,
                };
                self.engine
                    .process_callback(payment.gateway, &callback.payload, signature)
                    .await?;
            }
            ScriptOp::Verify => {
                let tx = self.engine.latest_attempt(&command.reference).await?;
                self.engine.verify_payment(tx.id).await?;
            }
            ScriptOp::Refund => {
                let tx = self.engine.latest_attempt(&command.reference).await?;
                let reason = command.detail.clone().unwrap_or_default();
                self.engine
                    .refund_payment(tx.id, command.amount()?, reason)
                    .await?;
            }
            ScriptOp::Reconcile => {
                self.engine.reconcile_order(&command.reference).await?;
            }
        }
        Ok(())
    }

    /// Drains background work and returns every payment attempt.
    pub async fn finish(self) -> Result<Vec<PaymentTransaction>> {
        self.engine.shutdown().await;
        self.engine.transactions().await
    }
}

/// `sku:qty;sku:qty`, quantity defaulting to 1.
fn parse_items(detail: &str) -> Result<Vec<OrderItem>> {
    detail
        .split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once(':') {
            Some((sku, qty)) => qty
                .trim()
                .parse::<u32>()
                .map(|qty| OrderItem::new(sku.trim(), qty))
                .map_err(|_| PaymentError::ValidationError(format!("bad quantity in `{item}`"))),
            None => Ok(OrderItem::new(item, 1)),
        })
        .collect()
}

fn parse_status(detail: &str) -> Result<GatewayStatus> {
    GatewayStatus::from_str(detail)
        .map_err(|_| PaymentError::ValidationError(format!("unknown provider status `{detail}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transaction::PaymentStatus;
    use crate::infrastructure::in_memory::{
        InMemoryPaymentStore, InMemoryRefundStore, InMemoryTokenStore, InMemoryWebhookLedger,
    };
    use crate::interfaces::csv::command_reader::CommandReader;

    fn runner() -> ScriptRunner {
        let stores = Stores {
            payments: Box::new(InMemoryPaymentStore::new()),
            refunds: Box::new(InMemoryRefundStore::new()),
            webhooks: Box::new(InMemoryWebhookLedger::new()),
            tokens: Arc::new(InMemoryTokenStore::new()),
        };
        ScriptRunner::build(&AppConfig::default(), stores).unwrap()
    }

    async fn replay(runner: &mut ScriptRunner, script: &str) -> Vec<Result<()>> {
        let mut results = Vec::new();
        for command in CommandReader::new(script.as_bytes()).commands() {
            results.push(match command {
                Ok(command) => runner.run(command).await,
                Err(e) => Err(e),
            });
        }
        results
    }

    #[test]
    fn test_parse_items() {
        let items = parse_items("a:2; b ;c:10").unwrap();
        assert_eq!(
            items,
            vec![
                OrderItem::new("a", 2),
                OrderItem::new("b", 1),
                OrderItem::new("c", 10)
            ]
        );
        assert!(parse_items("a:x").is_err());
        assert!(parse_items("").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_payment_restores_stock() {
        let mut runner = runner();
        let results = replay(
            &mut runner,
            "op,reference,method,amount,currency,detail\n\
             order,ORD-1,,,,sku-1:2;sku-2:1\n\
             create,ORD-1,card,800,BDT,\n\
             settle,ORD-1,,,,failed\n\
             forged,ORD-1,,,,completed\n",
        )
        .await;
        assert!(results.iter().all(Result::is_ok), "{results:?}");

        assert_eq!(runner.catalog().stock("sku-1").await, 2);
        assert_eq!(runner.catalog().stock("sku-2").await, 1);
        let transactions = runner.finish().await.unwrap();
        assert_eq!(transactions[0].status, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_errors_are_per_line() {
        let mut runner = runner();
        let results = replay(
            &mut runner,
            "op,reference,method,amount,currency,detail\n\
             verify,ORD-404,,,,\n\
             create,ORD-2,cash_on_delivery,100,,\n\
             settle,ORD-2,,,,maybe\n",
        )
        .await;
        assert!(matches!(results[0], Err(PaymentError::PaymentNotFound(_))));
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(PaymentError::ValidationError(_))));

        let transactions = runner.finish().await.unwrap();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].status, PaymentStatus::Completed);
    }
}
