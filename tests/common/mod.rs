#![allow(dead_code)]

use payrecon::application::compensation::CompensationDispatcher;
use payrecon::application::engine::{CreatePayment, ReconciliationEngine};
use payrecon::config::GatewaysConfig;
use payrecon::domain::gateway::GatewayStatus;
use payrecon::domain::money::Currency;
use payrecon::domain::order::{Order, OrderItem};
use payrecon::domain::transaction::{PaymentMethod, PaymentTransaction};
use payrecon::infrastructure::collaborators::{InMemoryCatalog, InMemoryOrderBook};
use payrecon::infrastructure::gateways::build_registry;
use payrecon::infrastructure::gateways::simulated::{SignedCallback, SimulatedProvider};
use payrecon::infrastructure::in_memory::{
    InMemoryPaymentStore, InMemoryRefundStore, InMemoryTokenStore, InMemoryWebhookLedger,
};
use rust_decimal::Decimal;
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

/// An engine over in-memory stores with every collaborator exposed.
pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub provider: Arc<SimulatedProvider>,
    pub orders: Arc<InMemoryOrderBook>,
    pub catalog: Arc<InMemoryCatalog>,
    pub webhooks: InMemoryWebhookLedger,
}

impl Harness {
    pub fn new() -> Self {
        let provider = Arc::new(SimulatedProvider::default());
        let orders = Arc::new(InMemoryOrderBook::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        let webhooks = InMemoryWebhookLedger::new();
        let registry = build_registry(
            &GatewaysConfig::default(),
            Arc::new(InMemoryTokenStore::new()),
            provider.clone(),
        )
        .unwrap();
        let engine = ReconciliationEngine::new(
            Box::new(InMemoryPaymentStore::new()),
            Box::new(InMemoryRefundStore::new()),
            Box::new(webhooks.clone()),
            registry,
            orders.clone(),
            CompensationDispatcher::new(catalog.clone()),
        );
        Self {
            engine: Arc::new(engine),
            provider,
            orders,
            catalog,
            webhooks,
        }
    }

    /// Registers order `id` with number `ORD-{id}` and the given items.
    pub async fn order(&self, id: &str, items: &[(&str, u32)]) -> String {
        let number = format!("ORD-{id}");
        let items = items
            .iter()
            .map(|(sku, qty)| OrderItem::new(*sku, *qty))
            .collect();
        self.orders.add(Order::new(id, number.clone(), items)).await;
        number
    }

    /// Creates a payment and returns the stored attempt.
    pub async fn pay(
        &self,
        order_reference: &str,
        method: PaymentMethod,
        amount: Decimal,
    ) -> PaymentTransaction {
        let created = self
            .engine
            .create_payment(CreatePayment::new(
                order_reference,
                method,
                amount,
                Currency::Bdt,
            ))
            .await
            .unwrap();
        self.engine
            .transaction(created.transaction_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn settle(&self, tx: &PaymentTransaction, status: GatewayStatus) {
        self.provider
            .settle(provider_id(tx), status)
            .await
            .unwrap();
    }

    pub async fn callback(&self, tx: &PaymentTransaction, claimed: GatewayStatus) -> SignedCallback {
        self.provider
            .callback(provider_id(tx), claimed)
            .await
            .unwrap()
    }

    pub async fn current(&self, tx: &PaymentTransaction) -> PaymentTransaction {
        self.engine.transaction(tx.id).await.unwrap().unwrap()
    }
}

pub fn provider_id(tx: &PaymentTransaction) -> &str {
    tx.gateway_transaction_id.as_deref().unwrap()
}

/// A replay script with one cash-on-delivery order per row.
pub fn generate_script(path: &Path, orders: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);

    wtr.write_record(["op", "reference", "method", "amount", "currency", "detail"])?;

    for i in 1..=orders {
        let reference = format!("ORD-{i}");
        wtr.write_record(["order", reference.as_str(), "", "", "", "sku-1:1"])?;
        wtr.write_record(["create", reference.as_str(), "cash_on_delivery", "100", "BDT", ""])?;
    }

    wtr.flush()?;
    Ok(())
}
