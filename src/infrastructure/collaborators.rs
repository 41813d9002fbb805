//! In-process stand-ins for the order service and the product catalog.
//!
//! Both record every call they receive so callers can check how many times
//! a side effect was applied.

use crate::domain::order::{Order, OrderPaymentStatus, OrderStatus};
use crate::domain::ports::{CatalogCollaborator, OrderCollaborator};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderUpdate {
    Status(OrderStatus),
    PaymentStatus(OrderPaymentStatus),
}

#[derive(Default)]
struct OrderTables {
    orders: HashMap<String, Order>,
    updates: Vec<(String, OrderUpdate)>,
}

#[derive(Default, Clone)]
pub struct InMemoryOrderBook {
    tables: Arc<RwLock<OrderTables>>,
}

impl InMemoryOrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, order: Order) {
        self.tables
            .write()
            .await
            .orders
            .insert(order.id.clone(), order);
    }

    pub async fn get(&self, id: &str) -> Option<Order> {
        self.tables.read().await.orders.get(id).cloned()
    }

    /// Every status write received for the order, in arrival order.
    pub async fn updates_for(&self, order_id: &str) -> Vec<OrderUpdate> {
        self.tables
            .read()
            .await
            .updates
            .iter()
            .filter(|(id, _)| id == order_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    async fn update(&self, order_id: &str, update: OrderUpdate) -> Result<()> {
        let mut tables = self.tables.write().await;
        let order = tables
            .orders
            .get_mut(order_id)
            .ok_or_else(|| PaymentError::Collaborator(format!("order {order_id} not found")))?;
        match &update {
            OrderUpdate::Status(status) => order.status = *status,
            OrderUpdate::PaymentStatus(status) => order.payment_status = *status,
        }
        tables.updates.push((order_id.to_string(), update));
        Ok(())
    }
}

#[async_trait]
impl OrderCollaborator for InMemoryOrderBook {
    async fn find_by_reference(&self, order_number: &str) -> Result<Option<Order>> {
        let tables = self.tables.read().await;
        Ok(tables
            .orders
            .values()
            .find(|order| order.order_number == order_number)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Order>> {
        Ok(self.get(id).await)
    }

    async fn set_status(&self, order_id: &str, status: OrderStatus) -> Result<()> {
        self.update(order_id, OrderUpdate::Status(status)).await
    }

    async fn set_payment_status(&self, order_id: &str, status: OrderPaymentStatus) -> Result<()> {
        self.update(order_id, OrderUpdate::PaymentStatus(status)).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAttempt {
    pub item_id: String,
    pub quantity: u32,
    pub succeeded: bool,
}

#[derive(Default)]
struct CatalogTables {
    stock: HashMap<String, i64>,
    attempts: Vec<StockAttempt>,
    /// Items whose counter update reports failure.
    rejecting: HashSet<String>,
    /// Items whose counter update errors out.
    broken: HashSet<String>,
}

#[derive(Default, Clone)]
pub struct InMemoryCatalog {
    tables: Arc<RwLock<CatalogTables>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_stock(&self, item_id: &str, quantity: i64) {
        self.tables
            .write()
            .await
            .stock
            .insert(item_id.to_string(), quantity);
    }

    pub async fn stock(&self, item_id: &str) -> i64 {
        self.tables
            .read()
            .await
            .stock
            .get(item_id)
            .copied()
            .unwrap_or(0)
    }

    /// Makes `increment_stock` return `false` for the item.
    pub async fn reject_item(&self, item_id: &str) {
        self.tables
            .write()
            .await
            .rejecting
            .insert(item_id.to_string());
    }

    /// Makes `increment_stock` return an error for the item.
    pub async fn break_item(&self, item_id: &str) {
        self.tables.write().await.broken.insert(item_id.to_string());
    }

    /// Clears injected faults for the item.
    pub async fn heal_item(&self, item_id: &str) {
        let mut tables = self.tables.write().await;
        tables.rejecting.remove(item_id);
        tables.broken.remove(item_id);
    }

    pub async fn attempts(&self) -> Vec<StockAttempt> {
        self.tables.read().await.attempts.clone()
    }

    pub async fn attempts_for(&self, item_id: &str) -> usize {
        self.tables
            .read()
            .await
            .attempts
            .iter()
            .filter(|attempt| attempt.item_id == item_id)
            .count()
    }
}

#[async_trait]
impl CatalogCollaborator for InMemoryCatalog {
    async fn increment_stock(&self, item_id: &str, quantity: u32) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let broken = tables.broken.contains(item_id);
        let succeeded = !broken && !tables.rejecting.contains(item_id);
        tables.attempts.push(StockAttempt {
            item_id: item_id.to_string(),
            quantity,
            succeeded,
        });
        if broken {
            return Err(PaymentError::Collaborator(format!(
                "catalog unavailable for item {item_id}"
            )));
        }
        if succeeded {
            *tables.stock.entry(item_id.to_string()).or_insert(0) += i64::from(quantity);
        }
        Ok(succeeded)
    }
}
