use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Cancelled,
    Refunded,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderPaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub item_id: String,
    pub quantity: u32,
}

impl OrderItem {
    pub fn new(item_id: impl Into<String>, quantity: u32) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

/// The engine's view of an order owned by the order service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Internal identifier of the order record.
    pub id: String,
    /// Customer-facing order number; payment attempts reference this.
    pub order_number: String,
    pub items: Vec<OrderItem>,
    pub status: OrderStatus,
    pub payment_status: OrderPaymentStatus,
}

impl Order {
    pub fn new(id: impl Into<String>, order_number: impl Into<String>, items: Vec<OrderItem>) -> Self {
        Self {
            id: id.into(),
            order_number: order_number.into(),
            items,
            status: OrderStatus::Pending,
            payment_status: OrderPaymentStatus::Pending,
        }
    }
}
