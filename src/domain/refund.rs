use crate::domain::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RefundStatus::Completed | RefundStatus::Failed)
    }

    /// Pending, processing and completed refunds all count against the
    /// refundable balance; only failed ones release it.
    pub fn reserves_balance(self) -> bool {
        !matches!(self, RefundStatus::Failed)
    }
}

/// One refund attempt against a payment transaction. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundTransaction {
    pub id: Uuid,
    pub payment_transaction_id: Uuid,
    /// Locally generated, unique reference sent to the provider.
    pub refund_id: String,
    pub amount: Amount,
    pub reason: String,
    pub status: RefundStatus,
    pub gateway_refund_id: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RefundTransaction {
    pub fn new(payment_transaction_id: Uuid, amount: Amount, reason: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            payment_transaction_id,
            refund_id: format!("RF-{}", id.simple()),
            amount,
            reason: reason.into(),
            status: RefundStatus::Pending,
            gateway_refund_id: None,
            gateway_response: None,
            error_message: None,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    pub fn complete(&mut self, gateway_refund_id: Option<String>, response: serde_json::Value) {
        self.status = RefundStatus::Completed;
        self.gateway_refund_id = gateway_refund_id;
        self.gateway_response = Some(response);
        self.processed_at = Some(Utc::now());
    }

    /// Accepted by the provider but not settled yet. Still reserves balance.
    pub fn mark_processing(
        &mut self,
        gateway_refund_id: Option<String>,
        response: serde_json::Value,
    ) {
        self.status = RefundStatus::Processing;
        self.gateway_refund_id = gateway_refund_id;
        self.gateway_response = Some(response);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = RefundStatus::Failed;
        self.error_message = Some(message.into());
        self.processed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_refund_ids_are_unique() {
        let payment = Uuid::new_v4();
        let a = RefundTransaction::new(payment, Amount::new(dec!(10)).unwrap(), "damaged");
        let b = RefundTransaction::new(payment, Amount::new(dec!(10)).unwrap(), "damaged");
        assert_ne!(a.refund_id, b.refund_id);
        assert!(a.refund_id.starts_with("RF-"));
    }

    #[test]
    fn test_failed_refund_releases_balance() {
        let mut refund =
            RefundTransaction::new(Uuid::new_v4(), Amount::new(dec!(10)).unwrap(), "x");
        assert!(refund.status.reserves_balance());
        refund.fail("provider declined");
        assert!(!refund.status.reserves_balance());
        assert!(refund.status.is_terminal());
        assert!(refund.processed_at.is_some());
    }
}
