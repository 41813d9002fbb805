use crate::domain::money::{Amount, Currency};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// How the customer chose to pay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PaymentMethod {
    WalletA,
    WalletB,
    Card,
    CashOnDelivery,
}

impl PaymentMethod {
    /// The provider that settles payments made with this method.
    pub fn gateway(&self) -> GatewayKind {
        match self {
            PaymentMethod::WalletA => GatewayKind::WalletA,
            PaymentMethod::WalletB => GatewayKind::WalletB,
            PaymentMethod::Card => GatewayKind::CardAggregator,
            PaymentMethod::CashOnDelivery => GatewayKind::CashOnDelivery,
        }
    }
}

/// Identifies the provider a transaction was created against.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum GatewayKind {
    WalletA,
    WalletB,
    CardAggregator,
    CashOnDelivery,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    /// Whether the state graph has an edge from `self` to `next`.
    ///
    /// ```text
    /// pending -> processing -> {completed | failed | cancelled}
    /// pending -> {completed | failed | cancelled}
    /// completed | partially_refunded -> {partially_refunded | refunded}
    /// ```
    ///
    /// Self-loops are not edges; the only repeatable transition is
    /// `partially_refunded -> partially_refunded`, which records a further
    /// partial refund.
    pub fn can_transition_to(self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Completed, PartiallyRefunded)
                | (Completed, Refunded)
                | (PartiallyRefunded, PartiallyRefunded)
                | (PartiallyRefunded, Refunded)
        )
    }

    /// No further automatic transition happens from a terminal status; only
    /// refund bookkeeping may move `completed` onward.
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }

    pub fn is_refundable(self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed | PaymentStatus::PartiallyRefunded
        )
    }

    pub fn is_negative(self) -> bool {
        matches!(self, PaymentStatus::Failed | PaymentStatus::Cancelled)
    }
}

/// One payment attempt against one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub order_reference: String,
    pub method: PaymentMethod,
    pub gateway: GatewayKind,
    pub amount: Amount,
    pub currency: Currency,
    pub status: PaymentStatus,
    /// Provider-assigned reference, absent until `initiate` succeeds.
    pub gateway_transaction_id: Option<String>,
    /// Bank/settlement reference reported on completion; needed for refunds.
    pub gateway_reference: Option<String>,
    pub gateway_response: Option<serde_json::Value>,
    pub return_url: Option<String>,
    pub cancel_url: Option<String>,
    pub refunded_amount: Decimal,
    pub retry_count: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every successful write.
    pub version: u64,
}

impl PaymentTransaction {
    pub fn new(
        order_reference: impl Into<String>,
        method: PaymentMethod,
        amount: Amount,
        currency: Currency,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_reference: order_reference.into(),
            method,
            gateway: method.gateway(),
            amount,
            currency,
            status: PaymentStatus::Pending,
            gateway_transaction_id: None,
            gateway_reference: None,
            gateway_response: None,
            return_url: None,
            cancel_url: None,
            refunded_amount: Decimal::ZERO,
            retry_count: 0,
            error_code: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            version: 0,
        }
    }

    pub fn with_urls(mut self, return_url: Option<String>, cancel_url: Option<String>) -> Self {
        self.return_url = return_url;
        self.cancel_url = cancel_url;
        self
    }

    /// Amount still available for refunds.
    pub fn refundable_remaining(&self) -> Decimal {
        self.amount.value() - self.refunded_amount
    }

    /// Moves to `next`, stamping the matching timestamp. Callers must have
    /// checked [`PaymentStatus::can_transition_to`].
    pub fn advance(&mut self, next: PaymentStatus) {
        let now = Utc::now();
        match next {
            PaymentStatus::Completed => self.completed_at = Some(now),
            PaymentStatus::Failed => self.failed_at = Some(now),
            PaymentStatus::Cancelled => self.cancelled_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
    }

    pub fn record_error(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self.updated_at = Utc::now();
    }

    /// Adds a completed refund and derives the refund status from coverage.
    pub fn apply_refund(&mut self, amount: Decimal) -> PaymentStatus {
        self.refunded_amount += amount;
        let next = if self.refunded_amount >= self.amount.value() {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartiallyRefunded
        };
        self.advance(next);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn transaction(amount: Decimal) -> PaymentTransaction {
        PaymentTransaction::new(
            "ORD-1",
            PaymentMethod::WalletA,
            Amount::new(amount).unwrap(),
            Currency::Bdt,
        )
    }

    #[test]
    fn test_forward_edges() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Completed.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(PartiallyRefunded));
        assert!(PartiallyRefunded.can_transition_to(Refunded));
    }

    #[test]
    fn test_terminal_statuses_never_cross() {
        use PaymentStatus::*;
        for from in [Completed, Failed, Cancelled, Refunded] {
            for to in [Pending, Processing, Completed, Failed, Cancelled] {
                assert!(
                    !from.can_transition_to(to),
                    "{from} -> {to} must be rejected"
                );
            }
        }
        assert!(!Refunded.can_transition_to(PartiallyRefunded));
        assert!(!Processing.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Refunded));
    }

    #[test]
    fn test_advance_stamps_timestamps() {
        let mut tx = transaction(dec!(100));
        tx.advance(PaymentStatus::Processing);
        assert!(tx.completed_at.is_none());
        tx.advance(PaymentStatus::Failed);
        assert!(tx.failed_at.is_some());
        assert_eq!(tx.status, PaymentStatus::Failed);
    }

    #[test]
    fn test_apply_refund_derives_status() {
        let mut tx = transaction(dec!(500));
        tx.advance(PaymentStatus::Completed);

        assert_eq!(tx.apply_refund(dec!(300)), PaymentStatus::PartiallyRefunded);
        assert_eq!(tx.refundable_remaining(), dec!(200));
        assert_eq!(tx.apply_refund(dec!(200)), PaymentStatus::Refunded);
        assert_eq!(tx.refunded_amount, dec!(500));
    }

    #[test]
    fn test_method_selects_gateway() {
        assert_eq!(PaymentMethod::Card.gateway(), GatewayKind::CardAggregator);
        assert_eq!(
            PaymentMethod::CashOnDelivery.gateway(),
            GatewayKind::CashOnDelivery
        );
        assert_eq!(PaymentMethod::WalletB.to_string(), "wallet_b");
    }
}
