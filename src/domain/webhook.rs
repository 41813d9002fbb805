use crate::domain::transaction::GatewayKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dedup boundary for inbound callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookKey {
    pub gateway: GatewayKind,
    pub transaction_id: String,
    pub event_type: String,
}

impl WebhookKey {
    /// Stable byte encoding used by ordered key-value backends.
    pub fn encode(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.gateway, self.transaction_id, self.event_type
        )
    }
}

/// Append-only audit record of one inbound callback delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentWebhook {
    pub id: Uuid,
    /// Provider-supplied correlation value.
    pub transaction_id: String,
    pub gateway: GatewayKind,
    pub event_type: String,
    pub payload: String,
    pub signature: Option<String>,
    pub processed: bool,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Set while a delivery holds the claim on its key.
    pub claimed_until: Option<DateTime<Utc>>,
}

impl PaymentWebhook {
    pub fn new(
        gateway: GatewayKind,
        transaction_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
        signature: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id: transaction_id.into(),
            gateway,
            event_type: event_type.into(),
            payload: payload.into(),
            signature,
            processed: false,
            received_at: Utc::now(),
            processed_at: None,
            claimed_until: None,
        }
    }

    pub fn key(&self) -> WebhookKey {
        WebhookKey {
            gateway: self.gateway,
            transaction_id: self.transaction_id.clone(),
            event_type: self.event_type.clone(),
        }
    }

    pub fn holds_live_claim(&self, now: DateTime<Utc>) -> bool {
        !self.processed && self.claimed_until.is_some_and(|until| until > now)
    }
}

/// Result of recording a delivery in the webhook ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookClaim {
    /// This delivery owns the key and must process it.
    Claimed(Uuid),
    /// The event was already applied; acknowledge without side effects.
    AlreadyProcessed,
    /// Another delivery holds a live claim on the key.
    InFlight,
}
