//! The asynchronous path: provider callbacks.
//!
//! Every delivery is written to the webhook ledger before anything else and
//! claims its `(gateway, provider id, event)` key atomically, so concurrent
//! or repeated deliveries of one event apply side effects at most once. A
//! payload whose signature does not verify is never trusted; the provider is
//! asked for the authoritative status instead.

use crate::application::engine::{Applied, Evidence, ReconciliationEngine};
use crate::domain::gateway::{CallbackEnvelope, GatewayRef};
use crate::domain::transaction::{GatewayKind, PaymentStatus, PaymentTransaction};
use crate::domain::webhook::{PaymentWebhook, WebhookClaim};
use crate::error::{PaymentError, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

/// What the callback endpoint answers. Every variant is a success
/// acknowledgement towards the provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "ack", rename_all = "snake_case")]
pub enum CallbackAck {
    /// The delivery moved the transaction to `status`.
    Applied {
        transaction_id: Uuid,
        status: PaymentStatus,
    },
    /// The transaction already had the reported status.
    Unchanged {
        transaction_id: Uuid,
        status: PaymentStatus,
    },
    /// The reported status is behind the current one and was ignored.
    Discarded {
        transaction_id: Uuid,
        current: PaymentStatus,
        claimed: PaymentStatus,
    },
    /// The event was already processed.
    Duplicate,
    /// Another delivery of the same event is being processed.
    InFlight,
    /// Recorded, but the outcome could not be confirmed yet.
    Deferred { reason: String },
    /// No payment transaction matches the callback.
    Unmatched,
}

impl ReconciliationEngine {
    pub async fn process_callback(
        &self,
        gateway: GatewayKind,
        raw: &[u8],
        signature: Option<&str>,
    ) -> Result<CallbackAck> {
        let adapter = self
            .gateways
            .get(gateway)
            .ok_or_else(|| PaymentError::UnsupportedMethod(gateway.to_string()))?;
        let envelope = adapter
            .parse_callback(raw)
            .map_err(|e| PaymentError::MalformedCallback(e.to_string()))?;

        let webhook = PaymentWebhook::new(
            gateway,
            envelope.provider_transaction_id.clone(),
            envelope.event_type.clone(),
            String::from_utf8_lossy(raw),
            signature.map(str::to_string),
        );
        let webhook_id = match self
            .webhooks
            .record(webhook, self.config.webhook_lease())
            .await?
        {
            WebhookClaim::Claimed(id) => id,
            WebhookClaim::AlreadyProcessed => {
                info!(%gateway, provider_id = %envelope.provider_transaction_id, "duplicate callback acknowledged");
                return Ok(CallbackAck::Duplicate);
            }
            WebhookClaim::InFlight => {
                info!(%gateway, provider_id = %envelope.provider_transaction_id, "callback already in flight");
                return Ok(CallbackAck::InFlight);
            }
        };

        match self
            .handle_claimed(&adapter, &envelope, raw, signature)
            .await
        {
            Ok(ack) => {
                // A later delivery for the same event must still be able to
                // carry the final outcome.
                let settled = match &ack {
                    CallbackAck::Deferred { .. } => false,
                    CallbackAck::Applied { status, .. } | CallbackAck::Unchanged { status, .. } => {
                        status.is_terminal()
                    }
                    _ => true,
                };
                if settled {
                    self.webhooks.mark_processed(webhook_id).await?;
                } else {
                    self.webhooks.release(webhook_id).await?;
                }
                Ok(ack)
            }
            Err(e) => {
                self.webhooks.release(webhook_id).await?;
                Err(e)
            }
        }
    }

    async fn handle_claimed(
        &self,
        adapter: &GatewayRef,
        envelope: &CallbackEnvelope,
        raw: &[u8],
        signature: Option<&str>,
    ) -> Result<CallbackAck> {
        let Some(tx) = self.match_callback(adapter, envelope).await? else {
            warn!(
                gateway = %adapter.kind(),
                provider_id = %envelope.provider_transaction_id,
                "callback matches no payment transaction"
            );
            return Ok(CallbackAck::Unmatched);
        };

        let (claimed, evidence) = if adapter.verify_callback(raw, signature) {
            (
                envelope.status.as_payment_status(),
                Evidence {
                    gateway_transaction_id: Some(envelope.provider_transaction_id.clone()),
                    bank_reference: envelope.bank_reference.clone(),
                    raw: Some(envelope.payload.clone()),
                },
            )
        } else {
            warn!(
                transaction_id = %tx.id,
                claimed = %envelope.status,
                "callback signature not verified; asking the provider"
            );
            match adapter.query(&tx).await {
                Ok(result) => (result.status.as_payment_status(), Evidence::from(result)),
                Err(e) => {
                    warn!(transaction_id = %tx.id, error = %e, "could not confirm callback; deferring");
                    return Ok(CallbackAck::Deferred {
                        reason: e.to_string(),
                    });
                }
            }
        };

        let ack = match self.apply_status(tx.id, claimed, evidence).await? {
            Applied::Transitioned(tx) => CallbackAck::Applied {
                transaction_id: tx.id,
                status: tx.status,
            },
            Applied::Unchanged(tx) => CallbackAck::Unchanged {
                transaction_id: tx.id,
                status: tx.status,
            },
            Applied::Discarded(tx) => CallbackAck::Discarded {
                transaction_id: tx.id,
                current: tx.status,
                claimed,
            },
        };
        Ok(ack)
    }

    /// Provider reference first, then the order reference carried in the
    /// payload, then the provider id read as an internal transaction id.
    async fn match_callback(
        &self,
        adapter: &GatewayRef,
        envelope: &CallbackEnvelope,
    ) -> Result<Option<PaymentTransaction>> {
        let gateway = adapter.kind();
        if let Some(tx) = self
            .payments
            .find_by_gateway_reference(gateway, &envelope.provider_transaction_id)
            .await?
        {
            return Ok(Some(tx));
        }
        if let Some(order_reference) = &envelope.order_reference
            && let Some(tx) = self
                .payments
                .find_by_order_reference(order_reference)
                .await?
                .into_iter()
                .rev()
                .find(|tx| tx.gateway == gateway)
        {
            return Ok(Some(tx));
        }
        match Uuid::parse_str(&envelope.provider_transaction_id) {
            Ok(id) => Ok(self
                .payments
                .get(id)
                .await?
                .filter(|tx| tx.gateway == gateway)),
            Err(_) => Ok(None),
        }
    }
}
