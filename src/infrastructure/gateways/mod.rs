//! Provider adapters and the registry wiring that picks live or simulated
//! adapters from configuration.

pub mod card;
pub mod cash_on_delivery;
pub mod http;
pub mod signing;
pub mod simulated;
pub mod wallet_a;
pub mod wallet_b;

use crate::config::{GatewayMode, GatewaySettings, GatewaysConfig};
use crate::domain::gateway::{GatewayRef, GatewayRegistry};
use crate::domain::ports::TokenStoreRef;
use crate::domain::transaction::{GatewayKind, PaymentMethod};
use crate::error::Result;
use cash_on_delivery::CashOnDeliveryGateway;
use simulated::{SimulatedGateway, SimulatedProvider};
use std::sync::Arc;
use tracing::info;

/// Builds one adapter per enabled method. The mode of each gateway is read
/// from configuration once, here.
pub fn build_registry(
    config: &GatewaysConfig,
    tokens: TokenStoreRef,
    simulator: Arc<SimulatedProvider>,
) -> Result<GatewayRegistry> {
    let mut registry = GatewayRegistry::new();

    if config.wallet_a.settings.enabled {
        let gateway: GatewayRef = match config.wallet_a.settings.mode {
            GatewayMode::Live => Arc::new(wallet_a::WalletAGateway::new(
                config.wallet_a.clone(),
                tokens,
            )?),
            GatewayMode::Simulated => {
                simulated(GatewayKind::WalletA, &config.wallet_a.settings, &simulator, true)
            }
        };
        registry.register(PaymentMethod::WalletA, gateway);
    }

    if config.wallet_b.settings.enabled {
        let gateway: GatewayRef = match config.wallet_b.settings.mode {
            GatewayMode::Live => Arc::new(wallet_b::WalletBGateway::new(config.wallet_b.clone())?),
            GatewayMode::Simulated => {
                simulated(GatewayKind::WalletB, &config.wallet_b.settings, &simulator, false)
            }
        };
        registry.register(PaymentMethod::WalletB, gateway);
    }

    if config.card.settings.enabled {
        let gateway: GatewayRef = match config.card.settings.mode {
            GatewayMode::Live => Arc::new(card::CardGateway::new(config.card.clone())?),
            GatewayMode::Simulated => {
                simulated(GatewayKind::CardAggregator, &config.card.settings, &simulator, true)
            }
        };
        registry.register(PaymentMethod::Card, gateway);
    }

    if config.cash_on_delivery.enabled {
        registry.register(
            PaymentMethod::CashOnDelivery,
            Arc::new(CashOnDeliveryGateway::new(config.cash_on_delivery.clone())),
        );
    }

    Ok(registry)
}

fn simulated(
    kind: GatewayKind,
    settings: &GatewaySettings,
    simulator: &Arc<SimulatedProvider>,
    refunds: bool,
) -> GatewayRef {
    info!(gateway = %kind, "using simulated provider");
    let gateway = SimulatedGateway::new(kind, settings, simulator.clone());
    if refunds {
        Arc::new(gateway)
    } else {
        Arc::new(gateway.without_refunds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::in_memory::InMemoryTokenStore;

    fn build(config: &GatewaysConfig) -> GatewayRegistry {
        build_registry(
            config,
            Arc::new(InMemoryTokenStore::new()),
            Arc::new(SimulatedProvider::default()),
        )
        .unwrap()
    }

    #[test]
    fn test_default_registry_covers_every_method() {
        let registry = build(&GatewaysConfig::default());
        assert_eq!(registry.methods().len(), 4);

        let wallet_b = registry.for_method(PaymentMethod::WalletB).unwrap();
        assert!(!wallet_b.supports_refund());
        let cod = registry.for_method(PaymentMethod::CashOnDelivery).unwrap();
        assert!(cod.settles_on_creation());
        assert!(!cod.supports_refund());
        assert_eq!(
            registry.get(GatewayKind::CardAggregator).unwrap().kind(),
            GatewayKind::CardAggregator
        );
    }

    #[test]
    fn test_disabled_gateway_is_not_registered() {
        let mut config = GatewaysConfig::default();
        config.wallet_b.settings.enabled = false;
        config.cash_on_delivery.enabled = false;
        let registry = build(&config);
        assert!(registry.for_method(PaymentMethod::WalletB).is_none());
        assert!(registry.for_method(PaymentMethod::CashOnDelivery).is_none());
        assert!(registry.for_method(PaymentMethod::WalletA).is_some());
    }

    #[test]
    fn test_live_mode_uses_live_adapter() {
        let mut config = GatewaysConfig::default();
        config.card.settings.mode = GatewayMode::Live;
        config.card.store_password = "pw".to_string();
        let registry = build(&config);
        let card = registry.for_method(PaymentMethod::Card).unwrap();
        // Form-encoded IPNs only parse on the live aggregator adapter.
        let envelope = card.parse_callback(b"tran_id=T&status=VALID").unwrap();
        assert_eq!(envelope.event_type, "ipn");
        assert!(!card.verify_callback(b"tran_id=T&status=VALID", None));
        assert!(card.supports_currency(crate::domain::money::Currency::Usd));
    }
}
