use crate::domain::money::{AmountBounds, Currency};
use crate::error::Result;
use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Whether an adapter talks to the real provider or to the in-process simulator.
///
/// Chosen once at startup. A live adapter never substitutes a simulated
/// response when the provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    Live,
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Re-read attempts after losing a compare-and-set race.
    pub cas_retries: u32,
    pub webhook_lease_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cas_retries: 5,
            webhook_lease_secs: 30,
        }
    }
}

impl EngineConfig {
    pub fn webhook_lease(&self) -> Duration {
        Duration::from_secs(self.webhook_lease_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompensationConfig {
    /// 0 keeps stock restoration best-effort with no follow-up queue.
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 0,
            retry_backoff_ms: 500,
        }
    }
}

/// Settings shared by every provider adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub enabled: bool,
    pub mode: GatewayMode,
    pub base_url: String,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub currencies: Vec<Currency>,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub webhook_secret: Option<String>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: GatewayMode::Simulated,
            base_url: String::new(),
            min_amount: dec!(1),
            max_amount: dec!(500000),
            currencies: vec![Currency::Bdt],
            timeout_ms: 10_000,
            max_retries: 2,
            webhook_secret: None,
        }
    }
}

impl GatewaySettings {
    pub fn bounds(&self) -> AmountBounds {
        AmountBounds::new(self.min_amount, self.max_amount)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn with_limits(min: Decimal, max: Decimal) -> Self {
        Self {
            min_amount: min,
            max_amount: max,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletAConfig {
    #[serde(flatten)]
    pub settings: GatewaySettings,
    pub app_key: String,
    pub app_secret: String,
    pub username: String,
    pub password: String,
    pub token_expiry_margin_secs: u64,
}

impl Default for WalletAConfig {
    fn default() -> Self {
        Self {
            settings: GatewaySettings {
                base_url: "https://tokenized.sandbox.wallet-a.example/v1.2.0-beta".to_string(),
                ..GatewaySettings::with_limits(dec!(1), dec!(300000))
            },
            app_key: String::new(),
            app_secret: String::new(),
            username: String::new(),
            password: String::new(),
            token_expiry_margin_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletBConfig {
    #[serde(flatten)]
    pub settings: GatewaySettings,
    pub merchant_id: String,
    pub signing_key: String,
}

impl Default for WalletBConfig {
    fn default() -> Self {
        Self {
            settings: GatewaySettings {
                base_url: "https://sandbox.wallet-b.example/remote-payment-gateway-1.0/api/dfs"
                    .to_string(),
                ..GatewaySettings::with_limits(dec!(10), dec!(100000))
            },
            merchant_id: String::new(),
            signing_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CardConfig {
    #[serde(flatten)]
    pub settings: GatewaySettings,
    pub store_id: String,
    pub store_password: String,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            settings: GatewaySettings {
                base_url: "https://sandbox.card-aggregator.example".to_string(),
                currencies: vec![Currency::Bdt, Currency::Usd, Currency::Eur],
                ..GatewaySettings::with_limits(dec!(10), dec!(500000))
            },
            store_id: String::new(),
            store_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CashOnDeliveryConfig {
    pub enabled: bool,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub currencies: Vec<Currency>,
}

impl Default for CashOnDeliveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_amount: dec!(1),
            max_amount: dec!(50000),
            currencies: vec![Currency::Bdt],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewaysConfig {
    pub wallet_a: WalletAConfig,
    pub wallet_b: WalletBConfig,
    pub card: CardConfig,
    pub cash_on_delivery: CashOnDeliveryConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub compensation: CompensationConfig,
    pub gateways: GatewaysConfig,
}

impl AppConfig {
    /// Defaults, overlaid by an optional TOML file, overlaid by
    /// `PAYRECON__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(
                Environment::with_prefix("PAYRECON")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("gateways.wallet_a.currencies")
                    .with_list_parse_key("gateways.wallet_b.currencies")
                    .with_list_parse_key("gateways.card.currencies")
                    .with_list_parse_key("gateways.cash_on_delivery.currencies")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
