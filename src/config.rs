use std::env;
use std::error::Error;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Nats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayMode {
    /// Built-in mock adapters; no provider credentials needed.
    Mock,
    /// Real adapters built from the per-gateway configs below.
    Live,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub store_backend: StoreBackend,
    pub database_url: Option<String>,

    pub bus_type: BusType,
    pub nats_url: String,

    pub gateway_mode: GatewayMode,

    /// Policy flag: permit `amount_paid` to exceed `total` on an invoice.
    pub allow_overpayment: bool,

    pub idempotency_lease: Duration,
    pub idempotency_retention_days: i64,

    pub gateway_retry_attempts: u32,
    pub gateway_retry_backoff: Duration,

    pub expiry_sweep_interval: Duration,
    pub idempotency_gc_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        dotenvy::dotenv().ok();

        let store_backend = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            _ => StoreBackend::Memory,
        };

        let bus_type = match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            _ => BusType::InMemory,
        };

        let gateway_mode = match env::var("GATEWAY_MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .to_lowercase()
            .as_str()
        {
            "live" => GatewayMode::Live,
            _ => GatewayMode::Mock,
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8089".to_string())
                .parse()?,

            store_backend,
            database_url: env::var("DATABASE_URL").ok(),

            bus_type,
            nats_url: env::var("NATS_URL")
                .unwrap_or_else(|_| "nats://localhost:4222".to_string()),

            gateway_mode,

            allow_overpayment: env::var("ALLOW_OVERPAYMENT")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,

            idempotency_lease: Duration::from_secs(
                env::var("IDEMPOTENCY_LEASE_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
            ),
            idempotency_retention_days: env::var("IDEMPOTENCY_RETENTION_DAYS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,

            gateway_retry_attempts: env::var("GATEWAY_RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            gateway_retry_backoff: Duration::from_millis(
                env::var("GATEWAY_RETRY_BACKOFF_MS")
                    .unwrap_or_else(|_| "250".to_string())
                    .parse()?,
            ),

            expiry_sweep_interval: Duration::from_secs(
                env::var("EXPIRY_SWEEP_SECS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()?,
            ),
            idempotency_gc_interval: Duration::from_secs(
                env::var("IDEMPOTENCY_GC_SECS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()?,
            ),
        })
    }
}

fn required(name: &str) -> Result<String, Box<dyn Error>> {
    env::var(name).map_err(|_| format!("Missing {name}").into())
}

/// Card-hosted checkout processor credentials.
#[derive(Debug, Clone)]
pub struct CardHostedConfig {
    pub base_path: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub session_ttl_minutes: i64,
}

impl CardHostedConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let sandbox = env::var("CARD_HOSTED_SANDBOX")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let base_path = env::var("CARD_HOSTED_BASE_PATH").unwrap_or_else(|_| {
            if sandbox {
                "https://sandbox-api.cardhosted.example".to_string()
            } else {
                "https://api.cardhosted.example".to_string()
            }
        });

        Ok(Self {
            base_path,
            secret_key: required("CARD_HOSTED_SECRET_KEY")?,
            webhook_secret: required("CARD_HOSTED_WEBHOOK_SECRET")?,
            session_ttl_minutes: env::var("CARD_HOSTED_SESSION_TTL_MINUTES")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
        })
    }
}

/// Order/signature gateway credentials. `key_secret` is the shared secret
/// the provider signs payment proofs with.
#[derive(Debug, Clone)]
pub struct OrderSignatureConfig {
    pub base_path: String,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    pub session_ttl_minutes: i64,
}

impl OrderSignatureConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            base_path: env::var("ORDER_SIGNATURE_BASE_PATH")
                .unwrap_or_else(|_| "https://api.ordersig.example".to_string()),
            key_id: required("ORDER_SIGNATURE_KEY_ID")?,
            key_secret: required("ORDER_SIGNATURE_KEY_SECRET")?,
            webhook_secret: required("ORDER_SIGNATURE_WEBHOOK_SECRET")?,
            session_ttl_minutes: env::var("ORDER_SIGNATURE_SESSION_TTL_MINUTES")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
        })
    }
}

/// Mobile-money network credentials.
#[derive(Debug, Clone)]
pub struct MobileMoneyConfig {
    pub base_path: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    pub shortcode: String,
    pub passkey: String,
    pub callback_secret: String,
    pub session_ttl_minutes: i64,
}

impl MobileMoneyConfig {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            base_path: env::var("MOBILE_MONEY_BASE_PATH")
                .unwrap_or_else(|_| "https://api.mobilemoney.example".to_string()),
            consumer_key: required("MOBILE_MONEY_CONSUMER_KEY")?,
            consumer_secret: required("MOBILE_MONEY_CONSUMER_SECRET")?,
            shortcode: required("MOBILE_MONEY_SHORTCODE")?,
            passkey: required("MOBILE_MONEY_PASSKEY")?,
            callback_secret: required("MOBILE_MONEY_CALLBACK_SECRET")?,
            session_ttl_minutes: env::var("MOBILE_MONEY_SESSION_TTL_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse()?,
        })
    }
}
