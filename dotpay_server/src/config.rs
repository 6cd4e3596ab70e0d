use std::env;

use dotpay_engine::FlowLimits;
use dp_common::{parse_boolean_flag, MicroKes, Secret};
use log::*;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8340;
const DEFAULT_QUOTE_TTL_SECONDS: i64 = 300;
const DEFAULT_KES_PER_USD: i64 = 130;
const DEFAULT_MAX_TXN_KES: i64 = 150_000;
const DEFAULT_MAX_DAILY_KES: i64 = 500_000;
const DEFAULT_PIN_LENGTH: usize = 6;
const DEFAULT_SIGNATURE_MAX_AGE_SECONDS: i64 = 600;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Secret<String>,
}

impl AuthConfig {
    pub fn try_from_env() -> Result<Self, String> {
        let secret = env::var("DOTPAY_BACKEND_JWT_SECRET")
            .map_err(|_| "DOTPAY_BACKEND_JWT_SECRET is not set".to_string())?;
        if secret.len() < 16 {
            return Err("DOTPAY_BACKEND_JWT_SECRET must be at least 16 characters".to_string());
        }
        Ok(Self { jwt_secret: Secret::new(secret) })
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { jwt_secret: Secret::new("insecure-test-secret".to_string()) }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Kill switch for all initiate endpoints.
    pub enabled: bool,
    pub auth: AuthConfig,
    pub internal_api_key: Secret<String>,
    pub webhook_secret: Option<Secret<String>>,
    pub quote_ttl_seconds: i64,
    pub kes_per_usd: MicroKes,
    pub limits: FlowLimits,
    /// Required PIN length. The PIN is exactly this many digits.
    pub pin_length: usize,
    pub signature_max_age_seconds: i64,
    pub auto_refund: bool,
    pub require_onchain_funding: bool,
    /// Public base for result callbacks, e.g. `https://api.dotpay.example`.
    pub result_base_url: String,
    /// Public base for timeout callbacks. Defaults to `result_base_url`.
    pub timeout_base_url: Option<String>,
}

fn env_i64(name: &str, default: i64) -> i64 {
    match env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|e| {
            error!("{name}={v} is not a valid number ({e}). Using the default, {default}, instead.");
            default
        }),
        Err(_) => default,
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            database_url: String::default(),
            enabled: true,
            auth: AuthConfig::default(),
            internal_api_key: Secret::new(String::default()),
            webhook_secret: None,
            quote_ttl_seconds: DEFAULT_QUOTE_TTL_SECONDS,
            kes_per_usd: MicroKes::from_kes(DEFAULT_KES_PER_USD),
            limits: FlowLimits {
                max_txn_kes: MicroKes::from_kes(DEFAULT_MAX_TXN_KES),
                max_daily_kes: MicroKes::from_kes(DEFAULT_MAX_DAILY_KES),
            },
            pin_length: DEFAULT_PIN_LENGTH,
            signature_max_age_seconds: DEFAULT_SIGNATURE_MAX_AGE_SECONDS,
            auto_refund: true,
            require_onchain_funding: true,
            result_base_url: "http://localhost:8340".to_string(),
            timeout_base_url: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env_or_default() -> Self {
        let host = env::var("DOTPAY_HOST").ok().unwrap_or_else(|| DEFAULT_HOST.into());
        let port = env_i64("DOTPAY_PORT", DEFAULT_PORT as i64) as u16;
        let database_url = dotpay_engine::db_url();
        let auth = AuthConfig::try_from_env().unwrap_or_else(|e| {
            error!("{e}. Falling back to an insecure default; do NOT run like this in production.");
            AuthConfig::default()
        });
        let internal_api_key = Secret::new(env::var("DOTPAY_INTERNAL_API_KEY").unwrap_or_else(|_| {
            error!("DOTPAY_INTERNAL_API_KEY is not set. The reconcile endpoint will reject all calls.");
            String::default()
        }));
        let rate = env_i64("KES_PER_USD", DEFAULT_KES_PER_USD);
        let result_base_url = env::var("MPESA_RESULT_BASE_URL").unwrap_or_else(|_| {
            error!("MPESA_RESULT_BASE_URL is not set. Provider callbacks will not reach this server.");
            "http://localhost:8340".to_string()
        });
        Self {
            host,
            port,
            database_url,
            enabled: parse_boolean_flag(env::var("MPESA_ENABLED").ok(), true),
            auth,
            internal_api_key,
            webhook_secret: env::var("MPESA_WEBHOOK_SECRET").ok().map(Secret::new),
            quote_ttl_seconds: env_i64("MPESA_QUOTE_TTL_SECONDS", DEFAULT_QUOTE_TTL_SECONDS),
            kes_per_usd: MicroKes::from_kes(rate),
            limits: FlowLimits {
                max_txn_kes: MicroKes::from_kes(env_i64("MPESA_MAX_TXN_KES", DEFAULT_MAX_TXN_KES)),
                max_daily_kes: MicroKes::from_kes(env_i64("MPESA_MAX_DAILY_KES", DEFAULT_MAX_DAILY_KES)),
            },
            pin_length: env_i64("MPESA_PIN_MIN_LENGTH", DEFAULT_PIN_LENGTH as i64) as usize,
            signature_max_age_seconds: env_i64(
                "MPESA_SIGNATURE_MAX_AGE_SECONDS",
                DEFAULT_SIGNATURE_MAX_AGE_SECONDS,
            ),
            auto_refund: parse_boolean_flag(env::var("MPESA_AUTO_REFUND").ok(), true),
            require_onchain_funding: parse_boolean_flag(
                env::var("MPESA_REQUIRE_ONCHAIN_FUNDING").ok(),
                true,
            ),
            result_base_url,
            timeout_base_url: env::var("MPESA_TIMEOUT_BASE_URL").ok(),
        }
    }
}
