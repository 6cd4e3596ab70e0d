use std::{env, fs, time::Duration};

use dp_common::Secret;
use log::*;

use crate::{
    error::DarajaApiError,
    security_credential::{encrypt_initiator_password, validate_security_credential, SANDBOX_CERT},
};

const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DarajaEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl DarajaEnvironment {
    pub fn from_env() -> Self {
        match env::var("MPESA_ENV").as_deref() {
            Ok("production") => Self::Production,
            _ => Self::Sandbox,
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Sandbox => SANDBOX_BASE_URL,
            Self::Production => PRODUCTION_BASE_URL,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DarajaConfig {
    pub environment: DarajaEnvironment,
    pub base_url: String,
    pub consumer_key: Secret<String>,
    pub consumer_secret: Secret<String>,
    pub passkey: Secret<String>,
    pub shortcode: String,
    pub stk_shortcode: Option<String>,
    pub b2c_shortcode: Option<String>,
    pub b2b_shortcode: Option<String>,
    pub initiator_name: String,
    /// Pre-encrypted security credential. Takes precedence over deriving one.
    pub security_credential: Option<Secret<String>>,
    pub initiator_password: Option<Secret<String>>,
    pub cert_path: Option<String>,
    pub result_base_url: Option<String>,
    pub timeout_base_url: Option<String>,
    pub timeout: Duration,
    /// B2B `RecieverIdentifierType` for paybill settlements.
    pub paybill_receiver_type: u8,
    /// B2B `RecieverIdentifierType` for till settlements.
    pub buygoods_receiver_type: u8,
}

fn env_or_warn(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| {
        warn!("📱️ {name} is not set, using a default that will not work against the live API");
        default.to_string()
    })
}

impl DarajaConfig {
    pub fn from_env_or_default() -> Self {
        let environment = DarajaEnvironment::from_env();
        let base_url =
            env::var("MPESA_BASE_URL").unwrap_or_else(|_| environment.default_base_url().to_string());
        Self {
            environment,
            base_url,
            consumer_key: Secret::new(env_or_warn("MPESA_CONSUMER_KEY", "missing-consumer-key")),
            consumer_secret: Secret::new(env_or_warn("MPESA_CONSUMER_SECRET", "missing-consumer-secret")),
            passkey: Secret::new(env_or_warn("MPESA_PASSKEY", "missing-passkey")),
            shortcode: env_or_warn("MPESA_SHORTCODE", "174379"),
            stk_shortcode: env::var("MPESA_STK_SHORTCODE").ok(),
            b2c_shortcode: env::var("MPESA_B2C_SHORTCODE").ok(),
            b2b_shortcode: env::var("MPESA_B2B_SHORTCODE").ok(),
            initiator_name: env::var("MPESA_INITIATOR_NAME").unwrap_or_else(|_| "testapi".to_string()),
            security_credential: env::var("MPESA_SECURITY_CREDENTIAL").ok().map(Secret::new),
            initiator_password: env::var("MPESA_INITIATOR_PASSWORD").ok().map(Secret::new),
            cert_path: env::var("MPESA_CERT_PATH").ok(),
            result_base_url: env::var("MPESA_RESULT_BASE_URL").ok(),
            timeout_base_url: env::var("MPESA_TIMEOUT_BASE_URL").ok(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            paybill_receiver_type: env::var("MPESA_PAYBILL_RECEIVER_TYPE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            buygoods_receiver_type: env::var("MPESA_BUYGOODS_RECEIVER_TYPE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }

    pub fn stk_shortcode(&self) -> &str {
        self.stk_shortcode.as_deref().unwrap_or(&self.shortcode)
    }

    pub fn b2c_shortcode(&self) -> &str {
        self.b2c_shortcode.as_deref().unwrap_or(&self.shortcode)
    }

    pub fn b2b_shortcode(&self) -> &str {
        self.b2b_shortcode.as_deref().unwrap_or(&self.shortcode)
    }

    /// The security credential for B2C/B2B calls: either the configured value, or the initiator
    /// password encrypted under the provider certificate (`MPESA_CERT_PATH`, falling back to the
    /// bundled sandbox certificate).
    pub fn security_credential(&self) -> Result<String, DarajaApiError> {
        if let Some(credential) = &self.security_credential {
            validate_security_credential(credential.reveal())?;
            return Ok(credential.reveal().clone());
        }
        let password = self.initiator_password.as_ref().ok_or_else(|| {
            DarajaApiError::Config(
                "Set MPESA_SECURITY_CREDENTIAL, or MPESA_INITIATOR_PASSWORD to derive one".to_string(),
            )
        })?;
        let cert = match &self.cert_path {
            Some(path) => fs::read_to_string(path)
                .map_err(|e| DarajaApiError::Config(format!("Could not read MPESA_CERT_PATH {path}: {e}")))?,
            None => SANDBOX_CERT.to_string(),
        };
        let credential = encrypt_initiator_password(password.reveal(), &cert)?;
        validate_security_credential(&credential)?;
        Ok(credential)
    }
}
