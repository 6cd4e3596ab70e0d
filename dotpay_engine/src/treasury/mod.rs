//! Treasury: the platform-controlled EVM wallet holding the pooled stablecoin.
//!
//! Two concerns live here. `funding` proves that a user really moved stablecoin into the treasury
//! before a payout is submitted; `transfers` moves stablecoin out of the treasury for refunds and
//! onramp credits.

mod funding;
mod transfers;

use std::env;

use dp_common::{parse_boolean_flag, MicroUsd, Secret};
use log::warn;
use thiserror::Error;

pub use funding::{expected_funding_units, FundingProof};
pub use transfers::simulated_refund_reference;

#[derive(Debug, Clone, Error)]
pub enum TreasuryError {
    #[error("Treasury is not configured: {0}")]
    NotConfigured(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Chain mismatch: expected chain id {expected}, got {actual}")]
    ChainMismatch { expected: u64, actual: u64 },
    #[error("No receipt found for transaction {0}")]
    ReceiptNotFound(String),
    #[error("Transaction {0} reverted on-chain")]
    TxFailed(String),
    #[error("Transaction has {actual} confirmations, {required} required")]
    InsufficientConfirmations { required: u64, actual: u64 },
    #[error("Funded amount {funded} units is below required {required} units")]
    BelowRequired { funded: u128, required: u128 },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Expected funding amount must be positive")]
    NonPositiveExpectation,
}

#[derive(Debug, Clone)]
pub struct TreasuryConfig {
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,
    pub token: Option<String>,
    pub decimals: u8,
    pub platform_address: Option<String>,
    pub private_key: Option<Secret<String>>,
    pub refund_enabled: bool,
    pub wait_confirmations: u64,
    pub min_funding_confirmations: u64,
    /// Sandbox mode allows simulated refunds when the treasury is not fully configured.
    pub sandbox: bool,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            chain_id: None,
            token: None,
            decimals: 6,
            platform_address: None,
            private_key: None,
            refund_enabled: true,
            wait_confirmations: 1,
            min_funding_confirmations: 1,
            sandbox: true,
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|e| {
            warn!("🏦️ {name}={v} is not a valid number ({e}). Using {default}.");
            default
        }),
        Err(_) => default,
    }
}

impl TreasuryConfig {
    pub fn from_env_or_default() -> Self {
        let sandbox = env::var("MPESA_ENV").map(|v| v != "production").unwrap_or(true);
        Self {
            rpc_url: env::var("TREASURY_RPC_URL").ok(),
            chain_id: env::var("TREASURY_CHAIN_ID").ok().and_then(|v| v.parse().ok()),
            token: env::var("TREASURY_USDC_CONTRACT").ok().map(|a| a.to_ascii_lowercase()),
            decimals: env_u64("TREASURY_USDC_DECIMALS", 6).min(18) as u8,
            platform_address: env::var("TREASURY_PLATFORM_ADDRESS").ok().map(|a| a.to_ascii_lowercase()),
            private_key: env::var("TREASURY_PRIVATE_KEY").ok().map(Secret::new),
            refund_enabled: parse_boolean_flag(env::var("TREASURY_REFUND_ENABLED").ok(), true),
            wait_confirmations: env_u64("TREASURY_WAIT_CONFIRMATIONS", 1),
            min_funding_confirmations: env_u64("MPESA_MIN_FUNDING_CONFIRMATIONS", 1),
            sandbox,
        }
    }

    /// The address users must fund: the configured platform address, or the address derived from
    /// the signing key when only that is configured.
    pub fn treasury_address(&self) -> Option<String> {
        if self.platform_address.is_some() {
            return self.platform_address.clone();
        }
        let key = self.private_key.as_ref()?;
        let signer: alloy::signers::local::PrivateKeySigner = key.reveal().trim_start_matches("0x").parse().ok()?;
        Some(signer.address().to_string().to_ascii_lowercase())
    }

    /// Everything needed to verify on-chain funding of payouts.
    pub fn can_verify(&self) -> Result<(), TreasuryError> {
        for (name, set) in [
            ("TREASURY_RPC_URL", self.rpc_url.is_some()),
            ("TREASURY_CHAIN_ID", self.chain_id.is_some()),
            ("TREASURY_USDC_CONTRACT", self.token.is_some()),
            ("TREASURY_PLATFORM_ADDRESS or TREASURY_PRIVATE_KEY", self.treasury_address().is_some()),
        ] {
            if !set {
                return Err(TreasuryError::NotConfigured(format!("{name} is not set")));
            }
        }
        Ok(())
    }

    /// Everything needed to execute outbound transfers (refunds, onramp credits).
    pub fn can_transfer(&self) -> bool {
        self.rpc_url.is_some() && self.private_key.is_some() && self.token.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct TreasuryClient {
    config: TreasuryConfig,
}

impl TreasuryClient {
    pub fn new(config: TreasuryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TreasuryConfig {
        &self.config
    }

    /// Convert integer token units back into a USD amount (truncating).
    pub fn units_to_usd(&self, units: u128) -> MicroUsd {
        let decimals = self.config.decimals.min(18) as u32;
        let micro = units.saturating_mul(1_000_000) / 10u128.pow(decimals);
        MicroUsd::from(micro.min(i64::MAX as u128) as i64)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn units_to_usd_truncates() {
        let client = TreasuryClient::new(TreasuryConfig { decimals: 6, ..Default::default() });
        assert_eq!(client.units_to_usd(10_000_000), MicroUsd::from_usd(10));
        let client = TreasuryClient::new(TreasuryConfig { decimals: 2, ..Default::default() });
        assert_eq!(client.units_to_usd(1234), MicroUsd::from(12_340_000));
    }

    #[test]
    fn unconfigured_treasury_cannot_verify() {
        let config = TreasuryConfig::default();
        assert!(config.can_verify().is_err());
        assert!(!config.can_transfer());
    }

    #[test]
    fn platform_address_wins_over_derived() {
        let config = TreasuryConfig {
            platform_address: Some("0x00a329c0648769a73afac7f9381e08fb43dbea72".into()),
            private_key: Some(Secret::new(
                "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".into(),
            )),
            ..Default::default()
        };
        assert_eq!(config.treasury_address().unwrap(), "0x00a329c0648769a73afac7f9381e08fb43dbea72");
    }

    #[test]
    fn treasury_address_derives_from_key() {
        let config = TreasuryConfig {
            private_key: Some(Secret::new(
                "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".into(),
            )),
            ..Default::default()
        };
        let addr = config.treasury_address().unwrap();
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 42);
        assert_eq!(addr, addr.to_ascii_lowercase());
    }
}
