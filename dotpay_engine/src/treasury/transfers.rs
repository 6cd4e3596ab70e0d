//! Outbound treasury transfers: compensating refunds and onramp credits.

use alloy::{
    network::EthereumWallet,
    primitives::{Address, U256},
    providers::ProviderBuilder,
    signers::local::PrivateKeySigner,
    sol,
};
use chrono::Utc;
use log::{info, warn};
use rand::RngCore;

use super::{TreasuryClient, TreasuryError};
use crate::helpers::validation::validate_evm_address;

sol! {
    #[sol(rpc)]
    interface IERC20 {
        function transfer(address to, uint256 amount) external returns (bool);
        event Transfer(address indexed from, address indexed to, uint256 value);
    }
}

/// Encode a number in base 36, lowercase.
fn base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ASCII")
}

/// A pseudo-reference for refunds executed in simulated (sandbox, no treasury) mode.
pub fn simulated_refund_reference() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("RF_{}_{hex}", base36(Utc::now().timestamp_millis() as u64))
}

impl TreasuryClient {
    /// Execute an ERC-20 `transfer(recipient, units)` from the treasury wallet and wait for the
    /// configured number of confirmations. Returns the transaction hash.
    pub async fn transfer(&self, recipient: &str, units: u128) -> Result<String, TreasuryError> {
        validate_evm_address(recipient).map_err(|e| TreasuryError::InvalidInput(e.to_string()))?;
        if units == 0 {
            return Err(TreasuryError::NonPositiveExpectation);
        }
        let config = self.config();
        if !config.can_transfer() {
            return Err(TreasuryError::NotConfigured(
                "TREASURY_RPC_URL, TREASURY_PRIVATE_KEY and TREASURY_USDC_CONTRACT are required".into(),
            ));
        }
        let url = config
            .rpc_url
            .clone()
            .unwrap_or_default()
            .parse::<url::Url>()
            .map_err(|e| TreasuryError::NotConfigured(format!("invalid TREASURY_RPC_URL: {e}")))?;
        let signer: PrivateKeySigner = config
            .private_key
            .as_ref()
            .map(|k| k.reveal().trim_start_matches("0x").to_string())
            .unwrap_or_default()
            .parse()
            .map_err(|e| TreasuryError::NotConfigured(format!("invalid TREASURY_PRIVATE_KEY: {e}")))?;
        let token: Address = config
            .token
            .clone()
            .unwrap_or_default()
            .parse()
            .map_err(|e| TreasuryError::NotConfigured(format!("invalid token address: {e}")))?;
        let to: Address = recipient
            .parse()
            .map_err(|e| TreasuryError::InvalidInput(format!("invalid recipient: {e}")))?;

        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(url);
        let contract = IERC20::new(token, provider);

        let pending = contract
            .transfer(to, U256::from(units))
            .send()
            .await
            .map_err(|e| TreasuryError::Rpc(e.to_string()))?;
        let receipt = pending
            .with_required_confirmations(config.wait_confirmations)
            .get_receipt()
            .await
            .map_err(|e| TreasuryError::Rpc(e.to_string()))?;
        let tx_hash = receipt.transaction_hash.to_string();
        if !receipt.status() {
            warn!("🏦️ Treasury transfer {tx_hash} to {recipient} reverted");
            return Err(TreasuryError::TxFailed(tx_hash));
        }
        info!("🏦️ Treasury transferred {units} units to {recipient} in {tx_hash}");
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::treasury::TreasuryConfig;

    #[test]
    fn simulated_references_match_the_expected_shape() {
        let a = simulated_refund_reference();
        let b = simulated_refund_reference();
        assert!(a.starts_with("RF_"));
        assert_ne!(a, b);
        let parts: Vec<&str> = a.splitn(3, '_').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[1].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn base36_encodes() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[tokio::test]
    async fn transfer_requires_configuration() {
        let client = TreasuryClient::new(TreasuryConfig::default());
        let err = client
            .transfer("0x00a329c0648769a73afac7f9381e08fb43dbea72", 1_000_000)
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn transfer_validates_recipient_first() {
        let client = TreasuryClient::new(TreasuryConfig::default());
        assert!(matches!(
            client.transfer("treasury", 1).await,
            Err(TreasuryError::InvalidInput(_))
        ));
        assert!(matches!(
            client.transfer("0x00a329c0648769a73afac7f9381e08fb43dbea72", 0).await,
            Err(TreasuryError::NonPositiveExpectation)
        ));
    }
}
