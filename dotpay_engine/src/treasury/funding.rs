//! On-chain funding verification.
//!
//! A payout is only submitted once the user's stablecoin transfer to the treasury is final. The
//! client supplies the funding transaction hash; we fetch the receipt, filter `Transfer` events
//! emitted by the configured token contract, and require that the sum transferred from the user
//! to the treasury covers the quote's total debit.

use alloy::{
    primitives::{Address, B256, U256},
    providers::{Provider, ProviderBuilder},
    sol_types::SolEvent,
};
use dp_common::{MicroKes, MicroUsd};
use log::{debug, info};

use super::{transfers::IERC20, TreasuryClient, TreasuryError};
use crate::helpers::validation::{validate_evm_address, validate_tx_hash};

/// The result of a successful funding verification.
#[derive(Debug, Clone)]
pub struct FundingProof {
    pub tx_hash: String,
    pub chain_id: u64,
    pub token: String,
    pub treasury: String,
    pub from: String,
    pub to: String,
    pub funded_units: u128,
    pub funded_usd: MicroUsd,
    pub log_index: u64,
    pub block_number: u64,
}

/// Integer-exact expected token units for a quote.
///
/// Both the KES debit and the rate are 6-decimal fixed point; the division rounds toward +∞ so
/// the user can never underfund the treasury by a rounding error.
pub fn expected_funding_units(
    total_debit_kes: MicroKes,
    rate_kes_per_usd: MicroKes,
    decimals: u8,
) -> Result<u128, TreasuryError> {
    if total_debit_kes.value() <= 0 {
        return Err(TreasuryError::NonPositiveExpectation);
    }
    if rate_kes_per_usd.value() <= 0 {
        return Err(TreasuryError::InvalidInput(format!("invalid rate {rate_kes_per_usd}")));
    }
    let decimals = decimals.min(18) as u32;
    let numerator = total_debit_kes.value() as i128 * 10i128.pow(decimals);
    let rate = rate_kes_per_usd.value() as i128;
    let units = (numerator + rate - 1) / rate;
    if units <= 0 {
        return Err(TreasuryError::NonPositiveExpectation);
    }
    Ok(units as u128)
}

impl TreasuryClient {
    /// Verify that `tx_hash` funds the treasury with at least `expected_units` from
    /// `expected_from`, on the configured chain, with enough confirmations.
    pub async fn verify_funding(
        &self,
        tx_hash: &str,
        expected_from: &str,
        expected_units: u128,
        request_chain_id: Option<u64>,
    ) -> Result<FundingProof, TreasuryError> {
        validate_tx_hash(tx_hash).map_err(|e| TreasuryError::InvalidInput(e.to_string()))?;
        validate_evm_address(expected_from).map_err(|e| TreasuryError::InvalidInput(e.to_string()))?;
        if expected_units == 0 {
            return Err(TreasuryError::NonPositiveExpectation);
        }

        let config = self.config();
        config.can_verify()?;
        let configured_chain = config.chain_id.unwrap_or_default();
        if let Some(requested) = request_chain_id {
            if requested != configured_chain {
                return Err(TreasuryError::ChainMismatch { expected: configured_chain, actual: requested });
            }
        }
        let rpc_url = config.rpc_url.clone().unwrap_or_default();
        let url = rpc_url
            .parse::<url::Url>()
            .map_err(|e| TreasuryError::NotConfigured(format!("invalid TREASURY_RPC_URL: {e}")))?;
        let token: Address = config
            .token
            .clone()
            .unwrap_or_default()
            .parse()
            .map_err(|e| TreasuryError::NotConfigured(format!("invalid token address: {e}")))?;
        let treasury: Address = config
            .treasury_address()
            .unwrap_or_default()
            .parse()
            .map_err(|e| TreasuryError::NotConfigured(format!("invalid treasury address: {e}")))?;
        let from: Address = expected_from
            .parse()
            .map_err(|e| TreasuryError::InvalidInput(format!("invalid funder address: {e}")))?;
        let hash: B256 =
            tx_hash.parse().map_err(|e| TreasuryError::InvalidInput(format!("invalid tx hash: {e}")))?;

        let provider = ProviderBuilder::new().connect_http(url);
        let reported_chain =
            provider.get_chain_id().await.map_err(|e| TreasuryError::Rpc(e.to_string()))?;
        if reported_chain != configured_chain {
            return Err(TreasuryError::ChainMismatch { expected: configured_chain, actual: reported_chain });
        }

        let receipt = provider
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| TreasuryError::Rpc(e.to_string()))?
            .ok_or_else(|| TreasuryError::ReceiptNotFound(tx_hash.to_string()))?;
        if !receipt.status() {
            return Err(TreasuryError::TxFailed(tx_hash.to_string()));
        }
        let block_number =
            receipt.block_number.ok_or_else(|| TreasuryError::Rpc("receipt has no block number".into()))?;
        let head = provider.get_block_number().await.map_err(|e| TreasuryError::Rpc(e.to_string()))?;
        let confirmations = head.saturating_sub(block_number) + 1;
        if confirmations < config.min_funding_confirmations {
            return Err(TreasuryError::InsufficientConfirmations {
                required: config.min_funding_confirmations,
                actual: confirmations,
            });
        }

        let mut funded = U256::ZERO;
        let mut log_index: Option<u64> = None;
        for log in receipt.inner.logs() {
            if log.address() != token {
                continue;
            }
            let Ok(decoded) = IERC20::Transfer::decode_log(&log.inner) else {
                continue;
            };
            let transfer = decoded.data;
            if transfer.from == from && transfer.to == treasury {
                funded += transfer.value;
                log_index = match (log_index, log.log_index) {
                    (Some(existing), Some(seen)) => Some(existing.min(seen)),
                    (None, seen) => seen,
                    (existing, None) => existing,
                };
                debug!("🏦️ Matched Transfer of {} units in {tx_hash} (log {log_index:?})", transfer.value);
            }
        }

        let funded_units: u128 = funded
            .try_into()
            .map_err(|_| TreasuryError::Rpc("transferred amount exceeds u128".to_string()))?;
        if funded_units < expected_units {
            return Err(TreasuryError::BelowRequired { funded: funded_units, required: expected_units });
        }

        info!(
            "🏦️ Funding verified for {tx_hash}: {funded_units} units from {expected_from} at block {block_number}"
        );
        Ok(FundingProof {
            tx_hash: tx_hash.to_string(),
            chain_id: reported_chain,
            token: token.to_string().to_ascii_lowercase(),
            treasury: treasury.to_string().to_ascii_lowercase(),
            from: expected_from.to_string(),
            to: treasury.to_string().to_ascii_lowercase(),
            funded_units,
            funded_usd: self.units_to_usd(funded_units),
            log_index: log_index.unwrap_or_default(),
            block_number,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::treasury::TreasuryConfig;

    #[test]
    fn expected_units_are_integer_exact() {
        // 1550 KES at 155 KES/USD with 6 decimals: exactly 10 USDC
        let units =
            expected_funding_units(MicroKes::from_kes(1550), MicroKes::from_kes(155), 6).unwrap();
        assert_eq!(units, 10_000_000);
    }

    #[test]
    fn expected_units_round_toward_positive_infinity() {
        // 1000.03 / 155 = 6.4518903... USDC; ceiling must apply
        let units =
            expected_funding_units(MicroKes::from(1_000_030_000), MicroKes::from_kes(155), 6).unwrap();
        assert!(units > 6_451_800, "expected ceiling above 6_451_800, got {units}");
        assert_eq!(units, 6_451_807);
    }

    #[test]
    fn expected_units_clamp_decimals() {
        let at_18 = expected_funding_units(MicroKes::from_kes(100), MicroKes::from_kes(100), 18).unwrap();
        let over = expected_funding_units(MicroKes::from_kes(100), MicroKes::from_kes(100), 200).unwrap();
        assert_eq!(at_18, over);
        assert_eq!(at_18, 1_000_000_000_000_000_000);
    }

    #[test]
    fn expected_units_reject_degenerate_inputs() {
        assert!(matches!(
            expected_funding_units(MicroKes::from_kes(0), MicroKes::from_kes(155), 6),
            Err(TreasuryError::NonPositiveExpectation)
        ));
        assert!(matches!(
            expected_funding_units(MicroKes::from_kes(-10), MicroKes::from_kes(155), 6),
            Err(TreasuryError::NonPositiveExpectation)
        ));
        assert!(expected_funding_units(MicroKes::from_kes(10), MicroKes::from_kes(0), 6).is_err());
    }

    #[tokio::test]
    async fn verification_validates_inputs_before_touching_the_rpc() {
        let client = TreasuryClient::new(TreasuryConfig::default());
        let good_hash = format!("0x{}", "ab".repeat(32));
        let good_addr = "0x00a329c0648769a73afac7f9381e08fb43dbea72";
        assert!(matches!(
            client.verify_funding("0x1234", good_addr, 1, None).await,
            Err(TreasuryError::InvalidInput(_))
        ));
        assert!(matches!(
            client.verify_funding(&good_hash, "not-an-address", 1, None).await,
            Err(TreasuryError::InvalidInput(_))
        ));
        assert!(matches!(
            client.verify_funding(&good_hash, good_addr, 0, None).await,
            Err(TreasuryError::NonPositiveExpectation)
        ));
        // Inputs fine, but nothing configured
        assert!(matches!(
            client.verify_funding(&good_hash, good_addr, 1, None).await,
            Err(TreasuryError::NotConfigured(_))
        ));
    }

    #[tokio::test]
    async fn request_chain_mismatch_is_rejected() {
        let config = TreasuryConfig {
            rpc_url: Some("http://127.0.0.1:1".into()),
            chain_id: Some(8453),
            token: Some("0x833589fcd6edb6e08f4c7c32d4f71b54bda02913".into()),
            platform_address: Some("0x00a329c0648769a73afac7f9381e08fb43dbea72".into()),
            ..Default::default()
        };
        let client = TreasuryClient::new(config);
        let hash = format!("0x{}", "ab".repeat(32));
        let err = client
            .verify_funding(&hash, "0x00a329c0648769a73afac7f9381e08fb43dbea72", 1, Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::ChainMismatch { expected: 8453, actual: 1 }));
    }
}
