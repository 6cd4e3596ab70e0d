//! Input validators for the initiate endpoints.

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

/// Kenyan MSISDNs: `254` followed by a 7xx or 1xx mobile prefix and eight digits.
pub fn validate_msisdn(phone: &str) -> Result<(), ValidationError> {
    let re = Regex::new(r"^254[71]\d{8}$").unwrap();
    if re.is_match(phone) {
        Ok(())
    } else {
        Err(ValidationError(format!("Invalid phone number: {phone}. Expected format 254[7|1]XXXXXXXX")))
    }
}

/// Paybill and till numbers are 5-8 digit shortcodes.
pub fn validate_shortcode(code: &str) -> Result<(), ValidationError> {
    let re = Regex::new(r"^\d{5,8}$").unwrap();
    if re.is_match(code) {
        Ok(())
    } else {
        Err(ValidationError(format!("Invalid business shortcode: {code}")))
    }
}

pub fn validate_account_ref(account_ref: &str) -> Result<(), ValidationError> {
    let len = account_ref.chars().count();
    if !(2..=20).contains(&len) || account_ref.chars().any(char::is_control) {
        return Err(ValidationError("Account reference must be 2-20 printable characters".into()));
    }
    Ok(())
}

/// Idempotency keys: 8-128 characters from `[A-Za-z0-9_\-:.]`.
pub fn validate_idempotency_key(key: &str) -> Result<(), ValidationError> {
    if !(8..=128).contains(&key.len()) {
        return Err(ValidationError("Idempotency-Key must be between 8 and 128 characters".into()));
    }
    let re = Regex::new(r"^[A-Za-z0-9_\-:.]+$").unwrap();
    if re.is_match(key) {
        Ok(())
    } else {
        Err(ValidationError("Idempotency-Key contains unsupported characters".into()))
    }
}

/// A 20-byte EVM address in lowercase hex with `0x` prefix.
pub fn validate_evm_address(address: &str) -> Result<(), ValidationError> {
    let re = Regex::new(r"^0x[0-9a-f]{40}$").unwrap();
    if re.is_match(address) {
        Ok(())
    } else {
        Err(ValidationError(format!("Invalid EVM address: {address}")))
    }
}

/// A 32-byte transaction hash in lowercase hex with `0x` prefix.
pub fn validate_tx_hash(hash: &str) -> Result<(), ValidationError> {
    let re = Regex::new(r"^0x[0-9a-f]{64}$").unwrap();
    if re.is_match(hash) {
        Ok(())
    } else {
        Err(ValidationError(format!("Invalid transaction hash: {hash}")))
    }
}

pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn msisdn_boundaries() {
        assert!(validate_msisdn("254700000000").is_ok());
        assert!(validate_msisdn("254100000000").is_ok());
        assert!(validate_msisdn("0700000000").is_err());
        assert!(validate_msisdn("7000000000").is_err());
        assert!(validate_msisdn("254200000000").is_err());
        assert!(validate_msisdn("25470000000").is_err());
        assert!(validate_msisdn("2547000000000").is_err());
    }

    #[test]
    fn shortcodes() {
        assert!(validate_shortcode("55667").is_ok());
        assert!(validate_shortcode("88888888").is_ok());
        assert!(validate_shortcode("1234").is_err());
        assert!(validate_shortcode("123456789").is_err());
        assert!(validate_shortcode("12a45").is_err());
    }

    #[test]
    fn idempotency_keys() {
        assert!(validate_idempotency_key("offramp:test-key-001").is_ok());
        assert!(validate_idempotency_key("a".repeat(8).as_str()).is_ok());
        assert!(validate_idempotency_key("a".repeat(128).as_str()).is_ok());
        assert!(validate_idempotency_key("a".repeat(7).as_str()).is_err());
        assert!(validate_idempotency_key("a".repeat(129).as_str()).is_err());
        assert!(validate_idempotency_key("bad/key-001").is_err());
        assert!(validate_idempotency_key("with space 123").is_err());
    }

    #[test]
    fn addresses_and_hashes() {
        assert!(validate_evm_address("0x00a329c0648769a73afac7f9381e08fb43dbea72").is_ok());
        assert!(validate_evm_address("0x00A329C0648769A73AFAC7F9381E08FB43DBEA72").is_err());
        assert!(validate_evm_address("00a329c0648769a73afac7f9381e08fb43dbea72").is_err());
        assert!(validate_tx_hash(&format!("0x{}", "ab".repeat(32))).is_ok());
        assert!(validate_tx_hash(&format!("0x{}", "ab".repeat(31))).is_err());
        assert_eq!(
            normalize_address(" 0x00A329c0648769A73afAc7F9381E08FB43dBEA72 "),
            "0x00a329c0648769a73afac7f9381e08fb43dbea72"
        );
    }

    #[test]
    fn account_refs() {
        assert!(validate_account_ref("AC").is_ok());
        assert!(validate_account_ref("ACCOUNT-1234567890AB").is_ok());
        assert!(validate_account_ref("A").is_err());
        assert!(validate_account_ref(&"A".repeat(21)).is_err());
    }
}
