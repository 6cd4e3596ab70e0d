//! # Wallet authorization message format
//!
//! Payout flows debit a user's stablecoin balance, so the request must carry proof that the
//! wallet owner approved this exact transaction. The client signs a canonical message with the
//! wallet key (EIP-191 personal sign) and the server recovers the signer and compares it with
//! the authenticated address.
//!
//! The message binds the transaction id, flow, quote, both debit amounts, the payout target and
//! a nonce, so a signature cannot be replayed against a different transaction or amount. It must
//! be byte-identical on both sides:
//!
//! ```text
//! DotPay Authorization
//! Transaction: <transactionId>
//! Flow: <flowType>
//! Quote: <quoteId>
//! AmountKES: <totalDebitKes, 2 decimals>
//! AmountUSDC: <expectedAmountUsd, 6 decimals>
//! Target: <descriptor>
//! Nonce: <nonce>
//! SignedAt: <signedAt exactly as provided>
//! ```

use alloy::primitives::Signature;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::{db_types::Transaction, helpers::AuthError};

/// How far in the future a `signedAt` stamp may lie before it is rejected.
const MAX_CLOCK_SKEW_SECONDS: i64 = 60;
const MIN_NONCE_LEN: usize = 8;
const MIN_SIGNATURE_LEN: usize = 24;

/// Build the canonical authorization message for a transaction.
pub fn authorization_message(tx: &Transaction, nonce: &str, signed_at: &str) -> String {
    [
        "DotPay Authorization".to_string(),
        format!("Transaction: {}", tx.transaction_id),
        format!("Flow: {}", tx.flow_type),
        format!("Quote: {}", tx.quote.quote_id),
        format!("AmountKES: {}", tx.quote.total_debit_kes.format_2dp()),
        format!("AmountUSDC: {}", tx.onchain.expected_amount_usd.format_6dp()),
        format!("Target: {}", tx.target_descriptor()),
        format!("Nonce: {nonce}"),
        format!("SignedAt: {signed_at}"),
    ]
    .join("\n")
}

/// Parse the raw `signedAt` value. RFC 3339 strings and unix epochs (seconds or milliseconds)
/// are accepted; the raw string is what gets signed either way.
fn parse_signed_at(raw: &str) -> Result<DateTime<Utc>, AuthError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(epoch) = raw.trim().parse::<i64>() {
        let (secs, millis) = if epoch >= 1_000_000_000_000 { (epoch / 1000, epoch % 1000) } else { (epoch, 0) };
        return Utc
            .timestamp_opt(secs, (millis * 1_000_000) as u32)
            .single()
            .ok_or_else(|| AuthError::BadSignedAt(raw.to_string()));
    }
    Err(AuthError::BadSignedAt(raw.to_string()))
}

/// Verify a wallet signature over the canonical message for `tx`.
///
/// Returns the recovered signer address (lowercase hex) on success.
pub fn verify_wallet_signature(
    tx: &Transaction,
    signature: &str,
    nonce: &str,
    signed_at: &str,
    expected_signer: &str,
    max_age: Duration,
) -> Result<String, AuthError> {
    if signature.len() < MIN_SIGNATURE_LEN {
        return Err(AuthError::MalformedSignature("signature is too short".into()));
    }
    if nonce.len() < MIN_NONCE_LEN {
        return Err(AuthError::NonceTooShort);
    }
    let stamped = parse_signed_at(signed_at)?;
    let now = Utc::now();
    if stamped > now + Duration::seconds(MAX_CLOCK_SKEW_SECONDS) {
        return Err(AuthError::SignatureFromFuture);
    }
    if now - stamped > max_age {
        return Err(AuthError::SignatureExpired);
    }

    let raw = alloy::hex::decode(signature.trim_start_matches("0x"))
        .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
    let sig = Signature::try_from(raw.as_slice())
        .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
    let message = authorization_message(tx, nonce, signed_at);
    let recovered = sig
        .recover_address_from_msg(message.as_bytes())
        .map_err(|e| AuthError::MalformedSignature(e.to_string()))?;
    let recovered = recovered.to_string().to_ascii_lowercase();
    if recovered != expected_signer.to_ascii_lowercase() {
        return Err(AuthError::SignerMismatch {
            expected: expected_signer.to_ascii_lowercase(),
            recovered,
        });
    }
    Ok(recovered)
}

#[cfg(test)]
mod test {
    use alloy::signers::{local::PrivateKeySigner, SignerSync};

    use super::*;
    use crate::{
        db_types::{FlowType, TransactionStatus},
        test_utils::sample_transaction,
    };

    fn signer() -> PrivateKeySigner {
        "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318".parse().unwrap()
    }

    fn sign(tx: &Transaction, nonce: &str, signed_at: &str) -> String {
        let message = authorization_message(tx, nonce, signed_at);
        let sig = signer().sign_message_sync(message.as_bytes()).unwrap();
        format!("0x{}", alloy::hex::encode(sig.as_bytes()))
    }

    #[test]
    fn message_is_canonical() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let msg = authorization_message(&tx, "nonce-12345", "2026-03-01T10:00:00Z");
        let lines: Vec<&str> = msg.split('\n').collect();
        assert_eq!(lines[0], "DotPay Authorization");
        assert_eq!(lines[1], "Transaction: dp_0123456789abcdef01234567");
        assert_eq!(lines[2], "Flow: offramp");
        assert_eq!(lines[4], "AmountKES: 1021.00");
        assert_eq!(lines[5], "AmountUSDC: 7.850000");
        assert_eq!(lines[6], "Target: phone:254700000000");
        assert_eq!(lines[8], "SignedAt: 2026-03-01T10:00:00Z");
        assert_eq!(lines.len(), 9);
    }

    #[test]
    fn valid_signature_recovers_the_signer() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let signed_at = Utc::now().to_rfc3339();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let expected = signer().address().to_string().to_ascii_lowercase();
        let recovered = verify_wallet_signature(
            &tx,
            &sig,
            "nonce-12345",
            &signed_at,
            &expected,
            Duration::seconds(600),
        )
        .unwrap();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn wrong_signer_is_rejected() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let signed_at = Utc::now().to_rfc3339();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let err = verify_wallet_signature(
            &tx,
            &sig,
            "nonce-12345",
            &signed_at,
            &tx.user_address,
            Duration::seconds(600),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::SignerMismatch { .. }));
    }

    #[test]
    fn tampered_message_changes_the_recovered_address() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let signed_at = Utc::now().to_rfc3339();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let expected = signer().address().to_string().to_ascii_lowercase();
        // Different nonce than the one signed over
        let err = verify_wallet_signature(
            &tx,
            &sig,
            "nonce-99999",
            &signed_at,
            &expected,
            Duration::seconds(600),
        )
        .unwrap_err();
        assert!(matches!(err, AuthError::SignerMismatch { .. }));
    }

    #[test]
    fn stale_signature_is_rejected() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        // Signed 11 minutes ago, max age 10 minutes
        let signed_at = (Utc::now() - Duration::seconds(660)).to_rfc3339();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let expected = signer().address().to_string().to_ascii_lowercase();
        let err =
            verify_wallet_signature(&tx, &sig, "nonce-12345", &signed_at, &expected, Duration::seconds(600))
                .unwrap_err();
        assert!(matches!(err, AuthError::SignatureExpired));
    }

    #[test]
    fn future_signature_is_rejected() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let signed_at = (Utc::now() + Duration::seconds(61)).to_rfc3339();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let expected = signer().address().to_string().to_ascii_lowercase();
        let err =
            verify_wallet_signature(&tx, &sig, "nonce-12345", &signed_at, &expected, Duration::seconds(600))
                .unwrap_err();
        assert!(matches!(err, AuthError::SignatureFromFuture));
    }

    #[test]
    fn short_nonce_and_short_signature_are_rejected() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let signed_at = Utc::now().to_rfc3339();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let expected = signer().address().to_string().to_ascii_lowercase();
        assert!(matches!(
            verify_wallet_signature(&tx, &sig, "short", &signed_at, &expected, Duration::seconds(600)),
            Err(AuthError::NonceTooShort)
        ));
        assert!(matches!(
            verify_wallet_signature(&tx, "0xdeadbeef", "nonce-12345", &signed_at, &expected, Duration::seconds(600)),
            Err(AuthError::MalformedSignature(_))
        ));
    }

    #[test]
    fn epoch_signed_at_values_are_accepted() {
        let tx = sample_transaction(FlowType::Offramp, TransactionStatus::Quoted);
        let signed_at = Utc::now().timestamp().to_string();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        let expected = signer().address().to_string().to_ascii_lowercase();
        assert!(verify_wallet_signature(&tx, &sig, "nonce-12345", &signed_at, &expected, Duration::seconds(600))
            .is_ok());
        // Milliseconds variant
        let signed_at = Utc::now().timestamp_millis().to_string();
        let sig = sign(&tx, "nonce-12345", &signed_at);
        assert!(verify_wallet_signature(&tx, &sig, "nonce-12345", &signed_at, &expected, Duration::seconds(600))
            .is_ok());
    }
}
