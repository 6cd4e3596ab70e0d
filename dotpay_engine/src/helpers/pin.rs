//! PIN hashing and verification.
//!
//! PINs are short numeric secrets, so the hash must be memory-hard to make offline guessing
//! expensive. Records are stored as `scrypt$<salt b64>$<hash b64>` and verified in constant time.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use scrypt::{scrypt, Params};
use subtle::ConstantTimeEq;

use crate::helpers::AuthError;

const SCHEME: &str = "scrypt";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 64;

fn scrypt_params() -> Params {
    // N = 2^14, r = 8, p = 1
    Params::new(14, 8, 1, HASH_LEN).expect("scrypt parameters are valid")
}

/// Normalize and validate a client-supplied PIN: whitespace is stripped, the remainder must be
/// exactly `pin_length` digits.
pub fn validate_pin_format(pin: &str, pin_length: usize) -> Result<String, AuthError> {
    let cleaned: String = pin.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() != pin_length || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::InvalidPinFormat(pin_length));
    }
    Ok(cleaned)
}

/// Hash a (already validated) PIN with a fresh random salt.
pub fn hash_pin(pin: &str) -> Result<String, AuthError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let mut hash = [0u8; HASH_LEN];
    scrypt(pin.as_bytes(), &salt, &scrypt_params(), &mut hash)
        .map_err(|_| AuthError::BadPinRecord)?;
    Ok(format!("{SCHEME}${}${}", BASE64.encode(salt), BASE64.encode(hash)))
}

/// Verify a PIN against a stored record. Comparison is constant-time.
pub fn verify_pin(pin: &str, stored: &str) -> Result<bool, AuthError> {
    let mut parts = stored.split('$');
    let (scheme, salt_b64, hash_b64) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(scheme), Some(salt), Some(hash), None) => (scheme, salt, hash),
        _ => return Err(AuthError::BadPinRecord),
    };
    if scheme != SCHEME {
        return Err(AuthError::BadPinRecord);
    }
    let salt = BASE64.decode(salt_b64).map_err(|_| AuthError::BadPinRecord)?;
    let expected = BASE64.decode(hash_b64).map_err(|_| AuthError::BadPinRecord)?;
    if expected.len() != HASH_LEN {
        return Err(AuthError::BadPinRecord);
    }
    let mut actual = [0u8; HASH_LEN];
    scrypt(pin.as_bytes(), &salt, &scrypt_params(), &mut actual)
        .map_err(|_| AuthError::BadPinRecord)?;
    Ok(actual.ct_eq(expected.as_slice()).into())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pin_format() {
        assert_eq!(validate_pin_format("123456", 6).unwrap(), "123456");
        assert_eq!(validate_pin_format(" 12 34 56 ", 6).unwrap(), "123456");
        assert!(validate_pin_format("12345", 6).is_err());
        assert!(validate_pin_format("1234567", 6).is_err());
        assert!(validate_pin_format("12345a", 6).is_err());
        assert!(validate_pin_format("", 6).is_err());
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_pin("123456").unwrap();
        assert!(hash.starts_with("scrypt$"));
        assert!(verify_pin("123456", &hash).unwrap());
        assert!(!verify_pin("654321", &hash).unwrap());
    }

    #[test]
    fn salts_are_random() {
        let a = hash_pin("123456").unwrap();
        let b = hash_pin("123456").unwrap();
        assert_ne!(a, b);
        assert!(verify_pin("123456", &a).unwrap());
        assert!(verify_pin("123456", &b).unwrap());
    }

    #[test]
    fn malformed_records_are_rejected() {
        assert!(verify_pin("123456", "argon2$abc$def").is_err());
        assert!(verify_pin("123456", "scrypt$not-base64!$x").is_err());
        assert!(verify_pin("123456", "scrypt$onlyonepart").is_err());
        assert!(verify_pin("123456", "scrypt$a$b$c").is_err());
    }
}
