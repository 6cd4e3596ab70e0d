pub mod auth_message;
pub mod pin;
pub mod validation;

use thiserror::Error;

/// Authentication and authorization failures. All of these surface as HTTP 401.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("PIN must be exactly {0} digits")]
    InvalidPinFormat(usize),
    #[error("Invalid PIN")]
    InvalidPin,
    #[error("No PIN is set for this account")]
    PinNotSet,
    #[error("Stored PIN record is malformed")]
    BadPinRecord,
    #[error("Authorization signature is malformed: {0}")]
    MalformedSignature(String),
    #[error("Authorization was signed by {recovered}, expected {expected}")]
    SignerMismatch { expected: String, recovered: String },
    #[error("Authorization signature has expired")]
    SignatureExpired,
    #[error("Authorization signedAt is too far in the future")]
    SignatureFromFuture,
    #[error("Authorization signedAt could not be parsed: {0}")]
    BadSignedAt(String),
    #[error("Authorization nonce must be at least 8 characters")]
    NonceTooShort,
}
