//! The Daraja `SecurityCredential`: the initiator password RSA-encrypted (PKCS#1 v1.5) under the
//! provider's X.509 certificate, base64 encoded.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::{pkcs1::DecodeRsaPublicKey, Pkcs1v15Encrypt, RsaPublicKey};
use x509_parser::pem::parse_x509_pem;

use crate::error::DarajaApiError;

/// Certificate used when no `MPESA_CERT_PATH` is configured (sandbox development).
pub const SANDBOX_CERT: &str = include_str!("../certs/sandbox.cer");

/// Ciphertext lengths produced by the RSA key sizes the provider has used over the years.
const VALID_CIPHERTEXT_LENGTHS: [usize; 5] = [128, 192, 256, 384, 512];

/// Encrypt the initiator password under the certificate's RSA public key.
pub fn encrypt_initiator_password(password: &str, cert_pem: &str) -> Result<String, DarajaApiError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| DarajaApiError::Config(format!("Invalid provider certificate PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| DarajaApiError::Config(format!("Invalid provider certificate: {e}")))?;
    let spki = cert.public_key();
    let public_key = RsaPublicKey::from_pkcs1_der(&spki.subject_public_key.data)
        .map_err(|e| DarajaApiError::Config(format!("Certificate does not carry an RSA key: {e}")))?;
    let mut rng = rand::thread_rng();
    let ciphertext = public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, password.as_bytes())
        .map_err(|e| DarajaApiError::Config(format!("RSA encryption failed: {e}")))?;
    Ok(BASE64.encode(ciphertext))
}

/// Sanity-check a security credential: base64, with a ciphertext length matching a valid RSA key
/// size. Catches plaintext passwords pasted into `MPESA_SECURITY_CREDENTIAL`.
pub fn validate_security_credential(credential: &str) -> Result<(), DarajaApiError> {
    let decoded = BASE64
        .decode(credential.trim())
        .map_err(|e| DarajaApiError::InvalidSecurityCredential(format!("not base64: {e}")))?;
    if !VALID_CIPHERTEXT_LENGTHS.contains(&decoded.len()) {
        return Err(DarajaApiError::InvalidSecurityCredential(format!(
            "decoded length {} does not match an RSA key size",
            decoded.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encrypts_under_the_bundled_sandbox_cert() {
        let credential = encrypt_initiator_password("Safaricom999!*!", SANDBOX_CERT).unwrap();
        validate_security_credential(&credential).unwrap();
        // RSA-2048 ciphertext
        assert_eq!(BASE64.decode(&credential).unwrap().len(), 256);
    }

    #[test]
    fn encryption_is_randomized() {
        let a = encrypt_initiator_password("secret", SANDBOX_CERT).unwrap();
        let b = encrypt_initiator_password("secret", SANDBOX_CERT).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn plaintext_credentials_are_rejected() {
        assert!(validate_security_credential("Safaricom999!*!").is_err());
        // Valid base64 but the wrong length
        assert!(validate_security_credential(&BASE64.encode([0u8; 100])).is_err());
        for len in [128usize, 256, 512] {
            assert!(validate_security_credential(&BASE64.encode(vec![7u8; len])).is_ok());
        }
    }

    #[test]
    fn garbage_certificates_are_rejected() {
        assert!(encrypt_initiator_password("pw", "not a pem").is_err());
    }
}
