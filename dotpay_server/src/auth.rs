//! Bearer authentication for the gateway.
//!
//! Access tokens are HS256 JWTs signed with the shared backend secret. The payload carries the
//! wallet address (in `address`, falling back to `sub`) and a space-separated `scope` claim that
//! must include `mpesa` for any mobile-money endpoint. Internal endpoints use a static API key in
//! the `X-DotPay-Internal-Key` header (or as a bearer token) instead.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::{config::AuthConfig, errors::ServerError};

pub const MPESA_SCOPE: &str = "mpesa";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub scope: String,
    pub exp: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
}

/// The authenticated caller, extracted from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct JwtClaims {
    /// Lowercase wallet address of the authenticated user.
    pub address: String,
    pub scope: String,
}

impl JwtClaims {
    fn from_token(token: &str, config: &AuthConfig) -> Result<Self, ServerError> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(config.jwt_secret.reveal().as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ServerError::Auth("Token has expired".to_string())
            },
            _ => ServerError::Auth(format!("Invalid bearer token. {e}")),
        })?;
        let claims = decoded.claims;
        if !claims.scope.split_whitespace().any(|s| s == MPESA_SCOPE) {
            return Err(ServerError::Auth(format!("Token scope does not include '{MPESA_SCOPE}'")));
        }
        let address = claims.address.unwrap_or(claims.sub).to_ascii_lowercase();
        Ok(Self { address, scope: claims.scope })
    }
}

fn bearer_token(req: &HttpRequest) -> Option<&str> {
    req.headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

impl FromRequest for JwtClaims {
    type Error = ServerError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let result = match req.app_data::<web::Data<AuthConfig>>() {
            None => Err(ServerError::Configuration("Auth configuration is not registered".to_string())),
            Some(config) => match bearer_token(req) {
                None => Err(ServerError::Auth("Missing bearer token".to_string())),
                Some(token) => JwtClaims::from_token(token, config),
            },
        };
        if let Err(e) = &result {
            debug!("💻️ Rejected request auth: {e}");
        }
        ready(result)
    }
}

/// Issues access tokens. Production mints these from the identity service; the gateway only needs
/// this for tooling and tests.
pub struct TokenIssuer {
    encoding_key: EncodingKey,
}

impl TokenIssuer {
    pub fn new(config: &AuthConfig) -> Self {
        Self { encoding_key: EncodingKey::from_secret(config.jwt_secret.reveal().as_bytes()) }
    }

    pub fn issue_token(&self, address: &str, scope: &str, ttl_seconds: i64) -> Result<String, ServerError> {
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            sub: address.to_string(),
            address: Some(address.to_string()),
            scope: scope.to_string(),
            exp: (now + ttl_seconds) as usize,
            iat: Some(now as usize),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ServerError::Auth(format!("Could not sign token. {e}")))
    }
}

/// Constant-time comparison of shared secrets, via digests so lengths do not leak.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.ct_eq(&b).into()
}

/// Check the internal API key for operator endpoints.
pub fn check_internal_key(req: &HttpRequest, expected: &str) -> Result<(), ServerError> {
    let provided = req
        .headers()
        .get("X-DotPay-Internal-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .or_else(|| bearer_token(req));
    match provided {
        Some(key) if secrets_match(key, expected) => Ok(()),
        Some(_) => Err(ServerError::Auth("Invalid internal API key".to_string())),
        None => Err(ServerError::Auth("Missing internal API key".to_string())),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_round_trip() {
        let config = AuthConfig::default();
        let issuer = TokenIssuer::new(&config);
        let token = issuer.issue_token("0xABCDEF0000000000000000000000000000000001", "mpesa users", 600).unwrap();
        let claims = JwtClaims::from_token(&token, &config).unwrap();
        assert_eq!(claims.address, "0xabcdef0000000000000000000000000000000001");
    }

    #[test]
    fn wrong_key_is_rejected() {
        let issuer = TokenIssuer::new(&AuthConfig::default());
        let token = issuer.issue_token("0xabc", "mpesa", 600).unwrap();
        let other = AuthConfig { jwt_secret: dp_common::Secret::new("a-completely-different-secret".into()) };
        assert!(JwtClaims::from_token(&token, &other).is_err());
    }

    #[test]
    fn scope_must_include_mpesa() {
        let config = AuthConfig::default();
        let issuer = TokenIssuer::new(&config);
        let token = issuer.issue_token("0xabc", "users", 600).unwrap();
        let err = JwtClaims::from_token(&token, &config).unwrap_err();
        assert!(err.to_string().contains("scope"));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let config = AuthConfig::default();
        let issuer = TokenIssuer::new(&config);
        let token = issuer.issue_token("0xabc", "mpesa", -120).unwrap();
        let err = JwtClaims::from_token(&token, &config).unwrap_err();
        assert!(err.to_string().contains("expired"), "was: {err}");
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("hunter2", "hunter2"));
        assert!(!secrets_match("hunter2", "hunter3"));
        assert!(!secrets_match("", ""));
        assert!(!secrets_match("anything", ""));
    }
}
