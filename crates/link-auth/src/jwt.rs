//! JWT (JSON Web Token) verification
//!
//! Agents present an HS256 token issued by the HIS backend. The relay only
//! verifies: signature, issuer, audience, and expiry. Signature comparison
//! is constant-time inside the jsonwebtoken crate.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Claims carried by agent registration tokens
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkClaims {
    /// Subject (tenant ID)
    pub sub: String,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
    /// Expiration time (seconds since epoch)
    pub exp: i64,
    /// Issued at (seconds since epoch)
    #[serde(default)]
    pub iat: i64,
    #[serde(rename = "organizationId", default)]
    pub organization_id: String,
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub role: String,
}

impl LinkClaims {
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

/// JWT validator using HMAC-SHA256 with a shared secret
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a validator that checks signature, expiry, issuer, and audience
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<LinkClaims, JwtError> {
        let token_data = decode::<LinkClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    /// Encode a token with HMAC-SHA256; the relay never issues tokens in
    /// production, this exists for agents embedded in tests
    pub fn encode(secret: &[u8], claims: &LinkClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";
    const ISSUER: &str = "his.tatbeeb.sa";
    const AUDIENCE: &str = "tatbeeb-link.tatbeeb.sa";

    fn claims_for(tenant_id: &str, ttl_secs: i64) -> LinkClaims {
        let now = Utc::now().timestamp();
        LinkClaims {
            sub: tenant_id.to_string(),
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            exp: now + ttl_secs,
            iat: now,
            organization_id: "org-1".to_string(),
            user_id: "user-1".to_string(),
            role: "agent".to_string(),
        }
    }

    #[test]
    fn test_valid_token_round_trip() {
        let claims = claims_for("clinic-001", 3600);
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE);
        let decoded = validator.validate(&token).unwrap();

        assert_eq!(decoded.sub, "clinic-001");
        assert_eq!(decoded.organization_id, "org-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let claims = claims_for("clinic-001", 3600);
        let token = JwtValidator::encode(b"other_secret", &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE);
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_wrong_audience_rejected() {
        let mut claims = claims_for("clinic-001", 3600);
        claims.aud = "somewhere-else".to_string();
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE);
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let mut claims = claims_for("clinic-001", 3600);
        claims.iss = "unknown-issuer".to_string();
        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE);
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let claims = claims_for("clinic-001", -3600);
        assert!(claims.is_expired());

        let token = JwtValidator::encode(TEST_SECRET, &claims).unwrap();

        let validator = JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE);
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_malformed_token_rejected() {
        let validator = JwtValidator::new(TEST_SECRET, ISSUER, AUDIENCE);
        assert!(validator.validate("not-a-jwt").is_err());
        assert!(validator.validate("a.b").is_err());
    }
}
