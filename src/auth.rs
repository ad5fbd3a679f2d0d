//! Narrow auth capabilities: JWT verification (HS256) for the WebSocket
//! handshake and HTTP middleware, and HMAC-SHA256 password hashing for
//! `/register` and `/login`.

use chrono::{Duration as ChronoDuration, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use uuid::Uuid;

use crate::domain::UserRole;
use crate::error::{EngineError, EngineResult};

const TOKEN_LIFETIME_HOURS: i64 = 24;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub name: String,
    pub email: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: Uuid, name: String, email: String, role: UserRole) -> Self {
        let now = Utc::now();
        let role = match role {
            UserRole::Passenger => "PASSENGER",
            UserRole::Driver => "DRIVER",
            UserRole::Admin => "ADMIN",
        };
        Self {
            user_id,
            name,
            email,
            role: role.to_string(),
            iat: now.timestamp(),
            exp: (now + ChronoDuration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
        }
    }
}

/// Issues and verifies HS256 tokens against one shared secret (env
/// `MY_SECRET`). Also owns the password-hashing scheme, since both derive
/// from the same HMAC key material in the original service.
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn issue(&self, claims: &Claims) -> EngineResult<String> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| EngineError::Internal(format!("token signing failed: {e}")))
    }

    pub fn verify(&self, token: &str) -> EngineResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| EngineError::AuthFailed(format!("invalid token: {e}")))
    }

    pub fn hash_password(&self, password: &str) -> EngineResult<String> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|e| EngineError::Internal(format!("bad hmac key: {e}")))?;
        mac.update(password.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn check_password(&self, password: &str, stored_hash: &str) -> EngineResult<bool> {
        let computed = self.hash_password(password)?;
        Ok(constant_time_eq(computed.as_bytes(), stored_hash.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> TokenVerifier {
        TokenVerifier::new(b"test-secret".to_vec())
    }

    #[test]
    fn issued_token_verifies_back_to_the_same_claims() {
        let v = verifier();
        let claims = Claims::new(
            Uuid::new_v4(),
            "Ada".into(),
            "ada@example.com".into(),
            UserRole::Passenger,
        );
        let token = v.issue(&claims).unwrap();
        let parsed = v.verify(&token).unwrap();
        assert_eq!(parsed.user_id, claims.user_id);
        assert_eq!(parsed.role, "PASSENGER");
    }

    #[test]
    fn tampered_token_is_rejected() {
        let v = verifier();
        let claims = Claims::new(Uuid::new_v4(), "Ada".into(), "ada@example.com".into(), UserRole::Driver);
        let mut token = v.issue(&claims).unwrap();
        token.push('x');
        assert!(v.verify(&token).is_err());
    }

    #[test]
    fn password_hash_round_trips_and_rejects_wrong_password() {
        let v = verifier();
        let hash = v.hash_password("correct horse battery staple").unwrap();
        assert!(v.check_password("correct horse battery staple", &hash).unwrap());
        assert!(!v.check_password("wrong password", &hash).unwrap());
    }
}
