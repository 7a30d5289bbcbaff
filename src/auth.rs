use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

// Tokens minted here are for tests and operational tooling; the real issuer
// is the external auth service.
const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    #[serde(default)]
    pub name: String, // display name
    pub exp: i64,    // Expiration time
    pub iat: i64,    // Issued at
    pub iss: String, // Issuer
}

/// Identity established at the connection handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub username: String,
}

/// Verifies gateway tokens. Issuance lives in the external auth service;
/// only HS256 verification against the shared secret happens here.
pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
}

impl AuthManager {
    pub fn new(secret: &str, issuer: impl Into<String>) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
        }
    }

    /// Verify a token and resolve the authenticated identity.
    pub fn verify_token(&self, token: &str) -> ChatResult<AuthenticatedUser> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.clone()]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        let claims = token_data.claims;

        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ChatError::auth("token subject is not a user id"))?;
        let username = if claims.name.trim().is_empty() {
            // Tokens from older issuers carry no display name
            crate::utils::fallback_username(&user_id)
        } else {
            claims.name
        };

        Ok(AuthenticatedUser { user_id, username })
    }

    /// Mint a token for the given identity.
    pub fn create_token(&self, user_id: &Uuid, username: &str) -> ChatResult<String> {
        self.create_token_with_ttl(user_id, username, DEFAULT_TOKEN_TTL_HOURS * 3600)
    }

    fn create_token_with_ttl(
        &self,
        user_id: &Uuid,
        username: &str,
        ttl_secs: i64,
    ) -> ChatResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            name: username.to_string(),
            exp: (now + Duration::seconds(ttl_secs)).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new("test-secret-with-enough-length-0123456789", "roomcast")
    }

    #[test]
    fn verify_round_trip() {
        let auth = manager();
        let user_id = Uuid::new_v4();
        let token = auth.create_token(&user_id, "alice").unwrap();

        let user = auth.verify_token(&token).unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.username, "alice");
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = manager();
        let user_id = Uuid::new_v4();
        // Far enough in the past to clear the default leeway
        let token = auth
            .create_token_with_ttl(&user_id, "alice", -7200)
            .unwrap();

        assert!(auth.verify_token(&token).is_err());
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let other = AuthManager::new("test-secret-with-enough-length-0123456789", "someone-else");
        let token = other.create_token(&Uuid::new_v4(), "alice").unwrap();

        assert!(manager().verify_token(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let other = AuthManager::new("a-completely-different-secret-value-12345", "roomcast");
        let token = other.create_token(&Uuid::new_v4(), "alice").unwrap();

        assert!(manager().verify_token(&token).is_err());
    }

    #[test]
    fn non_uuid_subject_is_rejected() {
        let auth = manager();
        let now = Utc::now();
        let claims = Claims {
            sub: "not-a-uuid".to_string(),
            name: "alice".to_string(),
            exp: (now + Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
            iss: "roomcast".to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret-with-enough-length-0123456789"),
        )
        .unwrap();

        assert!(matches!(
            auth.verify_token(&token),
            Err(ChatError::Auth(_))
        ));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(manager().verify_token("not.a.token").is_err());
    }
}
