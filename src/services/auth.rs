use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ADMIN_ROLE: &str = "admin";

/// Bearer token claims. `sub` is the owner id jobs and push events are
/// scoped to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

/// HS256 token verification with a shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(decode::<Claims>(token, &self.decoding, &self.validation)?.claims)
    }

    /// Sign a token for `sub`, valid for `ttl`.
    pub fn issue(&self, sub: &str, roles: &[&str], ttl: Duration) -> Result<String, AuthError> {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let verifier = TokenVerifier::new("test-secret");
        let token = verifier.issue("user-1", &["admin"], Duration::minutes(5)).unwrap();
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.is_admin());
    }

    #[test]
    fn test_rejects_bad_tokens() {
        let verifier = TokenVerifier::new("test-secret");
        let other = TokenVerifier::new("other-secret");
        let foreign = other.issue("user-1", &[], Duration::minutes(5)).unwrap();
        assert!(matches!(verifier.verify(&foreign), Err(AuthError::InvalidToken(_))));

        let expired = verifier.issue("user-1", &[], Duration::minutes(-10)).unwrap();
        assert!(verifier.verify(&expired).is_err());

        assert!(matches!(verifier.verify("  "), Err(AuthError::MissingToken)));
        assert!(verifier.verify("not-a-jwt").is_err());
    }
}
