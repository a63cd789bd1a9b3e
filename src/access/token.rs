// Bearer token verification (HS256 JWTs with the principal id in `userId`).

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Raw bearer credential as presented by the caller.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Extract from an `Authorization` header value. Anything other than `Bearer <token>`
    /// counts as no credential.
    pub fn from_authorization(value: &str) -> Option<Self> {
        value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Self::new)
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential(..)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Token generation failed: {0}")]
    Generation(String),
    #[error("Token expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
}

/// Turns a bearer token into the id of the principal it was issued for.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, credential: &Credential) -> Result<String, TokenError>;
}

#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token for `user_id` valid for `ttl_secs`. Used by tooling and tests; login
    /// lives in the account service.
    pub fn issue(&self, user_id: &str, ttl_secs: i64) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| TokenError::Generation(e.to_string()))?
            .as_secs();
        let exp = if ttl_secs >= 0 {
            now + ttl_secs as u64
        } else {
            now.saturating_sub(ttl_secs.unsigned_abs())
        };
        let claims = Claims {
            user_id: user_id.to_string(),
            exp,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Generation(e.to_string()))
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, credential: &Credential) -> Result<String, TokenError> {
        let mut validation = Validation::default();
        validation.leeway = 0;

        decode::<Claims>(credential.token(), &self.decoding_key, &validation)
            .map(|data| data.claims.user_id)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}
