//! Token primitives: HS256 access tokens, refresh-token material, id minting
//!
//! Access tokens are short-lived JWTs; refresh tokens are 256-bit random
//! hex values whose SHA-256 is what the database ever sees. Identifier
//! prefixes (`usr-`, `rt-`, `pnl-`) make log lines and foreign keys
//! self-describing.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::roles::Role;
use crate::error::{Error, Result};

/// Default access-token lifetime
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id
    pub sub: String,
    /// Issued-at, seconds since epoch
    pub iat: i64,
    /// Expiry, seconds since epoch
    pub exp: i64,
    /// Random token id
    pub jti: String,
    /// Principal role at issue time
    pub role: Role,
    /// Session id shared across one login's token chain
    pub sid: String,
}

/// Signs and parses HS256 access tokens
#[derive(Clone)]
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl,
        }
    }

    pub fn with_default_ttl(secret: &[u8]) -> Self {
        Self::new(secret, DEFAULT_ACCESS_TTL)
    }

    /// Issue an access token for a user session
    pub fn generate(&self, user_id: &str, role: Role, session_id: &str) -> Result<String> {
        self.generate_with_ttl(user_id, role, session_id, self.ttl)
    }

    /// Issue with an explicit lifetime
    pub fn generate_with_ttl(
        &self,
        user_id: &str,
        role: Role,
        session_id: &str,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            jti: uuid::Uuid::new_v4().to_string(),
            role,
            sid: session_id.to_string(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(Error::from)
    }

    /// Parse and validate an access token
    ///
    /// Rejects every algorithm except HS256, expired tokens (no leeway),
    /// and tokens missing `sub` or `role`.
    pub fn parse(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation)?;
        if data.claims.sub.is_empty() {
            return Err(Error::InvalidCredentials);
        }
        Ok(data.claims)
    }
}

/// Fresh 256-bit refresh-token material as 64 hex chars
pub fn new_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hex of a raw token; the only form that touches storage
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Random 32-hex-char password for the seeded owner account
pub fn random_hex_password() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_user_id() -> String {
    format!("usr-{}", uuid_prefix())
}

pub fn new_refresh_token_id() -> String {
    format!("rt-{}", uuid_prefix())
}

pub fn new_panel_id() -> String {
    format!("pnl-{}", uuid_prefix())
}

pub fn new_family_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn uuid_prefix() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}
