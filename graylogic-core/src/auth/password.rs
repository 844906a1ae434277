//! Password hashing using Argon2id
//!
//! Parameters follow the OWASP 2025 guidance: time cost 3, 64 MiB memory,
//! single lane, 32-byte tag, 16-byte random salt. Output is the PHC string
//! format, so the hash is self-describing and verification needs no extra
//! context.

use argon2::{
    password_hash::{
        rand_core::OsRng, PasswordHash, PasswordHasher as Argon2PasswordHasher,
        PasswordVerifier, SaltString,
    },
    Algorithm, Argon2, Params, Version,
};

use crate::error::{Error, Result};

const MEMORY_COST_KIB: u32 = 65536;
const TIME_COST: u32 = 3;
const PARALLELISM: u32 = 1;
const OUTPUT_LEN: usize = 32;

/// Argon2id password hasher with fixed production parameters
#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher {
    pub fn new() -> Self {
        let params = Params::new(MEMORY_COST_KIB, TIME_COST, PARALLELISM, Some(OUTPUT_LEN))
            .expect("argon2 parameters are compile-time constants");
        Self { params }
    }

    /// Hash a password into a PHC string
    ///
    /// A fresh random salt is drawn per call, so hashing the same password
    /// twice yields different strings.
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone());

        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::PasswordHash(format!("hashing failed: {}", e)))?;

        Ok(hash.to_string())
    }

    /// Verify a password against a PHC string in constant time
    pub fn verify(&self, password: &str, phc: &str) -> Result<bool> {
        let parsed = PasswordHash::new(phc)
            .map_err(|e| Error::PasswordHash(format!("invalid PHC string: {}", e)))?;

        // Parameters come from the hash itself
        let argon2 = Argon2::default();
        match argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::PasswordHash(format!("verification failed: {}", e))),
        }
    }
}
