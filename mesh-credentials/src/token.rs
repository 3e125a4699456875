//! Singleton bootstrap token used for trust-on-first-use enrollment.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The persisted bootstrap token record.
///
/// Only the salted hash is stored; the plaintext is surfaced exactly once by
/// [`BootstrapToken::generate`]. Regenerating replaces the record wholesale,
/// invalidating every previously issued plaintext.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapToken {
    /// Record identifier; changes on every regeneration.
    pub id: Uuid,
    /// Hex-encoded random salt.
    pub salt: String,
    /// Hex-encoded SHA-256 of salt bytes followed by the plaintext.
    pub hash: String,
    /// Whether bootstrap enrollment is currently accepted.
    pub enabled: bool,
    /// Whether enrollments under this token are approved inline.
    pub auto_approve: bool,
    /// Time the record was created.
    pub created_at: DateTime<Utc>,
}

/// A freshly generated token: the persisted record plus the one-time plaintext.
#[derive(Debug)]
pub struct IssuedToken {
    /// Record to persist.
    pub record: BootstrapToken,
    /// Plaintext shown to the operator exactly once.
    pub plaintext: String,
}

impl BootstrapToken {
    /// Generates a new token record and its one-time plaintext.
    #[must_use]
    pub fn generate(auto_approve: bool) -> IssuedToken {
        let mut token_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut token_bytes);
        let plaintext = hex::encode(token_bytes);

        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);

        let record = BootstrapToken {
            id: Uuid::new_v4(),
            salt: hex::encode(salt),
            hash: hash_token(&salt, &plaintext),
            enabled: true,
            auto_approve,
            created_at: Utc::now(),
        };

        IssuedToken { record, plaintext }
    }

    /// Returns `true` when the presented plaintext matches the stored hash.
    ///
    /// A disabled token never matches.
    #[must_use]
    pub fn matches(&self, presented: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let Ok(salt) = hex::decode(&self.salt) else {
            return false;
        };
        constant_time_eq(&hash_token(&salt, presented), &self.hash)
    }
}

fn hash_token(salt: &[u8], plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

// Comparison over fixed-length hex digests; avoids early exit on mismatch.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
