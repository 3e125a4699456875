//! Server identity and Ed25519 key-pair management.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use tracing::info;

use crate::error::{CredentialError, CredentialResult};

/// The server's signing identity.
///
/// The key-pair is owned by the credential store, never held in process-wide
/// state. `server_id` is the hex encoding of the verifying key, which lets
/// any holder of a certificate check the issuer without extra lookups.
#[derive(Debug)]
pub struct ServerIdentity {
    signing_key: SigningKey,
    server_id: String,
}

impl ServerIdentity {
    /// Generates a fresh key-pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let server_id = hex::encode(signing_key.verifying_key().as_bytes());
        info!(server_id = %server_id, "server key-pair generated");
        Self {
            signing_key,
            server_id,
        }
    }

    /// Restores an identity from stored secret key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] when the byte slice is not a
    /// valid Ed25519 secret key.
    pub fn from_secret_bytes(bytes: &[u8]) -> CredentialResult<Self> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| CredentialError::Malformed {
            what: "key",
            reason: "secret key must be 32 bytes".into(),
        })?;
        let signing_key = SigningKey::from_bytes(&secret);
        let server_id = hex::encode(signing_key.verifying_key().as_bytes());
        Ok(Self {
            signing_key,
            server_id,
        })
    }

    /// Returns the server identifier (hex-encoded verifying key).
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Returns the secret key bytes for persistence.
    #[must_use]
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Signs arbitrary bytes, returning the hex-encoded signature.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing_key.sign(data).to_bytes())
    }

    /// Verifies a hex-encoded signature against this server's key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] for undecodable input or
    /// [`CredentialError::InvalidSignature`] when verification fails.
    pub fn verify_own(&self, data: &[u8], signature_hex: &str) -> CredentialResult<()> {
        let verifying_key = self.signing_key.verifying_key();
        verify_with(&verifying_key, data, signature_hex)
    }
}

/// Verifies a hex-encoded signature under a hex-encoded public key.
///
/// # Errors
///
/// Returns [`CredentialError::Malformed`] when the key or signature cannot be
/// decoded, or [`CredentialError::InvalidSignature`] when verification fails.
pub(crate) fn verify_node_signature(
    public_key_hex: &str,
    data: &[u8],
    signature_hex: &str,
) -> CredentialResult<()> {
    let key = decode_public_key(public_key_hex)?;
    verify_with(&key, data, signature_hex)
}

pub(crate) fn decode_public_key(public_key_hex: &str) -> CredentialResult<VerifyingKey> {
    let bytes = hex::decode(public_key_hex).map_err(|err| CredentialError::Malformed {
        what: "key",
        reason: err.to_string(),
    })?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CredentialError::Malformed {
            what: "key",
            reason: "public key must be 32 bytes".into(),
        })?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| CredentialError::Malformed {
        what: "key",
        reason: err.to_string(),
    })
}

fn verify_with(key: &VerifyingKey, data: &[u8], signature_hex: &str) -> CredentialResult<()> {
    let bytes = hex::decode(signature_hex).map_err(|err| CredentialError::Malformed {
        what: "signature",
        reason: err.to_string(),
    })?;
    let bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CredentialError::Malformed {
            what: "signature",
            reason: "signature must be 64 bytes".into(),
        })?;
    let signature = Signature::from_bytes(&bytes);
    key.verify(data, &signature)
        .map_err(|_| CredentialError::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = ServerIdentity::generate();
        let signature = identity.sign(b"challenge");
        identity.verify_own(b"challenge", &signature).expect("verify");
        assert!(identity.verify_own(b"tampered", &signature).is_err());
    }

    #[test]
    fn restore_from_secret_bytes() {
        let identity = ServerIdentity::generate();
        let restored = ServerIdentity::from_secret_bytes(&identity.secret_bytes()).expect("restore");
        assert_eq!(identity.server_id(), restored.server_id());
    }

    #[test]
    fn node_signature_verification() {
        let node_key = SigningKey::generate(&mut OsRng);
        let public_key_hex = hex::encode(node_key.verifying_key().as_bytes());
        let signature_hex = hex::encode(node_key.sign(b"payload").to_bytes());

        verify_node_signature(&public_key_hex, b"payload", &signature_hex).expect("valid");
        assert!(verify_node_signature(&public_key_hex, b"other", &signature_hex).is_err());
        assert!(verify_node_signature("zz", b"payload", &signature_hex).is_err());
    }
}
