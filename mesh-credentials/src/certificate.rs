//! Signed per-node certificates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mesh_primitives::{AgentId, CapabilitySet, CertificateSerial};

use crate::error::{CredentialError, CredentialResult};

/// Immutable certificate binding a node identity to its public key.
///
/// The signature covers the canonical JSON serialization of every field
/// except `signature` itself, signed by the issuing server's Ed25519 key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    /// Unique serial assigned at issuance.
    pub serial: CertificateSerial,
    /// Node the certificate was issued to.
    pub node_id: AgentId,
    /// Hex-encoded Ed25519 public key of the node.
    pub public_key: String,
    /// Identifier of the issuing server (hex-encoded verifying key).
    pub server_id: String,
    /// Capabilities granted at enrollment approval.
    pub capabilities_granted: CapabilitySet,
    /// Start of the validity window.
    pub issued_at: DateTime<Utc>,
    /// End of the validity window.
    pub expires_at: DateTime<Utc>,
    /// Hex-encoded server signature over the canonical payload.
    pub signature: String,
}

impl Certificate {
    /// Returns the canonical byte payload covered by the signature.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] when the record cannot be
    /// serialized, which indicates a corrupt field value.
    pub fn signing_payload(&self) -> CredentialResult<Vec<u8>> {
        #[derive(Serialize)]
        struct Payload<'a> {
            serial: CertificateSerial,
            node_id: AgentId,
            public_key: &'a str,
            server_id: &'a str,
            capabilities_granted: &'a CapabilitySet,
            issued_at: DateTime<Utc>,
            expires_at: DateTime<Utc>,
        }

        serde_json::to_vec(&Payload {
            serial: self.serial,
            node_id: self.node_id,
            public_key: &self.public_key,
            server_id: &self.server_id,
            capabilities_granted: &self.capabilities_granted,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        })
        .map_err(|err| CredentialError::Malformed {
            what: "certificate",
            reason: err.to_string(),
        })
    }

    /// Returns `true` when `at` falls inside the validity window.
    #[must_use]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        at >= self.issued_at && at <= self.expires_at
    }
}
