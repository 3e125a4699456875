//! Credential service: key ownership, issuance, validation, revocation.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};

use mesh_primitives::{AgentId, CapabilitySet, CertificateSerial};

use crate::certificate::Certificate;
use crate::error::{CredentialError, CredentialResult};
use crate::keys::{self, ServerIdentity};
use crate::store::{BootstrapTokenStore, CertificateStore, RevocationEntry, RevocationStore};
use crate::token::{BootstrapToken, IssuedToken};

/// Central credential authority for the mesh.
///
/// Owns the server key-pair and fronts the certificate, revocation, and
/// bootstrap token stores. Validation consults the revocation set on every
/// call.
pub struct CredentialService {
    identity: RwLock<Option<ServerIdentity>>,
    certificates: Arc<dyn CertificateStore>,
    revocations: Arc<dyn RevocationStore>,
    tokens: Arc<dyn BootstrapTokenStore>,
}

impl CredentialService {
    /// Creates a service over the supplied stores. Keys are not yet loaded;
    /// call [`CredentialService::initialize_server_keys`] before issuing.
    #[must_use]
    pub fn new(
        certificates: Arc<dyn CertificateStore>,
        revocations: Arc<dyn RevocationStore>,
        tokens: Arc<dyn BootstrapTokenStore>,
    ) -> Self {
        Self {
            identity: RwLock::new(None),
            certificates,
            revocations,
            tokens,
        }
    }

    /// Generates the server key-pair if it does not already exist.
    ///
    /// Idempotent: subsequent calls return the existing server id.
    pub async fn initialize_server_keys(&self) -> String {
        let mut guard = self.identity.write().await;
        if let Some(identity) = guard.as_ref() {
            return identity.server_id().to_string();
        }
        let identity = ServerIdentity::generate();
        let server_id = identity.server_id().to_string();
        *guard = Some(identity);
        server_id
    }

    /// Installs a previously persisted key-pair instead of generating one.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] when the secret bytes are not a
    /// valid Ed25519 key.
    pub async fn install_server_keys(&self, secret_bytes: &[u8]) -> CredentialResult<String> {
        let identity = ServerIdentity::from_secret_bytes(secret_bytes)?;
        let server_id = identity.server_id().to_string();
        *self.identity.write().await = Some(identity);
        Ok(server_id)
    }

    /// Issues a signed certificate for a node.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::KeysUninitialized`] before key
    /// initialization, or [`CredentialError::Malformed`] for an undecodable
    /// node public key.
    pub async fn issue_certificate(
        &self,
        node_id: AgentId,
        public_key_hex: &str,
        capabilities: CapabilitySet,
        validity: Duration,
    ) -> CredentialResult<Certificate> {
        keys::decode_public_key(public_key_hex)?;

        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CredentialError::KeysUninitialized)?;

        let issued_at = Utc::now();
        let mut certificate = Certificate {
            serial: CertificateSerial::random(),
            node_id,
            public_key: public_key_hex.to_string(),
            server_id: identity.server_id().to_string(),
            capabilities_granted: capabilities,
            issued_at,
            expires_at: issued_at + validity,
            signature: String::new(),
        };
        certificate.signature = identity.sign(&certificate.signing_payload()?);
        drop(guard);

        self.certificates.put(certificate.clone()).await?;
        info!(
            node_id = %node_id,
            serial = %certificate.serial,
            expires_at = %certificate.expires_at,
            "certificate issued"
        );
        Ok(certificate)
    }

    /// Validates a presented certificate, returning the node id it binds.
    ///
    /// A certificate is valid iff its signature verifies under the server
    /// key, the current time falls inside the validity window, the issuer is
    /// this server, and its serial is not revoked.
    ///
    /// # Errors
    ///
    /// Returns the specific [`CredentialError`] describing the failed check.
    pub async fn validate_certificate(
        &self,
        certificate: &Certificate,
    ) -> CredentialResult<AgentId> {
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CredentialError::KeysUninitialized)?;

        if certificate.server_id != identity.server_id() {
            return Err(CredentialError::WrongIssuer {
                expected: identity.server_id().to_string(),
                found: certificate.server_id.clone(),
            });
        }

        identity.verify_own(&certificate.signing_payload()?, &certificate.signature)?;
        drop(guard);

        if !certificate.is_valid_at(Utc::now()) {
            return Err(CredentialError::Expired);
        }

        if self.revocations.is_revoked(certificate.serial).await? {
            warn!(
                node_id = %certificate.node_id,
                serial = %certificate.serial,
                "revoked certificate presented"
            );
            return Err(CredentialError::Revoked {
                node_id: certificate.node_id,
            });
        }

        Ok(certificate.node_id)
    }

    /// Revokes every certificate issued to a node.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn revoke(
        &self,
        node_id: AgentId,
        reason: impl Into<String>,
        actor: impl Into<String>,
    ) -> CredentialResult<()> {
        let reason = reason.into();
        let actor = actor.into();
        for certificate in self.certificates.all().await? {
            if certificate.node_id != node_id {
                continue;
            }
            self.revocations
                .revoke(RevocationEntry {
                    serial: certificate.serial,
                    node_id,
                    reason: reason.clone(),
                    actor: actor.clone(),
                    revoked_at: Utc::now(),
                })
                .await?;
        }
        info!(node_id = %node_id, actor = %actor, reason = %reason, "certificates revoked");
        Ok(())
    }

    /// Lists the revocation set.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_revoked(&self) -> CredentialResult<Vec<RevocationEntry>> {
        self.revocations.all().await
    }

    /// Returns the most recently issued certificate for a node, if any.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn node_certificate(&self, node_id: AgentId) -> CredentialResult<Option<Certificate>> {
        self.certificates.get_by_node(node_id).await
    }

    /// Lists every issued certificate.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn list_certificates(&self) -> CredentialResult<Vec<Certificate>> {
        self.certificates.all().await
    }

    /// Signs a challenge nonce with the server key.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::KeysUninitialized`] before key
    /// initialization.
    pub async fn sign_challenge(&self, nonce: &[u8]) -> CredentialResult<String> {
        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CredentialError::KeysUninitialized)?;
        Ok(identity.sign(nonce))
    }

    /// Verifies a node's signature over arbitrary data.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Malformed`] or
    /// [`CredentialError::InvalidSignature`].
    pub fn verify_node_signature(
        &self,
        public_key_hex: &str,
        data: &[u8],
        signature_hex: &str,
    ) -> CredentialResult<()> {
        keys::verify_node_signature(public_key_hex, data, signature_hex)
    }

    /// Regenerates the bootstrap token, invalidating any prior token.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn regenerate_bootstrap_token(
        &self,
        auto_approve: bool,
    ) -> CredentialResult<IssuedToken> {
        let issued = BootstrapToken::generate(auto_approve);
        self.tokens.put(issued.record.clone()).await?;
        info!(token_id = %issued.record.id, auto_approve, "bootstrap token regenerated");
        Ok(issued)
    }

    /// Returns the current bootstrap token record, if any.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn bootstrap_token(&self) -> CredentialResult<Option<BootstrapToken>> {
        self.tokens.get().await
    }

    /// Enables or disables bootstrap enrollment.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::BootstrapDisabled`] when no token exists.
    pub async fn set_bootstrap_enabled(&self, enabled: bool) -> CredentialResult<()> {
        let mut token = self
            .tokens
            .get()
            .await?
            .ok_or(CredentialError::BootstrapDisabled)?;
        token.enabled = enabled;
        self.tokens.put(token).await
    }

    /// Toggles inline approval for bootstrap enrollments.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::BootstrapDisabled`] when no token exists.
    pub async fn set_bootstrap_auto_approve(&self, auto_approve: bool) -> CredentialResult<()> {
        let mut token = self
            .tokens
            .get()
            .await?
            .ok_or(CredentialError::BootstrapDisabled)?;
        token.auto_approve = auto_approve;
        self.tokens.put(token).await
    }

    /// Checks a presented bootstrap token, returning the matching record.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::BootstrapDisabled`] when no enabled token
    /// exists or [`CredentialError::InvalidToken`] on hash mismatch.
    pub async fn verify_bootstrap_token(&self, presented: &str) -> CredentialResult<BootstrapToken> {
        let token = self
            .tokens
            .get()
            .await?
            .filter(|t| t.enabled)
            .ok_or(CredentialError::BootstrapDisabled)?;
        if !token.matches(presented) {
            return Err(CredentialError::InvalidToken);
        }
        Ok(token)
    }
}
