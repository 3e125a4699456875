//! Persistence traits for credential artifacts with in-memory implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use mesh_primitives::{AgentId, CertificateSerial};

use crate::certificate::Certificate;
use crate::error::CredentialResult;
use crate::token::BootstrapToken;

/// Storage backend for issued certificates.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Persists a newly issued certificate.
    async fn put(&self, certificate: Certificate) -> CredentialResult<()>;

    /// Returns the certificate with the given serial, if any.
    async fn get(&self, serial: CertificateSerial) -> CredentialResult<Option<Certificate>>;

    /// Returns the most recently issued certificate for a node, if any.
    async fn get_by_node(&self, node_id: AgentId) -> CredentialResult<Option<Certificate>>;

    /// Lists every stored certificate.
    async fn all(&self) -> CredentialResult<Vec<Certificate>>;
}

/// A revocation entry.
#[derive(Clone, Debug)]
pub struct RevocationEntry {
    /// Serial of the revoked certificate.
    pub serial: CertificateSerial,
    /// Node the certificate belonged to.
    pub node_id: AgentId,
    /// Operator-supplied reason.
    pub reason: String,
    /// Actor that performed the revocation.
    pub actor: String,
    /// Time of revocation.
    pub revoked_at: DateTime<Utc>,
}

/// Storage backend for the revocation set. Checked on every validation.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Adds an entry to the revocation set. Idempotent per serial.
    async fn revoke(&self, entry: RevocationEntry) -> CredentialResult<()>;

    /// Returns `true` when the serial has been revoked.
    async fn is_revoked(&self, serial: CertificateSerial) -> CredentialResult<bool>;

    /// Lists all revocation entries.
    async fn all(&self) -> CredentialResult<Vec<RevocationEntry>>;
}

/// Storage for the singleton bootstrap token record.
#[async_trait]
pub trait BootstrapTokenStore: Send + Sync {
    /// Returns the current token record, if one exists.
    async fn get(&self) -> CredentialResult<Option<BootstrapToken>>;

    /// Replaces the token record wholesale.
    async fn put(&self, token: BootstrapToken) -> CredentialResult<()>;
}

/// In-memory certificate store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryCertificateStore {
    inner: RwLock<HashMap<CertificateSerial, Certificate>>,
}

#[async_trait]
impl CertificateStore for InMemoryCertificateStore {
    async fn put(&self, certificate: Certificate) -> CredentialResult<()> {
        self.inner
            .write()
            .await
            .insert(certificate.serial, certificate);
        Ok(())
    }

    async fn get(&self, serial: CertificateSerial) -> CredentialResult<Option<Certificate>> {
        Ok(self.inner.read().await.get(&serial).cloned())
    }

    async fn get_by_node(&self, node_id: AgentId) -> CredentialResult<Option<Certificate>> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|c| c.node_id == node_id)
            .max_by_key(|c| c.issued_at)
            .cloned())
    }

    async fn all(&self) -> CredentialResult<Vec<Certificate>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}

/// In-memory revocation store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryRevocationStore {
    inner: RwLock<HashMap<CertificateSerial, RevocationEntry>>,
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn revoke(&self, entry: RevocationEntry) -> CredentialResult<()> {
        self.inner.write().await.entry(entry.serial).or_insert(entry);
        Ok(())
    }

    async fn is_revoked(&self, serial: CertificateSerial) -> CredentialResult<bool> {
        Ok(self.inner.read().await.contains_key(&serial))
    }

    async fn all(&self) -> CredentialResult<Vec<RevocationEntry>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}

/// In-memory bootstrap token store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryBootstrapTokenStore {
    inner: RwLock<Option<BootstrapToken>>,
}

#[async_trait]
impl BootstrapTokenStore for InMemoryBootstrapTokenStore {
    async fn get(&self) -> CredentialResult<Option<BootstrapToken>> {
        Ok(self.inner.read().await.clone())
    }

    async fn put(&self, token: BootstrapToken) -> CredentialResult<()> {
        *self.inner.write().await = Some(token);
        Ok(())
    }
}
