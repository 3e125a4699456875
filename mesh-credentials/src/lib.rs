//! Credential store for the mesh orchestrator.
//!
//! Owns the server Ed25519 key-pair, issues and validates per-node
//! certificates, maintains the revocation set, and manages the singleton
//! bootstrap token used for trust-on-first-use enrollment.

#![warn(missing_docs, clippy::pedantic)]

mod certificate;
mod error;
mod keys;
mod service;
mod store;
mod token;

/// Signed per-node certificate record.
pub use certificate::Certificate;
/// Error type and result alias for credential operations.
pub use error::{CredentialError, CredentialResult};
/// Server identity and key-pair management.
pub use keys::ServerIdentity;
/// Credential service combining keys, certificate stores, and revocation.
pub use service::CredentialService;
/// Persistence traits and in-memory implementations.
pub use store::{
    BootstrapTokenStore, CertificateStore, InMemoryBootstrapTokenStore, InMemoryCertificateStore,
    InMemoryRevocationStore, RevocationEntry, RevocationStore,
};
/// Singleton bootstrap token record.
pub use token::{BootstrapToken, IssuedToken};
