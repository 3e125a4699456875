//! Enrollment service: bootstrap admission, approval queue, expiry sweep.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use mesh_credentials::{Certificate, CredentialError, CredentialService};
use mesh_primitives::{CapabilitySet, EnrollmentId};

use crate::error::{EnrollError, EnrollResult};
use crate::request::{EnrollmentRequest, EnrollmentStatus, EnrollmentSubmission};
use crate::store::EnrollmentStore;

/// Outcome of a bootstrap enrollment submission.
#[derive(Debug)]
pub enum EnrollmentOutcome {
    /// Recorded and awaiting an admin decision; the session stays restricted.
    Pending(EnrollmentId),
    /// Approved inline because the bootstrap token has auto-approve set.
    Approved {
        /// The recorded request identifier.
        enrollment_id: EnrollmentId,
        /// Certificate issued to the node.
        certificate: Certificate,
    },
}

/// Snapshot returned by status checks.
#[derive(Debug)]
pub struct StatusReport {
    /// Current decision state.
    pub status: EnrollmentStatus,
    /// Issued certificate, present once approved.
    pub certificate: Option<Certificate>,
}

/// Coordinates trust-on-first-use admission of new nodes.
pub struct EnrollmentService {
    store: Arc<dyn EnrollmentStore>,
    credentials: Arc<CredentialService>,
    certificate_validity: Duration,
    enrollment_ttl: Duration,
}

impl EnrollmentService {
    /// Creates a service over the supplied store and credential authority.
    #[must_use]
    pub fn new(
        store: Arc<dyn EnrollmentStore>,
        credentials: Arc<CredentialService>,
        certificate_validity: Duration,
        enrollment_ttl: Duration,
    ) -> Self {
        Self {
            store,
            credentials,
            certificate_validity,
            enrollment_ttl,
        }
    }

    /// Handles a node's enrollment submission on the bootstrap path.
    ///
    /// Validates the presented bootstrap token, rejects blocked nodes,
    /// verifies the node's proof-of-possession signature, records the
    /// request, and approves inline when the token carries auto-approve.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError::BootstrapDisabled`], [`EnrollError::NodeBlocked`],
    /// or [`EnrollError::InvalidSignature`] for the respective admission
    /// failures.
    pub async fn request_enrollment(
        &self,
        bootstrap_token: &str,
        submission: EnrollmentSubmission,
    ) -> EnrollResult<EnrollmentOutcome> {
        let token = self
            .credentials
            .verify_bootstrap_token(bootstrap_token)
            .await
            .map_err(|err| match err {
                CredentialError::BootstrapDisabled => EnrollError::BootstrapDisabled,
                other => EnrollError::from(other),
            })?;

        if self.store.is_blocked(submission.node_id).await? {
            warn!(node_id = %submission.node_id, "blocked node attempted enrollment");
            return Err(EnrollError::NodeBlocked {
                node_id: submission.node_id,
            });
        }

        self.credentials
            .verify_node_signature(
                &submission.public_key,
                &submission.signing_payload(),
                &submission.signature,
            )
            .map_err(|_| EnrollError::InvalidSignature)?;

        let request = EnrollmentRequest::from_submission(submission);
        let enrollment_id = request.enrollment_id;
        let node_id = request.node_id;
        self.store.put(request).await?;
        info!(enrollment_id = %enrollment_id, node_id = %node_id, "enrollment recorded");

        if token.auto_approve {
            let certificate = self.approve(enrollment_id, None).await?;
            return Ok(EnrollmentOutcome::Approved {
                enrollment_id,
                certificate,
            });
        }

        Ok(EnrollmentOutcome::Pending(enrollment_id))
    }

    /// Returns the decision state of a request, with the certificate once
    /// approved.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError::UnknownEnrollment`] for an unknown identifier.
    pub async fn check_status(&self, enrollment_id: EnrollmentId) -> EnrollResult<StatusReport> {
        let request = self
            .store
            .get(enrollment_id)
            .await?
            .ok_or(EnrollError::UnknownEnrollment { enrollment_id })?;

        let certificate = if request.status == EnrollmentStatus::Approved {
            self.latest_certificate(&request).await?
        } else {
            None
        };

        Ok(StatusReport {
            status: request.status,
            certificate,
        })
    }

    /// Approves a pending request, issuing a certificate for the node.
    ///
    /// `granted` overrides the requested capability set when provided.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError::UnknownEnrollment`] or
    /// [`EnrollError::AlreadyDecided`], or propagates issuance failures.
    pub async fn approve(
        &self,
        enrollment_id: EnrollmentId,
        granted: Option<CapabilitySet>,
    ) -> EnrollResult<Certificate> {
        let request = self.pending_request(enrollment_id).await?;

        let capabilities = granted.unwrap_or_else(|| request.requested_capabilities.clone());
        let certificate = self
            .credentials
            .issue_certificate(
                request.node_id,
                &request.public_key,
                capabilities,
                self.certificate_validity,
            )
            .await?;

        self.store
            .set_status(enrollment_id, EnrollmentStatus::Approved)
            .await?;
        info!(enrollment_id = %enrollment_id, node_id = %request.node_id, "enrollment approved");
        Ok(certificate)
    }

    /// Rejects a pending request, optionally blocking the node permanently.
    ///
    /// # Errors
    ///
    /// Returns [`EnrollError::UnknownEnrollment`] or
    /// [`EnrollError::AlreadyDecided`].
    pub async fn reject(&self, enrollment_id: EnrollmentId, block_future: bool) -> EnrollResult<()> {
        let request = self.pending_request(enrollment_id).await?;

        self.store
            .set_status(enrollment_id, EnrollmentStatus::Rejected)
            .await?;
        if block_future {
            self.store.block(request.node_id).await?;
        }
        info!(
            enrollment_id = %enrollment_id,
            node_id = %request.node_id,
            blocked = block_future,
            "enrollment rejected"
        );
        Ok(())
    }

    /// Lists requests awaiting a decision.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn pending(&self) -> EnrollResult<Vec<EnrollmentRequest>> {
        self.store.list_by_status(EnrollmentStatus::Pending).await
    }

    /// Marks pending requests older than the enrollment TTL as expired.
    ///
    /// Returns the number of requests expired. Intended to run periodically
    /// from the server's housekeeping task.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn expire_overdue(&self) -> EnrollResult<usize> {
        let cutoff = Utc::now() - self.enrollment_ttl;
        let mut expired = 0;
        for request in self.store.list_by_status(EnrollmentStatus::Pending).await? {
            if request.submitted_at < cutoff {
                self.store
                    .set_status(request.enrollment_id, EnrollmentStatus::Expired)
                    .await?;
                expired += 1;
            }
        }
        if expired > 0 {
            info!(expired, "pending enrollments expired");
        }
        Ok(expired)
    }

    async fn pending_request(
        &self,
        enrollment_id: EnrollmentId,
    ) -> EnrollResult<EnrollmentRequest> {
        let request = self
            .store
            .get(enrollment_id)
            .await?
            .ok_or(EnrollError::UnknownEnrollment { enrollment_id })?;

        match request.status {
            EnrollmentStatus::Pending => Ok(request),
            EnrollmentStatus::Expired => Err(EnrollError::Expired { enrollment_id }),
            EnrollmentStatus::Approved | EnrollmentStatus::Rejected => {
                Err(EnrollError::AlreadyDecided { enrollment_id })
            }
        }
    }

    async fn latest_certificate(
        &self,
        request: &EnrollmentRequest,
    ) -> EnrollResult<Option<Certificate>> {
        // The credential service keeps the authoritative copy; the approved
        // request only records that issuance happened.
        Ok(self
            .credentials
            .node_certificate(request.node_id)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEnrollmentStore;
    use ed25519_dalek::{Signer, SigningKey};
    use mesh_credentials::{
        InMemoryBootstrapTokenStore, InMemoryCertificateStore, InMemoryRevocationStore,
    };
    use mesh_primitives::AgentId;
    use rand::rngs::OsRng;

    async fn setup(auto_approve: bool) -> (EnrollmentService, Arc<CredentialService>, String) {
        let credentials = Arc::new(CredentialService::new(
            Arc::new(InMemoryCertificateStore::default()),
            Arc::new(InMemoryRevocationStore::default()),
            Arc::new(InMemoryBootstrapTokenStore::default()),
        ));
        credentials.initialize_server_keys().await;
        let issued = credentials
            .regenerate_bootstrap_token(auto_approve)
            .await
            .expect("token");

        let service = EnrollmentService::new(
            Arc::new(InMemoryEnrollmentStore::default()),
            Arc::clone(&credentials),
            Duration::days(30),
            Duration::hours(24),
        );
        (service, credentials, issued.plaintext)
    }

    fn submission() -> EnrollmentSubmission {
        let key = SigningKey::generate(&mut OsRng);
        let mut submission = EnrollmentSubmission {
            node_id: AgentId::random(),
            node_name: "node-1".into(),
            public_key: hex::encode(key.verifying_key().as_bytes()),
            requested_capabilities: CapabilitySet::new(),
            signature: String::new(),
        };
        submission.signature = hex::encode(key.sign(&submission.signing_payload()).to_bytes());
        submission
    }

    #[tokio::test]
    async fn manual_approval_flow() {
        let (service, credentials, token) = setup(false).await;

        let outcome = service
            .request_enrollment(&token, submission())
            .await
            .expect("enroll");
        let EnrollmentOutcome::Pending(enrollment_id) = outcome else {
            panic!("expected pending outcome");
        };

        let report = service.check_status(enrollment_id).await.expect("status");
        assert_eq!(report.status, EnrollmentStatus::Pending);
        assert!(report.certificate.is_none());

        let certificate = service.approve(enrollment_id, None).await.expect("approve");
        credentials
            .validate_certificate(&certificate)
            .await
            .expect("issued certificate validates");

        let report = service.check_status(enrollment_id).await.expect("status");
        assert_eq!(report.status, EnrollmentStatus::Approved);
        assert!(report.certificate.is_some());
    }

    #[tokio::test]
    async fn auto_approve_issues_inline() {
        let (service, _, token) = setup(true).await;

        let outcome = service
            .request_enrollment(&token, submission())
            .await
            .expect("enroll");
        assert!(matches!(outcome, EnrollmentOutcome::Approved { .. }));
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        let (service, _, _) = setup(false).await;
        let err = service
            .request_enrollment("deadbeef", submission())
            .await
            .expect_err("should fail");
        assert!(matches!(err, EnrollError::Credential(_)));
    }

    #[tokio::test]
    async fn rejection_with_block_stops_reenrollment() {
        let (service, _, token) = setup(false).await;
        let sub = submission();
        let node_id = sub.node_id;

        let EnrollmentOutcome::Pending(enrollment_id) = service
            .request_enrollment(&token, sub.clone())
            .await
            .expect("enroll")
        else {
            panic!("expected pending");
        };

        service.reject(enrollment_id, true).await.expect("reject");

        let err = service
            .request_enrollment(&token, sub)
            .await
            .expect_err("blocked");
        assert!(matches!(err, EnrollError::NodeBlocked { node_id: n } if n == node_id));
    }

    #[tokio::test]
    async fn tampered_submission_rejected() {
        let (service, _, token) = setup(false).await;
        let mut sub = submission();
        sub.node_name = "imposter".into();

        let err = service
            .request_enrollment(&token, sub)
            .await
            .expect_err("bad signature");
        assert!(matches!(err, EnrollError::InvalidSignature));
    }

    #[tokio::test]
    async fn double_decision_rejected() {
        let (service, _, token) = setup(false).await;
        let EnrollmentOutcome::Pending(enrollment_id) = service
            .request_enrollment(&token, submission())
            .await
            .expect("enroll")
        else {
            panic!("expected pending");
        };

        service.approve(enrollment_id, None).await.expect("approve");
        let err = service
            .approve(enrollment_id, None)
            .await
            .expect_err("second decision");
        assert!(matches!(err, EnrollError::AlreadyDecided { .. }));
    }
}
