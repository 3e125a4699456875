//! Persistence for enrollment requests and the node block list.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use mesh_primitives::{AgentId, EnrollmentId};

use crate::error::EnrollResult;
use crate::request::{EnrollmentRequest, EnrollmentStatus};

/// Storage backend for enrollment requests and blocked nodes.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Persists a new request.
    async fn put(&self, request: EnrollmentRequest) -> EnrollResult<()>;

    /// Returns the request with the given identifier, if any.
    async fn get(&self, enrollment_id: EnrollmentId) -> EnrollResult<Option<EnrollmentRequest>>;

    /// Updates the status of an existing request.
    async fn set_status(
        &self,
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    ) -> EnrollResult<()>;

    /// Lists requests with the given status.
    async fn list_by_status(&self, status: EnrollmentStatus)
    -> EnrollResult<Vec<EnrollmentRequest>>;

    /// Adds a node to the persistent block list.
    async fn block(&self, node_id: AgentId) -> EnrollResult<()>;

    /// Returns `true` when the node is blocked.
    async fn is_blocked(&self, node_id: AgentId) -> EnrollResult<bool>;
}

/// In-memory enrollment store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryEnrollmentStore {
    requests: RwLock<HashMap<EnrollmentId, EnrollmentRequest>>,
    blocked: RwLock<HashSet<AgentId>>,
}

#[async_trait]
impl EnrollmentStore for InMemoryEnrollmentStore {
    async fn put(&self, request: EnrollmentRequest) -> EnrollResult<()> {
        self.requests
            .write()
            .await
            .insert(request.enrollment_id, request);
        Ok(())
    }

    async fn get(&self, enrollment_id: EnrollmentId) -> EnrollResult<Option<EnrollmentRequest>> {
        Ok(self.requests.read().await.get(&enrollment_id).cloned())
    }

    async fn set_status(
        &self,
        enrollment_id: EnrollmentId,
        status: EnrollmentStatus,
    ) -> EnrollResult<()> {
        if let Some(request) = self.requests.write().await.get_mut(&enrollment_id) {
            request.status = status;
        }
        Ok(())
    }

    async fn list_by_status(
        &self,
        status: EnrollmentStatus,
    ) -> EnrollResult<Vec<EnrollmentRequest>> {
        Ok(self
            .requests
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn block(&self, node_id: AgentId) -> EnrollResult<()> {
        self.blocked.write().await.insert(node_id);
        Ok(())
    }

    async fn is_blocked(&self, node_id: AgentId) -> EnrollResult<bool> {
        Ok(self.blocked.read().await.contains(&node_id))
    }
}
