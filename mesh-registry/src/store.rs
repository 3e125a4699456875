//! Persistence trait for agent records.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use mesh_primitives::{AgentDescriptor, AgentId};

use crate::RegistryResult;

/// Durable storage for agent registrations.
///
/// The presence table is authoritative while the server runs; the store
/// exists so registrations survive restarts and so durable backends can be
/// swapped in.
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Persists or replaces an agent record.
    async fn put(&self, descriptor: AgentDescriptor) -> RegistryResult<()>;

    /// Returns the record for an agent, if any.
    async fn get(&self, agent_id: AgentId) -> RegistryResult<Option<AgentDescriptor>>;

    /// Removes an agent record.
    async fn remove(&self, agent_id: AgentId) -> RegistryResult<()>;

    /// Lists every stored record.
    async fn all(&self) -> RegistryResult<Vec<AgentDescriptor>>;
}

/// In-memory agent store for development and tests.
#[derive(Debug, Default)]
pub struct InMemoryAgentStore {
    inner: RwLock<HashMap<AgentId, AgentDescriptor>>,
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn put(&self, descriptor: AgentDescriptor) -> RegistryResult<()> {
        self.inner.write().await.insert(descriptor.id(), descriptor);
        Ok(())
    }

    async fn get(&self, agent_id: AgentId) -> RegistryResult<Option<AgentDescriptor>> {
        Ok(self.inner.read().await.get(&agent_id).cloned())
    }

    async fn remove(&self, agent_id: AgentId) -> RegistryResult<()> {
        self.inner.write().await.remove(&agent_id);
        Ok(())
    }

    async fn all(&self) -> RegistryResult<Vec<AgentDescriptor>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }
}
