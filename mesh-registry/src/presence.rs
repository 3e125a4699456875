//! The in-memory presence table.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use mesh_primitives::{AgentDescriptor, AgentId, AgentStatus, CapabilityId, ConnectionId};

use crate::status::{AgentEvent, transition};
use crate::store::{AgentStore, InMemoryAgentStore};
use crate::{RegistryError, RegistryResult};

#[derive(Debug)]
struct AgentEntry {
    descriptor: AgentDescriptor,
    status: AgentStatus,
    connection_id: Option<ConnectionId>,
    last_heartbeat: DateTime<Utc>,
}

/// A consistent point-in-time view of one presence entry.
#[derive(Clone, Debug)]
pub struct AgentSnapshot {
    /// Registration-time identity and advertisement.
    pub descriptor: AgentDescriptor,
    /// Current lifecycle status.
    pub status: AgentStatus,
    /// Live connection, present iff the status implies one.
    pub connection_id: Option<ConnectionId>,
    /// Time of the most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentSnapshot {
    fn from_entry(entry: &AgentEntry) -> Self {
        Self {
            descriptor: entry.descriptor.clone(),
            status: entry.status,
            connection_id: entry.connection_id,
            last_heartbeat: entry.last_heartbeat,
        }
    }
}

/// Presence change notifications emitted by the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PresenceEvent {
    /// An agent registered (or re-registered) under a live connection.
    Registered(AgentId),
    /// An agent's heartbeats were lost or its session closed.
    Disconnected(AgentId),
    /// An agent was removed from the table entirely.
    Unregistered(AgentId),
}

/// Concurrent presence table keyed by agent id with a connection index.
///
/// Readers see consistent per-agent snapshots; cross-agent reads are not
/// atomic. Status changes go through the transition table in
/// [`crate::status`]. Registrations are persisted through the injected
/// [`AgentStore`] before the table changes.
pub struct AgentRegistry {
    store: Arc<dyn AgentStore>,
    agents: DashMap<AgentId, AgentEntry>,
    connections: DashMap<ConnectionId, AgentId>,
    events: broadcast::Sender<PresenceEvent>,
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("store", &"dyn AgentStore")
            .field("agents", &self.agents.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl AgentRegistry {
    /// Creates an empty registry over the supplied store.
    #[must_use]
    pub fn new(store: Arc<dyn AgentStore>) -> Self {
        Self {
            store,
            agents: DashMap::new(),
            connections: DashMap::new(),
            events: broadcast::channel(256).0,
        }
    }

    /// Creates a registry backed by an in-memory store, for development
    /// and tests.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryAgentStore::default()))
    }

    /// Subscribes to presence change notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Registers an agent under a live connection, replacing any previous
    /// presence entry for the same agent id.
    ///
    /// The record is persisted before the presence table changes, so a
    /// store failure leaves the table untouched. A fresh entry starts at
    /// `Created` and walks the bootstrap path to `Ready` through the
    /// transition table. A re-registration after a disconnect restores
    /// presence the same way; work that was already reassigned stays where
    /// it went.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn register(
        &self,
        descriptor: AgentDescriptor,
        connection_id: ConnectionId,
    ) -> RegistryResult<()> {
        let agent_id = descriptor.id();
        self.store.put(descriptor.clone()).await?;

        if let Some(previous) = self.agents.get(&agent_id) {
            if let Some(old_connection) = previous.connection_id {
                self.connections.remove(&old_connection);
            }
            info!(agent_id = %agent_id, "agent re-registered");
        } else {
            info!(agent_id = %agent_id, name = %descriptor.name(), "agent registered");
        }

        self.agents.insert(
            agent_id,
            AgentEntry {
                descriptor,
                status: AgentStatus::Created,
                connection_id: Some(connection_id),
                last_heartbeat: Utc::now(),
            },
        );
        self.connections.insert(connection_id, agent_id);

        // Bring the entry up through the lifecycle table.
        if let Some(mut entry) = self.agents.get_mut(&agent_id) {
            for event in [AgentEvent::Initialize, AgentEvent::Initialized] {
                if let Some(next) = transition(entry.status, event) {
                    debug!(agent_id = %agent_id, from = ?entry.status, to = ?next, ?event, "agent status transition");
                    entry.status = next;
                }
            }
        }

        let _ = self.events.send(PresenceEvent::Registered(agent_id));
        Ok(())
    }

    /// Removes an agent from the table and the store entirely.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] when no entry exists, or
    /// propagates store failures (in which case presence is kept).
    pub async fn unregister(&self, agent_id: AgentId) -> RegistryResult<()> {
        if !self.agents.contains_key(&agent_id) {
            return Err(RegistryError::UnknownAgent { agent_id });
        }
        self.store.remove(agent_id).await?;

        let Some((_, entry)) = self.agents.remove(&agent_id) else {
            return Ok(());
        };
        if let Some(connection_id) = entry.connection_id {
            self.connections.remove(&connection_id);
        }
        info!(agent_id = %agent_id, "agent unregistered");
        let _ = self.events.send(PresenceEvent::Unregistered(agent_id));
        Ok(())
    }

    /// Records a heartbeat timestamp for an agent.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] when no entry exists.
    pub fn update_heartbeat(&self, agent_id: AgentId, at: DateTime<Utc>) -> RegistryResult<()> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::UnknownAgent { agent_id })?;
        entry.last_heartbeat = at;
        Ok(())
    }

    /// Applies a status event to an agent.
    ///
    /// Returns the new status. Dropping out of a connected status clears
    /// the connection index entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownAgent`] for a missing entry or
    /// [`RegistryError::InvalidTransition`] when the event is not permitted
    /// from the current status.
    pub fn update_status(
        &self,
        agent_id: AgentId,
        event: AgentEvent,
    ) -> RegistryResult<AgentStatus> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or(RegistryError::UnknownAgent { agent_id })?;

        let Some(next) = transition(entry.status, event) else {
            return Err(RegistryError::InvalidTransition {
                agent_id,
                from: entry.status,
                event,
            });
        };

        if next != entry.status {
            debug!(agent_id = %agent_id, from = ?entry.status, to = ?next, ?event, "agent status transition");
            entry.status = next;
        }

        if !next.is_connected() {
            if let Some(connection_id) = entry.connection_id.take() {
                self.connections.remove(&connection_id);
            }
        }

        Ok(next)
    }

    /// Marks an agent disconnected, returning `true` when the status
    /// actually changed.
    ///
    /// Unlike [`AgentRegistry::update_status`] this treats a redundant event
    /// as a no-op, because the monitor and an explicit unregister can race.
    pub fn mark_disconnected(&self, agent_id: AgentId) -> bool {
        let Some(mut entry) = self.agents.get_mut(&agent_id) else {
            return false;
        };
        let Some(next) = transition(entry.status, AgentEvent::HeartbeatLost) else {
            return false;
        };
        warn!(agent_id = %agent_id, from = ?entry.status, "agent heartbeat lost");
        entry.status = next;
        if let Some(connection_id) = entry.connection_id.take() {
            self.connections.remove(&connection_id);
        }
        let _ = self.events.send(PresenceEvent::Disconnected(agent_id));
        true
    }

    /// Returns a snapshot of one agent.
    #[must_use]
    pub fn get(&self, agent_id: AgentId) -> Option<AgentSnapshot> {
        self.agents
            .get(&agent_id)
            .map(|entry| AgentSnapshot::from_entry(&entry))
    }

    /// Resolves a connection to its agent snapshot.
    #[must_use]
    pub fn get_by_connection(&self, connection_id: ConnectionId) -> Option<AgentSnapshot> {
        let agent_id = *self.connections.get(&connection_id)?;
        self.get(agent_id)
    }

    /// Returns snapshots of every agent advertising the capability.
    #[must_use]
    pub fn get_by_capability(&self, capability: &CapabilityId) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .filter(|entry| entry.descriptor.capability_set().contains(capability))
            .map(|entry| AgentSnapshot::from_entry(&entry))
            .collect()
    }

    /// Returns snapshots of every agent tagged with the group.
    #[must_use]
    pub fn get_by_group(&self, group: &str) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .filter(|entry| entry.descriptor.group() == Some(group))
            .map(|entry| AgentSnapshot::from_entry(&entry))
            .collect()
    }

    /// Returns snapshots of every agent in the table.
    #[must_use]
    pub fn all(&self) -> Vec<AgentSnapshot> {
        self.agents
            .iter()
            .map(|entry| AgentSnapshot::from_entry(&entry))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_primitives::{Capability, CapabilityId};

    fn descriptor(name: &str, capability: &str) -> AgentDescriptor {
        AgentDescriptor::builder(AgentId::random())
            .name(name)
            .unwrap()
            .version("0.1.0")
            .unwrap()
            .capabilities(vec![
                Capability::new(CapabilityId::new(capability).unwrap(), "1.0").unwrap(),
            ])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn register_and_query() {
        let registry = AgentRegistry::in_memory();
        let descriptor = descriptor("worker", "gpu");
        let agent_id = descriptor.id();
        let connection_id = ConnectionId::random();

        registry.register(descriptor, connection_id).await.unwrap();

        let snapshot = registry.get(agent_id).expect("present");
        assert_eq!(snapshot.status, AgentStatus::Ready);
        assert_eq!(snapshot.connection_id, Some(connection_id));
        assert_eq!(
            registry
                .get_by_connection(connection_id)
                .expect("indexed")
                .descriptor
                .id(),
            agent_id
        );
        assert_eq!(
            registry
                .get_by_capability(&CapabilityId::new("gpu").unwrap())
                .len(),
            1
        );
        assert!(
            registry
                .get_by_capability(&CapabilityId::new("tpu").unwrap())
                .is_empty()
        );
    }

    #[tokio::test]
    async fn registration_persists_to_store() {
        let store = Arc::new(InMemoryAgentStore::default());
        let registry = AgentRegistry::new(Arc::clone(&store) as Arc<dyn AgentStore>);
        let descriptor = descriptor("worker", "gpu");
        let agent_id = descriptor.id();

        registry
            .register(descriptor, ConnectionId::random())
            .await
            .unwrap();
        assert!(store.get(agent_id).await.unwrap().is_some());
        assert_eq!(store.all().await.unwrap().len(), 1);

        registry.unregister(agent_id).await.unwrap();
        assert!(store.get(agent_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_agent_cannot_unregister() {
        let registry = AgentRegistry::in_memory();
        let err = registry
            .unregister(AgentId::random())
            .await
            .expect_err("nothing registered");
        assert!(matches!(err, RegistryError::UnknownAgent { .. }));
    }

    #[tokio::test]
    async fn disconnect_clears_connection_index() {
        let registry = AgentRegistry::in_memory();
        let descriptor = descriptor("worker", "cpu");
        let agent_id = descriptor.id();
        let connection_id = ConnectionId::random();
        registry.register(descriptor, connection_id).await.unwrap();

        assert!(registry.mark_disconnected(agent_id));
        assert!(!registry.mark_disconnected(agent_id));

        let snapshot = registry.get(agent_id).expect("present");
        assert_eq!(snapshot.status, AgentStatus::Disconnected);
        assert!(snapshot.connection_id.is_none());
        assert!(registry.get_by_connection(connection_id).is_none());
    }

    #[tokio::test]
    async fn reregistration_restores_presence() {
        let registry = AgentRegistry::in_memory();
        let descriptor = descriptor("worker", "cpu");
        let agent_id = descriptor.id();
        registry
            .register(descriptor.clone(), ConnectionId::random())
            .await
            .unwrap();
        registry.mark_disconnected(agent_id);

        let new_connection = ConnectionId::random();
        registry.register(descriptor, new_connection).await.unwrap();
        let snapshot = registry.get(agent_id).expect("present");
        assert_eq!(snapshot.status, AgentStatus::Ready);
        assert_eq!(snapshot.connection_id, Some(new_connection));
    }

    #[tokio::test]
    async fn invalid_status_event_is_rejected() {
        let registry = AgentRegistry::in_memory();
        let descriptor = descriptor("worker", "cpu");
        let agent_id = descriptor.id();
        registry
            .register(descriptor, ConnectionId::random())
            .await
            .unwrap();

        let err = registry
            .update_status(agent_id, AgentEvent::Resume)
            .expect_err("resume from ready is illegal");
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn group_queries() {
        let registry = AgentRegistry::in_memory();
        let descriptor = AgentDescriptor::builder(AgentId::random())
            .name("grouped")
            .unwrap()
            .version("0.1.0")
            .unwrap()
            .group("batch")
            .unwrap()
            .build()
            .unwrap();
        registry
            .register(descriptor, ConnectionId::random())
            .await
            .unwrap();

        assert_eq!(registry.get_by_group("batch").len(), 1);
        assert!(registry.get_by_group("other").is_empty());
    }
}
