//! Agent identity and lifecycle status.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{AgentId, Capability, CapabilitySet};

/// Lifecycle status reported for an agent in the presence table.
///
/// Transitions between statuses are owned by the registry's state machine;
/// this enum is shared so the hub and dispatcher can reason about
/// eligibility without depending on the registry crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Record exists but the agent has not begun initialization.
    Created,
    /// Agent is bootstrapping and not yet eligible for work.
    Initializing,
    /// Agent is connected and idle.
    Ready,
    /// Agent is connected and executing at least one job.
    Running,
    /// Agent is connected but temporarily not accepting work.
    Paused,
    /// Agent is draining in-flight work prior to shutdown.
    Stopping,
    /// Agent has shut down cleanly.
    Stopped,
    /// Agent reported an unrecoverable internal failure.
    Faulted,
    /// Heartbeats were lost; in-flight work is being reassigned.
    Disconnected,
}

impl AgentStatus {
    /// Returns `true` when the status implies a live hub connection.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Ready | Self::Running | Self::Paused)
    }

    /// Returns `true` when the dispatcher may assign new work.
    #[must_use]
    pub const fn is_dispatchable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

/// Registration-time identity and advertisement for an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentDescriptor {
    id: AgentId,
    name: String,
    version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    capabilities: Vec<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    metadata: HashMap<String, String>,
}

impl AgentDescriptor {
    /// Starts building an [`AgentDescriptor`].
    #[must_use]
    pub fn builder(id: AgentId) -> AgentDescriptorBuilder {
        AgentDescriptorBuilder {
            id,
            name: None,
            version: None,
            capabilities: Vec::new(),
            group: None,
            metadata: HashMap::new(),
        }
    }

    /// Returns the agent identifier.
    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the agent build version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the advertised capabilities.
    #[must_use]
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Returns the advertised capability identifiers as a set.
    #[must_use]
    pub fn capability_set(&self) -> CapabilitySet {
        CapabilitySet::from_capabilities(&self.capabilities)
    }

    /// Returns the optional group tag.
    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Returns the metadata map.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }
}

/// Builder for [`AgentDescriptor`].
#[derive(Debug)]
pub struct AgentDescriptorBuilder {
    id: AgentId,
    name: Option<String>,
    version: Option<String>,
    capabilities: Vec<Capability>,
    group: Option<String>,
    metadata: HashMap<String, String>,
}

impl AgentDescriptorBuilder {
    /// Sets the human-readable name for the agent.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidField`] when the name is empty.
    pub fn name(mut self, name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(crate::Error::InvalidField {
                field: "name",
                reason: "descriptor name cannot be empty".into(),
            });
        }
        self.name = Some(name);
        Ok(self)
    }

    /// Sets the semantic version string.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidField`] when the version string is empty.
    pub fn version(mut self, version: impl Into<String>) -> crate::Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(crate::Error::InvalidField {
                field: "version",
                reason: "descriptor version cannot be empty".into(),
            });
        }
        self.version = Some(version);
        Ok(self)
    }

    /// Replaces the capability list.
    #[must_use]
    pub fn capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Sets the group tag.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidField`] when the supplied tag is empty.
    pub fn group(mut self, group: impl Into<String>) -> crate::Result<Self> {
        let group = group.into();
        if group.trim().is_empty() {
            return Err(crate::Error::InvalidField {
                field: "group",
                reason: "group tag cannot be empty".into(),
            });
        }
        self.group = Some(group);
        Ok(self)
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Consumes the builder and returns the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidField`] if mandatory fields are missing.
    pub fn build(self) -> crate::Result<AgentDescriptor> {
        let name = self.name.ok_or(crate::Error::InvalidField {
            field: "name",
            reason: "descriptor name must be provided".into(),
        })?;
        let version = self.version.ok_or(crate::Error::InvalidField {
            field: "version",
            reason: "descriptor version must be provided".into(),
        })?;

        Ok(AgentDescriptor {
            id: self.id,
            name,
            version,
            capabilities: self.capabilities,
            group: self.group,
            metadata: self.metadata,
        })
    }
}
