//! Capability descriptors and set matching.
//!
//! Capabilities are purely declarative tags: the orchestrator matches jobs to
//! agents by id-set membership and attaches no semantics to the names.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;

/// Identifier for a capability an agent may advertise.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityId(String);

impl CapabilityId {
    /// Creates a new capability identifier after validating its format.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCapabilityId`] if the supplied identifier is
    /// empty, too long, or contains unsupported characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id)?;
        Ok(Self(id))
    }

    /// Returns the capability identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<CapabilityId> for String {
    fn from(value: CapabilityId) -> Self {
        value.0
    }
}

fn validate_identifier(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidCapabilityId {
            id: String::new(),
            reason: "identifier cannot be empty".into(),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidCapabilityId {
            id: id.into(),
            reason: format!("identifier length must be <= {MAX_ID_LEN}"),
        });
    }

    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidCapabilityId {
            id: id.into(),
            reason: "identifier must contain lowercase alphanumeric, dash, underscore, or dot"
                .into(),
        });
    }

    Ok(())
}

/// A capability advertised by an agent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    id: CapabilityId,
    version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, String>,
}

impl Capability {
    /// Creates a capability with the given identifier and version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidField`] when the version string is empty.
    pub fn new(id: CapabilityId, version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(Error::InvalidField {
                field: "version",
                reason: "capability version cannot be empty".into(),
            });
        }
        Ok(Self {
            id,
            version,
            params: BTreeMap::new(),
        })
    }

    /// Attaches a declarative parameter to the capability.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns the capability identifier.
    #[must_use]
    pub fn id(&self) -> &CapabilityId {
        &self.id
    }

    /// Returns the version string.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the declarative parameters.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }
}

/// An agent's advertised capability set, matched by identifier membership.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<CapabilityId>);

impl CapabilitySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from the identifiers of the supplied capabilities.
    #[must_use]
    pub fn from_capabilities(capabilities: &[Capability]) -> Self {
        Self(capabilities.iter().map(|c| c.id.clone()).collect())
    }

    /// Adds an identifier to the set.
    pub fn insert(&mut self, id: CapabilityId) {
        self.0.insert(id);
    }

    /// Returns `true` when the set contains the identifier.
    #[must_use]
    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.0.contains(id)
    }

    /// Returns `true` when every required identifier is present in this set.
    #[must_use]
    pub fn satisfies(&self, required: &CapabilitySet) -> bool {
        required.0.is_subset(&self.0)
    }

    /// Returns `true` when no identifiers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the identifiers in the set.
    pub fn iter(&self) -> impl Iterator<Item = &CapabilityId> {
        self.0.iter()
    }
}

impl FromIterator<CapabilityId> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = CapabilityId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> CapabilityId {
        CapabilityId::new(s).expect("id")
    }

    #[test]
    fn identifier_rules() {
        assert!(CapabilityId::new("gpu.cuda-12").is_ok());
        assert!(CapabilityId::new("").is_err());
        assert!(CapabilityId::new("UPPER").is_err());
        assert!(CapabilityId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn capability_requires_version() {
        assert!(Capability::new(id("gpu"), " ").is_err());
        let cap = Capability::new(id("gpu"), "1.0")
            .expect("cap")
            .with_param("memory", "24g");
        assert_eq!(cap.params().get("memory").map(String::as_str), Some("24g"));
    }

    #[test]
    fn subset_matching() {
        let advertised: CapabilitySet = [id("gpu"), id("cpu"), id("ffmpeg")].into_iter().collect();
        let required: CapabilitySet = [id("gpu"), id("ffmpeg")].into_iter().collect();
        let missing: CapabilitySet = [id("tpu")].into_iter().collect();

        assert!(advertised.satisfies(&required));
        assert!(!advertised.satisfies(&missing));
        assert!(advertised.satisfies(&CapabilitySet::new()));
    }
}
