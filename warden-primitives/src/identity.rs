//! Host identity as known to the manager.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

/// Immutable-per-install identity of the enrolled host.
///
/// `groups` is the one mutable field: the manager can reassign the host's
/// configuration groups at runtime. The list is ordered and duplicate-free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    uuid: String,
    key: String,
    #[serde(default)]
    groups: Vec<String>,
}

impl AgentIdentity {
    /// Creates an identity from an existing enrolment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidIdentity`] when the uuid is empty.
    pub fn new(uuid: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let uuid = uuid.into();
        if uuid.trim().is_empty() {
            return Err(Error::invalid_identity("uuid must not be empty"));
        }
        Ok(Self {
            uuid,
            key: key.into(),
            groups: Vec::new(),
        })
    }

    /// Generates a fresh identity with a random v4 uuid and no key.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            key: String::new(),
            groups: Vec::new(),
        }
    }

    /// Returns the enrolment uuid.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns the enrolment key (may be empty before registration).
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Replaces the enrolment key.
    pub fn set_key(&mut self, key: impl Into<String>) {
        self.key = key.into();
    }

    /// Returns the ordered group list.
    #[must_use]
    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Replaces the group list, preserving order and dropping duplicates.
    pub fn set_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = Vec::new();
        for group in groups {
            let group = group.into();
            if !seen.contains(&group) {
                seen.push(group);
            }
        }
        self.groups = seen;
    }
}
