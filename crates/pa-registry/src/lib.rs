//! Principal Registry
//!
//! Holds principals, groups and contact metadata keyed by name. The registry
//! is in-memory; `snapshot` persists it to a JSON file so a restarted process
//! picks up where the last one left off.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use pa_common::{Group, Principal};

mod snapshot;

pub use snapshot::RegistrySnapshot;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Principal not found: {name}")]
    NotFound { name: String },

    #[error("Unknown principal: {name}")]
    UnknownPrincipal { name: String },

    #[error("Unknown group: {group_name}")]
    UnknownGroup { group_name: String },

    #[error("Invalid {kind} name: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RegistryError {
    /// Misses that may resolve once a concurrent write becomes visible
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. } | RegistryError::UnknownPrincipal { .. })
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

#[derive(Default)]
pub struct PrincipalRegistry {
    principals: DashMap<String, Principal>,
    groups: DashMap<String, Group>,
}

impl PrincipalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by name. Identical input is a no-op.
    pub fn upsert(&self, principal: Principal) -> Result<UpsertOutcome> {
        validate_name("principal", &principal.name)?;

        let outcome = match self.principals.entry(principal.name.clone()) {
            Entry::Occupied(existing) if *existing.get() == principal => UpsertOutcome::Unchanged,
            Entry::Occupied(mut existing) => {
                existing.insert(principal.clone());
                UpsertOutcome::Updated
            }
            Entry::Vacant(slot) => {
                slot.insert(principal.clone());
                UpsertOutcome::Created
            }
        };

        debug!(principal = %principal.name, ?outcome, "Principal upserted");
        Ok(outcome)
    }

    pub fn get(&self, name: &str) -> Result<Principal> {
        self.principals
            .get(name)
            .map(|p| p.clone())
            .ok_or_else(|| RegistryError::NotFound { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.principals.contains_key(name)
    }

    /// Add a membership. Returns false when it was already present.
    pub fn add_to_group(&self, name: &str, group_name: &str) -> Result<bool> {
        if !self.groups.contains_key(group_name) {
            return Err(RegistryError::UnknownGroup { group_name: group_name.to_string() });
        }
        let mut principal = self.principals
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownPrincipal { name: name.to_string() })?;
        Ok(principal.group_names.insert(group_name.to_string()))
    }

    /// Attach contact metadata. The principal must already exist.
    /// Returns false when the stored value was already equal.
    pub fn set_metadata(&self, name: &str, email: &str) -> Result<bool> {
        let mut principal = self.principals
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownPrincipal { name: name.to_string() })?;

        if principal.contact_email.as_deref() == Some(email) {
            return Ok(false);
        }
        principal.contact_email = Some(email.to_string());
        debug!(principal = %name, "Contact metadata recorded");
        Ok(true)
    }

    /// Create or replace a group definition
    pub fn put_group(&self, group: Group) -> Result<UpsertOutcome> {
        validate_name("group", &group.name)?;

        let outcome = match self.groups.insert(group.name.clone(), group.clone()) {
            None => UpsertOutcome::Created,
            Some(previous) if previous == group => UpsertOutcome::Unchanged,
            Some(_) => UpsertOutcome::Updated,
        };
        Ok(outcome)
    }

    pub fn get_group(&self, name: &str) -> Result<Group> {
        self.groups
            .get(name)
            .map(|g| g.clone())
            .ok_or_else(|| RegistryError::UnknownGroup { group_name: name.to_string() })
    }

    /// All principals, ordered by name
    pub fn list(&self) -> Vec<Principal> {
        let mut principals: Vec<Principal> = self.principals.iter().map(|e| e.value().clone()).collect();
        principals.sort_by(|a, b| a.name.cmp(&b.name));
        principals
    }

    /// All groups, ordered by name
    pub fn list_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.groups.iter().map(|e| e.value().clone()).collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Whether any group the principal belongs to allows `action` on `resource`
    pub fn is_allowed(&self, name: &str, action: &str, resource: &str) -> Result<bool> {
        let principal = self.get(name)?;
        Ok(principal.group_names.iter().any(|g| {
            self.groups.get(g).map(|group| group.allows(action, resource)).unwrap_or(false)
        }))
    }
}

fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    if name.trim().is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName { kind, name: name.to_string() });
    }
    Ok(())
}
