//! Desired-state manifest
//!
//! ```toml
//! [[resources]]
//! kind = "group"
//! name = "EC2UserGroup"
//! rules = [{ actions = ["ec2:*"], resources = ["*"] }]
//!
//! [[resources]]
//! kind = "principal"
//! name = "ec2User"
//! group = "EC2UserGroup"
//! contact_email = "a@x.com"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use pa_common::{Group, PermissionRule};

use crate::ProvisionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resource {
    Group(GroupPolicy),
    Principal(DesiredPrincipal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupPolicy {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
}

impl GroupPolicy {
    pub fn to_group(&self) -> Group {
        Group {
            name: self.name.clone(),
            permissions: self.rules.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredPrincipal {
    #[serde(alias = "principalName")]
    pub name: String,
    #[serde(alias = "groupName")]
    pub group: String,
    #[serde(alias = "contactEmail")]
    pub contact_email: String,
}

impl DesiredPrincipal {
    pub fn new(name: impl Into<String>, group: impl Into<String>, contact_email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
            contact_email: contact_email.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    resources: Vec<Resource>,
}

/// Groups and principals to reconcile, each in declaration order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub groups: Vec<GroupPolicy>,
    pub principals: Vec<DesiredPrincipal>,
}

impl DesiredState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: GroupPolicy) -> Self {
        self.groups.push(group);
        self
    }

    pub fn with_principal(mut self, principal: DesiredPrincipal) -> Self {
        self.principals.push(principal);
        self
    }

    pub fn from_resources(resources: Vec<Resource>) -> Result<Self, ProvisionError> {
        let mut state = Self::new();
        let mut seen_groups = HashSet::new();
        let mut seen_principals = HashSet::new();

        for resource in resources {
            match resource {
                Resource::Group(group) => {
                    if !seen_groups.insert(group.name.clone()) {
                        return Err(ProvisionError::InvalidManifest(format!("duplicate group: {}", group.name)));
                    }
                    state.groups.push(group);
                }
                Resource::Principal(principal) => {
                    if !seen_principals.insert(principal.name.clone()) {
                        return Err(ProvisionError::InvalidManifest(format!(
                            "duplicate principal: {}",
                            principal.name
                        )));
                    }
                    state.principals.push(principal);
                }
            }
        }
        Ok(state)
    }

    pub fn from_toml(content: &str) -> Result<Self, ProvisionError> {
        let manifest: Manifest =
            toml::from_str(content).map_err(|e| ProvisionError::InvalidManifest(e.to_string()))?;
        Self::from_resources(manifest.resources)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ProvisionError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&content)
    }

    pub fn declares_group(&self, name: &str) -> bool {
        self.groups.iter().any(|g| g.name == name)
    }
}
