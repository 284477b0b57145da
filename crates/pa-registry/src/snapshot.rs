//! JSON snapshot persistence for the registry

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use pa_common::{Group, Principal};

use crate::{PrincipalRegistry, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub groups: Vec<Group>,
    pub principals: Vec<Principal>,
}

impl PrincipalRegistry {
    /// Point-in-time copy, ordered by name
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            groups: self.list_groups(),
            principals: self.list(),
        }
    }

    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Self {
        let registry = Self::new();
        for group in snapshot.groups {
            registry.groups.insert(group.name.clone(), group);
        }
        for principal in snapshot.principals {
            registry.principals.insert(principal.name.clone(), principal);
        }
        registry
    }

    /// Write the snapshot through a temp file and rename it into place
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let snapshot = self.snapshot();
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, path).await?;

        debug!(path = ?path, principals = snapshot.principals.len(), "Registry snapshot saved");
        Ok(())
    }

    /// Restore from `path`; a missing file yields an empty registry
    pub async fn load_snapshot(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await? {
            info!(path = ?path, "No registry snapshot found, starting empty");
            return Ok(Self::new());
        }

        let bytes = tokio::fs::read(path).await?;
        let snapshot: RegistrySnapshot = serde_json::from_slice(&bytes)?;
        info!(
            path = ?path,
            principals = snapshot.principals.len(),
            groups = snapshot.groups.len(),
            "Registry snapshot loaded"
        );
        Ok(Self::from_snapshot(snapshot))
    }
}
