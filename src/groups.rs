//! Group & Script-Config Store (C8).
//!
//! Durable CRUD over device groups, backed by a single JSON document under
//! `data_dir/groups.json`. Guarded by one `RwLock` and persisted via
//! write-to-temp + atomic rename, the same durability idiom the teacher's
//! `config.rs` and the updater's state file both use (§5 shared-resource
//! policy).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub sort_order: u64,
    #[serde(default)]
    pub device_udids: Vec<String>,
    #[serde(default)]
    pub script_path: Option<String>,
    #[serde(default)]
    pub script_overrides: HashMap<String, Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct GroupFile {
    #[serde(default)]
    groups: Vec<Group>,
    #[serde(default)]
    next_sort_order: u64,
}

/// A partial update applied to an existing group; `None` fields are left
/// unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub device_udids: Option<Vec<String>>,
    pub script_path: Option<Option<String>>,
}

pub struct GroupStore {
    path: PathBuf,
    file: tokio::sync::RwLock<GroupFile>,
}

impl GroupStore {
    /// Construct an empty, unpersisted store without touching the
    /// filesystem — used for tests that never exercise CRUD operations.
    #[must_use]
    pub fn new_empty(path: PathBuf) -> Self {
        Self { path, file: tokio::sync::RwLock::new(GroupFile::default()) }
    }

    /// Load the store from `path`, starting empty if the file does not
    /// exist yet.
    pub async fn load(path: PathBuf) -> std::io::Result<Self> {
        let file = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let raw = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            GroupFile::default()
        };
        Ok(Self { path, file: tokio::sync::RwLock::new(file) })
    }

    async fn persist(&self, file: &GroupFile) -> std::io::Result<()> {
        let serialized = serde_json::to_vec_pretty(file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        util::write_atomic(&self.path, &serialized).await
    }

    pub async fn create(
        &self,
        name: String,
        device_udids: Vec<String>,
        script_path: Option<String>,
    ) -> std::io::Result<Group> {
        let mut file = self.file.write().await;
        let group = Group {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            sort_order: file.next_sort_order,
            device_udids,
            script_path,
            script_overrides: HashMap::new(),
        };
        file.next_sort_order += 1;
        file.groups.push(group.clone());
        self.persist(&file).await?;
        Ok(group)
    }

    pub async fn list(&self) -> Vec<Group> {
        let file = self.file.read().await;
        let mut groups = file.groups.clone();
        groups.sort_by_key(|g| g.sort_order);
        groups
    }

    pub async fn get(&self, id: &str) -> Option<Group> {
        self.file.read().await.groups.iter().find(|g| g.id == id).cloned()
    }

    pub async fn update(&self, id: &str, patch: GroupPatch) -> std::io::Result<Option<Group>> {
        let mut file = self.file.write().await;
        let Some(group) = file.groups.iter_mut().find(|g| g.id == id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            group.name = name;
        }
        if let Some(udids) = patch.device_udids {
            group.device_udids = udids;
        }
        if let Some(script_path) = patch.script_path {
            group.script_path = script_path;
        }
        let updated = group.clone();
        self.persist(&file).await?;
        Ok(Some(updated))
    }

    pub async fn set_script_overrides(
        &self,
        id: &str,
        script_name: String,
        overrides: Value,
    ) -> std::io::Result<bool> {
        let mut file = self.file.write().await;
        let Some(group) = file.groups.iter_mut().find(|g| g.id == id) else {
            return Ok(false);
        };
        group.script_overrides.insert(script_name, overrides);
        self.persist(&file).await?;
        Ok(true)
    }

    pub async fn delete(&self, id: &str) -> std::io::Result<bool> {
        let mut file = self.file.write().await;
        let before = file.groups.len();
        file.groups.retain(|g| g.id != id);
        let removed = file.groups.len() != before;
        if removed {
            self.persist(&file).await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupStore::load(dir.path().join("groups.json")).await.unwrap();
        let group = store.create("fleet-a".to_string(), vec![], None).await.unwrap();
        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, group.id);
        assert_eq!(listed[0].name, "fleet-a");
    }

    #[tokio::test]
    async fn update_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupStore::load(dir.path().join("groups.json")).await.unwrap();
        let group = store.create("fleet-a".to_string(), vec![], None).await.unwrap();

        let patch = GroupPatch { name: Some("renamed".to_string()), ..Default::default() };
        let updated = store.update(&group.id, patch).await.unwrap().unwrap();
        assert_eq!(updated.name, "renamed");

        assert!(store.delete(&group.id).await.unwrap());
        assert!(store.get(&group.id).await.is_none());
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("groups.json");
        {
            let store = GroupStore::load(path.clone()).await.unwrap();
            store.create("fleet-a".to_string(), vec!["udid-1".to_string()], None).await.unwrap();
        }
        let reloaded = GroupStore::load(path).await.unwrap();
        let groups = reloaded.list().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].device_udids, vec!["udid-1".to_string()]);
    }
}
