//! Named recipient groups (spec §3 "Group").
//!
//! Groups expand to a flat, ordered list of recipient identifiers at resolve
//! time (§4.3); they never contain keys directly, and never recursively
//! reference themselves or another group.

use crate::error::{DedpasteError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GroupFile(pub HashMap<String, Vec<String>>);

impl GroupFile {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(GroupFile::default());
        }
        let raw = std::fs::read_to_string(path)?;
        if raw.trim().is_empty() {
            return Ok(GroupFile::default());
        }
        match serde_json::from_str(&raw) {
            Ok(groups) => Ok(GroupFile(groups)),
            Err(_) => {
                tracing::warn!(path = %path.display(), "groups file is corrupt, treating as empty");
                Ok(GroupFile::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&self.0)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Vec<String>> {
        self.0.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Validates and inserts a group. Rejects members that name the group
    /// itself or another known group (spec §3 invariant, §8 "Group expansion
    /// depth").
    pub fn put(&mut self, name: String, members: Vec<String>) -> Result<()> {
        if members.is_empty() {
            return Err(DedpasteError::StoreCorrupt(format!(
                "group {name:?} must have at least one member"
            )));
        }
        if members.iter().any(|m| m == &name) {
            return Err(DedpasteError::RecursiveGroup(name));
        }
        for member in &members {
            if self.0.contains_key(member) {
                return Err(DedpasteError::RecursiveGroup(format!(
                    "{name} -> {member}"
                )));
            }
        }
        self.0.insert(name, members);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.0.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_self_reference() {
        let mut groups = GroupFile::default();
        let err = groups
            .put("friends".into(), vec!["friends".into()])
            .unwrap_err();
        assert!(matches!(err, DedpasteError::RecursiveGroup(_)));
    }

    #[test]
    fn rejects_nested_group_member() {
        let mut groups = GroupFile::default();
        groups.put("inner".into(), vec!["alice".into()]).unwrap();
        let err = groups
            .put("outer".into(), vec!["inner".into()])
            .unwrap_err();
        assert!(matches!(err, DedpasteError::RecursiveGroup(_)));
    }

    #[test]
    fn rejects_empty_members() {
        let mut groups = GroupFile::default();
        assert!(groups.put("empty".into(), vec![]).is_err());
    }

    #[test]
    fn accepts_plain_members() {
        let mut groups = GroupFile::default();
        groups
            .put("team".into(), vec!["alice".into(), "bob".into()])
            .unwrap();
        assert_eq!(groups.get("team").unwrap().len(), 2);
    }
}
