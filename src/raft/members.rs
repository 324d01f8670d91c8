use super::NodeID;
use crate::error::Result;

use log::error;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

/// The cluster membership: the set of node addresses participating in
/// consensus, including the local node. Membership changes are replicated
/// through the log and applied on every node, which persists the set to a
/// peers.json manifest so it survives restarts.
///
/// Persistence failures are logged but don't fail the membership change:
/// the in-memory set is authoritative while running, and the manifest is
/// rewritten on the next change.
pub struct Members {
    local: NodeID,
    all: Mutex<BTreeSet<NodeID>>,
    path: Option<PathBuf>,
}

impl Members {
    /// Loads the membership from a peers.json manifest if it exists and is
    /// non-empty, otherwise from the given seed addresses. The local node is
    /// always a member.
    pub fn load(path: Option<PathBuf>, local: NodeID, seeds: Vec<NodeID>) -> Result<Self> {
        let mut all: BTreeSet<NodeID> = match &path {
            Some(path) if path.try_exists()? => {
                let bytes = std::fs::read(path)?;
                if bytes.is_empty() {
                    seeds.into_iter().collect()
                } else {
                    serde_json::from_slice::<Vec<NodeID>>(&bytes)?.into_iter().collect()
                }
            }
            _ => seeds.into_iter().collect(),
        };
        all.insert(local.clone());
        Ok(Self { local, all: Mutex::new(all), path })
    }

    /// Returns the local node address.
    pub fn local(&self) -> &NodeID {
        &self.local
    }

    /// Returns the full membership, including the local node.
    pub fn all(&self) -> BTreeSet<NodeID> {
        self.all.lock().expect("lock poisoned").clone()
    }

    /// Returns the peers, i.e. all members except the local node.
    pub fn peers(&self) -> BTreeSet<NodeID> {
        let mut peers = self.all();
        peers.remove(&self.local);
        peers
    }

    /// Returns the cluster size.
    pub fn len(&self) -> usize {
        self.all.lock().expect("lock poisoned").len()
    }

    /// Returns true if the node is a member.
    pub fn contains(&self, node: &NodeID) -> bool {
        self.all.lock().expect("lock poisoned").contains(node)
    }

    /// Adds a member, returning false if it was already present.
    pub fn add(&self, node: NodeID) -> bool {
        let mut all = self.all.lock().expect("lock poisoned");
        let added = all.insert(node);
        if added {
            self.save(&all);
        }
        added
    }

    /// Removes a member, returning false if it was absent.
    pub fn remove(&self, node: &NodeID) -> bool {
        let mut all = self.all.lock().expect("lock poisoned");
        let removed = all.remove(node);
        if removed {
            self.save(&all);
        }
        removed
    }

    /// Replaces the membership wholesale, e.g. when installing a snapshot.
    /// The local node always remains a member.
    pub fn replace(&self, members: BTreeSet<NodeID>) {
        let mut all = self.all.lock().expect("lock poisoned");
        *all = members;
        all.insert(self.local.clone());
        self.save(&all);
    }

    /// Empties the membership, e.g. on shutdown after leaving the cluster.
    pub fn clear(&self) {
        let mut all = self.all.lock().expect("lock poisoned");
        all.clear();
        self.save(&all);
    }

    /// Persists the membership manifest, logging failures.
    fn save(&self, all: &BTreeSet<NodeID>) {
        let Some(path) = &self.path else {
            return;
        };
        let members: Vec<&NodeID> = all.iter().collect();
        let result = serde_json::to_vec_pretty(&members)
            .map_err(crate::error::Error::from)
            .and_then(|json| Ok(std::fs::write(path, json)?));
        if let Err(err) = result {
            error!("Failed to persist membership manifest {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_seeds() -> Result<()> {
        let members =
            Members::load(None, "a:1".to_string(), vec!["b:1".to_string(), "c:1".to_string()])?;
        assert_eq!(members.len(), 3);
        assert_eq!(members.peers(), ["b:1".to_string(), "c:1".to_string()].into());
        Ok(())
    }

    #[test]
    fn persistence_roundtrip() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ballast")?;
        let path = dir.path().join("peers.json");

        let members = Members::load(Some(path.clone()), "a:1".to_string(), vec![])?;
        members.add("b:1".to_string());
        members.add("c:1".to_string());
        members.remove(&"b:1".to_string());

        let members = Members::load(Some(path), "a:1".to_string(), vec![])?;
        assert_eq!(members.all(), ["a:1".to_string(), "c:1".to_string()].into());
        Ok(())
    }

    #[test]
    fn add_remove_idempotent() -> Result<()> {
        let members = Members::load(None, "a:1".to_string(), vec![])?;
        assert!(members.add("b:1".to_string()));
        assert!(!members.add("b:1".to_string()));
        assert!(members.remove(&"b:1".to_string()));
        assert!(!members.remove(&"b:1".to_string()));
        Ok(())
    }
}
