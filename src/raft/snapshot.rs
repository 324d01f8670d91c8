use super::{Index, NodeID, Term};
use crate::encoding::{self, Value as _};
use crate::error::Result;

use log::{error, info};
use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;

/// The number of snapshots to retain on disk.
const RETAIN: usize = 2;

/// A state machine snapshot at a given log position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The log index the snapshot covers.
    pub index: Index,
    /// The term of the entry at that index.
    pub term: Term,
    /// The cluster membership as of the snapshot. Membership changes are log
    /// entries, so a compacted log must carry them in the snapshot.
    pub members: Vec<NodeID>,
    /// The serialized state machine.
    pub data: Vec<u8>,
}

impl encoding::Value for Snapshot {}

/// Stores snapshots as files named `<index>-<term>.snap` under a directory,
/// retaining the most recent two so the latest can be corrupt without losing
/// everything. A store without a directory discards snapshots, for
/// development mode where the log is in memory anyway.
pub struct SnapshotStore {
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    /// Creates a snapshot store under the given directory, creating it if
    /// necessary. None discards all snapshots.
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = &dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { dir })
    }

    /// Returns true if this store actually persists snapshots. A discard
    /// store can't serve snapshots back, so the log must not be compacted
    /// against it.
    pub fn is_durable(&self) -> bool {
        self.dir.is_some()
    }

    /// Persists a snapshot via a temporary file, fsynced and renamed into
    /// place so a crash can't leave a partial snapshot behind. The partial
    /// file is removed on error, allowing the caller to retry. Older
    /// snapshots beyond the retention count are pruned.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        info!("Persisting snapshot at index {} term {}", snapshot.index, snapshot.term);

        let path = dir.join(format!("{}-{}.snap", snapshot.index, snapshot.term));
        let tmp_path = dir.join(format!("{}-{}.snap.tmp", snapshot.index, snapshot.term));
        let result = || -> Result<()> {
            let mut file = std::fs::File::create(&tmp_path)?;
            std::io::Write::write_all(&mut file, &snapshot.encode())?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        }();
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
            return result;
        }

        self.prune()?;
        Ok(())
    }

    /// Loads the most recent snapshot, if any. A snapshot that fails to
    /// decode is skipped in favor of an older one.
    pub fn latest(&self) -> Result<Option<Snapshot>> {
        let mut snapshots = self.list()?;
        snapshots.sort();
        while let Some((index, term, path)) = snapshots.pop() {
            match std::fs::read(&path).map_err(crate::error::Error::from).and_then(|b| Snapshot::decode(&b)) {
                Ok(snapshot) => {
                    assert_eq!((snapshot.index, snapshot.term), (index, term), "snapshot name mismatch");
                    return Ok(Some(snapshot));
                }
                Err(err) => error!("Skipping unreadable snapshot {}: {err}", path.display()),
            }
        }
        Ok(None)
    }

    /// Lists the stored snapshots as (index, term, path), unordered.
    fn list(&self) -> Result<Vec<(Index, Term, PathBuf)>> {
        let Some(dir) = &self.dir else {
            return Ok(Vec::new());
        };
        let mut snapshots = Vec::new();
        for dirent in std::fs::read_dir(dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(name) = name.strip_suffix(".snap") else {
                continue;
            };
            let Some((index, term)) = name.split_once('-') else {
                continue;
            };
            let (Ok(index), Ok(term)) = (index.parse(), term.parse()) else {
                continue;
            };
            snapshots.push((index, term, path));
        }
        Ok(snapshots)
    }

    /// Removes all but the most recent RETAIN snapshots.
    fn prune(&self) -> Result<()> {
        let mut snapshots = self.list()?;
        snapshots.sort();
        for (_, _, path) in snapshots.into_iter().rev().skip(RETAIN) {
            info!("Pruning old snapshot {}", path.display());
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_prune() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ballast")?;
        let store = SnapshotStore::new(Some(dir.path().join("snapshots")))?;

        assert_eq!(store.latest()?, None);

        for index in 1..=3 {
            store.save(&Snapshot { index, term: 1, members: vec![], data: vec![index as u8] })?;
        }

        let latest = store.latest()?.expect("no snapshot");
        assert_eq!((latest.index, latest.term), (3, 1));

        // Only the two most recent snapshots remain.
        assert_eq!(std::fs::read_dir(dir.path().join("snapshots"))?.count(), 2);
        Ok(())
    }

    #[test]
    fn discard_store() -> Result<()> {
        let store = SnapshotStore::new(None)?;
        store.save(&Snapshot { index: 1, term: 1, members: vec![], data: vec![] })?;
        assert_eq!(store.latest()?, None);
        Ok(())
    }

    #[test]
    fn corrupt_latest_falls_back() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("ballast")?;
        let snapdir = dir.path().join("snapshots");
        let store = SnapshotStore::new(Some(snapdir.clone()))?;

        store.save(&Snapshot { index: 1, term: 1, members: vec![], data: vec![1] })?;
        store.save(&Snapshot { index: 2, term: 1, members: vec![], data: vec![2] })?;
        std::fs::write(snapdir.join("2-1.snap"), b"garbage")?;

        let latest = store.latest()?.expect("no snapshot");
        assert_eq!(latest.index, 1);
        Ok(())
    }
}
