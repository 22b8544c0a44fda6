use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SedimentError};
use crate::segment::varint::{put_uvarint_ascending, read_uvarint_ascending};

const SNAPSHOTS_KS: &str = "snapshots";

/// One segment of a recorded snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: u64,
    /// File name relative to the index directory
    pub path: String,
    /// Serialized roaring bitmap of deleted doc numbers
    pub deleted: Option<Vec<u8>>,
}

/// Everything needed to reinstall the root of one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub epoch: u64,
    pub segment_type: String,
    pub segment_version: u32,
    pub persisted_at: DateTime<Utc>,
    pub segments: Vec<SegmentRecord>,
    pub internal: Vec<(Vec<u8>, Vec<u8>)>,
}

impl SnapshotRecord {
    pub fn segment_paths(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.path.as_str())
    }
}

fn epoch_key(epoch: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(10);
    put_uvarint_ascending(&mut key, epoch);
    key
}

/// Fjall-backed store of snapshot records keyed by ascending epoch.
pub struct MetaStore {
    dir: PathBuf,
    db: Database,
    snapshots: Keyspace,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("dir", &self.dir).finish()
    }
}

impl MetaStore {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = Database::builder(dir)
            .open()
            .map_err(|e| SedimentError::MetaStore(format!("failed to open metadata store: {}", e)))?;
        let snapshots = db
            .keyspace(SNAPSHOTS_KS, || KeyspaceCreateOptions::default())
            .map_err(|e| SedimentError::MetaStore(format!("failed to open snapshots keyspace: {}", e)))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            db,
            snapshots,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a record and sync it to disk before returning
    pub fn put(&self, record: &SnapshotRecord) -> Result<()> {
        let val = bincode::serialize(record)?;
        self.snapshots
            .insert(epoch_key(record.epoch), val)
            .map_err(|e| SedimentError::MetaStore(e.to_string()))?;
        self.db
            .persist(PersistMode::SyncAll)
            .map_err(|e| SedimentError::MetaStore(e.to_string()))?;
        Ok(())
    }

    pub fn get(&self, epoch: u64) -> Result<Option<SnapshotRecord>> {
        let Some(val) = self
            .snapshots
            .get(epoch_key(epoch))
            .map_err(|e| SedimentError::MetaStore(e.to_string()))?
        else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(val.as_ref())?))
    }

    /// Recorded epochs, oldest first
    pub fn epochs(&self) -> Result<Vec<u64>> {
        let mut out = Vec::new();
        for kv in self.snapshots.iter() {
            let key = kv.key().map_err(|e| SedimentError::MetaStore(e.to_string()))?;
            match read_uvarint_ascending(key.as_ref()) {
                Ok((epoch, rest)) if rest.is_empty() => out.push(epoch),
                _ => tracing::warn!(key = ?key.as_ref(), "skipping malformed snapshot key"),
            }
        }
        Ok(out)
    }

    pub fn remove(&self, epoch: u64) -> Result<()> {
        self.snapshots
            .remove(epoch_key(epoch))
            .map_err(|e| SedimentError::MetaStore(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(epoch: u64) -> SnapshotRecord {
        SnapshotRecord {
            epoch,
            segment_type: "sediment".to_string(),
            segment_version: 1,
            persisted_at: Utc::now(),
            segments: vec![SegmentRecord {
                id: epoch,
                path: format!("{epoch:012x}.seg"),
                deleted: None,
            }],
            internal: vec![(b"k".to_vec(), epoch.to_be_bytes().to_vec())],
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        let r = record(3);
        store.put(&r).unwrap();
        assert_eq!(store.get(3).unwrap(), Some(r));
        assert_eq!(store.get(4).unwrap(), None);
        store.remove(3).unwrap();
        assert_eq!(store.get(3).unwrap(), None);
    }

    #[test]
    fn test_epochs_sorted_numerically() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        for epoch in [300, 2, 70_000, 129, 1] {
            store.put(&record(epoch)).unwrap();
        }
        assert_eq!(store.epochs().unwrap(), vec![1, 2, 129, 300, 70_000]);
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            store.put(&record(5)).unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        assert_eq!(store.epochs().unwrap(), vec![5]);
        assert_eq!(store.get(5).unwrap().unwrap().segments[0].path, "000000000005.seg");
    }
}
