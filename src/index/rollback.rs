use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crossbeam::channel::{bounded, select};
use roaring::RoaringBitmap;
use tracing::{info, warn};

use super::introducer::SnapshotReversion;
use super::persister::IneligibleGuard;
use super::{Index, META_DIR};
use crate::error::{Result, SedimentError};
use crate::persistence::{MetaStore, SnapshotRecord};
use crate::segment::SegmentRegistry;
use crate::snapshot::{IndexSnapshot, SegmentSnapshot};

/// A recorded epoch the index can be rolled back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPoint {
    epoch: u64,
    meta: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl RollbackPoint {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Internal key/value data as of this point
    pub fn meta(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.meta
    }

    pub fn get_internal(&self, key: &[u8]) -> Option<&[u8]> {
        self.meta.get(key).map(Vec::as_slice)
    }
}

/// Rollback points newest first; unreadable records are skipped
pub(crate) fn rollback_points_from(meta: &MetaStore) -> Result<Vec<RollbackPoint>> {
    let mut points = Vec::new();
    for epoch in meta.epochs()?.into_iter().rev() {
        match meta.get(epoch) {
            Ok(Some(record)) => points.push(RollbackPoint {
                epoch: record.epoch,
                meta: record.internal.into_iter().collect(),
            }),
            Ok(None) => {}
            Err(e) => warn!(epoch, error = %e, "skipping unreadable metadata record"),
        }
    }
    Ok(points)
}

/// List the rollback points of an index that is not open
pub fn rollback_points_at(path: impl AsRef<Path>) -> Result<Vec<RollbackPoint>> {
    let meta_dir = path.as_ref().join(META_DIR);
    if !meta_dir.exists() {
        return Ok(Vec::new());
    }
    rollback_points_from(&MetaStore::open(&meta_dir)?)
}

/// Open every segment a record refers to
pub(crate) fn load_record(
    record: &SnapshotRecord,
    dir: &Path,
    registry: &SegmentRegistry,
) -> Result<(Vec<SegmentSnapshot>, Arc<BTreeMap<Vec<u8>, Vec<u8>>>)> {
    let plugin = registry.get(&record.segment_type, record.segment_version)?;
    let mut segments = Vec::with_capacity(record.segments.len());
    for s in &record.segments {
        let segment = (plugin.open)(&dir.join(&s.path))?;
        let deleted = match &s.deleted {
            Some(bytes) => Some(Arc::new(RoaringBitmap::deserialize_from(bytes.as_slice())?)),
            None => None,
        };
        segments.push(SegmentSnapshot::new(s.id, segment, deleted));
    }
    let internal = record.internal.iter().cloned().collect();
    Ok((segments, Arc::new(internal)))
}

/// The newest record that loads, as a snapshot at its recorded epoch
pub(crate) fn load_latest(meta: &MetaStore, dir: &Path, registry: &SegmentRegistry) -> Result<Option<IndexSnapshot>> {
    for epoch in meta.epochs()?.into_iter().rev() {
        let record = match meta.get(epoch) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                warn!(epoch, error = %e, "skipping unreadable metadata record");
                continue;
            }
        };
        match load_record(&record, dir, registry) {
            Ok((segments, internal)) => return Ok(Some(IndexSnapshot::new(record.epoch, segments, internal))),
            Err(e @ SedimentError::UnknownSegmentType { .. }) => return Err(e),
            Err(e) => warn!(epoch, error = %e, "skipping unloadable metadata record"),
        }
    }
    Ok(None)
}

impl Index {
    /// Recorded rollback points, newest first
    pub fn rollback_points(&self) -> Result<Vec<RollbackPoint>> {
        let meta = self
            .inner
            .meta
            .as_ref()
            .ok_or_else(|| SedimentError::InvalidRequest("in-memory index has no rollback points".to_string()))?;
        rollback_points_from(meta)
    }

    /// Install the content recorded at `point` as a new root
    ///
    /// The epoch keeps increasing: the reverted root gets a fresh epoch
    /// even though its content is older. Snapshots already handed out are
    /// unaffected.
    pub fn rollback(&self, point: &RollbackPoint) -> Result<()> {
        let inner = &self.inner;
        if inner.config.read_only {
            return Err(SedimentError::InvalidRequest("index is read-only".to_string()));
        }
        let (Some(dir), Some(meta)) = (inner.config.path.as_deref(), inner.meta.as_ref()) else {
            return Err(SedimentError::InvalidRequest("in-memory index cannot roll back".to_string()));
        };
        self.check_open()?;

        let record = meta
            .get(point.epoch)?
            .ok_or(SedimentError::RollbackPointNotFound(point.epoch))?;
        let _guard = IneligibleGuard::mark(inner, record.segment_paths().map(str::to_string).collect());
        let (segments, internal) = load_record(&record, dir, &inner.registry)?;

        let (applied, applied_rx) = bounded(1);
        let (persisted, persisted_rx) = if inner.config.waits_for_persistence() {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let revert = SnapshotReversion {
            segments,
            internal,
            applied,
            persisted,
        };

        let close = &inner.close_rx;
        select! {
            recv(close) -> _ => return Err(SedimentError::Closed),
            send(inner.reverts, revert) -> res => res.map_err(|_| SedimentError::Closed)?,
        }
        select! {
            recv(close) -> _ => return Err(SedimentError::Closed),
            recv(applied_rx) -> res => res.map_err(|_| SedimentError::Closed)??,
        }
        info!(epoch = point.epoch, "rolled back");

        if let Some(rx) = persisted_rx {
            select! {
                recv(close) -> _ => return Err(SedimentError::Closed),
                recv(rx) -> res => res.map_err(|_| SedimentError::Closed)??,
            }
        }
        Ok(())
    }
}
