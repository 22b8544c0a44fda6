//! The persister thread: writes in-memory segments to disk and records
//! each durable root in the metadata store.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::channel::{bounded, select, Receiver};
use tracing::{debug, error};

use super::introducer::PersistIntroduction;
use super::watcher::{notify_satisfied, EpochWatcher};
use super::{parse_segment_file_name, segment_file_name, IndexInner};
use crate::error::{Result, SedimentError};
use crate::persistence::{SegmentRecord, SnapshotRecord};
use crate::segment::Segment;
use crate::snapshot::IndexSnapshot;

/// Pause before retrying a failed pass
const RETRY_DELAY: Duration = Duration::from_millis(50);

pub(crate) struct PersisterState {
    /// Epoch of the newest durable root
    pub last_persisted: u64,
    /// Content of the newest metadata record
    pub last_record: Option<Arc<IndexSnapshot>>,
}

enum Wake {
    Epoch,
    Closed,
}

pub(crate) fn run(inner: Arc<IndexInner>, mut state: PersisterState, merger_watchers_rx: Receiver<EpochWatcher>) {
    let close = inner.close_rx.clone();
    let mut merger_watchers: Vec<EpochWatcher> = Vec::new();

    'outer: loop {
        let (root, waiters) = {
            let mut waiters = inner.root_persisted.lock();
            (inner.root.load_full(), std::mem::take(&mut *waiters))
        };

        if root.epoch() > state.last_persisted {
            let start = Instant::now();
            match persist_root(&inner, &root, &mut state) {
                Ok(()) => {
                    inner.stats.persist_latency.observe(start.elapsed().as_secs_f64());
                    for waiter in waiters {
                        let _ = waiter.send(Ok(()));
                    }
                    if let Err(e) = remove_old_data(&inner) {
                        inner.report_async_error("remove old data", &e);
                    }
                }
                Err(e) => {
                    inner.stats.tot_persist_errors.inc();
                    inner.report_async_error("persist", &e);
                    for waiter in waiters {
                        let _ = waiter.send(Err(SedimentError::Internal(format!("persist failed: {}", e))));
                    }
                    select! {
                        recv(close) -> _ => break 'outer,
                        default(RETRY_DELAY) => continue 'outer,
                    }
                }
            }
        } else {
            for waiter in waiters {
                let _ = waiter.send(Ok(()));
            }
        }

        notify_satisfied(&mut merger_watchers, state.last_persisted);

        // wait for the root to move past what we just handled
        let (watcher, advanced) = EpochWatcher::new(root.epoch());
        select! {
            recv(close) -> _ => break 'outer,
            send(inner.introducer_watchers, watcher) -> res => {
                if res.is_err() {
                    break 'outer;
                }
            }
        }
        match wait(&close, &advanced, &merger_watchers_rx, &mut merger_watchers, state.last_persisted) {
            Some(Wake::Epoch) => {}
            Some(Wake::Closed) | None => break 'outer,
        }
    }
    debug!("persister stopped");
}

fn wait(
    close: &Receiver<()>,
    advanced: &Receiver<()>,
    watchers_rx: &Receiver<EpochWatcher>,
    watchers: &mut Vec<EpochWatcher>,
    last_persisted: u64,
) -> Option<Wake> {
    loop {
        select! {
            recv(close) -> _ => return Some(Wake::Closed),
            recv(advanced) -> res => return res.ok().map(|_| Wake::Epoch),
            recv(watchers_rx) -> msg => match msg {
                Ok(w) => {
                    watchers.push(w);
                    notify_satisfied(watchers, last_persisted);
                }
                Err(_) => return None,
            },
        }
    }
}

/// Releases its names from the ineligible set when dropped
pub(crate) struct IneligibleGuard<'a> {
    inner: &'a IndexInner,
    names: Vec<String>,
}

impl<'a> IneligibleGuard<'a> {
    pub fn mark(inner: &'a IndexInner, names: Vec<String>) -> Self {
        {
            let mut set = inner.ineligible.lock();
            for name in &names {
                *set.entry(name.clone()).or_insert(0) += 1;
            }
        }
        Self { inner, names }
    }
}

impl Drop for IneligibleGuard<'_> {
    fn drop(&mut self) {
        let mut set = self.inner.ineligible.lock();
        for name in &self.names {
            if let Some(count) = set.get_mut(name) {
                *count -= 1;
                if *count == 0 {
                    set.remove(name);
                }
            }
        }
    }
}

fn persisted_file_name(segment: &dyn Segment) -> Option<String> {
    let persisted = segment.as_persisted()?;
    persisted.path().file_name()?.to_str().map(str::to_string)
}

fn persist_root(inner: &IndexInner, root: &Arc<IndexSnapshot>, state: &mut PersisterState) -> Result<()> {
    let (Some(dir), Some(meta)) = (inner.config.path.as_deref(), inner.meta.as_ref()) else {
        return Err(SedimentError::Internal("persister running without a directory".to_string()));
    };

    if let Some(last) = &state.last_record {
        if last.same_content(root) {
            debug!(epoch = root.epoch(), "root unchanged since last record");
            state.last_persisted = root.epoch();
            inner.stats.last_persisted_epoch.set(root.epoch() as i64);
            return Ok(());
        }
    }

    let mut records = Vec::with_capacity(root.segments().len());
    let mut twins: HashMap<u64, Arc<dyn Segment>> = HashMap::new();
    let mut written = Vec::new();

    for s in root.segments() {
        let name = if let Some(name) = persisted_file_name(s.segment().as_ref()) {
            name
        } else if let Some(unpersisted) = s.segment().as_unpersisted() {
            let name = segment_file_name(s.id());
            written.push(name.clone());
            let path = dir.join(&name);
            unpersisted.persist(&path)?;
            twins.insert(s.id(), (inner.plugin.open)(&path)?);
            inner.stats.tot_persisted_segments.inc();
            name
        } else {
            return Err(SedimentError::Internal(format!(
                "segment {} is neither persisted nor persistable",
                s.id()
            )));
        };

        let deleted = match s.deleted() {
            Some(d) => {
                let mut buf = Vec::with_capacity(d.serialized_size());
                d.serialize_into(&mut buf)?;
                Some(buf)
            }
            None => None,
        };
        records.push(SegmentRecord {
            id: s.id(),
            path: name,
            deleted,
        });
    }
    let _guard = IneligibleGuard::mark(inner, written);

    if !twins.is_empty() {
        swap_in_twins(inner, twins)?;
    }

    let record = SnapshotRecord {
        epoch: root.epoch(),
        segment_type: inner.plugin.name.clone(),
        segment_version: inner.plugin.version,
        persisted_at: Utc::now(),
        segments: records,
        internal: root.internal().iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    };
    meta.put(&record)?;

    inner.stats.tot_persisted_snapshots.inc();
    inner.stats.last_persisted_epoch.set(root.epoch() as i64);
    state.last_persisted = root.epoch();
    state.last_record = Some(root.clone());
    debug!(epoch = root.epoch(), segments = record.segments.len(), "persisted root");
    Ok(())
}

fn swap_in_twins(inner: &IndexInner, twins: HashMap<u64, Arc<dyn Segment>>) -> Result<()> {
    let close = &inner.close_rx;
    let (applied, applied_rx) = bounded(1);
    select! {
        recv(close) -> _ => return Err(SedimentError::Closed),
        send(inner.persists, PersistIntroduction { twins, applied }) -> res => {
            res.map_err(|_| SedimentError::Closed)?;
        }
    }
    select! {
        recv(close) -> _ => Err(SedimentError::Closed),
        recv(applied_rx) -> res => res.map(|_| ()).map_err(|_| SedimentError::Closed),
    }
}

/// Prune metadata records beyond the retention count and delete segment
/// files nothing refers to
pub(crate) fn remove_old_data(inner: &IndexInner) -> Result<()> {
    let (Some(dir), Some(meta)) = (inner.config.path.as_deref(), inner.meta.as_ref()) else {
        return Ok(());
    };

    let epochs = meta.epochs()?;
    let keep = inner.config.num_snapshots_to_keep.max(1);
    let split = epochs.len().saturating_sub(keep);
    for &epoch in &epochs[..split] {
        meta.remove(epoch)?;
        inner.stats.tot_meta_records_removed.inc();
        debug!(epoch, "removed metadata record");
    }

    let mut referenced: HashSet<String> = HashSet::new();
    for &epoch in &epochs[split..] {
        if let Some(record) = meta.get(epoch)? {
            referenced.extend(record.segment_paths().map(str::to_string));
        }
    }
    // ineligible first: a file leaves that set only after joining the root
    referenced.extend(inner.ineligible.lock().keys().cloned());
    let root = inner.root.load_full();
    referenced.extend(root.segments().iter().filter_map(|s| persisted_file_name(s.segment().as_ref())));

    remove_unreferenced_files(inner, dir, &referenced)
}

fn remove_unreferenced_files(inner: &IndexInner, dir: &Path, referenced: &HashSet<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if parse_segment_file_name(&name).is_none() || referenced.contains(&name) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                inner.stats.tot_files_removed.inc();
                debug!(file = %name, "removed unreferenced segment file");
            }
            Err(e) => error!(file = %name, error = %e, "failed to remove segment file"),
        }
    }
    Ok(())
}
