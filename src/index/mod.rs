//! The index orchestrator
//!
//! An [`Index`] owns one root [`IndexSnapshot`] and up to three background
//! threads sharing it:
//!
//! - the introducer, the only thread that swaps the root. Batches, merge
//!   results, persisted twins and rollbacks all reach it as messages on
//!   bounded queues and each produces a new root with a higher epoch.
//! - the persister, which writes in-memory segments to files, swaps the
//!   file-backed twins in, records the root in the metadata store and
//!   prunes records and files that are no longer needed.
//! - the merger, which plans merges over file-backed segments each time a
//!   newer root becomes durable.
//!
//! Threads wait on each other through epoch watchers and all blocking waits
//! race a shared close signal. In-memory and read-only indexes only run the
//! introducer.

mod introducer;
mod merger;
mod persister;
mod rollback;
mod watcher;

pub use rollback::{rollback_points_at, RollbackPoint};

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::{info, warn};

use crate::analysis::Analyzer;
use crate::config::IndexConfig;
use crate::error::{Result, SedimentError};
use crate::mergeplan::validate_options;
use crate::metrics::IndexStats;
use crate::models::{Batch, Document};
use crate::persistence::MetaStore;
use crate::segment::{SegmentPlugin, SegmentRegistry};
use crate::snapshot::IndexSnapshot;
use introducer::{
    IntroducerQueues, PersistIntroduction, SegmentIntroduction, SegmentMerge, SnapshotReversion,
};
use persister::PersisterState;
use watcher::EpochWatcher;

/// Directory under the index path holding the metadata store
pub const META_DIR: &str = "root.meta";

const SEGMENT_EXT: &str = ".seg";

pub(crate) fn segment_file_name(id: u64) -> String {
    format!("{:012x}{}", id, SEGMENT_EXT)
}

/// Segment id of a segment file name
pub(crate) fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(SEGMENT_EXT)?;
    if stem.len() != 12 {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}

/// State shared by the index handle and its threads
pub(crate) struct IndexInner {
    pub config: IndexConfig,
    pub plugin: SegmentPlugin,
    pub registry: SegmentRegistry,
    pub analyzer: Analyzer,
    pub meta: Option<MetaStore>,
    pub stats: IndexStats,

    pub root: ArcSwap<IndexSnapshot>,
    /// Callers waiting for the current root to become durable
    pub root_persisted: Mutex<Vec<Sender<Result<()>>>>,
    /// Segment file names that must survive cleanup, with a mark count
    pub ineligible: Mutex<HashMap<String, usize>>,
    next_segment_id: AtomicU64,
    next_epoch: AtomicU64,

    pub introductions: Sender<SegmentIntroduction>,
    pub merges: Sender<SegmentMerge>,
    pub persists: Sender<PersistIntroduction>,
    pub reverts: Sender<SnapshotReversion>,
    pub introducer_watchers: Sender<EpochWatcher>,
    /// Waiters for a newer durable epoch, served by the persister
    pub persister_watchers: Sender<EpochWatcher>,
    pub close_rx: Receiver<()>,
}

impl IndexInner {
    pub fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_segment_id(&self) -> u64 {
        self.next_segment_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Count, log and forward an error from a background thread
    pub fn report_async_error(&self, task: &str, e: &SedimentError) {
        self.stats.tot_async_errors.inc();
        tracing::error!(task, error = %e, "background task failed");
        if let Some(handler) = &self.config.async_error_handler {
            handler(e);
        }
    }
}

/// A segmented, append-only inverted index
pub struct Index {
    inner: Arc<IndexInner>,
    close_tx: Mutex<Option<Sender<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("path", &self.inner.config.path)
            .field("epoch", &self.inner.root.load().epoch())
            .finish()
    }
}

impl Index {
    /// Open or create an index using the built-in segment format
    pub fn open(config: IndexConfig) -> Result<Self> {
        Self::open_with_registry(config, SegmentRegistry::with_defaults())
    }

    /// Open or create an index, resolving segment formats through `registry`
    pub fn open_with_registry(config: IndexConfig, registry: SegmentRegistry) -> Result<Self> {
        validate_options(&config.merge_plan)?;
        let plugin = registry.get(&config.segment_type, config.segment_version)?.clone();
        let stats = IndexStats::new().map_err(|e| SedimentError::Internal(format!("metrics: {}", e)))?;

        let (meta, root, max_segment_id, max_recorded) = match config.path.as_deref() {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let meta = MetaStore::open(&dir.join(META_DIR))?;
                let root = rollback::load_latest(&meta, dir, &registry)?.unwrap_or_else(IndexSnapshot::empty);
                let max_id = max_segment_id_on_disk(dir)?;
                let max_recorded = meta.epochs()?.last().copied().unwrap_or(0);
                (Some(meta), root, max_id, max_recorded)
            }
            None => (None, IndexSnapshot::empty(), 0, 0),
        };
        let max_segment_id = root.segments().iter().map(|s| s.id()).fold(max_segment_id, u64::max);
        let epoch = root.epoch();
        // epochs continue past records that failed to load
        if max_recorded > epoch {
            warn!(loaded = epoch, newest = max_recorded, "newer metadata records could not be loaded");
        }
        let next_epoch = epoch.max(max_recorded) + 1;
        info!(
            path = ?config.path,
            epoch,
            segments = root.segments().len(),
            docs = root.doc_count(),
            "opened index"
        );
        stats.record_root(epoch, root.segments().len());
        stats.last_persisted_epoch.set(epoch as i64);

        let depth = config.queue_depth.max(1);
        let (introductions, introductions_rx) = bounded(depth);
        let (merges, merges_rx) = bounded(depth);
        let (persists, persists_rx) = bounded(depth);
        let (reverts, reverts_rx) = bounded(depth);
        let (introducer_watchers, introducer_watchers_rx) = bounded(depth);
        let (persister_watchers, persister_watchers_rx) = bounded(depth);
        let (close_tx, close_rx) = bounded::<()>(0);

        let background = config.path.is_some() && !config.read_only;
        let root = Arc::new(root);
        let inner = Arc::new(IndexInner {
            analyzer: Analyzer::new(&config.analyzer),
            config,
            plugin,
            registry,
            meta,
            stats,
            root: ArcSwap::new(root.clone()),
            root_persisted: Mutex::new(Vec::new()),
            ineligible: Mutex::new(HashMap::new()),
            next_segment_id: AtomicU64::new(max_segment_id + 1),
            next_epoch: AtomicU64::new(next_epoch),
            introductions,
            merges,
            persists,
            reverts,
            introducer_watchers,
            persister_watchers,
            close_rx,
        });

        let mut tasks = Vec::new();
        let queues = IntroducerQueues {
            introductions: introductions_rx,
            merges: merges_rx,
            persists: persists_rx,
            reverts: reverts_rx,
            watchers: introducer_watchers_rx,
        };
        let i = inner.clone();
        tasks.push(
            thread::Builder::new()
                .name("sediment-introducer".to_string())
                .spawn(move || introducer::run(i, queues))?,
        );

        if background {
            let state = PersisterState {
                last_persisted: epoch,
                last_record: if epoch > 0 { Some(root) } else { None },
            };
            let i = inner.clone();
            tasks.push(
                thread::Builder::new()
                    .name("sediment-persister".to_string())
                    .spawn(move || persister::run(i, state, persister_watchers_rx))?,
            );
            let i = inner.clone();
            tasks.push(
                thread::Builder::new()
                    .name("sediment-merger".to_string())
                    .spawn(move || merger::run(i))?,
            );
        }

        Ok(Self {
            inner,
            close_tx: Mutex::new(Some(close_tx)),
            tasks: Mutex::new(tasks),
        })
    }

    /// Apply a batch atomically
    ///
    /// Returns once the batch is visible to new readers, and under
    /// [`Durability::Sync`](crate::config::Durability::Sync) once it is
    /// also durable.
    pub fn batch(&self, batch: Batch) -> Result<()> {
        let inner = &self.inner;
        if inner.config.read_only {
            return Err(SedimentError::InvalidRequest("index is read-only".to_string()));
        }
        self.check_open()?;
        let start = Instant::now();

        let (updates, deletes) = batch.op_counts();
        let (ops, internal) = batch.into_parts();
        if ops.is_empty() && internal.is_empty() {
            inner.stats.tot_batches_empty.inc();
            return Ok(());
        }

        let ids: Vec<String> = ops.keys().cloned().collect();
        let results: Vec<_> = ops
            .into_values()
            .flatten()
            .map(|doc| inner.analyzer.analyze(doc))
            .collect();
        let (id, data) = if results.is_empty() {
            (0, None)
        } else {
            let segment = (inner.plugin.build)(&results, inner.config.chunk_factor)?;
            (inner.next_segment_id(), Some(segment))
        };

        // optimistic: the introducer covers segments that appear after this
        let root = inner.root.load_full();
        let mut obsoletes: HashMap<u64, RoaringBitmap> = HashMap::with_capacity(root.segments().len());
        if !ids.is_empty() {
            for s in root.segments() {
                obsoletes.insert(s.id(), s.segment().doc_numbers(&ids)?);
            }
        }
        drop(root);

        let (applied, applied_rx) = bounded(1);
        let (persisted, persisted_rx) = if inner.config.waits_for_persistence() {
            let (tx, rx) = bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let intro = SegmentIntroduction {
            id,
            data,
            obsoletes,
            ids,
            internal,
            applied,
            persisted,
        };

        let close = &inner.close_rx;
        select! {
            recv(close) -> _ => return Err(SedimentError::Closed),
            send(inner.introductions, intro) -> res => res.map_err(|_| SedimentError::Closed)?,
        }
        select! {
            recv(close) -> _ => return Err(SedimentError::Closed),
            recv(applied_rx) -> res => res.map_err(|_| SedimentError::Closed)??,
        }
        if let Some(rx) = persisted_rx {
            select! {
                recv(close) -> _ => return Err(SedimentError::Closed),
                recv(rx) -> res => res.map_err(|_| SedimentError::Closed)??,
            }
        }

        inner.stats.tot_batches.inc();
        inner.stats.tot_updates.inc_by(updates);
        inner.stats.tot_deletes.inc_by(deletes);
        inner.stats.batch_latency.observe(start.elapsed().as_secs_f64());
        Ok(())
    }

    /// Insert or replace one document
    pub fn update(&self, doc: Document) -> Result<()> {
        let mut batch = Batch::new();
        batch.update(doc);
        self.batch(batch)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete(id);
        self.batch(batch)
    }

    pub fn set_internal(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.set_internal(key, value);
        self.batch(batch)
    }

    pub fn delete_internal(&self, key: &[u8]) -> Result<()> {
        let mut batch = Batch::new();
        batch.delete_internal(key);
        self.batch(batch)
    }

    /// The current root; it stays valid however the index moves on
    pub fn reader(&self) -> Arc<IndexSnapshot> {
        self.inner.root.load_full()
    }

    pub fn doc_count(&self) -> u64 {
        self.inner.root.load().doc_count()
    }

    pub fn document(&self, id: &str) -> Result<Option<Document>> {
        self.reader().document(id)
    }

    pub fn get_internal(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.root.load().get_internal(key).map(<[u8]>::to_vec)
    }

    pub fn epoch(&self) -> u64 {
        self.inner.root.load().epoch()
    }

    pub fn config(&self) -> &IndexConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &IndexStats {
        &self.inner.stats
    }

    /// Block until every root up to the current one is durable
    ///
    /// Lets callers using [`Durability::Unsafe`](crate::config::Durability::Unsafe)
    /// pick their own sync points.
    pub fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.config.path.is_none() || inner.config.read_only {
            return Ok(());
        }
        self.check_open()?;
        let epoch = inner.root.load().epoch();
        if epoch == 0 {
            return Ok(());
        }

        let (watcher, durable) = EpochWatcher::new(epoch - 1);
        let close = &inner.close_rx;
        select! {
            recv(close) -> _ => return Err(SedimentError::Closed),
            send(inner.persister_watchers, watcher) -> res => res.map_err(|_| SedimentError::Closed)?,
        }
        select! {
            recv(close) -> _ => Err(SedimentError::Closed),
            recv(durable) -> res => res.map_err(|_| SedimentError::Closed),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.close_tx.lock().is_none() {
            return Err(SedimentError::Closed);
        }
        Ok(())
    }

    /// Stop background threads and wait for them to exit
    ///
    /// Batches applied with [`Durability::Unsafe`](crate::config::Durability::Unsafe)
    /// that the persister had not reached yet are lost.
    pub fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        let Some(close_tx) = self.close_tx.lock().take() else {
            return;
        };
        drop(close_tx);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let name = task.thread().name().map(str::to_string);
            if task.join().is_err() {
                warn!(thread = ?name, "background thread panicked");
            }
        }
        info!(path = ?self.inner.config.path, epoch = self.epoch(), "closed index");
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn max_segment_id_on_disk(dir: &Path) -> Result<u64> {
    let mut max = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(id) = entry.file_name().to_str().and_then(parse_segment_file_name) {
            max = max.max(id);
        }
    }
    Ok(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Durability;
    use crate::models::Field;
    use tempfile::TempDir;

    fn doc(id: &str, body: &str) -> Document {
        Document::new(id).with_field(Field::text("body", body))
    }

    #[test]
    fn test_segment_file_names() {
        assert_eq!(segment_file_name(0x2a), "00000000002a.seg");
        assert_eq!(parse_segment_file_name("00000000002a.seg"), Some(0x2a));
        assert_eq!(parse_segment_file_name("00000000002a.tmp"), None);
        assert_eq!(parse_segment_file_name("2a.seg"), None);
    }

    #[test]
    fn test_in_memory_batches() {
        let index = Index::open(IndexConfig::in_memory()).unwrap();
        let mut batch = Batch::new();
        batch.update(doc("a", "hello world"));
        batch.update(doc("b", "hello there"));
        index.batch(batch).unwrap();
        assert_eq!(index.doc_count(), 2);
        assert_eq!(index.epoch(), 1);

        index.update(doc("a", "goodbye")).unwrap();
        assert_eq!(index.doc_count(), 2);
        let reader = index.reader();
        let a = reader.document("a").unwrap().unwrap();
        assert_eq!(a.field("body").and_then(|f| f.as_text()), Some("goodbye"));

        index.delete("b").unwrap();
        assert_eq!(index.doc_count(), 1);
        assert!(index.document("b").unwrap().is_none());
        // the earlier reader is unaffected
        assert_eq!(reader.doc_count(), 2);
    }

    #[test]
    fn test_empty_batch_keeps_epoch() {
        let index = Index::open(IndexConfig::in_memory()).unwrap();
        index.batch(Batch::new()).unwrap();
        assert_eq!(index.epoch(), 0);
        assert_eq!(index.stats().tot_batches_empty.get(), 1);
    }

    #[test]
    fn test_internal_values() {
        let index = Index::open(IndexConfig::in_memory()).unwrap();
        index.set_internal(b"k", b"v1").unwrap();
        assert_eq!(index.get_internal(b"k"), Some(b"v1".to_vec()));
        index.delete_internal(b"k").unwrap();
        assert_eq!(index.get_internal(b"k"), None);
    }

    #[test]
    fn test_closed_index_rejects_batches() {
        let index = Index::open(IndexConfig::in_memory()).unwrap();
        index.close().unwrap();
        index.close().unwrap();
        assert!(matches!(index.update(doc("a", "x")), Err(SedimentError::Closed)));
    }

    #[test]
    fn test_read_only_rejects_batches() {
        let index = Index::open(IndexConfig::in_memory().with_read_only(true)).unwrap();
        assert!(matches!(
            index.update(doc("a", "x")),
            Err(SedimentError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_unknown_segment_type() {
        let config = IndexConfig::in_memory().with_segment_type("nope", 9);
        assert!(matches!(
            Index::open(config),
            Err(SedimentError::UnknownSegmentType { .. })
        ));
    }

    #[test]
    fn test_sync_batch_is_durable_and_reopens() {
        let dir = TempDir::new().unwrap();
        let config = IndexConfig::new(dir.path()).with_durability(Durability::Sync);
        {
            let index = Index::open(config.clone()).unwrap();
            index.update(doc("a", "persist me")).unwrap();
            index.set_internal(b"seq", b"1").unwrap();
            index.close().unwrap();
        }
        let index = Index::open(config).unwrap();
        assert_eq!(index.doc_count(), 1);
        assert_eq!(index.get_internal(b"seq"), Some(b"1".to_vec()));
        let reader = index.reader();
        assert!(reader.segments()[0].segment().as_persisted().is_some());

        index.update(doc("b", "after reopen")).unwrap();
        assert!(index.epoch() > reader.epoch());
        assert_eq!(index.doc_count(), 2);
    }

    #[test]
    fn test_unsafe_flush() {
        let dir = TempDir::new().unwrap();
        let config = IndexConfig::new(dir.path()).with_durability(Durability::Unsafe);
        let index = Index::open(config.clone()).unwrap();
        index.update(doc("a", "x")).unwrap();
        index.flush().unwrap();
        index.close().unwrap();
        drop(index);

        let index = Index::open(config).unwrap();
        assert_eq!(index.doc_count(), 1);
    }
}
