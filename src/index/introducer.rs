//! The introducer thread: the only writer of the root snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crossbeam::channel::{select, Receiver, Sender};
use roaring::RoaringBitmap;
use tracing::debug;

use super::watcher::{notify_satisfied, EpochWatcher};
use super::IndexInner;
use crate::error::Result;
use crate::segment::{Segment, DOC_DROPPED};
use crate::snapshot::{IndexSnapshot, SegmentSnapshot};

/// A new segment from a batch along with the deletions it implies
pub(crate) struct SegmentIntroduction {
    pub id: u64,
    /// `None` for batches that only delete or touch internal data
    pub data: Option<Arc<dyn Segment>>,
    /// Doc numbers obsoleted per segment id, computed against an earlier root
    pub obsoletes: HashMap<u64, RoaringBitmap>,
    /// Every id the batch touches
    pub ids: Vec<String>,
    pub internal: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pub applied: Sender<Result<()>>,
    pub persisted: Option<Sender<Result<()>>>,
}

/// One merge input as it was when the merge started
pub(crate) struct MergeInput {
    pub id: u64,
    pub segment: Arc<dyn Segment>,
    pub deleted: Option<Arc<RoaringBitmap>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    Introduced,
    /// Inputs were gone or every merged doc had since been deleted
    Obsoleted,
    /// The merge produced no documents; only the inputs were removed
    Skipped,
}

pub(crate) struct SegmentMerge {
    pub inputs: Vec<MergeInput>,
    /// Old doc number to new doc number, per input
    pub remaps: Vec<Vec<u64>>,
    pub new_id: u64,
    pub new: Arc<dyn Segment>,
    pub done: Sender<MergeOutcome>,
}

/// File-backed replacements for in-memory segments
pub(crate) struct PersistIntroduction {
    pub twins: HashMap<u64, Arc<dyn Segment>>,
    pub applied: Sender<Arc<IndexSnapshot>>,
}

/// Install the content of a historical snapshot as a new root
pub(crate) struct SnapshotReversion {
    pub segments: Vec<SegmentSnapshot>,
    pub internal: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
    pub applied: Sender<Result<()>>,
    pub persisted: Option<Sender<Result<()>>>,
}

pub(crate) struct IntroducerQueues {
    pub introductions: Receiver<SegmentIntroduction>,
    pub merges: Receiver<SegmentMerge>,
    pub persists: Receiver<PersistIntroduction>,
    pub reverts: Receiver<SnapshotReversion>,
    pub watchers: Receiver<EpochWatcher>,
}

fn same_segment(a: &Arc<dyn Segment>, b: &Arc<dyn Segment>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

pub(crate) fn run(inner: Arc<IndexInner>, queues: IntroducerQueues) {
    let close = inner.close_rx.clone();
    let mut watchers: Vec<EpochWatcher> = Vec::new();

    loop {
        select! {
            recv(close) -> _ => break,
            recv(queues.watchers) -> msg => match msg {
                Ok(w) => watchers.push(w),
                Err(_) => break,
            },
            recv(queues.introductions) -> msg => match msg {
                Ok(intro) => introduce_segment(&inner, intro),
                Err(_) => break,
            },
            recv(queues.merges) -> msg => match msg {
                Ok(merge) => introduce_merge(&inner, merge),
                Err(_) => break,
            },
            recv(queues.persists) -> msg => match msg {
                Ok(persist) => introduce_persisted(&inner, persist),
                Err(_) => break,
            },
            recv(queues.reverts) -> msg => match msg {
                Ok(revert) => revert_to_snapshot(&inner, revert),
                Err(_) => break,
            },
        }

        notify_satisfied(&mut watchers, inner.root.load().epoch());
    }
    debug!("introducer stopped");
}

/// Swap in a new root, registering `persisted` as a durability waiter
/// atomically with the swap
fn install_root(inner: &IndexInner, snapshot: IndexSnapshot, persisted: Option<Sender<Result<()>>>) {
    let epoch = snapshot.epoch();
    let segments = snapshot.segments().len();
    {
        let mut waiters = inner.root_persisted.lock();
        inner.root.store(Arc::new(snapshot));
        if let Some(p) = persisted {
            waiters.push(p);
        }
    }
    inner.stats.record_root(epoch, segments);
}

fn introduce_segment(inner: &IndexInner, intro: SegmentIntroduction) {
    let SegmentIntroduction {
        id,
        data,
        obsoletes,
        ids,
        internal,
        applied,
        persisted,
    } = intro;

    let root = inner.root.load_full();
    let build = || -> Result<IndexSnapshot> {
        let mut segments = Vec::with_capacity(root.segments().len() + 1);
        for s in root.segments() {
            let delta = match obsoletes.get(&s.id()) {
                Some(delta) => delta.clone(),
                // appeared after the batch looked at the root
                None if !ids.is_empty() => s.segment().doc_numbers(&ids)?,
                None => RoaringBitmap::new(),
            };
            segments.push(s.with_deletions(&delta));
        }

        if let Some(segment) = &data {
            if segment.count() > 0 {
                inner.stats.tot_introduced_segments_batch.inc();
                inner.stats.tot_introduced_items.inc_by(segment.count());
                segments.push(SegmentSnapshot::new(id, segment.clone(), None));
            }
        }

        let internal_map = if internal.is_empty() {
            root.internal().clone()
        } else {
            let mut map = root.internal().as_ref().clone();
            for (k, v) in &internal {
                match v {
                    Some(v) => map.insert(k.clone(), v.clone()),
                    None => map.remove(k),
                };
            }
            Arc::new(map)
        };

        Ok(IndexSnapshot::new(inner.next_epoch(), segments, internal_map))
    };

    match build() {
        Ok(snapshot) => {
            debug!(epoch = snapshot.epoch(), segment = id, "introduced batch");
            install_root(inner, snapshot, persisted);
            let _ = applied.send(Ok(()));
        }
        Err(e) => {
            debug!(segment = id, error = %e, "batch introduction failed, discarding segment");
            drop(data);
            let _ = applied.send(Err(e));
        }
    }
}

/// Root segments after applying `merge`, or `None` when an input is no
/// longer in the root and the merge must be discarded
fn merged_segments(root: &IndexSnapshot, merge: &SegmentMerge) -> (Option<Vec<SegmentSnapshot>>, MergeOutcome) {
    let mut current: HashMap<u64, &SegmentSnapshot> = HashMap::with_capacity(merge.inputs.len());
    for input in &merge.inputs {
        match root.segments().iter().find(|s| s.id() == input.id) {
            Some(s) if same_segment(s.segment(), &input.segment) => {
                current.insert(input.id, s);
            }
            _ => return (None, MergeOutcome::Obsoleted),
        }
    }

    // deletions that landed on the inputs while the merge ran
    let mut deleted = RoaringBitmap::new();
    for (input, remap) in merge.inputs.iter().zip(&merge.remaps) {
        let Some(now) = current.get(&input.id).and_then(|s| s.deleted()) else {
            continue;
        };
        let since = match &input.deleted {
            Some(before) => now.as_ref() - before.as_ref(),
            None => now.as_ref().clone(),
        };
        for old in since {
            match remap.get(old as usize) {
                Some(&new) if new != DOC_DROPPED => {
                    deleted.insert(new as u32);
                }
                _ => {}
            }
        }
    }

    let merged: HashSet<u64> = merge.inputs.iter().map(|i| i.id).collect();
    let mut segments: Vec<SegmentSnapshot> = root
        .segments()
        .iter()
        .filter(|s| !merged.contains(&s.id()))
        .cloned()
        .collect();

    let count = merge.new.count();
    let outcome = if count > deleted.len() {
        segments.push(SegmentSnapshot::new(merge.new_id, merge.new.clone(), Some(Arc::new(deleted))));
        MergeOutcome::Introduced
    } else if count > 0 {
        MergeOutcome::Obsoleted
    } else {
        MergeOutcome::Skipped
    };
    (Some(segments), outcome)
}

fn introduce_merge(inner: &IndexInner, merge: SegmentMerge) {
    let root = inner.root.load_full();
    let (segments, outcome) = merged_segments(&root, &merge);
    match outcome {
        MergeOutcome::Introduced => inner.stats.tot_introduced_segments_merge.inc(),
        MergeOutcome::Obsoleted => inner.stats.tot_merge_introductions_obsoleted.inc(),
        MergeOutcome::Skipped => inner.stats.tot_merge_introductions_skipped.inc(),
    }

    match segments {
        Some(segments) => {
            let snapshot = IndexSnapshot::new(inner.next_epoch(), segments, root.internal().clone());
            debug!(
                epoch = snapshot.epoch(),
                new = merge.new_id,
                inputs = merge.inputs.len(),
                ?outcome,
                "introduced merge"
            );
            install_root(inner, snapshot, None);
        }
        None => debug!(new = merge.new_id, "merge inputs gone, discarding"),
    }
    let _ = merge.done.send(outcome);
}

fn introduce_persisted(inner: &IndexInner, persist: PersistIntroduction) {
    let root = inner.root.load_full();
    if !root.segments().iter().any(|s| persist.twins.contains_key(&s.id())) {
        let _ = persist.applied.send(root);
        return;
    }

    let segments = root
        .segments()
        .iter()
        .map(|s| match persist.twins.get(&s.id()) {
            Some(twin) => s.with_segment(twin.clone()),
            None => s.clone(),
        })
        .collect();
    let snapshot = Arc::new(IndexSnapshot::new(inner.next_epoch(), segments, root.internal().clone()));
    debug!(epoch = snapshot.epoch(), swapped = persist.twins.len(), "introduced persisted segments");

    inner.root.store(snapshot.clone());
    inner.stats.record_root(snapshot.epoch(), snapshot.segments().len());
    let _ = persist.applied.send(snapshot);
}

fn revert_to_snapshot(inner: &IndexInner, revert: SnapshotReversion) {
    let snapshot = IndexSnapshot::new(inner.next_epoch(), revert.segments, revert.internal);
    debug!(epoch = snapshot.epoch(), segments = snapshot.segments().len(), "reverted root");
    install_root(inner, snapshot, revert.persisted);
    inner.stats.tot_rollback_ops.inc();
    let _ = revert.applied.send(Ok(()));
}
