//! The merger thread: plans merges over file-backed segments whenever the
//! persister makes a new root durable.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{bounded, select, TryRecvError};
use roaring::RoaringBitmap;
use tracing::{debug, info};

use super::introducer::{MergeInput, MergeOutcome, SegmentMerge};
use super::persister::IneligibleGuard;
use super::watcher::EpochWatcher;
use super::{segment_file_name, IndexInner};
use crate::error::{Result, SedimentError};
use crate::mergeplan::{self, MergeTask, SegmentDescriptor};
use crate::snapshot::{IndexSnapshot, SegmentSnapshot};

pub(crate) fn run(inner: Arc<IndexInner>) {
    let close = inner.close_rx.clone();
    let mut last_merged = 0;

    loop {
        let root = inner.root.load_full();
        if root.epoch() != last_merged {
            if let Err(e) = plan_and_merge(&inner, &root) {
                if matches!(e, SedimentError::Closed) {
                    break;
                }
                inner.stats.tot_merge_errors.inc();
                inner.report_async_error("merge", &e);
            }
            last_merged = root.epoch();
        }

        // sleep until something newer than what we planned over is durable
        let (watcher, persisted) = EpochWatcher::new(last_merged);
        select! {
            recv(close) -> _ => break,
            send(inner.persister_watchers, watcher) -> res => {
                if res.is_err() {
                    break;
                }
            }
        }
        select! {
            recv(close) -> _ => break,
            recv(persisted) -> res => {
                if res.is_err() {
                    break;
                }
            }
        }
    }
    debug!("merger stopped");
}

fn plan_and_merge(inner: &IndexInner, root: &IndexSnapshot) -> Result<()> {
    let candidates: Vec<&SegmentSnapshot> = root
        .segments()
        .iter()
        .filter(|s| s.segment().as_persisted().is_some())
        .collect();
    let descriptors: Vec<SegmentDescriptor> = candidates
        .iter()
        .map(|s| SegmentDescriptor::new(s.id(), s.full_size(), s.count()))
        .collect();

    let plan = mergeplan::plan(&descriptors, &inner.config.merge_plan)?;
    if plan.is_empty() {
        return Ok(());
    }
    debug!(epoch = root.epoch(), tasks = plan.tasks.len(), "planned merges");

    for task in &plan.tasks {
        match inner.close_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => return Err(SedimentError::Closed),
        }
        let inputs: Vec<&SegmentSnapshot> = task
            .segment_ids()
            .into_iter()
            .filter_map(|id| candidates.iter().copied().find(|s| s.id() == id))
            .collect();
        merge_task(inner, task, &inputs)?;
    }
    Ok(())
}

fn merge_task(inner: &IndexInner, task: &MergeTask, inputs: &[&SegmentSnapshot]) -> Result<()> {
    let Some(dir) = inner.config.path.as_deref() else {
        return Err(SedimentError::Internal("merger running without a directory".to_string()));
    };
    let start = Instant::now();

    let new_id = inner.next_segment_id();
    let name = segment_file_name(new_id);
    let _guard = IneligibleGuard::mark(inner, vec![name.clone()]);
    let path = dir.join(&name);

    let segments: Vec<_> = inputs.iter().map(|s| s.segment().clone()).collect();
    let drops: Vec<Option<RoaringBitmap>> = inputs
        .iter()
        .map(|s| s.deleted().map(|d| d.as_ref().clone()))
        .collect();

    let remaps = (inner.plugin.merge)(&segments, &drops, &path, inner.config.chunk_factor)?;
    inner.stats.tot_file_merge_ops.inc();
    inner.stats.tot_file_merge_segments.inc_by(inputs.len() as u64);
    let new = (inner.plugin.open)(&path)?;

    let (done, done_rx) = bounded(1);
    let merge = SegmentMerge {
        inputs: inputs
            .iter()
            .map(|s| MergeInput {
                id: s.id(),
                segment: s.segment().clone(),
                deleted: s.deleted().cloned(),
            })
            .collect(),
        remaps,
        new_id,
        new,
        done,
    };

    let close = &inner.close_rx;
    select! {
        recv(close) -> _ => return Err(SedimentError::Closed),
        send(inner.merges, merge) -> res => res.map_err(|_| SedimentError::Closed)?,
    }
    let outcome = select! {
        recv(close) -> _ => return Err(SedimentError::Closed),
        recv(done_rx) -> res => res.map_err(|_| SedimentError::Closed)?,
    };

    info!(
        new = new_id,
        inputs = ?task.segment_ids(),
        live = task.live_size(),
        ?outcome,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "merge finished"
    );
    if outcome != MergeOutcome::Introduced {
        debug!(new = new_id, "merged segment not introduced");
    }
    Ok(())
}
