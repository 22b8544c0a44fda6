//! Tiered merge planning
//!
//! Segments are grouped into logarithmic tiers by live size. While the index
//! holds more eligible segments than the tier budget allows, the planner
//! picks the best-scoring roster of similarly sized segments and emits it as
//! a merge task. Planning is pure: it never touches the index.
//!
//! - Segments whose live size reaches half of `max_segment_size` are left alone
//! - Segments with no live data are always merged away together
//! - Lower roster scores win; the default score favors balanced rosters
//!   that reclaim deletions

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SedimentError};

/// Largest `max_segment_size` accepted by [`validate_options`]
pub const MAX_SEGMENT_SIZE_LIMIT: u64 = 1 << 31;

/// What the planner needs to know about a segment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub id: u64,
    /// Size before deletions
    pub full_size: u64,
    /// Size of the data still live
    pub live_size: u64,
}

impl SegmentDescriptor {
    pub fn new(id: u64, full_size: u64, live_size: u64) -> Self {
        Self {
            id,
            full_size,
            live_size,
        }
    }
}

/// Budget hook: `(eligible live size, first tier size, options)` to the
/// number of segments the index may hold
pub type CalcBudgetFn = Arc<dyn Fn(u64, u64, &MergePlanOptions) -> usize + Send + Sync>;

/// Score hook: lower scores are merged first
pub type ScoreSegmentsFn = Arc<dyn Fn(&[SegmentDescriptor], &MergePlanOptions) -> f64 + Send + Sync>;

/// Configuration for the tiered merge planner
#[derive(Clone, Serialize, Deserialize)]
pub struct MergePlanOptions {
    /// Maximum number of segments per tier (default: 10)
    pub max_segments_per_tier: usize,
    /// Largest segment a merge may produce (default: 5,000,000)
    pub max_segment_size: u64,
    /// Maximum number of segments in one merge task, also the size ratio
    /// between consecutive tiers (default: 10)
    pub segments_per_merge_task: usize,
    /// Smaller segments count as this size when tiering and scoring
    pub floor_segment_size: u64,
    /// How strongly merges that reclaim deletions are favored; 0 ignores
    /// deletions
    pub reclaim_deletes_weight: f64,
    /// A segment carrying deletions is only eligible once at least this
    /// percentage of it is deleted; segments without deletions always are
    pub min_deletes_pct: f64,
    #[serde(skip)]
    pub calc_budget: Option<CalcBudgetFn>,
    #[serde(skip)]
    pub score_segments: Option<ScoreSegmentsFn>,
}

impl fmt::Debug for MergePlanOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergePlanOptions")
            .field("max_segments_per_tier", &self.max_segments_per_tier)
            .field("max_segment_size", &self.max_segment_size)
            .field("segments_per_merge_task", &self.segments_per_merge_task)
            .field("floor_segment_size", &self.floor_segment_size)
            .field("reclaim_deletes_weight", &self.reclaim_deletes_weight)
            .field("min_deletes_pct", &self.min_deletes_pct)
            .field("calc_budget", &self.calc_budget.is_some())
            .field("score_segments", &self.score_segments.is_some())
            .finish()
    }
}

impl Default for MergePlanOptions {
    fn default() -> Self {
        Self {
            max_segments_per_tier: 10,
            max_segment_size: 5_000_000,
            segments_per_merge_task: 10,
            floor_segment_size: 2000,
            reclaim_deletes_weight: 2.0,
            min_deletes_pct: 10.0,
            calc_budget: None,
            score_segments: None,
        }
    }
}

impl MergePlanOptions {
    pub fn raise_to_floor_segment_size(&self, size: u64) -> u64 {
        size.max(self.floor_segment_size)
    }

    /// Whether a segment's deletions, if any, reach `min_deletes_pct`
    pub fn qualifies(&self, segment: &SegmentDescriptor) -> bool {
        if segment.full_size == 0 || segment.live_size >= segment.full_size {
            return true;
        }
        let deleted = (segment.full_size - segment.live_size) as f64;
        deleted * 100.0 / segment.full_size as f64 >= self.min_deletes_pct
    }

    pub fn with_calc_budget(mut self, f: CalcBudgetFn) -> Self {
        self.calc_budget = Some(f);
        self
    }

    pub fn with_score_segments(mut self, f: ScoreSegmentsFn) -> Self {
        self.score_segments = Some(f);
        self
    }
}

/// A set of segments to merge into one
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeTask {
    pub segments: Vec<SegmentDescriptor>,
}

impl MergeTask {
    pub fn segment_ids(&self) -> Vec<u64> {
        self.segments.iter().map(|s| s.id).collect()
    }

    pub fn live_size(&self) -> u64 {
        self.segments.iter().map(|s| s.live_size).sum()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub tasks: Vec<MergeTask>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Reject options the planner cannot honor
pub fn validate_options(options: &MergePlanOptions) -> Result<()> {
    if options.max_segment_size > MAX_SEGMENT_SIZE_LIMIT {
        return Err(SedimentError::InvalidRequest(format!(
            "max_segment_size {} exceeds the limit of {}",
            options.max_segment_size, MAX_SEGMENT_SIZE_LIMIT
        )));
    }
    if options.segments_per_merge_task < 2 {
        return Err(SedimentError::InvalidRequest(format!(
            "segments_per_merge_task must be at least 2, got {}",
            options.segments_per_merge_task
        )));
    }
    Ok(())
}

/// Number of segments an index of `total_size` may hold before merging
pub fn calc_budget(total_size: u64, first_tier_size: u64, options: &MergePlanOptions) -> usize {
    let mut tier_size = first_tier_size.max(1);
    let per_tier = options.max_segments_per_tier.max(1);
    let growth = options.segments_per_merge_task.max(1) as u64;

    let mut remaining = total_size;
    let mut budget = 0;
    while remaining > 0 {
        let segments_in_tier = remaining as f64 / tier_size as f64;
        if segments_in_tier < per_tier as f64 {
            budget += segments_in_tier.ceil() as usize;
            break;
        }
        budget += per_tier;
        remaining = remaining.saturating_sub(per_tier as u64 * tier_size);
        tier_size = tier_size.saturating_mul(growth);
    }
    budget
}

/// Default roster score; the first segment is the roster's largest
pub fn score_segments(segments: &[SegmentDescriptor], options: &MergePlanOptions) -> f64 {
    let Some(first) = segments.first() else {
        return 0.0;
    };
    let total_full: u64 = segments.iter().map(|s| s.full_size).sum();
    let total_live: u64 = segments.iter().map(|s| s.live_size).sum();
    let total_floored: u64 = segments
        .iter()
        .map(|s| options.raise_to_floor_segment_size(s.live_size))
        .sum();
    if total_full == 0 || total_live == 0 || total_floored == 0 {
        return 0.0;
    }

    // 1.0 for a lone segment, approaching 1/n for n equal segments
    let balance = options.raise_to_floor_segment_size(first.live_size) as f64 / total_floored as f64;
    let mut score = balance * (total_live as f64).powf(0.05);
    let live_ratio = total_live as f64 / total_full as f64;
    score *= live_ratio.powf(options.reclaim_deletes_weight);
    score
}

fn remove_segments(segments: &mut Vec<SegmentDescriptor>, remove: &[SegmentDescriptor]) {
    segments.retain(|s| !remove.iter().any(|r| r.id == s.id));
}

/// Plan merges for `segments`
pub fn plan(segments: &[SegmentDescriptor], options: &MergePlanOptions) -> Result<MergePlan> {
    let mut result = MergePlan::default();
    if segments.len() < 2 {
        return Ok(result);
    }

    let mut sorted = segments.to_vec();
    sorted.sort_by(|a, b| b.live_size.cmp(&a.live_size).then(a.id.cmp(&b.id)));

    let min_live = sorted.iter().map(|s| s.live_size).min().unwrap_or(0);
    let first_tier = options.raise_to_floor_segment_size(min_live);
    let mut eligible: Vec<SegmentDescriptor> = sorted
        .into_iter()
        .filter(|s| s.live_size < options.max_segment_size / 2 && options.qualifies(s))
        .collect();
    let eligible_live: u64 = eligible.iter().map(|s| s.live_size).sum();

    let budget = match &options.calc_budget {
        Some(f) => f(eligible_live, first_tier, options),
        None => calc_budget(eligible_live, first_tier, options),
    };
    let score = |roster: &[SegmentDescriptor]| match &options.score_segments {
        Some(f) => f(roster, options),
        None => score_segments(roster, options),
    };

    let empties: Vec<SegmentDescriptor> = eligible.iter().filter(|s| s.live_size == 0).cloned().collect();
    if !empties.is_empty() {
        remove_segments(&mut eligible, &empties);
        result.tasks.push(MergeTask { segments: empties });
    }

    while !eligible.is_empty() && eligible.len() + result.tasks.len() > budget {
        let mut best: Option<(Vec<SegmentDescriptor>, f64)> = None;

        for start in 0..eligible.len() {
            let mut roster = Vec::new();
            let mut roster_live = 0u64;
            for candidate in &eligible[start..] {
                if roster.len() >= options.segments_per_merge_task {
                    break;
                }
                // keep packing smaller segments instead of stopping at the first overflow
                if roster_live + candidate.live_size < options.max_segment_size {
                    roster_live += candidate.live_size;
                    roster.push(candidate.clone());
                }
            }
            if roster.is_empty() {
                continue;
            }
            let roster_score = score(&roster);
            if best.as_ref().map_or(true, |(_, s)| roster_score < *s) {
                best = Some((roster, roster_score));
            }
        }

        match best {
            Some((roster, _)) if roster.len() > 1 => {
                remove_segments(&mut eligible, &roster);
                result.tasks.push(MergeTask { segments: roster });
            }
            _ => break,
        }
    }

    tracing::trace!(
        segments = segments.len(),
        budget,
        tasks = result.tasks.len(),
        "planned merges"
    );
    Ok(result)
}
