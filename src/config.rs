use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::SedimentError;
use crate::mergeplan::MergePlanOptions;
use crate::segment::{DEFAULT_CHUNK_FACTOR, FORMAT_NAME, FORMAT_VERSION};

/// Callback invoked for failures in background loops
pub type AsyncErrorHandler = Arc<dyn Fn(&SedimentError) + Send + Sync>;

/// Analyzer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub lowercase: bool,
    pub stem: bool,
    pub min_token_length: usize,
    pub max_token_length: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            lowercase: true,
            stem: false,
            min_token_length: 1,
            max_token_length: 255,
        }
    }
}

/// How long a batch waits before returning
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// Wait until the batch's epoch has been persisted
    Sync,
    /// Return once the batch is visible in the root snapshot
    Unsafe,
}

/// Index configuration
#[derive(Clone)]
pub struct IndexConfig {
    /// Index directory; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    pub segment_type: String,
    pub segment_version: u32,
    pub chunk_factor: u32,
    pub durability: Durability,
    pub merge_plan: MergePlanOptions,
    /// Number of metadata records retained as rollback points
    pub num_snapshots_to_keep: usize,
    /// Capacity of each bounded pipeline queue
    pub queue_depth: usize,
    pub read_only: bool,
    pub analyzer: AnalyzerConfig,
    pub async_error_handler: Option<AsyncErrorHandler>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: None,
            segment_type: FORMAT_NAME.to_string(),
            segment_version: FORMAT_VERSION,
            chunk_factor: DEFAULT_CHUNK_FACTOR,
            durability: Durability::Sync,
            merge_plan: MergePlanOptions::default(),
            num_snapshots_to_keep: 1,
            queue_depth: 8,
            read_only: false,
            analyzer: AnalyzerConfig::default(),
            async_error_handler: None,
        }
    }
}

impl fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexConfig")
            .field("path", &self.path)
            .field("segment_type", &self.segment_type)
            .field("segment_version", &self.segment_version)
            .field("chunk_factor", &self.chunk_factor)
            .field("durability", &self.durability)
            .field("merge_plan", &self.merge_plan)
            .field("num_snapshots_to_keep", &self.num_snapshots_to_keep)
            .field("queue_depth", &self.queue_depth)
            .field("read_only", &self.read_only)
            .field("analyzer", &self.analyzer)
            .field("async_error_handler", &self.async_error_handler.is_some())
            .finish()
    }
}

/// Configuration profiles for different workloads
#[derive(Clone, Copy, Debug)]
pub enum PerformanceProfile {
    Durable,
    Balanced,
    Bulk,
}

impl PerformanceProfile {
    pub fn durability(&self) -> Durability {
        match self {
            PerformanceProfile::Durable | PerformanceProfile::Balanced => Durability::Sync,
            PerformanceProfile::Bulk => Durability::Unsafe,
        }
    }

    pub fn queue_depth(&self) -> usize {
        match self {
            PerformanceProfile::Durable => 1,
            PerformanceProfile::Balanced => 8,
            PerformanceProfile::Bulk => 64,
        }
    }

    /// Segments allowed per tier before the planner merges them
    pub fn max_segments_per_tier(&self) -> usize {
        match self {
            PerformanceProfile::Durable => 5,
            PerformanceProfile::Balanced => 10,
            PerformanceProfile::Bulk => 20,
        }
    }

    /// Apply this profile to an IndexConfig
    pub fn apply_to(&self, config: &mut IndexConfig) {
        config.durability = self.durability();
        config.queue_depth = self.queue_depth();
        config.merge_plan.max_segments_per_tier = self.max_segments_per_tier();
    }
}

impl IndexConfig {
    /// Configuration for a persistent index rooted at `path`
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Configuration for an index that never touches disk
    pub fn in_memory() -> Self {
        Self {
            durability: Durability::Unsafe,
            ..Default::default()
        }
    }

    /// Apply a performance profile to this configuration
    pub fn with_profile(mut self, profile: PerformanceProfile) -> Self {
        profile.apply_to(&mut self);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn with_chunk_factor(mut self, chunk_factor: u32) -> Self {
        self.chunk_factor = chunk_factor;
        self
    }

    pub fn with_merge_plan(mut self, options: MergePlanOptions) -> Self {
        self.merge_plan = options;
        self
    }

    pub fn with_snapshots_to_keep(mut self, keep: usize) -> Self {
        self.num_snapshots_to_keep = keep;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_analyzer(mut self, analyzer: AnalyzerConfig) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_segment_type(mut self, name: impl Into<String>, version: u32) -> Self {
        self.segment_type = name.into();
        self.segment_version = version;
        self
    }

    pub fn with_async_error_handler(
        mut self,
        handler: impl Fn(&SedimentError) + Send + Sync + 'static,
    ) -> Self {
        self.async_error_handler = Some(Arc::new(handler));
        self
    }

    /// Batches wait for persistence only when there is a persister to wait on
    pub fn waits_for_persistence(&self) -> bool {
        self.path.is_some() && !self.read_only && self.durability == Durability::Sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let config = IndexConfig::default();
        assert_eq!(config.chunk_factor, 1024);
        assert_eq!(config.num_snapshots_to_keep, 1);
        assert_eq!(config.segment_type, FORMAT_NAME);
        assert!(config.path.is_none());

        let analyzer = AnalyzerConfig::default();
        assert!(analyzer.lowercase);
        assert!(!analyzer.stem);
    }

    #[test]
    fn test_performance_profiles() {
        assert_eq!(PerformanceProfile::Bulk.durability(), Durability::Unsafe);
        assert_eq!(PerformanceProfile::Durable.queue_depth(), 1);
        assert_eq!(PerformanceProfile::Balanced.max_segments_per_tier(), 10);
    }

    #[test]
    fn test_index_config_builder() {
        let config = IndexConfig::new("/tmp/idx")
            .with_profile(PerformanceProfile::Bulk)
            .with_snapshots_to_keep(5)
            .with_chunk_factor(64);

        assert_eq!(config.path, Some(PathBuf::from("/tmp/idx")));
        assert_eq!(config.durability, Durability::Unsafe);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.merge_plan.max_segments_per_tier, 20);
        assert_eq!(config.num_snapshots_to_keep, 5);
        assert_eq!(config.chunk_factor, 64);
        assert!(!config.waits_for_persistence());
    }

    #[test]
    fn test_in_memory_never_waits_for_persistence() {
        let config = IndexConfig::in_memory().with_durability(Durability::Sync);
        assert!(!config.waits_for_persistence());
        assert!(IndexConfig::new("/tmp/idx").waits_for_persistence());
    }
}
