pub mod analysis;
pub mod config;
pub mod error;
pub mod index;
pub mod mergeplan;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod segment;
pub mod snapshot;

pub use analysis::{AnalysisResult, Analyzer};
pub use config::{AnalyzerConfig, Durability, IndexConfig, PerformanceProfile};
pub use error::{Result, SedimentError};
pub use index::{rollback_points_at, Index, RollbackPoint};
pub use mergeplan::{MergePlan, MergePlanOptions, MergeTask, SegmentDescriptor};
pub use metrics::IndexStats;
pub use models::*;
pub use segment::{Segment, SegmentPlugin, SegmentRegistry};
pub use snapshot::{IndexSnapshot, SegmentSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
