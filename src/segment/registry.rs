//! Segment implementations available to an index, keyed by type and version
//!
//! Metadata records name the segment type that wrote each snapshot; reopening
//! an index resolves that name here. The registry is an explicit value passed
//! to [`Index::open_with_registry`](crate::index::Index::open_with_registry),
//! never process-wide state.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use roaring::RoaringBitmap;

use super::file::FileSegment;
use super::footer::FORMAT_VERSION;
use super::mem::MemSegment;
use super::merge::merge_to_file;
use super::traits::Segment;
use crate::analysis::AnalysisResult;
use crate::error::{Result, SedimentError};

/// Name of the built-in segment format
pub const FORMAT_NAME: &str = "sediment";

pub type OpenFn = Arc<dyn Fn(&Path) -> Result<Arc<dyn Segment>> + Send + Sync>;
pub type BuildFn = Arc<dyn Fn(&[AnalysisResult], u32) -> Result<Arc<dyn Segment>> + Send + Sync>;
pub type MergeFn =
    Arc<dyn Fn(&[Arc<dyn Segment>], &[Option<RoaringBitmap>], &Path, u32) -> Result<Vec<Vec<u64>>> + Send + Sync>;

/// One segment implementation
#[derive(Clone)]
pub struct SegmentPlugin {
    pub name: String,
    pub version: u32,
    /// Open a persisted segment file
    pub open: OpenFn,
    /// Build an in-memory segment from analyzed documents
    pub build: BuildFn,
    /// Merge segments into a new file, returning per-input doc remaps
    pub merge: MergeFn,
}

impl fmt::Debug for SegmentPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentPlugin")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

impl SegmentPlugin {
    /// The built-in format: [`MemSegment`] builds, [`FileSegment`] opens
    pub fn builtin() -> Self {
        Self {
            name: FORMAT_NAME.to_string(),
            version: FORMAT_VERSION,
            open: Arc::new(|path: &Path| Ok(Arc::new(FileSegment::open(path)?) as Arc<dyn Segment>)),
            build: Arc::new(|results: &[AnalysisResult], chunk_factor: u32| {
                Ok(Arc::new(MemSegment::build(results, chunk_factor)?) as Arc<dyn Segment>)
            }),
            merge: Arc::new(
                |segments: &[Arc<dyn Segment>], drops: &[Option<RoaringBitmap>], path: &Path, chunk_factor: u32| {
                    merge_to_file(segments, drops, path, chunk_factor)
                },
            ),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct SegmentRegistry {
    plugins: HashMap<(String, u32), SegmentPlugin>,
}

impl SegmentRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in format
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.plugins.insert(
            (FORMAT_NAME.to_string(), FORMAT_VERSION),
            SegmentPlugin::builtin(),
        );
        registry
    }

    pub fn register(&mut self, plugin: SegmentPlugin) -> Result<()> {
        let key = (plugin.name.clone(), plugin.version);
        if self.plugins.contains_key(&key) {
            return Err(SedimentError::InvalidRequest(format!(
                "segment type {} version {} already registered",
                plugin.name, plugin.version
            )));
        }
        self.plugins.insert(key, plugin);
        Ok(())
    }

    pub fn get(&self, name: &str, version: u32) -> Result<&SegmentPlugin> {
        self.plugins
            .get(&(name.to_string(), version))
            .ok_or_else(|| SedimentError::UnknownSegmentType {
                name: name.to_string(),
                version,
            })
    }

    pub fn default_plugin(&self) -> Result<&SegmentPlugin> {
        self.get(FORMAT_NAME, FORMAT_VERSION)
    }

    /// Registered (name, version) pairs, sorted
    pub fn types(&self) -> Vec<(String, u32)> {
        let mut types: Vec<_> = self.plugins.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_builtin() {
        let registry = SegmentRegistry::with_defaults();
        let plugin = registry.get(FORMAT_NAME, FORMAT_VERSION).unwrap();
        assert_eq!(plugin.name, FORMAT_NAME);
        assert!(registry.default_plugin().is_ok());
    }

    #[test]
    fn test_unknown_type() {
        let registry = SegmentRegistry::with_defaults();
        let err = registry.get("zap", 15).unwrap_err();
        assert!(matches!(err, SedimentError::UnknownSegmentType { ref name, version: 15 } if name == "zap"));
        assert!(SegmentRegistry::new().default_plugin().is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = SegmentRegistry::with_defaults();
        assert!(registry.register(SegmentPlugin::builtin()).is_err());

        let mut other = SegmentPlugin::builtin();
        other.version = FORMAT_VERSION + 1;
        registry.register(other).unwrap();
        assert_eq!(registry.types().len(), 2);
    }

    #[test]
    fn test_builtin_build() {
        let plugin = SegmentPlugin::builtin();
        let segment = (plugin.build)(&[], 1024).unwrap();
        assert_eq!(segment.count(), 0);
        assert!(segment.as_unpersisted().is_some());
    }
}
