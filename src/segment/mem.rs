//! Segments that live only in memory until the persister writes them out

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use bytes::Bytes;
use roaring::RoaringBitmap;

use super::builder::build_segment_bytes;
use super::docvalues::DocValueReader;
use super::reader::SegmentBase;
use super::term_dict::Dictionary;
use super::traits::{DiskStatsReporter, Segment, UnpersistedSegment};
use super::types::StoredValue;
use crate::analysis::AnalysisResult;
use crate::error::Result;

/// A freshly built segment held in memory
#[derive(Debug)]
pub struct MemSegment {
    base: SegmentBase,
}

impl MemSegment {
    /// Encode analyzed documents into a new in-memory segment
    pub fn build(results: &[AnalysisResult], chunk_factor: u32) -> Result<Self> {
        let buf = build_segment_bytes(results, chunk_factor)?;
        Self::from_bytes(Bytes::from(buf))
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        Ok(Self {
            base: SegmentBase::open(data)?,
        })
    }

    pub fn base(&self) -> &SegmentBase {
        &self.base
    }
}

/// Write `data` to `path` through a temporary file, syncing before the rename
fn write_file_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(dir) = path.parent() {
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

impl Segment for MemSegment {
    fn count(&self) -> u64 {
        self.base.count()
    }

    fn fields(&self) -> &[String] {
        self.base.fields()
    }

    fn dictionary(&self, field: &str) -> Result<Dictionary> {
        self.base.dictionary(field)
    }

    fn visit_stored(&self, doc_num: u64, visitor: &mut dyn FnMut(StoredValue<'_>) -> bool) -> Result<()> {
        self.base.visit_stored(doc_num, visitor)
    }

    fn doc_id(&self, doc_num: u64) -> Result<String> {
        self.base.doc_id(doc_num)
    }

    fn doc_numbers(&self, ids: &[String]) -> Result<RoaringBitmap> {
        self.base.doc_numbers(ids)
    }

    fn doc_value_reader(&self, field: &str) -> Result<Option<DocValueReader>> {
        self.base.doc_value_reader(field)
    }

    fn size(&self) -> usize {
        self.base.size()
    }

    fn as_unpersisted(&self) -> Option<&dyn UnpersistedSegment> {
        Some(self)
    }

    fn as_disk_stats(&self) -> Option<&dyn DiskStatsReporter> {
        Some(self)
    }
}

impl UnpersistedSegment for MemSegment {
    fn buffer(&self) -> &Bytes {
        self.base.data()
    }

    fn persist(&self, path: &Path) -> Result<()> {
        write_file_atomic(path, self.base.data())
    }
}

impl DiskStatsReporter for MemSegment {
    fn bytes_read(&self) -> u64 {
        self.base.bytes_read()
    }

    fn reset_bytes_read(&self) {
        self.base.reset_bytes_read()
    }

    fn bytes_written(&self) -> u64 {
        0
    }
}
