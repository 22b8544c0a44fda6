//! Segments backed by memory-mapped files

use std::fs::File;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;
use roaring::RoaringBitmap;

use super::docvalues::DocValueReader;
use super::reader::SegmentBase;
use super::term_dict::Dictionary;
use super::traits::{DiskStatsReporter, PersistedSegment, Segment};
use super::types::StoredValue;
use crate::error::Result;

/// A segment file mapped into memory; the mapping is released when the last
/// reference to the segment is dropped
#[derive(Debug)]
pub struct FileSegment {
    base: SegmentBase,
    path: PathBuf,
}

impl FileSegment {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: segment files are written to a temporary name, synced and
        // renamed into place, and never opened for writing again. The
        // persister only unlinks a file once no snapshot or merge refers to
        // it, and unlinking leaves an existing mapping intact.
        let mmap = unsafe { Mmap::map(&file)? };
        let base = SegmentBase::open(Bytes::from_owner(mmap))?;
        Ok(Self {
            base,
            path: path.to_path_buf(),
        })
    }

    pub fn base(&self) -> &SegmentBase {
        &self.base
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

impl Segment for FileSegment {
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

    fn as_persisted(&self) -> Option<&dyn PersistedSegment> {
        Some(self)
    }

    fn as_disk_stats(&self) -> Option<&dyn DiskStatsReporter> {
        Some(self)
    }
}

impl PersistedSegment for FileSegment {
    fn path(&self) -> &Path {
        &self.path
    }
}

impl DiskStatsReporter for FileSegment {
    fn bytes_read(&self) -> u64 {
        self.base.bytes_read()
    }

    fn reset_bytes_read(&self) {
        self.base.reset_bytes_read()
    }

    fn bytes_written(&self) -> u64 {
        self.base.size() as u64
    }
}
