//! Segment capability traits
//!
//! [`Segment`] is what readers, the merger and snapshots work against.
//! Narrower capabilities are discovered at runtime through the `as_*`
//! queries instead of matching on concrete types, so a new segment
//! implementation only has to answer the queries it supports.

use std::fmt;
use std::path::Path;

use bytes::Bytes;
use roaring::RoaringBitmap;

use super::docvalues::DocValueReader;
use super::term_dict::Dictionary;
use super::types::StoredValue;
use crate::error::Result;

/// An immutable generation of documents numbered `0..count()`
pub trait Segment: Send + Sync + fmt::Debug {
    fn count(&self) -> u64;

    /// Field names in field id order; the id field is always first
    fn fields(&self) -> &[String];

    fn dictionary(&self, field: &str) -> Result<Dictionary>;

    /// Visit stored values of `doc_num`, `_id` first; return false to stop
    fn visit_stored(&self, doc_num: u64, visitor: &mut dyn FnMut(StoredValue<'_>) -> bool) -> Result<()>;

    /// External id of `doc_num`
    fn doc_id(&self, doc_num: u64) -> Result<String>;

    /// Local doc numbers holding any of `ids`, deleted or not
    fn doc_numbers(&self, ids: &[String]) -> Result<RoaringBitmap>;

    fn doc_value_reader(&self, field: &str) -> Result<Option<DocValueReader>>;

    /// Approximate memory footprint in bytes
    fn size(&self) -> usize;

    fn as_persisted(&self) -> Option<&dyn PersistedSegment> {
        None
    }

    fn as_unpersisted(&self) -> Option<&dyn UnpersistedSegment> {
        None
    }

    fn as_disk_stats(&self) -> Option<&dyn DiskStatsReporter> {
        None
    }
}

/// A segment backed by a file
pub trait PersistedSegment {
    fn path(&self) -> &Path;
}

/// A segment that only exists in memory
pub trait UnpersistedSegment {
    /// The encoded segment image
    fn buffer(&self) -> &Bytes;

    /// Write the segment image durably to `path`
    fn persist(&self, path: &Path) -> Result<()>;
}

/// Byte accounting for segment I/O
pub trait DiskStatsReporter {
    fn bytes_read(&self) -> u64;

    fn reset_bytes_read(&self);

    fn bytes_written(&self) -> u64;
}
