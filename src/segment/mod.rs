//! Immutable segment format
//!
//! A segment is a self-contained, write-once image of a batch of documents:
//! stored fields, one FST term dictionary per field, chunked postings with
//! roaring doc sets, optional doc values and a checksummed footer.
//!
//! # Architecture
//!
//! - `SegmentWriter`: Section-ordered encoder shared by building and merging
//! - `SegmentBase`: Parses an image once and serves readers over it
//! - `MemSegment` / `FileSegment`: In-memory and memory-mapped segments
//! - `SegmentRegistry`: Segment implementations by type name and version

mod builder;
mod contentcoder;
mod docvalues;
mod file;
mod footer;
mod intcoder;
mod mem;
mod merge;
mod postings;
mod reader;
mod registry;
mod store;
mod term_dict;
mod traits;
mod types;
pub mod varint;
mod writer;

pub use builder::{build_segment, build_segment_bytes};
pub use contentcoder::ChunkedContentCoder;
pub use docvalues::{encode_terms, DocValueReader, TERM_SEPARATOR};
pub use file::FileSegment;
pub use footer::{Footer, FOOTER_SIZE, FORMAT_VERSION};
pub use mem::MemSegment;
pub use merge::{merge_to_bytes, merge_to_file, merge_to_writer};
pub use postings::{PostingsIterator, PostingsList};
pub use reader::SegmentBase;
pub use registry::{BuildFn, MergeFn, OpenFn, SegmentPlugin, SegmentRegistry, FORMAT_NAME};
pub use term_dict::Dictionary;
pub use traits::{DiskStatsReporter, PersistedSegment, Segment, UnpersistedSegment};
pub use types::{
    decode_one_hit, encode_one_hit, norm_for_length, postings_chunk_size, DictEntry, Location, Posting,
    StoredValue, DEFAULT_CHUNK_FACTOR, DOC_DROPPED, ID_FIELD, ONE_CHUNK_CARDINALITY, ONE_HIT_FLAG,
};
pub use writer::{DocRuns, SegmentWriter};

