//! Core types shared by the segment reader, writer and merger

use serde::{Deserialize, Serialize};

use crate::models::FieldKind;

/// Name of the document identifier field; always field 0 in a segment
pub const ID_FIELD: &str = "_id";

/// Default number of documents per chunk
pub const DEFAULT_CHUNK_FACTOR: u32 = 1024;

/// Terms at or below this cardinality keep their whole postings list in one chunk
pub const ONE_CHUNK_CARDINALITY: u64 = 1024;

/// Marks a document removed during merge in an old-to-new doc number table
pub const DOC_DROPPED: u64 = u64::MAX;

/// Dictionary value flag for postings inlined into the FST
pub const ONE_HIT_FLAG: u64 = 1 << 63;

const ONE_HIT_DOC_MASK: u64 = 0x7fff_ffff;

/// Chunk size used for a postings list of `cardinality` docs
pub fn postings_chunk_size(cardinality: u64, num_docs: u64, chunk_factor: u32) -> u64 {
    if cardinality <= ONE_CHUNK_CARDINALITY {
        if num_docs > 0 {
            num_docs
        } else {
            chunk_factor.max(1) as u64
        }
    } else {
        chunk_factor.max(1) as u64
    }
}

/// Pack a single-doc postings list into a dictionary value, if it fits
pub fn encode_one_hit(doc_num: u64, norm: f32) -> Option<u64> {
    if doc_num > ONE_HIT_DOC_MASK {
        return None;
    }
    let norm_bits = norm.to_bits() as u64 & ONE_HIT_DOC_MASK;
    Some(ONE_HIT_FLAG | (norm_bits << 31) | doc_num)
}

/// Unpack a dictionary value produced by [`encode_one_hit`]
pub fn decode_one_hit(value: u64) -> Option<(u64, f32)> {
    if value & ONE_HIT_FLAG == 0 {
        return None;
    }
    let doc_num = value & ONE_HIT_DOC_MASK;
    let norm_bits = ((value >> 31) & ONE_HIT_DOC_MASK) as u32;
    Some((doc_num, f32::from_bits(norm_bits)))
}

/// Length normalization factor stored with every posting
pub fn norm_for_length(field_length: u64) -> f32 {
    1.0 / (field_length.max(1) as f32).sqrt()
}

/// One occurrence of a term within a document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Id of the field within the segment the location was read from
    pub field_id: u16,
    pub pos: u64,
    pub start: u64,
    pub end: u64,
    pub array_positions: Vec<u64>,
}

/// A single posting entry within a postings list
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    /// Dense document number within the segment
    pub doc_num: u64,
    pub freq: u64,
    pub norm: f32,
    pub locations: Vec<Location>,
}

/// A term and the number of documents containing it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictEntry {
    pub term: Vec<u8>,
    pub count: u64,
}

impl DictEntry {
    pub fn term_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.term).ok()
    }
}

/// Stored field value handed to stored-field visitors
#[derive(Clone, Copy, Debug)]
pub struct StoredValue<'a> {
    pub field: &'a str,
    pub kind: FieldKind,
    pub value: &'a [u8],
    pub array_positions: &'a [u64],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_hit_roundtrip() {
        let norm = norm_for_length(4);
        let value = encode_one_hit(12345, norm).unwrap();
        assert_eq!(value >> 62, 0b10);
        assert_eq!(decode_one_hit(value), Some((12345, norm)));
    }

    #[test]
    fn test_one_hit_rejects_large_doc() {
        assert!(encode_one_hit(1 << 31, 1.0).is_none());
        assert!(decode_one_hit(42).is_none());
    }

    #[test]
    fn test_postings_chunk_size() {
        assert_eq!(postings_chunk_size(10, 5000, 1024), 5000);
        assert_eq!(postings_chunk_size(1024, 5000, 1024), 5000);
        assert_eq!(postings_chunk_size(1025, 5000, 1024), 1024);
        assert_eq!(postings_chunk_size(1, 0, 0), 1);
    }

    #[test]
    fn test_norm_for_length() {
        assert_eq!(norm_for_length(0), 1.0);
        assert_eq!(norm_for_length(1), 1.0);
        assert_eq!(norm_for_length(4), 0.5);
    }
}
