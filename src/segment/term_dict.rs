//! Term dictionary using FST (Finite State Transducer)
//!
//! Each field's FST maps term bytes to either a postings record offset or an
//! inlined single-document posting. FST provides O(|key|) lookups and
//! efficient prefix/range queries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fst::map::Stream;
use fst::{IntoStreamer, Map, Streamer};
use roaring::RoaringBitmap;

use super::postings::PostingsList;
use super::types::DictEntry;

use crate::error::Result;

/// Dictionary of one field in one segment
#[derive(Clone)]
pub struct Dictionary {
    field: String,
    fst: Option<Map<Bytes>>,
    data: Bytes,
    num_docs: u64,
    chunk_factor: u32,
    bytes_read: Arc<AtomicU64>,
}

impl std::fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dictionary")
            .field("field", &self.field)
            .field("terms", &self.len())
            .finish()
    }
}

impl Dictionary {
    pub(crate) fn new(
        field: &str,
        fst: Option<Map<Bytes>>,
        data: Bytes,
        num_docs: u64,
        chunk_factor: u32,
        bytes_read: Arc<AtomicU64>,
    ) -> Self {
        Self {
            field: field.to_string(),
            fst,
            data,
            num_docs,
            chunk_factor,
            bytes_read,
        }
    }

    /// Dictionary of a field the segment does not have
    pub fn empty(field: &str) -> Self {
        Self::new(field, None, Bytes::new(), 0, 1, Arc::new(AtomicU64::new(0)))
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of terms
    pub fn len(&self) -> usize {
        self.fst.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, term: &[u8]) -> bool {
        self.fst.as_ref().is_some_and(|m| m.contains_key(term))
    }

    /// Raw dictionary value of `term`
    pub fn value(&self, term: &[u8]) -> Option<u64> {
        self.fst.as_ref().and_then(|m| m.get(term))
    }

    /// Postings of `term`, excluding doc numbers in `except`; a missing term
    /// yields an empty list
    pub fn postings_list(&self, term: &[u8], except: Option<&RoaringBitmap>) -> Result<PostingsList> {
        match self.value(term) {
            Some(value) => self.postings_for_value(value, except),
            None => Ok(PostingsList::empty()),
        }
    }

    /// Postings for a value obtained from this dictionary's FST
    pub fn postings_for_value(&self, value: u64, except: Option<&RoaringBitmap>) -> Result<PostingsList> {
        let list = PostingsList::from_value(&self.data, value, self.num_docs, self.chunk_factor, except)?;
        self.bytes_read.fetch_add(8, Ordering::Relaxed);
        Ok(list)
    }

    /// Stream of every (term, value) pair in term order
    pub fn stream(&self) -> Option<Stream<'_>> {
        self.fst.as_ref().map(|m| m.stream())
    }

    /// Stream over `[start, end]`; either bound may be open
    pub fn range_stream(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Option<Stream<'_>> {
        let map = self.fst.as_ref()?;
        let mut range = map.range();
        if let Some(start) = start {
            range = range.ge(start);
        }
        if let Some(end) = end {
            range = range.le(end);
        }
        Some(range.into_stream())
    }

    fn collect(&self, stream: Option<Stream<'_>>, except: Option<&RoaringBitmap>) -> Result<Vec<DictEntry>> {
        let Some(mut stream) = stream else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        while let Some((term, value)) = stream.next() {
            let count = self.postings_for_value(value, except)?.count();
            if count > 0 {
                out.push(DictEntry {
                    term: term.to_vec(),
                    count,
                });
            }
        }
        Ok(out)
    }

    /// Every term with its document count; terms whose every doc is in
    /// `except` are left out
    pub fn entries(&self, except: Option<&RoaringBitmap>) -> Result<Vec<DictEntry>> {
        self.collect(self.stream(), except)
    }

    /// Terms starting with `prefix`
    pub fn prefix_entries(&self, prefix: &[u8], except: Option<&RoaringBitmap>) -> Result<Vec<DictEntry>> {
        let Some(map) = self.fst.as_ref() else {
            return Ok(Vec::new());
        };
        let mut range = map.range().ge(prefix);
        let upper = prefix_successor(prefix);
        if let Some(upper) = upper.as_deref() {
            range = range.lt(upper);
        }
        self.collect(Some(range.into_stream()), except)
    }

    /// Terms in the inclusive range `[start, end]`
    pub fn range_entries(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        except: Option<&RoaringBitmap>,
    ) -> Result<Vec<DictEntry>> {
        self.collect(self.range_stream(start, end), except)
    }
}

/// Smallest byte string greater than every string starting with `prefix`
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < 0xff {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_successor(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_successor(b"\xff\xff"), None);
        assert_eq!(prefix_successor(b""), None);
    }

    #[test]
    fn test_empty_dictionary() {
        let dict = Dictionary::empty("body");
        assert!(dict.is_empty());
        assert!(!dict.contains(b"anything"));
        assert_eq!(dict.postings_list(b"anything", None).unwrap().count(), 0);
        assert!(dict.entries(None).unwrap().is_empty());
        assert!(dict.prefix_entries(b"a", None).unwrap().is_empty());
    }
}
