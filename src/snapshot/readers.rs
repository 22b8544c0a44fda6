//! Snapshot-wide iterators over global doc numbers
//!
//! Both readers walk segments in order, so global doc numbers come out
//! ascending without a heap.

use std::iter::Peekable;

use roaring::RoaringBitmap;

use crate::error::Result;
use crate::segment::{Posting, PostingsIterator, PostingsList};

struct TermPart {
    offset: u64,
    end: u64,
    iter: PostingsIterator,
}

/// Postings of one term across a snapshot
///
/// Returned postings carry global doc numbers.
pub struct TermFieldReader {
    parts: Vec<TermPart>,
    current: usize,
    count: u64,
}

impl TermFieldReader {
    pub(crate) fn new(
        lists: Vec<(u64, u64, PostingsList)>,
        include_freq_norm: bool,
        include_locations: bool,
    ) -> Result<Self> {
        let count = lists.iter().map(|(_, _, list)| list.count()).sum();
        let parts = lists
            .into_iter()
            .map(|(offset, end, list)| {
                Ok(TermPart {
                    offset,
                    end,
                    iter: list.iter(include_freq_norm, include_locations)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            parts,
            current: 0,
            count,
        })
    }

    /// Number of live documents containing the term
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn next(&mut self) -> Result<Option<Posting>> {
        while let Some(part) = self.parts.get_mut(self.current) {
            if let Some(mut posting) = part.iter.next_posting()? {
                posting.doc_num += part.offset;
                return Ok(Some(posting));
            }
            self.current += 1;
        }
        Ok(None)
    }

    /// First posting with global doc number >= `target`
    pub fn advance(&mut self, target: u64) -> Result<Option<Posting>> {
        while let Some(part) = self.parts.get_mut(self.current) {
            if target >= part.end {
                self.current += 1;
                continue;
            }
            if let Some(mut posting) = part.iter.advance(target.saturating_sub(part.offset))? {
                posting.doc_num += part.offset;
                return Ok(Some(posting));
            }
            self.current += 1;
        }
        Ok(None)
    }
}

/// Live global doc numbers of a snapshot, ascending
pub struct DocIdReader {
    parts: Vec<(u64, Peekable<roaring::bitmap::IntoIter>)>,
    current: usize,
}

impl DocIdReader {
    pub(crate) fn new(parts: Vec<(u64, RoaringBitmap)>) -> Self {
        Self {
            parts: parts
                .into_iter()
                .filter(|(_, docs)| !docs.is_empty())
                .map(|(offset, docs)| (offset, docs.into_iter().peekable()))
                .collect(),
            current: 0,
        }
    }

    /// First doc number >= `target`
    pub fn advance(&mut self, target: u64) -> Option<u64> {
        while let Some((offset, docs)) = self.parts.get_mut(self.current) {
            while let Some(&doc) = docs.peek() {
                if doc as u64 + *offset >= target {
                    break;
                }
                docs.next();
            }
            match docs.next() {
                Some(doc) => return Some(doc as u64 + *offset),
                None => self.current += 1,
            }
        }
        None
    }
}

impl Iterator for DocIdReader {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while let Some((offset, docs)) = self.parts.get_mut(self.current) {
            if let Some(doc) = docs.next() {
                return Some(doc as u64 + *offset);
            }
            self.current += 1;
        }
        None
    }
}
