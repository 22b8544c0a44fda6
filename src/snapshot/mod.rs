//! Immutable point-in-time views of the index
//!
//! An [`IndexSnapshot`] is an ordered list of [`SegmentSnapshot`]s, the
//! cumulative doc number offset of each, the internal key/value map and the
//! epoch it was installed at. Snapshots are shared as `Arc<IndexSnapshot>`:
//! cloning the `Arc` retains it, dropping releases it, and segments are
//! unmapped once the last snapshot referencing them goes away.
//!
//! Global doc numbers are `offset + local doc number`, so they increase
//! with segment position.

mod dict;
mod readers;

pub use dict::FieldDict;
pub use readers::{DocIdReader, TermFieldReader};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use roaring::RoaringBitmap;

use crate::error::{Result, SedimentError};
use crate::models::{Document, Field, FieldOptions};
use crate::segment::{Segment, ID_FIELD};

/// A segment paired with the docs deleted from it as of one snapshot
#[derive(Clone, Debug)]
pub struct SegmentSnapshot {
    id: u64,
    segment: Arc<dyn Segment>,
    deleted: Option<Arc<RoaringBitmap>>,
}

impl SegmentSnapshot {
    pub fn new(id: u64, segment: Arc<dyn Segment>, deleted: Option<Arc<RoaringBitmap>>) -> Self {
        let deleted = deleted.filter(|d| !d.is_empty());
        Self { id, segment, deleted }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn segment(&self) -> &Arc<dyn Segment> {
        &self.segment
    }

    pub fn deleted(&self) -> Option<&Arc<RoaringBitmap>> {
        self.deleted.as_ref()
    }

    /// Documents in the segment, deleted or not
    pub fn full_size(&self) -> u64 {
        self.segment.count()
    }

    /// Documents not deleted
    pub fn count(&self) -> u64 {
        let deleted = self.deleted.as_ref().map_or(0, |d| d.len());
        self.segment.count().saturating_sub(deleted)
    }

    pub fn is_deleted(&self, doc_num: u64) -> bool {
        match (&self.deleted, u32::try_from(doc_num)) {
            (Some(d), Ok(doc)) => d.contains(doc),
            _ => false,
        }
    }

    /// Live local doc numbers holding any of `ids`
    pub fn live_doc_numbers(&self, ids: &[String]) -> Result<RoaringBitmap> {
        let mut docs = self.segment.doc_numbers(ids)?;
        if let Some(deleted) = &self.deleted {
            docs -= deleted.as_ref();
        }
        Ok(docs)
    }

    /// The same segment with `delta` added to its deletions
    pub fn with_deletions(&self, delta: &RoaringBitmap) -> Self {
        if delta.is_empty() {
            return self.clone();
        }
        let deleted = match &self.deleted {
            Some(d) => d.as_ref() | delta,
            None => delta.clone(),
        };
        Self::new(self.id, self.segment.clone(), Some(Arc::new(deleted)))
    }

    /// The same documents and deletions backed by another segment
    pub fn with_segment(&self, segment: Arc<dyn Segment>) -> Self {
        Self {
            id: self.id,
            segment,
            deleted: self.deleted.clone(),
        }
    }

    fn deleted_ref(&self) -> Option<&RoaringBitmap> {
        self.deleted.as_deref()
    }
}

/// One immutable generation of the whole index
#[derive(Debug)]
pub struct IndexSnapshot {
    epoch: u64,
    segments: Vec<SegmentSnapshot>,
    offsets: Vec<u64>,
    internal: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl IndexSnapshot {
    pub fn new(epoch: u64, segments: Vec<SegmentSnapshot>, internal: Arc<BTreeMap<Vec<u8>, Vec<u8>>>) -> Self {
        let mut offsets = Vec::with_capacity(segments.len());
        let mut running = 0;
        for segment in &segments {
            offsets.push(running);
            running += segment.full_size();
        }
        Self {
            epoch,
            segments,
            offsets,
            internal,
        }
    }

    pub fn empty() -> Self {
        Self::new(0, Vec::new(), Arc::default())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn segments(&self) -> &[SegmentSnapshot] {
        &self.segments
    }

    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    pub fn internal(&self) -> &Arc<BTreeMap<Vec<u8>, Vec<u8>>> {
        &self.internal
    }

    pub fn get_internal(&self, key: &[u8]) -> Option<&[u8]> {
        self.internal.get(key).map(Vec::as_slice)
    }

    /// Number of live documents
    pub fn doc_count(&self) -> u64 {
        self.segments.iter().map(SegmentSnapshot::count).sum()
    }

    /// Total doc numbers allocated, deleted ones included
    pub fn max_doc(&self) -> u64 {
        match (self.offsets.last(), self.segments.last()) {
            (Some(offset), Some(segment)) => offset + segment.full_size(),
            _ => 0,
        }
    }

    /// Whether two snapshots hold the same segments, deletions and internal
    /// data, whatever their epochs
    pub fn same_content(&self, other: &IndexSnapshot) -> bool {
        self.segments.len() == other.segments.len()
            && Arc::ptr_eq(&self.internal, &other.internal)
            && self.segments.iter().zip(&other.segments).all(|(a, b)| {
                a.id == b.id
                    && match (&a.deleted, &b.deleted) {
                        (Some(x), Some(y)) => Arc::ptr_eq(x, y),
                        (None, None) => true,
                        _ => false,
                    }
            })
    }

    /// Segment index and local doc number of a global doc number
    pub fn segment_for(&self, global: u64) -> Option<(usize, u64)> {
        if global >= self.max_doc() {
            return None;
        }
        let idx = self.offsets.partition_point(|&o| o <= global).checked_sub(1)?;
        Some((idx, global - self.offsets[idx]))
    }

    /// Global doc number of the live document with external `id`
    pub fn internal_id(&self, id: &str) -> Result<Option<u64>> {
        let ids = [id.to_string()];
        for (segment, offset) in self.segments.iter().zip(&self.offsets).rev() {
            if let Some(local) = segment.live_doc_numbers(&ids)?.min() {
                return Ok(Some(offset + local as u64));
            }
        }
        Ok(None)
    }

    /// External id of a global doc number
    pub fn external_id(&self, global: u64) -> Result<String> {
        let (idx, local) = self
            .segment_for(global)
            .ok_or_else(|| SedimentError::InvalidRequest(format!("doc number {global} out of range")))?;
        self.segments[idx].segment().doc_id(local)
    }

    /// Stored fields of the live document with external `id`
    pub fn document(&self, id: &str) -> Result<Option<Document>> {
        let Some(global) = self.internal_id(id)? else {
            return Ok(None);
        };
        self.document_at(global).map(Some)
    }

    /// Stored fields of a global doc number
    pub fn document_at(&self, global: u64) -> Result<Document> {
        let (idx, local) = self
            .segment_for(global)
            .ok_or_else(|| SedimentError::InvalidRequest(format!("doc number {global} out of range")))?;
        let mut doc = Document::new(String::new());
        self.segments[idx].segment().visit_stored(local, &mut |v| {
            if v.field == ID_FIELD {
                doc.id = String::from_utf8_lossy(v.value).into_owned();
            } else {
                doc.fields.push(Field {
                    name: v.field.to_string(),
                    kind: v.kind,
                    value: v.value.to_vec(),
                    array_positions: v.array_positions.to_vec(),
                    options: FieldOptions::default(),
                });
            }
            true
        })?;
        Ok(doc)
    }

    /// Every field name in any segment, sorted
    pub fn fields(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .segments
            .iter()
            .flat_map(|s| s.segment().fields().iter().map(String::as_str))
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Postings of `term` in `field` across live documents
    pub fn term_field_reader(
        &self,
        term: &[u8],
        field: &str,
        include_freq_norm: bool,
        include_locations: bool,
    ) -> Result<TermFieldReader> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for (segment, &offset) in self.segments.iter().zip(&self.offsets) {
            let list = segment
                .segment()
                .dictionary(field)?
                .postings_list(term, segment.deleted_ref())?;
            if list.is_empty() {
                continue;
            }
            let end = offset + segment.full_size();
            parts.push((offset, end, list));
        }
        TermFieldReader::new(parts, include_freq_norm, include_locations)
    }

    /// Every live global doc number in order
    pub fn doc_id_reader_all(&self) -> DocIdReader {
        let parts = self
            .segments
            .iter()
            .zip(&self.offsets)
            .map(|(segment, &offset)| {
                let mut live = RoaringBitmap::new();
                if let Some(last) = segment.full_size().checked_sub(1) {
                    live.insert_range(0..=last as u32);
                }
                if let Some(deleted) = segment.deleted_ref() {
                    live -= deleted;
                }
                (offset, live)
            })
            .collect();
        DocIdReader::new(parts)
    }

    /// Live global doc numbers of the given external ids
    pub fn doc_id_reader_only(&self, ids: &[String]) -> Result<DocIdReader> {
        let parts = self
            .segments
            .iter()
            .zip(&self.offsets)
            .map(|(segment, &offset)| Ok((offset, segment.live_doc_numbers(ids)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(DocIdReader::new(parts))
    }

    /// Every term of `field` with its live document count
    pub fn field_dict(&self, field: &str) -> Result<FieldDict> {
        self.collect_dict(field, |dict, except| dict.entries(except))
    }

    pub fn field_dict_prefix(&self, field: &str, prefix: &[u8]) -> Result<FieldDict> {
        self.collect_dict(field, |dict, except| dict.prefix_entries(prefix, except))
    }

    /// Terms of `field` in the inclusive range `[start, end]`
    pub fn field_dict_range(&self, field: &str, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<FieldDict> {
        self.collect_dict(field, |dict, except| dict.range_entries(start, end, except))
    }

    fn collect_dict<F>(&self, field: &str, mut entries: F) -> Result<FieldDict>
    where
        F: FnMut(&crate::segment::Dictionary, Option<&RoaringBitmap>) -> Result<Vec<crate::segment::DictEntry>>,
    {
        let mut sources = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let dict = segment.segment().dictionary(field)?;
            sources.push(entries(&dict, segment.deleted_ref())?);
        }
        Ok(FieldDict::new(sources))
    }

    /// Visit the doc values of `fields` for a global doc number
    pub fn visit_document_field_terms(
        &self,
        global: u64,
        fields: &[&str],
        visitor: &mut dyn FnMut(&str, &[u8]),
    ) -> Result<()> {
        let (idx, local) = self
            .segment_for(global)
            .ok_or_else(|| SedimentError::InvalidRequest(format!("doc number {global} out of range")))?;
        let segment = self.segments[idx].segment();
        for &field in fields {
            if let Some(mut reader) = segment.doc_value_reader(field)? {
                reader.visit(local, &mut |term| visitor(field, term))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::config::AnalyzerConfig;
    use crate::segment::MemSegment;

    fn segment(docs: &[(&str, &str)]) -> Arc<dyn Segment> {
        let analyzer = Analyzer::new(&AnalyzerConfig::default());
        let results: Vec<_> = docs
            .iter()
            .map(|(id, body)| analyzer.analyze(Document::new(*id).with_field(Field::text("body", body))))
            .collect();
        Arc::new(MemSegment::build(&results, 1024).unwrap())
    }

    fn snapshot() -> IndexSnapshot {
        let a = SegmentSnapshot::new(1, segment(&[("a", "red apple"), ("b", "green apple")]), None);
        let deleted: RoaringBitmap = [0u32].into_iter().collect();
        let b = SegmentSnapshot::new(
            2,
            segment(&[("a", "old red"), ("c", "red cherry")]),
            Some(Arc::new(deleted)),
        );
        let mut internal = BTreeMap::new();
        internal.insert(b"k".to_vec(), b"v".to_vec());
        IndexSnapshot::new(7, vec![a, b], Arc::new(internal))
    }

    #[test]
    fn test_counts_and_offsets() {
        let snap = snapshot();
        assert_eq!(snap.epoch(), 7);
        assert_eq!(snap.offsets(), &[0, 2]);
        assert_eq!(snap.doc_count(), 3);
        assert_eq!(snap.max_doc(), 4);
        assert_eq!(snap.segment_for(3), Some((1, 1)));
        assert_eq!(snap.segment_for(4), None);
        assert_eq!(snap.get_internal(b"k"), Some(&b"v"[..]));
    }

    #[test]
    fn test_id_lookup_skips_deleted() {
        let snap = snapshot();
        assert_eq!(snap.internal_id("a").unwrap(), Some(0));
        assert_eq!(snap.internal_id("c").unwrap(), Some(3));
        assert_eq!(snap.internal_id("zzz").unwrap(), None);
        assert_eq!(snap.external_id(3).unwrap(), "c");

        let doc = snap.document("c").unwrap().unwrap();
        assert_eq!(doc.id, "c");
        assert_eq!(doc.field("body").and_then(|f| f.as_text()), Some("red cherry"));
    }

    #[test]
    fn test_term_field_reader_spans_segments() {
        let snap = snapshot();
        let mut reader = snap.term_field_reader(b"red", "body", true, true).unwrap();
        assert_eq!(reader.count(), 2);
        let first = reader.next().unwrap().unwrap();
        assert_eq!(first.doc_num, 0);
        assert_eq!(first.freq, 1);
        let second = reader.next().unwrap().unwrap();
        assert_eq!(second.doc_num, 3);
        assert!(reader.next().unwrap().is_none());

        let mut reader = snap.term_field_reader(b"red", "body", false, false).unwrap();
        assert_eq!(reader.advance(1).unwrap().map(|p| p.doc_num), Some(3));
    }

    #[test]
    fn test_doc_id_readers() {
        let snap = snapshot();
        let all: Vec<u64> = snap.doc_id_reader_all().collect();
        assert_eq!(all, vec![0, 1, 3]);

        let only: Vec<u64> = snap
            .doc_id_reader_only(&["a".to_string(), "c".to_string()])
            .unwrap()
            .collect();
        assert_eq!(only, vec![0, 3]);

        let mut reader = snap.doc_id_reader_all();
        assert_eq!(reader.advance(2), Some(3));
    }

    #[test]
    fn test_field_dict_merges_counts() {
        let snap = snapshot();
        let terms: Vec<(String, u64)> = snap
            .field_dict("body")
            .unwrap()
            .map(|e| (e.term_str().unwrap_or_default().to_string(), e.count))
            .collect();
        assert_eq!(
            terms,
            vec![
                ("apple".to_string(), 2),
                ("cherry".to_string(), 1),
                ("green".to_string(), 1),
                ("red".to_string(), 2),
            ]
        );

        let prefixed: Vec<_> = snap.field_dict_prefix("body", b"gr").unwrap().collect();
        assert_eq!(prefixed.len(), 1);
        let ranged: Vec<_> = snap
            .field_dict_range("body", Some(b"b"), Some(b"green"))
            .unwrap()
            .collect();
        assert_eq!(ranged.len(), 2);
    }

    #[test]
    fn test_visit_document_field_terms() {
        let snap = snapshot();
        let mut seen = Vec::new();
        snap.visit_document_field_terms(1, &["body"], &mut |field, term| {
            seen.push((field.to_string(), term.to_vec()))
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("body".to_string(), b"apple".to_vec()),
                ("body".to_string(), b"green".to_vec())
            ]
        );
    }

    #[test]
    fn test_same_content_ignores_epoch() {
        let snap = snapshot();
        let again = IndexSnapshot::new(9, snap.segments().to_vec(), snap.internal().clone());
        assert!(snap.same_content(&again));
        let fresh = IndexSnapshot::new(9, snap.segments().to_vec(), Arc::default());
        assert!(!snap.same_content(&fresh));
    }
}
