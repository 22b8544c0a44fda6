//! Segment writer shared by the builder and the merger
//!
//! Sections must be written in file order:
//! 1. stored records ([`SegmentWriter::add_stored`]) then the stored index
//!    ([`SegmentWriter::finish_stored`])
//! 2. per field, in field id order: postings for every term
//!    ([`SegmentWriter::write_postings`]), then the dictionary and doc values
//!    ([`SegmentWriter::finish_field`])
//! 3. doc values index, fields section, fields index and footer
//!    ([`SegmentWriter::finish`])

use std::io::Write;

use fst::MapBuilder;
use roaring::RoaringBitmap;

use super::contentcoder::ChunkedContentCoder;
use super::footer::{CountHashWriter, Footer, FORMAT_VERSION};
use super::intcoder::{write_prefixed, ChunkedIntCoder};
use super::postings::encode_locations;
use super::store::{encode_record, StoredEntry};
use super::types::{encode_one_hit, postings_chunk_size, Posting};
use super::varint::{put_uvarint, write_uvarint};
use crate::error::{Result, SedimentError};

/// Accumulates ascending doc numbers, inserting contiguous runs as ranges
#[derive(Default)]
pub struct DocRuns {
    bitmap: RoaringBitmap,
    run: Option<(u32, u32)>,
}

impl DocRuns {
    pub fn push(&mut self, doc: u32) {
        match self.run {
            Some((start, end)) if end.checked_add(1) == Some(doc) => self.run = Some((start, doc)),
            Some((start, end)) => {
                self.bitmap.insert_range(start..=end);
                self.run = Some((doc, doc));
            }
            None => self.run = Some((doc, doc)),
        }
    }

    pub fn finish(mut self) -> RoaringBitmap {
        if let Some((start, end)) = self.run.take() {
            self.bitmap.insert_range(start..=end);
        }
        self.bitmap
    }
}

struct FieldRecord {
    name: String,
    dict_loc: u64,
    doc_values: Option<(u64, u64)>,
}

pub struct SegmentWriter<W: Write> {
    w: CountHashWriter<W>,
    num_docs: u64,
    chunk_factor: u32,
    stored_offsets: Vec<u64>,
    stored_index_offset: Option<u64>,
    fields: Vec<FieldRecord>,
}

impl<W: Write> SegmentWriter<W> {
    pub fn new(w: W, num_docs: u64, chunk_factor: u32) -> Self {
        Self {
            w: CountHashWriter::new(w),
            num_docs,
            chunk_factor: chunk_factor.max(1),
            stored_offsets: Vec::with_capacity(num_docs as usize),
            stored_index_offset: None,
            fields: Vec::new(),
        }
    }

    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    pub fn chunk_factor(&self) -> u32 {
        self.chunk_factor
    }

    /// Write the stored record of the next document
    pub fn add_stored(&mut self, id: &[u8], values: &[StoredEntry<'_>]) -> Result<()> {
        let record = encode_record(id, values)?;
        self.stored_offsets.push(self.w.count());
        self.w.write_all(&record)?;
        Ok(())
    }

    pub fn finish_stored(&mut self) -> Result<()> {
        if self.stored_offsets.len() as u64 != self.num_docs {
            return Err(SedimentError::Internal(format!(
                "wrote {} stored records for {} documents",
                self.stored_offsets.len(),
                self.num_docs
            )));
        }
        self.stored_index_offset = Some(self.w.count());
        for &offset in &self.stored_offsets {
            self.w.write_all(&offset.to_be_bytes())?;
        }
        Ok(())
    }

    /// Write the postings of one term and return its dictionary value
    ///
    /// `hits` must be sorted by doc number and non-empty.
    pub fn write_postings(&mut self, hits: &[Posting]) -> Result<u64> {
        if let [hit] = hits {
            if hit.freq == 1 && hit.locations.is_empty() {
                if let Some(value) = encode_one_hit(hit.doc_num, hit.norm) {
                    return Ok(value);
                }
            }
        }
        self.write_general_postings(hits)
    }

    /// Write a full postings record, never inlining
    pub fn write_general_postings(&mut self, hits: &[Posting]) -> Result<u64> {
        if hits.is_empty() {
            return Err(SedimentError::Internal("empty postings list".to_string()));
        }
        let chunk_size = postings_chunk_size(hits.len() as u64, self.num_docs, self.chunk_factor);
        let max_doc = self.num_docs.saturating_sub(1);
        let mut freqs = ChunkedIntCoder::new(chunk_size, max_doc);
        let mut locs = ChunkedIntCoder::new(chunk_size, max_doc);
        let mut runs = DocRuns::default();

        for hit in hits {
            let doc = u32::try_from(hit.doc_num)
                .map_err(|_| SedimentError::InvalidRequest(format!("doc number {} too large", hit.doc_num)))?;
            let has_locs = !hit.locations.is_empty();
            freqs.add(
                hit.doc_num,
                &[hit.freq << 1 | has_locs as u64, hit.norm.to_bits() as u64],
            )?;
            if has_locs {
                locs.add_bytes(hit.doc_num, &encode_locations(&hit.locations))?;
            }
            runs.push(doc);
        }
        let bitmap = runs.finish();

        let freq_offset = self.w.count();
        freqs.write(&mut self.w)?;
        let loc_offset = self.w.count();
        locs.write(&mut self.w)?;

        let postings_offset = self.w.count();
        let mut bitmap_bytes = Vec::with_capacity(bitmap.serialized_size());
        bitmap.serialize_into(&mut bitmap_bytes)?;
        let mut record = Vec::with_capacity(bitmap_bytes.len() + 12);
        put_uvarint(&mut record, freq_offset);
        put_uvarint(&mut record, loc_offset);
        put_uvarint(&mut record, bitmap_bytes.len() as u64);
        record.extend_from_slice(&bitmap_bytes);
        self.w.write_all(&record)?;

        Ok(postings_offset)
    }

    /// Write a field's dictionary and doc values; a builder holding no terms
    /// records no dictionary
    pub fn finish_field(
        &mut self,
        name: &str,
        dict: MapBuilder<Vec<u8>>,
        num_terms: usize,
        doc_values: Option<ChunkedContentCoder>,
    ) -> Result<()> {
        let dict_loc = if num_terms > 0 {
            let fst_bytes = dict.into_inner()?;
            let loc = self.w.count();
            write_prefixed(&mut self.w, &fst_bytes)?;
            loc
        } else {
            0
        };

        let doc_values = match doc_values {
            Some(mut coder) => {
                let start = self.w.count();
                coder.write(&mut self.w)?;
                Some((start, self.w.count()))
            }
            None => None,
        };

        self.fields.push(FieldRecord {
            name: name.to_string(),
            dict_loc,
            doc_values,
        });
        Ok(())
    }

    /// Write the trailing indexes and footer, returning the underlying writer
    pub fn finish(mut self) -> Result<(W, Footer)> {
        let stored_index_offset = self
            .stored_index_offset
            .ok_or_else(|| SedimentError::Internal("stored section not finished".to_string()))?;

        let doc_values_index_offset = self.w.count();
        for field in &self.fields {
            let (start, end) = field.doc_values.unwrap_or((u64::MAX, u64::MAX));
            write_uvarint(&mut self.w, start)?;
            write_uvarint(&mut self.w, end)?;
        }

        let mut field_starts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            field_starts.push(self.w.count());
            write_uvarint(&mut self.w, field.dict_loc)?;
            write_prefixed(&mut self.w, field.name.as_bytes())?;
        }

        let fields_index_offset = self.w.count();
        for start in field_starts {
            self.w.write_all(&start.to_be_bytes())?;
        }

        let mut footer = Footer {
            num_docs: self.num_docs,
            stored_index_offset,
            fields_index_offset,
            doc_values_index_offset,
            chunk_factor: self.chunk_factor,
            version: FORMAT_VERSION,
            crc: 0,
        };
        footer.write_to(&mut self.w)?;
        self.w.flush()?;
        Ok((self.w.into_inner(), footer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_runs_coalesce() {
        let mut runs = DocRuns::default();
        for doc in [0, 1, 2, 3, 7, 8, 20] {
            runs.push(doc);
        }
        let bitmap = runs.finish();
        assert_eq!(bitmap.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 7, 8, 20]);
    }

    #[test]
    fn test_doc_runs_empty() {
        assert!(DocRuns::default().finish().is_empty());
    }

    #[test]
    fn test_write_postings_inlines_single_hit() {
        let mut writer = SegmentWriter::new(Vec::new(), 10, 1024);
        let hit = Posting {
            doc_num: 4,
            freq: 1,
            norm: 0.5,
            locations: vec![],
        };
        let value = writer.write_postings(std::slice::from_ref(&hit)).unwrap();
        assert_eq!(value >> 63, 1);

        let general = writer.write_general_postings(&[hit]).unwrap();
        assert_eq!(general >> 62, 0);
    }

    #[test]
    fn test_finish_requires_stored_section() {
        let writer = SegmentWriter::new(Vec::new(), 0, 1024);
        assert!(writer.finish().is_err());
    }
}
