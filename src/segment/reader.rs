//! Immutable segment reader over in-memory or mmapped bytes
//!
//! [`SegmentBase`] parses the footer and the field tables once, then serves
//! dictionaries, stored fields and doc values as cheap views into the same
//! shared buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use fst::Map;
use roaring::RoaringBitmap;

use super::docvalues::DocValueReader;
use super::footer::{be_u64, Footer, FOOTER_SIZE};
use super::store::read_record;
use super::term_dict::Dictionary;
use super::types::{StoredValue, ID_FIELD};
use super::varint::read_uvarint;
use crate::error::{Result, SedimentError};
use crate::models::FieldKind;

pub struct SegmentBase {
    data: Bytes,
    footer: Footer,
    fields: Vec<String>,
    field_ids: HashMap<String, u16>,
    dict_locs: Vec<u64>,
    doc_value_locs: Vec<Option<u64>>,
    bytes_read: Arc<AtomicU64>,
}

impl std::fmt::Debug for SegmentBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentBase")
            .field("num_docs", &self.footer.num_docs)
            .field("fields", &self.fields)
            .field("size", &self.data.len())
            .finish()
    }
}

impl SegmentBase {
    /// Validate and index a complete segment image
    pub fn open(data: Bytes) -> Result<Self> {
        let footer = Footer::parse(&data)?;
        let end = data.len() - FOOTER_SIZE;

        let fields_index = footer.fields_index_offset as usize;
        if (end - fields_index) % 8 != 0 {
            return Err(SedimentError::corrupt("fields index is not a whole number of entries"));
        }
        let num_fields = (end - fields_index) / 8;

        let mut fields = Vec::with_capacity(num_fields);
        let mut dict_locs = Vec::with_capacity(num_fields);
        for i in 0..num_fields {
            let at = fields_index + i * 8;
            let mut pos = be_u64(&data[at..at + 8]) as usize;
            if pos >= end {
                return Err(SedimentError::corrupt(format!("field {i} record past end")));
            }
            let dict_loc = read_uvarint(&data, &mut pos)?;
            let name_len = read_uvarint(&data, &mut pos)? as usize;
            let name_end = pos
                .checked_add(name_len)
                .filter(|&e| e <= end)
                .ok_or_else(|| SedimentError::corrupt(format!("field {i} name past end")))?;
            let name = std::str::from_utf8(&data[pos..name_end])
                .map_err(|_| SedimentError::corrupt(format!("field {i} name is not UTF-8")))?;
            fields.push(name.to_string());
            dict_locs.push(dict_loc);
        }
        if fields.first().map(String::as_str) != Some(ID_FIELD) {
            return Err(SedimentError::corrupt("first field is not the id field"));
        }

        let mut pos = footer.doc_values_index_offset as usize;
        let mut doc_value_locs = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            let start = read_uvarint(&data, &mut pos)?;
            let _end = read_uvarint(&data, &mut pos)?;
            doc_value_locs.push((start != u64::MAX).then_some(start));
        }

        let field_ids = fields
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i as u16))
            .collect();

        Ok(Self {
            data,
            footer,
            fields,
            field_ids,
            dict_locs,
            doc_value_locs,
            bytes_read: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn count(&self) -> u64 {
        self.footer.num_docs
    }

    pub fn chunk_factor(&self) -> u32 {
        self.footer.chunk_factor
    }

    /// Field names in field id order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_id(&self, name: &str) -> Option<u16> {
        self.field_ids.get(name).copied()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn reset_bytes_read(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
    }

    /// Term dictionary of `field`; unknown fields yield an empty dictionary
    pub fn dictionary(&self, field: &str) -> Result<Dictionary> {
        let Some(id) = self.field_id(field) else {
            return Ok(Dictionary::empty(field));
        };
        let loc = self.dict_locs[id as usize];
        let fst = if loc == 0 {
            None
        } else {
            let mut pos = loc as usize;
            let len = read_uvarint(&self.data, &mut pos)? as usize;
            let end = pos
                .checked_add(len)
                .filter(|&e| e <= self.data.len())
                .ok_or_else(|| SedimentError::corrupt(format!("dictionary of {field} past end")))?;
            self.bytes_read.fetch_add(len as u64, Ordering::Relaxed);
            Some(Map::new(self.data.slice(pos..end))?)
        };
        Ok(Dictionary::new(
            field,
            fst,
            self.data.clone(),
            self.footer.num_docs,
            self.footer.chunk_factor,
            self.bytes_read.clone(),
        ))
    }

    /// Visit the stored values of `doc_num`, `_id` first; the visitor returns
    /// false to stop early
    pub fn visit_stored(&self, doc_num: u64, visitor: &mut dyn FnMut(StoredValue<'_>) -> bool) -> Result<()> {
        let record = read_record(
            &self.data,
            self.footer.stored_index_offset,
            self.footer.num_docs,
            doc_num,
        )?;
        self.bytes_read
            .fetch_add(record.encoded_len as u64, Ordering::Relaxed);

        let keep_going = visitor(StoredValue {
            field: ID_FIELD,
            kind: FieldKind::Keyword,
            value: &record.id,
            array_positions: &[],
        });
        if !keep_going {
            return Ok(());
        }
        for meta in &record.meta {
            let field = self
                .fields
                .get(meta.field_id as usize)
                .ok_or_else(|| SedimentError::corrupt(format!("stored field id {}", meta.field_id)))?;
            let keep_going = visitor(StoredValue {
                field,
                kind: meta.kind,
                value: record.value(meta),
                array_positions: &meta.array_positions,
            });
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// External id of `doc_num`
    pub fn doc_id(&self, doc_num: u64) -> Result<String> {
        let record = read_record(
            &self.data,
            self.footer.stored_index_offset,
            self.footer.num_docs,
            doc_num,
        )?;
        String::from_utf8(record.id.to_vec())
            .map_err(|_| SedimentError::corrupt(format!("id of doc {doc_num} is not UTF-8")))
    }

    /// Local doc numbers holding any of `ids`
    pub fn doc_numbers(&self, ids: &[String]) -> Result<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let dict = self.dictionary(ID_FIELD)?;
        for id in ids {
            let list = dict.postings_list(id.as_bytes(), None)?;
            out |= list.doc_nums();
        }
        Ok(out)
    }

    /// Doc values of `field`, if the segment recorded any
    pub fn doc_value_reader(&self, field: &str) -> Result<Option<DocValueReader>> {
        let Some(id) = self.field_id(field) else {
            return Ok(None);
        };
        match self.doc_value_locs[id as usize] {
            Some(start) => Ok(Some(DocValueReader::open(
                field,
                &self.data,
                start,
                self.footer.chunk_factor,
            )?)),
            None => Ok(None),
        }
    }

    /// Fields that carry doc values
    pub fn doc_value_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .zip(&self.doc_value_locs)
            .filter(|(_, loc)| loc.is_some())
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
