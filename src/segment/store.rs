//! Stored field records
//!
//! Per document: `uvarint meta_len`, `uvarint id_len`, `uvarint compressed_len`,
//! the meta bytes, the raw `_id` and the snappy-compressed concatenation of
//! the remaining stored values. Meta holds one entry per value:
//! `field_id, type_byte, start, len, num_array_positions, array_positions...`.
//! The stored index that follows the records is one big-endian u64 record
//! offset per document.

use bytes::Bytes;

use super::footer::be_u64;
use super::varint::{put_uvarint, read_uvarint};
use crate::error::{Result, SedimentError};
use crate::models::FieldKind;

/// A stored value on its way into a segment
#[derive(Clone, Debug)]
pub struct StoredEntry<'a> {
    pub field_id: u16,
    pub kind: FieldKind,
    pub value: &'a [u8],
    pub array_positions: &'a [u64],
}

/// Encode one document's stored record
pub fn encode_record(id: &[u8], values: &[StoredEntry<'_>]) -> Result<Vec<u8>> {
    let mut meta = Vec::new();
    let mut data = Vec::new();
    for v in values {
        put_uvarint(&mut meta, v.field_id as u64);
        meta.push(v.kind.type_byte());
        put_uvarint(&mut meta, data.len() as u64);
        put_uvarint(&mut meta, v.value.len() as u64);
        put_uvarint(&mut meta, v.array_positions.len() as u64);
        for &ap in v.array_positions {
            put_uvarint(&mut meta, ap);
        }
        data.extend_from_slice(v.value);
    }
    let compressed = snap::raw::Encoder::new().compress_vec(&data)?;

    let mut out = Vec::with_capacity(meta.len() + id.len() + compressed.len() + 12);
    put_uvarint(&mut out, meta.len() as u64);
    put_uvarint(&mut out, id.len() as u64);
    put_uvarint(&mut out, compressed.len() as u64);
    out.extend_from_slice(&meta);
    out.extend_from_slice(id);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// One decoded meta entry of a stored record
#[derive(Clone, Debug, PartialEq)]
pub struct StoredMeta {
    pub field_id: u16,
    pub kind: FieldKind,
    pub start: usize,
    pub len: usize,
    pub array_positions: Vec<u64>,
}

/// A decoded stored record
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub id: Bytes,
    pub meta: Vec<StoredMeta>,
    pub values: Vec<u8>,
    /// Size of the record as laid out in the segment
    pub encoded_len: usize,
}

impl StoredRecord {
    pub fn value(&self, meta: &StoredMeta) -> &[u8] {
        &self.values[meta.start..meta.start + meta.len]
    }
}

/// Read the stored record of `doc_num`
pub fn read_record(data: &Bytes, stored_index_offset: u64, num_docs: u64, doc_num: u64) -> Result<StoredRecord> {
    if doc_num >= num_docs {
        return Err(SedimentError::InvalidRequest(format!(
            "doc {doc_num} out of range, segment holds {num_docs}"
        )));
    }
    let at = doc_num
        .checked_mul(8)
        .and_then(|o| o.checked_add(stored_index_offset))
        .and_then(|o| usize::try_from(o).ok())
        .filter(|&o| o.checked_add(8).map_or(false, |e| e <= data.len()))
        .ok_or_else(|| SedimentError::corrupt("stored index past segment end"))?;
    let start = usize::try_from(be_u64(&data[at..at + 8]))
        .map_err(|_| SedimentError::corrupt("stored record offset"))?;

    let mut pos = start;
    let meta_len = read_uvarint(data, &mut pos)?;
    let id_len = read_uvarint(data, &mut pos)?;
    let compressed_len = read_uvarint(data, &mut pos)?;
    let advance = |from: usize, len: u64| {
        usize::try_from(len)
            .ok()
            .and_then(|len| from.checked_add(len))
            .filter(|&end| end <= data.len())
            .ok_or_else(|| SedimentError::corrupt(format!("stored record of doc {doc_num} truncated")))
    };
    let meta_end = advance(pos, meta_len)?;
    let id_end = advance(meta_end, id_len)?;
    let end = advance(id_end, compressed_len)?;

    let meta_bytes = &data[pos..meta_end];
    let values = snap::raw::Decoder::new().decompress_vec(&data[id_end..end])?;

    let mut meta = Vec::new();
    let mut mp = 0;
    while mp < meta_bytes.len() {
        let field_id = read_uvarint(meta_bytes, &mut mp)?;
        let field_id = u16::try_from(field_id)
            .map_err(|_| SedimentError::corrupt(format!("stored field id {field_id}")))?;
        let type_byte = *meta_bytes
            .get(mp)
            .ok_or_else(|| SedimentError::corrupt("stored meta truncated"))?;
        mp += 1;
        let kind = FieldKind::from_type_byte(type_byte)
            .ok_or_else(|| SedimentError::corrupt(format!("stored type byte {type_byte:#04x}")))?;
        let vstart = read_uvarint(meta_bytes, &mut mp)? as usize;
        let vlen = read_uvarint(meta_bytes, &mut mp)? as usize;
        if vstart.checked_add(vlen).map_or(true, |e| e > values.len()) {
            return Err(SedimentError::corrupt("stored value past record end"));
        }
        let n = read_uvarint(meta_bytes, &mut mp)? as usize;
        if n > meta_bytes.len() {
            return Err(SedimentError::corrupt("stored array position count"));
        }
        let mut array_positions = Vec::with_capacity(n);
        for _ in 0..n {
            array_positions.push(read_uvarint(meta_bytes, &mut mp)?);
        }
        meta.push(StoredMeta {
            field_id,
            kind,
            start: vstart,
            len: vlen,
            array_positions,
        });
    }

    Ok(StoredRecord {
        id: data.slice(meta_end..id_end),
        meta,
        values,
        encoded_len: end - start,
    })
}
