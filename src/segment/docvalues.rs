//! Doc values: per-document term lists, un-inverted from postings
//!
//! Each document's terms for a field are stored sorted, every term followed
//! by a `0xFF` terminator, inside the chunked content stream written by
//! [`ChunkedContentCoder`](super::contentcoder::ChunkedContentCoder).

use bytes::Bytes;

use super::intcoder::ChunkedIntReader;
use super::varint::read_uvarint;
use crate::error::{Result, SedimentError};

/// Separator following every term in a doc value entry
pub const TERM_SEPARATOR: u8 = 0xff;

/// Join terms into the doc value representation
pub fn encode_terms<'a>(terms: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for term in terms {
        out.extend_from_slice(term);
        out.push(TERM_SEPARATOR);
    }
    out
}

struct DecodedChunk {
    idx: usize,
    meta: Vec<(u64, u64)>,
    data: Vec<u8>,
}

/// Reader over one field's doc values with a single-chunk cache
pub struct DocValueReader {
    field: String,
    chunks: ChunkedIntReader,
    chunk_size: u64,
    cache: Option<DecodedChunk>,
}

impl DocValueReader {
    pub fn open(field: &str, data: &Bytes, offset: u64, chunk_factor: u32) -> Result<Self> {
        Ok(Self {
            field: field.to_string(),
            chunks: ChunkedIntReader::open(data, offset)?,
            chunk_size: chunk_factor.max(1) as u64,
            cache: None,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    fn load_chunk(&mut self, idx: usize) -> Result<&DecodedChunk> {
        let cached = matches!(&self.cache, Some(c) if c.idx == idx);
        if !cached {
            let raw = self.chunks.chunk(idx);
            let mut meta = Vec::new();
            let mut data = Vec::new();
            if !raw.is_empty() {
                let mut pos = 0;
                let n = read_uvarint(&raw, &mut pos)?;
                for _ in 0..n {
                    let doc_num = read_uvarint(&raw, &mut pos)?;
                    let end = read_uvarint(&raw, &mut pos)?;
                    meta.push((doc_num, end));
                }
                data = snap::raw::Decoder::new().decompress_vec(&raw[pos..])?;
                if let Some(&(_, end)) = meta.last() {
                    if end as usize > data.len() {
                        return Err(SedimentError::corrupt(format!(
                            "doc value chunk {idx} of field {} shorter than its offsets",
                            self.field
                        )));
                    }
                }
            }
            self.cache = Some(DecodedChunk { idx, meta, data });
        }
        self.cache
            .as_ref()
            .ok_or_else(|| SedimentError::Internal("doc value chunk cache empty".to_string()))
    }

    /// Raw doc value bytes of `doc_num`, or `None` if the doc has no terms
    pub fn doc_bytes(&mut self, doc_num: u64) -> Result<Option<&[u8]>> {
        let idx = (doc_num / self.chunk_size) as usize;
        let chunk = self.load_chunk(idx)?;
        let Ok(i) = chunk.meta.binary_search_by_key(&doc_num, |&(d, _)| d) else {
            return Ok(None);
        };
        let start = if i == 0 { 0 } else { chunk.meta[i - 1].1 as usize };
        let end = chunk.meta[i].1 as usize;
        if start > end {
            return Err(SedimentError::corrupt("doc value offsets out of order"));
        }
        Ok(Some(&chunk.data[start..end]))
    }

    /// Call `visitor` with every term of `doc_num`, in sorted order
    pub fn visit(&mut self, doc_num: u64, visitor: &mut dyn FnMut(&[u8])) -> Result<()> {
        if let Some(bytes) = self.doc_bytes(doc_num)? {
            for term in bytes.split(|&b| b == TERM_SEPARATOR) {
                if !term.is_empty() {
                    visitor(term);
                }
            }
        }
        Ok(())
    }

    pub fn terms(&mut self, doc_num: u64) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        self.visit(doc_num, &mut |t| out.push(t.to_vec()))?;
        Ok(out)
    }
}
