//! Chunked, snappy-compressed content stream used for doc values
//!
//! Each chunk is `uvarint num_docs`, then `(uvarint doc_num, uvarint end)`
//! per document, then the snappy-compressed concatenation of the documents'
//! values. `end` is the exclusive end of the document's bytes within the
//! uncompressed chunk. The stream wraps the chunks exactly like
//! [`ChunkedIntCoder`](super::intcoder::ChunkedIntCoder) does.

use std::io::Write;

use super::varint::put_uvarint;
use crate::error::{Result, SedimentError};

pub struct ChunkedContentCoder {
    chunk_size: u64,
    chunk_lens: Vec<u64>,
    current_chunk: u64,
    chunk_meta: Vec<(u64, u64)>,
    chunk_buf: Vec<u8>,
    final_buf: Vec<u8>,
}

impl ChunkedContentCoder {
    pub fn new(chunk_size: u64, max_doc_num: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let total = (max_doc_num / chunk_size + 1) as usize;
        Self {
            chunk_size,
            chunk_lens: vec![0; total],
            current_chunk: 0,
            chunk_meta: Vec::new(),
            chunk_buf: Vec::new(),
            final_buf: Vec::new(),
        }
    }

    /// Add the value bytes for `doc_num`; doc numbers must ascend
    pub fn add(&mut self, doc_num: u64, val: &[u8]) -> Result<()> {
        let chunk = doc_num / self.chunk_size;
        if chunk as usize >= self.chunk_lens.len() {
            return Err(SedimentError::Internal(format!(
                "doc {doc_num} beyond content coder capacity"
            )));
        }
        if chunk != self.current_chunk {
            self.flush_chunk()?;
            self.current_chunk = chunk;
        }
        self.chunk_buf.extend_from_slice(val);
        self.chunk_meta.push((doc_num, self.chunk_buf.len() as u64));
        Ok(())
    }

    fn flush_chunk(&mut self) -> Result<()> {
        if self.chunk_meta.is_empty() {
            self.chunk_lens[self.current_chunk as usize] = 0;
            return Ok(());
        }
        let start = self.final_buf.len();
        put_uvarint(&mut self.final_buf, self.chunk_meta.len() as u64);
        for &(doc_num, end) in &self.chunk_meta {
            put_uvarint(&mut self.final_buf, doc_num);
            put_uvarint(&mut self.final_buf, end);
        }
        let compressed = snap::raw::Encoder::new().compress_vec(&self.chunk_buf)?;
        self.final_buf.extend_from_slice(&compressed);

        self.chunk_lens[self.current_chunk as usize] = (self.final_buf.len() - start) as u64;
        self.chunk_meta.clear();
        self.chunk_buf.clear();
        Ok(())
    }

    /// Flush the open chunk and write the whole stream, returning bytes written
    pub fn write<W: Write>(&mut self, w: &mut W) -> Result<u64> {
        self.flush_chunk()?;
        let mut header = Vec::with_capacity(self.chunk_lens.len() + 1);
        put_uvarint(&mut header, self.chunk_lens.len() as u64);
        for &len in &self.chunk_lens {
            put_uvarint(&mut header, len);
        }
        w.write_all(&header)?;
        w.write_all(&self.final_buf)?;
        Ok((header.len() + self.final_buf.len()) as u64)
    }
}
