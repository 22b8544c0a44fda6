//! Chunked uvarint streams
//!
//! Documents are grouped into chunks of `chunk_size` consecutive doc numbers.
//! Each chunk's bytes are independently addressable, so reading one
//! document's entry costs a single chunk lookup instead of a full scan.
//!
//! Layout: `uvarint num_chunks`, `uvarint chunk_len` per chunk, chunk bytes.

use std::io::{self, Write};

use bytes::Bytes;

use super::varint::{put_uvarint, read_uvarint, write_uvarint};
use crate::error::{Result, SedimentError};

/// Writer side of a chunked uvarint stream
pub struct ChunkedIntCoder {
    chunk_size: u64,
    chunk_lens: Vec<u64>,
    current_chunk: u64,
    chunk_buf: Vec<u8>,
    final_buf: Vec<u8>,
}

impl ChunkedIntCoder {
    /// Create a coder able to hold doc numbers `0..=max_doc_num`
    pub fn new(chunk_size: u64, max_doc_num: u64) -> Self {
        let chunk_size = chunk_size.max(1);
        let total = (max_doc_num / chunk_size + 1) as usize;
        Self {
            chunk_size,
            chunk_lens: vec![0; total],
            current_chunk: 0,
            chunk_buf: Vec::new(),
            final_buf: Vec::new(),
        }
    }

    fn switch_chunk(&mut self, doc_num: u64) -> Result<()> {
        let chunk = doc_num / self.chunk_size;
        if chunk as usize >= self.chunk_lens.len() {
            return Err(SedimentError::Internal(format!(
                "doc {doc_num} beyond coder capacity of {} chunks",
                self.chunk_lens.len()
            )));
        }
        if chunk != self.current_chunk {
            self.close();
            self.current_chunk = chunk;
        }
        Ok(())
    }

    /// Append uvarint-encoded values for `doc_num`; doc numbers must be added
    /// in ascending order
    pub fn add(&mut self, doc_num: u64, vals: &[u64]) -> Result<()> {
        self.switch_chunk(doc_num)?;
        for &v in vals {
            put_uvarint(&mut self.chunk_buf, v);
        }
        Ok(())
    }

    /// Append pre-encoded bytes for `doc_num`
    pub fn add_bytes(&mut self, doc_num: u64, buf: &[u8]) -> Result<()> {
        self.switch_chunk(doc_num)?;
        self.chunk_buf.extend_from_slice(buf);
        Ok(())
    }

    /// Seal the current chunk
    pub fn close(&mut self) {
        self.chunk_lens[self.current_chunk as usize] = self.chunk_buf.len() as u64;
        self.final_buf.append(&mut self.chunk_buf);
    }

    /// Seal the current chunk and write the whole stream, returning bytes written
    pub fn write<W: Write>(&mut self, w: &mut W) -> io::Result<u64> {
        self.close();
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

/// Reader side of a chunked uvarint stream
#[derive(Clone, Debug)]
pub struct ChunkedIntReader {
    data: Bytes,
    chunk_offsets: Vec<usize>,
}

impl ChunkedIntReader {
    /// Open the stream that starts at `offset` within `data`
    pub fn open(data: &Bytes, offset: u64) -> Result<Self> {
        let mut pos = usize::try_from(offset)
            .map_err(|_| SedimentError::corrupt("chunk stream offset overflows usize"))?;
        let num_chunks = read_uvarint(data, &mut pos)? as usize;
        if num_chunks > data.len() {
            return Err(SedimentError::corrupt(format!(
                "chunk count {num_chunks} exceeds segment size"
            )));
        }
        let mut lens = Vec::with_capacity(num_chunks);
        for _ in 0..num_chunks {
            lens.push(read_uvarint(data, &mut pos)? as usize);
        }

        let mut chunk_offsets = Vec::with_capacity(num_chunks + 1);
        let mut at = pos;
        chunk_offsets.push(at);
        for len in lens {
            at = at
                .checked_add(len)
                .filter(|&end| end <= data.len())
                .ok_or_else(|| SedimentError::corrupt("chunk extends past segment end"))?;
            chunk_offsets.push(at);
        }

        Ok(Self {
            data: data.clone(),
            chunk_offsets,
        })
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_offsets.len() - 1
    }

    /// Bytes of chunk `idx`; an out-of-range chunk reads as empty
    pub fn chunk(&self, idx: usize) -> Bytes {
        if idx >= self.num_chunks() {
            return Bytes::new();
        }
        self.data
            .slice(self.chunk_offsets[idx]..self.chunk_offsets[idx + 1])
    }
}

#[cfg(test)]
pub(crate) fn encode_to_vec(coder: &mut ChunkedIntCoder) -> Vec<u8> {
    let mut out = Vec::new();
    // writes into a Vec cannot fail
    let _ = coder.write(&mut out);
    out
}

/// Write a uvarint length prefix followed by `payload`
pub(crate) fn write_prefixed<W: Write>(w: &mut W, payload: &[u8]) -> io::Result<u64> {
    let n = write_uvarint(w, payload.len() as u64)?;
    w.write_all(payload)?;
    Ok((n + payload.len()) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunk: &[u8]) -> Vec<u64> {
        let mut pos = 0;
        let mut out = Vec::new();
        while pos < chunk.len() {
            out.push(read_uvarint(chunk, &mut pos).unwrap());
        }
        out
    }

    #[test]
    fn test_chunked_int_coder() {
        let mut coder = ChunkedIntCoder::new(2, 5);
        coder.add(0, &[1, 2]).unwrap();
        coder.add(1, &[3]).unwrap();
        coder.add(4, &[300]).unwrap();
        coder.add(5, &[4]).unwrap();
        let bytes = Bytes::from(encode_to_vec(&mut coder));

        let reader = ChunkedIntReader::open(&bytes, 0).unwrap();
        assert_eq!(reader.num_chunks(), 3);
        assert_eq!(decode_all(&reader.chunk(0)), vec![1, 2, 3]);
        assert!(reader.chunk(1).is_empty());
        assert_eq!(decode_all(&reader.chunk(2)), vec![300, 4]);
        assert!(reader.chunk(9).is_empty());
    }

    #[test]
    fn test_chunked_int_coder_rejects_overflow() {
        let mut coder = ChunkedIntCoder::new(4, 3);
        assert!(coder.add(4, &[1]).is_err());
    }

    #[test]
    fn test_reader_at_offset() {
        let mut coder = ChunkedIntCoder::new(10, 9);
        coder.add(3, &[7]).unwrap();
        let mut data = vec![0xaa, 0xbb];
        data.extend(encode_to_vec(&mut coder));
        let bytes = Bytes::from(data);

        let reader = ChunkedIntReader::open(&bytes, 2).unwrap();
        assert_eq!(decode_all(&reader.chunk(0)), vec![7]);
    }

    #[test]
    fn test_reader_rejects_truncated_chunk() {
        let bytes = Bytes::from(vec![1u8, 10, 0]);
        assert!(ChunkedIntReader::open(&bytes, 0).unwrap_err().is_corruption());
    }
}
