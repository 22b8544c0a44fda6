//! Segment footer and the checksumming writer that produces it

use std::io::{self, Write};

use crate::error::{Result, SedimentError};

/// Current segment file format version
pub const FORMAT_VERSION: u32 = 1;

/// Footer size in bytes: four u64 offsets/counts plus three u32 fields
pub const FOOTER_SIZE: usize = 8 * 4 + 4 * 3;

/// Fixed-size trailer at the end of every segment file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Footer {
    pub num_docs: u64,
    pub stored_index_offset: u64,
    pub fields_index_offset: u64,
    pub doc_values_index_offset: u64,
    pub chunk_factor: u32,
    pub version: u32,
    pub crc: u32,
}

impl Footer {
    /// Write the footer through `w`, finishing with the checksum of
    /// everything written before the checksum itself
    pub fn write_to<W: Write>(&mut self, w: &mut CountHashWriter<W>) -> io::Result<()> {
        w.write_all(&self.num_docs.to_be_bytes())?;
        w.write_all(&self.stored_index_offset.to_be_bytes())?;
        w.write_all(&self.fields_index_offset.to_be_bytes())?;
        w.write_all(&self.doc_values_index_offset.to_be_bytes())?;
        w.write_all(&self.chunk_factor.to_be_bytes())?;
        w.write_all(&self.version.to_be_bytes())?;
        self.crc = w.crc();
        w.write_all(&self.crc.to_be_bytes())
    }

    /// Parse and validate the footer of a complete segment file
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FOOTER_SIZE {
            return Err(SedimentError::corrupt(format!(
                "segment too short for footer: {} bytes",
                data.len()
            )));
        }
        let start = data.len() - FOOTER_SIZE;
        let f = &data[start..];

        let crc = be_u32(&f[40..44]);
        let actual = crc32fast::hash(&data[..data.len() - 4]);
        if crc != actual {
            return Err(SedimentError::ChecksumMismatch {
                expected: crc,
                actual,
            });
        }

        let footer = Footer {
            num_docs: be_u64(&f[0..8]),
            stored_index_offset: be_u64(&f[8..16]),
            fields_index_offset: be_u64(&f[16..24]),
            doc_values_index_offset: be_u64(&f[24..32]),
            chunk_factor: be_u32(&f[32..36]),
            version: be_u32(&f[36..40]),
            crc,
        };

        if footer.version != FORMAT_VERSION {
            return Err(SedimentError::UnsupportedVersion {
                expected: FORMAT_VERSION,
                actual: footer.version,
            });
        }
        let limit = start as u64;
        for (name, offset) in [
            ("stored index", footer.stored_index_offset),
            ("fields index", footer.fields_index_offset),
            ("doc values index", footer.doc_values_index_offset),
        ] {
            if offset > limit {
                return Err(SedimentError::corrupt(format!(
                    "{name} offset {offset} beyond footer at {limit}"
                )));
            }
        }
        Ok(footer)
    }
}

pub(crate) fn be_u64(b: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&b[..8]);
    u64::from_be_bytes(buf)
}

fn be_u32(b: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&b[..4]);
    u32::from_be_bytes(buf)
}

/// Writer that tracks the byte count and a running CRC32 of everything
/// passed through it
pub struct CountHashWriter<W: Write> {
    inner: W,
    count: u64,
    hasher: crc32fast::Hasher,
}

impl<W: Write> CountHashWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            count: 0,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Bytes written so far, which is also the absolute offset of the next write
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn crc(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountHashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_with_footer(body: &[u8]) -> Vec<u8> {
        let mut w = CountHashWriter::new(Vec::new());
        w.write_all(body).unwrap();
        let mut footer = Footer {
            num_docs: 3,
            stored_index_offset: 1,
            fields_index_offset: 2,
            doc_values_index_offset: 2,
            chunk_factor: 1024,
            version: FORMAT_VERSION,
            crc: 0,
        };
        footer.write_to(&mut w).unwrap();
        w.into_inner()
    }

    #[test]
    fn test_footer_parse() {
        let data = write_with_footer(b"body");
        assert_eq!(data.len(), 4 + FOOTER_SIZE);

        let footer = Footer::parse(&data).unwrap();
        assert_eq!(footer.num_docs, 3);
        assert_eq!(footer.chunk_factor, 1024);
        assert_eq!(footer.crc, crc32fast::hash(&data[..data.len() - 4]));
    }

    #[test]
    fn test_footer_detects_corruption() {
        let mut data = write_with_footer(b"body");
        data[0] ^= 0xff;
        assert!(matches!(
            Footer::parse(&data),
            Err(SedimentError::ChecksumMismatch { .. })
        ));

        assert!(Footer::parse(b"short").unwrap_err().is_corruption());
    }

    #[test]
    fn test_count_hash_writer() {
        let mut w = CountHashWriter::new(Vec::new());
        w.write_all(b"hello ").unwrap();
        w.write_all(b"world").unwrap();
        assert_eq!(w.count(), 11);
        assert_eq!(w.crc(), crc32fast::hash(b"hello world"));
    }
}
