//! Postings lists and their iterators
//!
//! A postings record is `uvarint freq_offset`, `uvarint loc_offset`,
//! `uvarint bitmap_len` and a serialized roaring bitmap of local doc numbers.
//! The two offsets point at chunked streams written before the record:
//! - freq/norm: per doc `uvarint (freq << 1 | has_locations)`, `uvarint norm_bits`
//! - locations: per doc with locations, `uvarint num_bytes` then per occurrence
//!   `field_id, pos, start, end, num_array_positions, array_positions...`
//!
//! Terms held by a single document may skip the record entirely and live in
//! the dictionary value itself (see [`encode_one_hit`](super::types::encode_one_hit)).

use std::iter::Peekable;

use bytes::Bytes;
use roaring::RoaringBitmap;

use super::intcoder::ChunkedIntReader;
use super::types::{decode_one_hit, postings_chunk_size, Location, Posting};
use super::varint::{put_uvarint, read_uvarint};
use crate::error::{Result, SedimentError};

/// Encode the location entry of one document, including its length prefix
pub fn encode_locations(locations: &[Location]) -> Vec<u8> {
    let mut body = Vec::new();
    for loc in locations {
        put_uvarint(&mut body, loc.field_id as u64);
        put_uvarint(&mut body, loc.pos);
        put_uvarint(&mut body, loc.start);
        put_uvarint(&mut body, loc.end);
        put_uvarint(&mut body, loc.array_positions.len() as u64);
        for &ap in &loc.array_positions {
            put_uvarint(&mut body, ap);
        }
    }
    let mut out = Vec::with_capacity(body.len() + 2);
    put_uvarint(&mut out, body.len() as u64);
    out.extend_from_slice(&body);
    out
}

fn decode_locations(buf: &[u8]) -> Result<Vec<Location>> {
    let mut pos = 0;
    let mut out = Vec::new();
    while pos < buf.len() {
        let field_id = read_uvarint(buf, &mut pos)?;
        let field_id = u16::try_from(field_id)
            .map_err(|_| SedimentError::corrupt(format!("location field id {field_id}")))?;
        let loc_pos = read_uvarint(buf, &mut pos)?;
        let start = read_uvarint(buf, &mut pos)?;
        let end = read_uvarint(buf, &mut pos)?;
        let n = read_uvarint(buf, &mut pos)? as usize;
        if n > buf.len() {
            return Err(SedimentError::corrupt("array position count exceeds entry"));
        }
        let mut array_positions = Vec::with_capacity(n);
        for _ in 0..n {
            array_positions.push(read_uvarint(buf, &mut pos)?);
        }
        out.push(Location {
            field_id,
            pos: loc_pos,
            start,
            end,
            array_positions,
        });
    }
    Ok(out)
}

#[derive(Clone, Debug)]
enum Encoding {
    Empty,
    OneHit {
        norm: f32,
    },
    General {
        freq_offset: u64,
        loc_offset: u64,
        chunk_size: u64,
    },
}

/// The documents containing one term of one field, minus any excluded docs
#[derive(Clone, Debug)]
pub struct PostingsList {
    data: Bytes,
    bitmap: RoaringBitmap,
    except: Option<RoaringBitmap>,
    encoding: Encoding,
}

impl PostingsList {
    pub fn empty() -> Self {
        Self {
            data: Bytes::new(),
            bitmap: RoaringBitmap::new(),
            except: None,
            encoding: Encoding::Empty,
        }
    }

    /// Decode the postings referenced by dictionary value `value`
    pub(crate) fn from_value(
        data: &Bytes,
        value: u64,
        num_docs: u64,
        chunk_factor: u32,
        except: Option<&RoaringBitmap>,
    ) -> Result<Self> {
        let except = except.filter(|e| !e.is_empty()).cloned();

        if let Some((doc_num, norm)) = decode_one_hit(value) {
            let doc = u32::try_from(doc_num)
                .map_err(|_| SedimentError::corrupt("1-hit doc number overflow"))?;
            let mut bitmap = RoaringBitmap::new();
            bitmap.insert(doc);
            return Ok(Self {
                data: data.clone(),
                bitmap,
                except,
                encoding: Encoding::OneHit { norm },
            });
        }

        let mut pos = usize::try_from(value)
            .map_err(|_| SedimentError::corrupt("postings offset overflows usize"))?;
        let freq_offset = read_uvarint(data, &mut pos)?;
        let loc_offset = read_uvarint(data, &mut pos)?;
        let bitmap_len = read_uvarint(data, &mut pos)? as usize;
        let end = pos
            .checked_add(bitmap_len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| SedimentError::corrupt("postings bitmap past segment end"))?;
        let bitmap = RoaringBitmap::deserialize_from(&data[pos..end])
            .map_err(|e| SedimentError::corrupt(format!("postings bitmap: {e}")))?;

        let chunk_size = postings_chunk_size(bitmap.len(), num_docs, chunk_factor);
        Ok(Self {
            data: data.clone(),
            bitmap,
            except,
            encoding: Encoding::General {
                freq_offset,
                loc_offset,
                chunk_size,
            },
        })
    }

    /// Number of documents after exclusions
    pub fn count(&self) -> u64 {
        match &self.except {
            Some(except) => self.bitmap.len() - self.bitmap.intersection_len(except),
            None => self.bitmap.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Doc numbers after exclusions
    pub fn doc_nums(&self) -> RoaringBitmap {
        match &self.except {
            Some(except) => &self.bitmap - except,
            None => self.bitmap.clone(),
        }
    }

    /// Whether this list was read from an inlined dictionary value
    pub fn is_one_hit(&self) -> bool {
        matches!(self.encoding, Encoding::OneHit { .. })
    }

    /// Iterate postings; frequency, norm and locations are only decoded
    /// when requested
    pub fn iter(&self, include_freq_norm: bool, include_locations: bool) -> Result<PostingsIterator> {
        let decode = include_freq_norm || include_locations;
        let streams = match &self.encoding {
            Encoding::General {
                freq_offset,
                loc_offset,
                chunk_size,
            } if decode => Some(Streams {
                freq: ChunkedIntReader::open(&self.data, *freq_offset)?,
                locs: ChunkedIntReader::open(&self.data, *loc_offset)?,
                chunk_size: *chunk_size,
                current: None,
                freq_chunk: Bytes::new(),
                freq_pos: 0,
                loc_chunk: Bytes::new(),
                loc_pos: 0,
            }),
            _ => None,
        };
        let one_hit_norm = match self.encoding {
            Encoding::OneHit { norm } => Some(norm),
            _ => None,
        };

        Ok(PostingsIterator {
            docs: self.bitmap.clone().into_iter().peekable(),
            all: self.bitmap.clone(),
            except: self.except.clone(),
            streams,
            one_hit_norm,
            include_freq_norm,
            include_locations,
        })
    }

    /// Collect every posting with frequency, norm and locations
    pub fn postings(&self) -> Result<Vec<Posting>> {
        let mut iter = self.iter(true, true)?;
        let mut out = Vec::with_capacity(self.count() as usize);
        while let Some(p) = iter.next_posting()? {
            out.push(p);
        }
        Ok(out)
    }
}

struct Streams {
    freq: ChunkedIntReader,
    locs: ChunkedIntReader,
    chunk_size: u64,
    current: Option<usize>,
    freq_chunk: Bytes,
    freq_pos: usize,
    loc_chunk: Bytes,
    loc_pos: usize,
}

impl Streams {
    fn chunk_of(&self, doc: u32) -> usize {
        (doc as u64 / self.chunk_size) as usize
    }

    fn load(&mut self, idx: usize) {
        self.current = Some(idx);
        self.freq_chunk = self.freq.chunk(idx);
        self.freq_pos = 0;
        self.loc_chunk = self.locs.chunk(idx);
        self.loc_pos = 0;
    }

    /// Decode the next entry: (freq, norm, raw location bytes)
    fn read_entry(&mut self) -> Result<(u64, f32, Option<(usize, usize)>)> {
        let freq_has_locs = read_uvarint(&self.freq_chunk, &mut self.freq_pos)?;
        let norm_bits = read_uvarint(&self.freq_chunk, &mut self.freq_pos)?;
        let norm = f32::from_bits(norm_bits as u32);
        let freq = freq_has_locs >> 1;
        if freq_has_locs & 1 == 0 {
            return Ok((freq, norm, None));
        }
        let n = read_uvarint(&self.loc_chunk, &mut self.loc_pos)? as usize;
        let start = self.loc_pos;
        let end = start
            .checked_add(n)
            .filter(|&e| e <= self.loc_chunk.len())
            .ok_or_else(|| SedimentError::corrupt("location entry past chunk end"))?;
        self.loc_pos = end;
        Ok((freq, norm, Some((start, end))))
    }
}

/// Iterator over a [`PostingsList`]
///
/// Walks the unfiltered bitmap so chunk entries stay aligned with doc
/// numbers, skipping excluded docs after decoding their entries. Chunks are
/// loaded lazily; entries before the first visited doc of a chunk are
/// skipped by counting bitmap members with `rank`.
pub struct PostingsIterator {
    docs: Peekable<roaring::bitmap::IntoIter>,
    all: RoaringBitmap,
    except: Option<RoaringBitmap>,
    streams: Option<Streams>,
    one_hit_norm: Option<f32>,
    include_freq_norm: bool,
    include_locations: bool,
}

impl PostingsIterator {
    fn is_excluded(&self, doc: u32) -> bool {
        self.except.as_ref().is_some_and(|e| e.contains(doc))
    }

    /// Count bitmap members in `[lo, doc)`
    fn members_before(&self, lo: u64, doc: u32) -> u64 {
        let upto = self.all.rank(doc) - 1;
        if lo == 0 {
            upto
        } else {
            upto - self.all.rank((lo - 1) as u32)
        }
    }

    fn decode(&mut self, doc: u32) -> Result<Posting> {
        let include_freq_norm = self.include_freq_norm;
        let include_locations = self.include_locations;

        if let Some(norm) = self.one_hit_norm {
            return Ok(Posting {
                doc_num: doc as u64,
                freq: 1,
                norm,
                locations: Vec::new(),
            });
        }

        let idx = match &self.streams {
            Some(s) => s.chunk_of(doc),
            None => {
                return Ok(Posting {
                    doc_num: doc as u64,
                    freq: 0,
                    norm: 0.0,
                    locations: Vec::new(),
                })
            }
        };
        let needs_load = self.streams.as_ref().is_some_and(|s| s.current != Some(idx));
        if needs_load {
            let chunk_size = self.streams.as_ref().map_or(1, |s| s.chunk_size);
            let skip = self.members_before(idx as u64 * chunk_size, doc);
            if let Some(s) = self.streams.as_mut() {
                s.load(idx);
                for _ in 0..skip {
                    s.read_entry()?;
                }
            }
        }

        let Some(s) = self.streams.as_mut() else {
            return Err(SedimentError::Internal("postings streams missing".to_string()));
        };
        let (freq, norm, loc_range) = s.read_entry()?;
        let locations = match loc_range {
            Some((start, end)) if include_locations => decode_locations(&s.loc_chunk[start..end])?,
            _ => Vec::new(),
        };
        Ok(Posting {
            doc_num: doc as u64,
            freq: if include_freq_norm { freq } else { 0 },
            norm: if include_freq_norm { norm } else { 0.0 },
            locations,
        })
    }

    /// Next non-excluded posting
    pub fn next_posting(&mut self) -> Result<Option<Posting>> {
        while let Some(doc) = self.docs.next() {
            let decoding = self.streams.is_some() || self.one_hit_norm.is_some();
            let posting = if decoding {
                Some(self.decode(doc)?)
            } else {
                None
            };
            if self.is_excluded(doc) {
                continue;
            }
            return Ok(Some(posting.unwrap_or(Posting {
                doc_num: doc as u64,
                freq: 0,
                norm: 0.0,
                locations: Vec::new(),
            })));
        }
        Ok(None)
    }

    /// First non-excluded posting with doc number >= `target`
    pub fn advance(&mut self, target: u64) -> Result<Option<Posting>> {
        while let Some(&doc) = self.docs.peek() {
            if doc as u64 >= target {
                break;
            }
            self.docs.next();
            // entries of a skipped doc are not consumed, so the loaded chunk
            // is no longer aligned
            if let Some(s) = self.streams.as_mut() {
                if s.current == Some(s.chunk_of(doc)) {
                    s.current = None;
                }
            }
        }
        self.next_posting()
    }
}

impl Iterator for PostingsIterator {
    type Item = Result<Posting>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_posting().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_encoding() {
        let locs = vec![
            Location {
                field_id: 2,
                pos: 1,
                start: 0,
                end: 5,
                array_positions: vec![],
            },
            Location {
                field_id: 2,
                pos: 7,
                start: 40,
                end: 45,
                array_positions: vec![0, 3],
            },
        ];
        let encoded = encode_locations(&locs);
        let mut pos = 0;
        let len = read_uvarint(&encoded, &mut pos).unwrap() as usize;
        assert_eq!(len, encoded.len() - pos);
        assert_eq!(decode_locations(&encoded[pos..]).unwrap(), locs);
    }

    #[test]
    fn test_one_hit_matches_general_encoding() {
        use crate::segment::types::norm_for_length;
        use crate::segment::writer::SegmentWriter;

        let mut writer = SegmentWriter::new(Vec::new(), 3, 1024);
        for id in ["a", "b", "c"] {
            writer.add_stored(id.as_bytes(), &[]).unwrap();
        }
        writer.finish_stored().unwrap();
        let hit = Posting {
            doc_num: 2,
            freq: 1,
            norm: norm_for_length(4),
            locations: vec![],
        };
        let inlined = writer.write_postings(std::slice::from_ref(&hit)).unwrap();
        let general = writer.write_general_postings(std::slice::from_ref(&hit)).unwrap();
        let (buf, _) = writer.finish().unwrap();
        let data = Bytes::from(buf);

        let one = PostingsList::from_value(&data, inlined, 3, 1024, None).unwrap();
        let full = PostingsList::from_value(&data, general, 3, 1024, None).unwrap();
        assert!(one.is_one_hit());
        assert!(!full.is_one_hit());
        assert_eq!(one.doc_nums(), full.doc_nums());
        assert_eq!(one.postings().unwrap(), vec![hit.clone()]);
        assert_eq!(full.postings().unwrap(), vec![hit]);

        let mut except = RoaringBitmap::new();
        except.insert(2);
        let gone = PostingsList::from_value(&data, inlined, 3, 1024, Some(&except)).unwrap();
        assert!(gone.is_empty());
    }

    #[test]
    fn test_empty_postings() {
        let list = PostingsList::empty();
        assert_eq!(list.count(), 0);
        let mut iter = list.iter(true, true).unwrap();
        assert!(iter.next_posting().unwrap().is_none());
    }
}
