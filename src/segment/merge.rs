//! Merging several segments into one
//!
//! Surviving documents are renumbered densely in input order: all live docs
//! of the first segment, then the second, and so on. Every section of the
//! output is rebuilt from the inputs through their public readers, so any
//! [`Segment`] implementation can take part in a merge.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use fst::{MapBuilder, Streamer};
use roaring::RoaringBitmap;

use super::contentcoder::ChunkedContentCoder;
use super::store::StoredEntry;
use super::traits::Segment;
use super::types::{Location, Posting, DOC_DROPPED, ID_FIELD};
use super::writer::SegmentWriter;
use crate::error::{Result, SedimentError};
use crate::models::FieldKind;

/// Old doc number to new doc number, [`DOC_DROPPED`] for removed docs
fn remap_doc_nums(segments: &[Arc<dyn Segment>], drops: &[Option<RoaringBitmap>]) -> Result<(Vec<Vec<u64>>, u64)> {
    let mut next = 0u64;
    let mut remaps = Vec::with_capacity(segments.len());
    for (i, segment) in segments.iter().enumerate() {
        let dropped = drops.get(i).and_then(Option::as_ref);
        let mut remap = Vec::with_capacity(segment.count() as usize);
        for doc in 0..segment.count() {
            let gone = match (dropped, u32::try_from(doc)) {
                (Some(d), Ok(doc)) => d.contains(doc),
                _ => false,
            };
            if gone {
                remap.push(DOC_DROPPED);
            } else {
                remap.push(next);
                next += 1;
            }
        }
        remaps.push(remap);
    }
    if next > u32::MAX as u64 {
        return Err(SedimentError::InvalidRequest(format!(
            "merge of {next} documents exceeds the per-segment limit"
        )));
    }
    Ok((remaps, next))
}

fn merged_fields(segments: &[Arc<dyn Segment>]) -> Vec<String> {
    let names: BTreeSet<&str> = segments
        .iter()
        .flat_map(|s| s.fields().iter().map(String::as_str))
        .filter(|&name| name != ID_FIELD)
        .collect();
    std::iter::once(ID_FIELD)
        .chain(names)
        .map(str::to_string)
        .collect()
}

struct OwnedStored {
    field_id: u16,
    kind: FieldKind,
    value: Vec<u8>,
    array_positions: Vec<u64>,
}

fn merge_stored<W: Write>(
    writer: &mut SegmentWriter<W>,
    segments: &[Arc<dyn Segment>],
    remaps: &[Vec<u64>],
    field_ids: &HashMap<&str, u16>,
) -> Result<()> {
    for (segment, remap) in segments.iter().zip(remaps) {
        for (doc, &new_doc) in remap.iter().enumerate() {
            if new_doc == DOC_DROPPED {
                continue;
            }
            let mut id = Vec::new();
            let mut values = Vec::new();
            segment.visit_stored(doc as u64, &mut |v| {
                if v.field == ID_FIELD {
                    id = v.value.to_vec();
                } else if let Some(&field_id) = field_ids.get(v.field) {
                    values.push(OwnedStored {
                        field_id,
                        kind: v.kind,
                        value: v.value.to_vec(),
                        array_positions: v.array_positions.to_vec(),
                    });
                }
                true
            })?;
            let entries: Vec<StoredEntry<'_>> = values
                .iter()
                .map(|v| StoredEntry {
                    field_id: v.field_id,
                    kind: v.kind,
                    value: &v.value,
                    array_positions: &v.array_positions,
                })
                .collect();
            writer.add_stored(&id, &entries)?;
        }
    }
    writer.finish_stored()
}

/// Postings of one term gathered from every segment that has it
fn merge_term_postings(
    sources: &[(usize, u64)],
    dicts: &[super::term_dict::Dictionary],
    drops: &[Option<RoaringBitmap>],
    remaps: &[Vec<u64>],
    location_fields: &[Vec<Option<u16>>],
) -> Result<Vec<Posting>> {
    let mut hits = Vec::new();
    for &(seg, value) in sources {
        let except = drops.get(seg).and_then(Option::as_ref);
        let list = dicts[seg].postings_for_value(value, except)?;
        let mut iter = list.iter(true, true)?;
        while let Some(posting) = iter.next_posting()? {
            let new_doc = remaps[seg]
                .get(posting.doc_num as usize)
                .copied()
                .unwrap_or(DOC_DROPPED);
            if new_doc == DOC_DROPPED {
                return Err(SedimentError::MergeInvariant(format!(
                    "dropped doc {} of input {seg} still has postings in {}",
                    posting.doc_num,
                    dicts[seg].field()
                )));
            }
            let mut locations = Vec::with_capacity(posting.locations.len());
            for loc in posting.locations {
                let field_id = location_fields[seg]
                    .get(loc.field_id as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| {
                        SedimentError::MergeInvariant(format!(
                            "location field {} unknown in input {seg}",
                            loc.field_id
                        ))
                    })?;
                locations.push(Location { field_id, ..loc });
            }
            hits.push(Posting {
                doc_num: new_doc,
                freq: posting.freq,
                norm: posting.norm,
                locations,
            });
        }
    }
    Ok(hits)
}

fn merge_field<W: Write>(
    writer: &mut SegmentWriter<W>,
    name: &str,
    segments: &[Arc<dyn Segment>],
    drops: &[Option<RoaringBitmap>],
    remaps: &[Vec<u64>],
    location_fields: &[Vec<Option<u16>>],
    new_count: u64,
) -> Result<()> {
    let dicts = segments
        .iter()
        .map(|s| s.dictionary(name))
        .collect::<Result<Vec<_>>>()?;
    let mut streams: Vec<_> = dicts.iter().map(|d| d.stream()).collect();

    let mut heap = BinaryHeap::new();
    for (seg, stream) in streams.iter_mut().enumerate() {
        if let Some((term, value)) = stream.as_mut().and_then(|s| s.next()) {
            heap.push(Reverse((term.to_vec(), seg, value)));
        }
    }

    let mut dict = MapBuilder::memory();
    let mut num_terms = 0;
    while let Some(Reverse((term, seg, value))) = heap.pop() {
        let mut sources = vec![(seg, value)];
        while let Some(Reverse((next, _, _))) = heap.peek() {
            if *next != term {
                break;
            }
            if let Some(Reverse((_, seg, value))) = heap.pop() {
                sources.push((seg, value));
            }
        }
        sources.sort_unstable_by_key(|&(seg, _)| seg);

        for &(seg, _) in &sources {
            if let Some((next, value)) = streams[seg].as_mut().and_then(|s| s.next()) {
                heap.push(Reverse((next.to_vec(), seg, value)));
            }
        }

        let hits = merge_term_postings(&sources, &dicts, drops, remaps, location_fields)?;
        if hits.is_empty() {
            continue;
        }
        let value = writer.write_postings(&hits)?;
        dict.insert(&term, value)?;
        num_terms += 1;
    }

    let mut doc_values: Option<ChunkedContentCoder> = None;
    for (seg, segment) in segments.iter().enumerate() {
        let Some(mut reader) = segment.doc_value_reader(name)? else {
            continue;
        };
        let coder = doc_values.get_or_insert_with(|| {
            ChunkedContentCoder::new(writer.chunk_factor() as u64, new_count.saturating_sub(1))
        });
        for (doc, &new_doc) in remaps[seg].iter().enumerate() {
            if new_doc == DOC_DROPPED {
                continue;
            }
            if let Some(bytes) = reader.doc_bytes(doc as u64)? {
                if !bytes.is_empty() {
                    coder.add(new_doc, bytes)?;
                }
            }
        }
    }

    writer.finish_field(name, dict, num_terms, doc_values)
}

/// Merge `segments` into `w`, leaving out the docs set in `drops`
///
/// Returns, per input segment, the new number of every old doc
/// ([`DOC_DROPPED`] for removed ones).
pub fn merge_to_writer<W: Write>(
    segments: &[Arc<dyn Segment>],
    drops: &[Option<RoaringBitmap>],
    chunk_factor: u32,
    w: W,
) -> Result<(W, Vec<Vec<u64>>)> {
    let (remaps, new_count) = remap_doc_nums(segments, drops)?;
    let fields = merged_fields(segments);
    if fields.len() > u16::MAX as usize {
        return Err(SedimentError::InvalidRequest(format!("{} fields in one segment", fields.len())));
    }
    let field_ids: HashMap<&str, u16> = fields
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i as u16))
        .collect();
    let location_fields: Vec<Vec<Option<u16>>> = segments
        .iter()
        .map(|s| s.fields().iter().map(|f| field_ids.get(f.as_str()).copied()).collect())
        .collect();

    let mut writer = SegmentWriter::new(w, new_count, chunk_factor);
    merge_stored(&mut writer, segments, &remaps, &field_ids)?;
    for name in &fields {
        merge_field(&mut writer, name, segments, drops, &remaps, &location_fields, new_count)?;
    }
    let (w, footer) = writer.finish()?;
    tracing::debug!(
        inputs = segments.len(),
        docs = footer.num_docs,
        fields = fields.len(),
        "merged segments"
    );
    Ok((w, remaps))
}

/// Merge into a new segment file at `path`
pub fn merge_to_file(
    segments: &[Arc<dyn Segment>],
    drops: &[Option<RoaringBitmap>],
    path: &Path,
    chunk_factor: u32,
) -> Result<Vec<Vec<u64>>> {
    let tmp = path.with_extension("tmp");
    let result = (|| -> Result<Vec<Vec<u64>>> {
        let file = BufWriter::new(File::create(&tmp)?);
        let (file, remaps) = merge_to_writer(segments, drops, chunk_factor, file)?;
        let file = file
            .into_inner()
            .map_err(|e| SedimentError::Io(e.into_error()))?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(remaps)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Merge into an in-memory segment image
pub fn merge_to_bytes(
    segments: &[Arc<dyn Segment>],
    drops: &[Option<RoaringBitmap>],
    chunk_factor: u32,
) -> Result<(Vec<u8>, Vec<Vec<u64>>)> {
    merge_to_writer(segments, drops, chunk_factor, Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::config::AnalyzerConfig;
    use crate::models::{Document, Field};
    use crate::segment::mem::MemSegment;

    fn segment(docs: &[(&str, &str)]) -> Arc<dyn Segment> {
        let analyzer = Analyzer::new(&AnalyzerConfig::default());
        let results: Vec<_> = docs
            .iter()
            .map(|(id, body)| {
                analyzer.analyze(
                    Document::new(*id)
                        .with_field(Field::text("body", body))
                        .with_field(Field::keyword("tag", id)),
                )
            })
            .collect();
        Arc::new(MemSegment::build(&results, 1024).unwrap())
    }

    fn drops(docs: &[u32]) -> Option<RoaringBitmap> {
        Some(docs.iter().copied().collect())
    }

    #[test]
    fn test_merge_renumbers_in_input_order() {
        let a = segment(&[("a1", "red fox"), ("a2", "blue fox")]);
        let b = segment(&[("b1", "red hen")]);
        let (bytes, remaps) = merge_to_bytes(&[a, b], &[drops(&[0]), None], 1024).unwrap();
        assert_eq!(remaps, vec![vec![DOC_DROPPED, 0], vec![1]]);

        let merged = MemSegment::from_bytes(bytes.into()).unwrap();
        assert_eq!(merged.count(), 2);
        assert_eq!(merged.doc_id(0).unwrap(), "a2");
        assert_eq!(merged.doc_id(1).unwrap(), "b1");

        let dict = merged.dictionary("body").unwrap();
        let fox = dict.postings_list(b"fox", None).unwrap();
        assert_eq!(fox.doc_nums().iter().collect::<Vec<_>>(), vec![0]);
        let red = dict.postings_list(b"red", None).unwrap();
        assert_eq!(red.doc_nums().iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_merge_drops_terms_without_survivors() {
        let a = segment(&[("a1", "lonely"), ("a2", "other")]);
        let (bytes, _) = merge_to_bytes(&[a], &[drops(&[0])], 1024).unwrap();
        let merged = MemSegment::from_bytes(bytes.into()).unwrap();
        let dict = merged.dictionary("body").unwrap();
        assert!(!dict.contains(b"lonely"));
        assert!(dict.contains(b"other"));
        assert!(!merged.dictionary(ID_FIELD).unwrap().contains(b"a1"));
    }

    #[test]
    fn test_merge_remaps_location_fields() {
        let a = segment(&[("a1", "quick")]);
        let analyzer = Analyzer::new(&AnalyzerConfig::default());
        let b: Arc<dyn Segment> = Arc::new(
            MemSegment::build(
                &[analyzer.analyze(
                    Document::new("b1")
                        .with_field(Field::text("aaa", "first"))
                        .with_field(Field::text("body", "quick")),
                )],
                1024,
            )
            .unwrap(),
        );
        let (bytes, _) = merge_to_bytes(&[a, b], &[None, None], 1024).unwrap();
        let merged = MemSegment::from_bytes(bytes.into()).unwrap();
        let body_id = merged.base().field_id("body").unwrap();

        let postings = merged
            .dictionary("body")
            .unwrap()
            .postings_list(b"quick", None)
            .unwrap()
            .postings()
            .unwrap();
        assert_eq!(postings.len(), 2);
        for p in postings {
            assert!(p.locations.iter().all(|l| l.field_id == body_id));
        }
    }

    #[test]
    fn test_merge_carries_stored_and_doc_values() {
        let a = segment(&[("a1", "alpha beta")]);
        let b = segment(&[("b1", "gamma")]);
        let (bytes, _) = merge_to_bytes(&[a, b], &[None, None], 1024).unwrap();
        let merged = MemSegment::from_bytes(bytes.into()).unwrap();

        let mut body = None;
        merged
            .visit_stored(1, &mut |v| {
                if v.field == "body" {
                    body = Some(v.value.to_vec());
                }
                true
            })
            .unwrap();
        assert_eq!(body.as_deref(), Some(&b"gamma"[..]));

        let mut reader = merged.doc_value_reader("body").unwrap().unwrap();
        assert_eq!(reader.terms(0).unwrap(), vec![b"alpha".to_vec(), b"beta".to_vec()]);
        assert_eq!(reader.terms(1).unwrap(), vec![b"gamma".to_vec()]);
    }

    #[test]
    fn test_merge_everything_dropped() {
        let a = segment(&[("a1", "x")]);
        let (bytes, remaps) = merge_to_bytes(&[a], &[drops(&[0])], 1024).unwrap();
        assert_eq!(remaps, vec![vec![DOC_DROPPED]]);
        let merged = MemSegment::from_bytes(bytes.into()).unwrap();
        assert_eq!(merged.count(), 0);
        assert!(merged.dictionary("body").unwrap().is_empty());
    }

    #[test]
    fn test_merge_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("000000000001.seg");
        let a = segment(&[("a1", "x")]);
        merge_to_file(&[a], &[None], &path, 1024).unwrap();
        let opened = crate::segment::file::FileSegment::open(&path).unwrap();
        assert_eq!(opened.doc_id(0).unwrap(), "a1");
        assert!(!path.with_extension("tmp").exists());
    }
}
