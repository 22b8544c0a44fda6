//! Encoding analyzed documents into a new segment

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;

use fst::MapBuilder;

use super::contentcoder::ChunkedContentCoder;
use super::docvalues::encode_terms;
use super::store::StoredEntry;
use super::types::{norm_for_length, Location, Posting, ID_FIELD};
use super::writer::SegmentWriter;
use crate::analysis::AnalysisResult;
use crate::error::{Result, SedimentError};

#[derive(Default)]
struct FieldAccum {
    terms: BTreeMap<Vec<u8>, Vec<Posting>>,
    doc_values: Option<ChunkedContentCoder>,
}

/// Everything one document contributes to one field
#[derive(Default)]
struct DocField<'a> {
    length: u64,
    doc_values: bool,
    terms: BTreeMap<&'a [u8], (u64, Vec<Location>)>,
}

/// Field names of a build: `_id` first, the rest sorted
fn field_names(results: &[AnalysisResult]) -> Vec<String> {
    let names: BTreeSet<&str> = results
        .iter()
        .flat_map(|r| r.document.fields.iter().map(|f| f.name.as_str()))
        .filter(|&name| name != ID_FIELD)
        .collect();
    std::iter::once(ID_FIELD)
        .chain(names)
        .map(str::to_string)
        .collect()
}

/// Encode `results` as a segment, documents numbered in slice order
pub fn build_segment<W: Write>(results: &[AnalysisResult], chunk_factor: u32, w: W) -> Result<W> {
    let num_docs = results.len() as u64;
    if num_docs > u32::MAX as u64 {
        return Err(SedimentError::InvalidRequest(format!(
            "{num_docs} documents exceed the per-segment limit"
        )));
    }
    let fields = field_names(results);
    if fields.len() > u16::MAX as usize {
        return Err(SedimentError::InvalidRequest(format!("{} fields in one segment", fields.len())));
    }
    let field_ids: HashMap<&str, u16> = fields
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i as u16))
        .collect();

    let mut writer = SegmentWriter::new(w, num_docs, chunk_factor);
    let chunk_factor = writer.chunk_factor();

    for result in results {
        let stored: Vec<StoredEntry<'_>> = result
            .document
            .fields
            .iter()
            .filter(|f| f.options.store && f.name != ID_FIELD)
            .filter_map(|f| {
                field_ids.get(f.name.as_str()).map(|&field_id| StoredEntry {
                    field_id,
                    kind: f.kind,
                    value: &f.value,
                    array_positions: &f.array_positions,
                })
            })
            .collect();
        writer.add_stored(result.document.id.as_bytes(), &stored)?;
    }
    writer.finish_stored()?;

    let mut accums: Vec<FieldAccum> = fields.iter().map(|_| FieldAccum::default()).collect();
    for (doc_num, result) in results.iter().enumerate() {
        let doc_num = doc_num as u64;
        accums[0]
            .terms
            .entry(result.document.id.as_bytes().to_vec())
            .or_default()
            .push(Posting {
                doc_num,
                freq: 1,
                norm: norm_for_length(1),
                locations: Vec::new(),
            });

        let mut per_field: BTreeMap<u16, DocField<'_>> = BTreeMap::new();
        for (field, analyzed) in result.fields() {
            if !field.options.index || field.name == ID_FIELD {
                continue;
            }
            let Some(&field_id) = field_ids.get(field.name.as_str()) else {
                continue;
            };
            let entry = per_field.entry(field_id).or_default();
            entry.length += analyzed.length;
            entry.doc_values |= field.options.doc_values;
            for (term, tf) in &analyzed.tokens {
                let (freq, locations) = entry.terms.entry(term.as_slice()).or_default();
                *freq += tf.frequency;
                if field.options.include_locations {
                    locations.extend(tf.locations.iter().map(|loc| Location {
                        field_id,
                        pos: loc.position,
                        start: loc.start,
                        end: loc.end,
                        array_positions: loc.array_positions.clone(),
                    }));
                }
            }
        }

        for (field_id, doc_field) in per_field {
            let accum = &mut accums[field_id as usize];
            if doc_field.doc_values && !doc_field.terms.is_empty() {
                let coder = accum
                    .doc_values
                    .get_or_insert_with(|| ChunkedContentCoder::new(chunk_factor as u64, num_docs - 1));
                coder.add(doc_num, &encode_terms(doc_field.terms.keys().copied()))?;
            }
            let norm = norm_for_length(doc_field.length);
            for (term, (freq, locations)) in doc_field.terms {
                accum.terms.entry(term.to_vec()).or_default().push(Posting {
                    doc_num,
                    freq,
                    norm,
                    locations,
                });
            }
        }
    }

    for (name, accum) in fields.iter().zip(accums) {
        let mut dict = MapBuilder::memory();
        let num_terms = accum.terms.len();
        for (term, hits) in &accum.terms {
            let value = writer.write_postings(hits)?;
            dict.insert(term, value)?;
        }
        writer.finish_field(name, dict, num_terms, accum.doc_values)?;
    }

    let (w, _footer) = writer.finish()?;
    Ok(w)
}

/// Encode `results` into an in-memory buffer
pub fn build_segment_bytes(results: &[AnalysisResult], chunk_factor: u32) -> Result<Vec<u8>> {
    build_segment(results, chunk_factor, Vec::new())
}
