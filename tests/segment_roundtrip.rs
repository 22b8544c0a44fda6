//! Encode analyzed documents to a segment file and read everything back

use std::collections::BTreeMap;
use std::sync::Arc;

use sediment::analysis::{AnalysisResult, Analyzer};
use sediment::config::AnalyzerConfig;
use sediment::models::{Document, Field, FieldOptions};
use sediment::segment::{
    build_segment_bytes, merge_to_bytes, norm_for_length, FileSegment, MemSegment, Segment, UnpersistedSegment,
    ID_FIELD,
};
use tempfile::TempDir;

fn corpus() -> Vec<Document> {
    let titles = [
        "the quick brown fox",
        "jumps over the lazy dog",
        "quick quick slow",
        "brown paper packages",
        "a fox in the henhouse",
        "unique snowflake",
    ];
    titles
        .iter()
        .enumerate()
        .map(|(i, title)| {
            Document::new(format!("doc-{i}"))
                .with_field(Field::text("title", title))
                .with_field(Field::keyword("tag", if i % 2 == 0 { "even" } else { "odd" }))
                .with_field(Field::numeric("rank", i as f64))
        })
        .collect()
}

fn analyze(docs: Vec<Document>) -> Vec<AnalysisResult> {
    let analyzer = Analyzer::new(&AnalyzerConfig::default());
    docs.into_iter().map(|d| analyzer.analyze(d)).collect()
}

/// Expected (doc_num, freq, norm, positions) per (field, term)
fn expected_postings(results: &[AnalysisResult]) -> BTreeMap<(String, Vec<u8>), Vec<(u64, u64, f32, Vec<u64>)>> {
    let mut out: BTreeMap<(String, Vec<u8>), Vec<(u64, u64, f32, Vec<u64>)>> = BTreeMap::new();
    for (doc_num, result) in results.iter().enumerate() {
        for (field, analyzed) in result.fields() {
            for (term, freq) in &analyzed.tokens {
                let positions = freq.locations.iter().map(|l| l.position).collect();
                out.entry((field.name.clone(), term.clone())).or_default().push((
                    doc_num as u64,
                    freq.frequency,
                    norm_for_length(analyzed.length),
                    positions,
                ));
            }
        }
    }
    out
}

fn stored_fields(segment: &dyn Segment, doc_num: u64) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    segment
        .visit_stored(doc_num, &mut |v| {
            out.push((v.field.to_string(), v.value.to_vec()));
            true
        })
        .unwrap();
    out
}

fn check_segment(segment: &dyn Segment, results: &[AnalysisResult]) {
    assert_eq!(segment.count(), results.len() as u64);
    assert_eq!(segment.fields()[0], ID_FIELD);

    for (doc_num, result) in results.iter().enumerate() {
        let doc_num = doc_num as u64;
        assert_eq!(segment.doc_id(doc_num).unwrap(), result.document.id);

        let stored = stored_fields(segment, doc_num);
        let expected: Vec<(String, Vec<u8>)> = std::iter::once((ID_FIELD.to_string(), result.document.id.clone().into_bytes()))
            .chain(result.document.fields.iter().map(|f| (f.name.clone(), f.value.clone())))
            .collect();
        assert_eq!(stored, expected, "stored fields of doc {doc_num}");
    }

    for ((field, term), hits) in expected_postings(results) {
        let dict = segment.dictionary(&field).unwrap();
        let list = dict.postings_list(&term, None).unwrap();
        let postings = list.postings().unwrap();
        assert_eq!(postings.len(), hits.len(), "postings of {field}:{:?}", String::from_utf8_lossy(&term));
        for (p, (doc, freq, norm, positions)) in postings.iter().zip(&hits) {
            assert_eq!(p.doc_num, *doc);
            assert_eq!(p.freq, *freq);
            assert_eq!(p.norm, *norm);
            if !list.is_one_hit() {
                let got: Vec<u64> = p.locations.iter().map(|l| l.pos).collect();
                assert_eq!(&got, positions);
            }
        }
    }
}

#[test]
fn test_memory_and_file_segments_agree() {
    let results = analyze(corpus());
    let mem = MemSegment::build(&results, 2).unwrap();
    check_segment(&mem, &results);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("000000000001.seg");
    mem.persist(&path).unwrap();
    let file = FileSegment::open(&path).unwrap();
    check_segment(&file, &results);
    assert_eq!(file.file_name(), Some("000000000001.seg"));
    assert!(file.as_persisted().is_some());
    assert!(file.as_unpersisted().is_none());
    assert!(mem.as_unpersisted().is_some());
}

#[test]
fn test_single_document_terms_use_one_hit_encoding() {
    let docs: Vec<Document> = corpus()
        .into_iter()
        .map(|mut d| {
            for f in &mut d.fields {
                f.options.include_locations = false;
            }
            d
        })
        .collect();
    let results = analyze(docs);
    let segment = MemSegment::build(&results, 1024).unwrap();
    check_segment(&segment, &results);

    let dict = segment.dictionary("title").unwrap();
    // "snowflake" occurs once in one document
    let list = dict.postings_list(b"snowflake", None).unwrap();
    assert!(list.is_one_hit());
    let postings = list.postings().unwrap();
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].doc_num, 5);
    assert_eq!(postings[0].freq, 1);
    assert_eq!(postings[0].norm, norm_for_length(2));

    // "quick" occurs in two documents
    assert!(!dict.postings_list(b"quick", None).unwrap().is_one_hit());

    // ids are always single-hit
    let ids = segment.dictionary(ID_FIELD).unwrap();
    assert!(ids.postings_list(b"doc-3", None).unwrap().is_one_hit());
}

#[test]
fn test_doc_numbers_and_doc_values() {
    let results = analyze(corpus());
    let segment = MemSegment::build(&results, 4).unwrap();

    let ids = vec!["doc-1".to_string(), "doc-4".to_string(), "missing".to_string()];
    let found = segment.doc_numbers(&ids).unwrap();
    assert_eq!(found.iter().collect::<Vec<_>>(), vec![1, 4]);

    let mut reader = segment.doc_value_reader("tag").unwrap().unwrap();
    let mut terms = Vec::new();
    reader.visit(3, &mut |t| terms.push(t.to_vec())).unwrap();
    assert_eq!(terms, vec![b"odd".to_vec()]);
}

#[test]
fn test_corrupted_file_is_rejected() {
    let results = analyze(corpus());
    let mut bytes = build_segment_bytes(&results, 1024).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("000000000002.seg");
    std::fs::write(&path, &bytes).unwrap();
    let err = FileSegment::open(&path).unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {err}");

    let truncated = dir.path().join("000000000003.seg");
    std::fs::write(&truncated, &bytes[..10]).unwrap();
    assert!(FileSegment::open(&truncated).is_err());
}

#[test]
fn test_merge_with_no_drops_unions_postings() {
    let docs = corpus();
    let (left, right) = docs.split_at(3);
    let a_results = analyze(left.to_vec());
    let b_results = analyze(right.to_vec());
    let a: Arc<dyn Segment> = Arc::new(MemSegment::build(&a_results, 1024).unwrap());
    let b: Arc<dyn Segment> = Arc::new(MemSegment::build(&b_results, 1024).unwrap());

    let (bytes, remaps) = merge_to_bytes(&[a.clone(), b.clone()], &[None, None], 1024).unwrap();
    assert_eq!(remaps, vec![vec![0, 1, 2], vec![3, 4, 5]]);
    let merged = MemSegment::from_bytes(bytes.into()).unwrap();

    // merging is equivalent to building from all documents at once
    let all = analyze(corpus());
    check_segment(&merged, &all);

    for field in ["title", "tag"] {
        let mut expected: BTreeMap<Vec<u8>, Vec<u64>> = BTreeMap::new();
        for (segment, remap) in [(&a, &remaps[0]), (&b, &remaps[1])] {
            for entry in segment.dictionary(field).unwrap().entries(None).unwrap() {
                let docs = segment.dictionary(field).unwrap().postings_list(&entry.term, None).unwrap();
                expected
                    .entry(entry.term)
                    .or_default()
                    .extend(docs.doc_nums().iter().map(|d| remap[d as usize]));
            }
        }
        let dict = merged.dictionary(field).unwrap();
        for (term, docs) in expected {
            let got: Vec<u64> = dict
                .postings_list(&term, None)
                .unwrap()
                .doc_nums()
                .iter()
                .map(u64::from)
                .collect();
            assert_eq!(got, docs);
        }
    }
}

#[test]
fn test_unindexed_fields_are_only_stored() {
    let doc = Document::new("x").with_field(Field::text("note", "not searchable").with_options(FieldOptions {
        index: false,
        store: true,
        include_locations: false,
        doc_values: false,
    }));
    let results = analyze(vec![doc]);
    let segment = MemSegment::build(&results, 1024).unwrap();
    assert!(segment.dictionary("note").unwrap().is_empty());
    let stored = stored_fields(&segment, 0);
    assert!(stored.contains(&("note".to_string(), b"not searchable".to_vec())));
}
