//! Background merging and cleanup of a persisted index

use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use sediment::config::{Durability, IndexConfig};
use sediment::mergeplan::MergePlanOptions;
use sediment::models::{Batch, Document, Field};
use sediment::snapshot::IndexSnapshot;
use sediment::Index;
use tempfile::TempDir;

fn doc(id: &str, body: &str) -> Document {
    Document::new(id)
        .with_field(Field::text("body", body))
        .with_field(Field::keyword("kind", "note"))
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn live_ids(snapshot: &IndexSnapshot) -> BTreeSet<String> {
    snapshot
        .doc_id_reader_all()
        .map(|global| snapshot.external_id(global).unwrap())
        .collect()
}

fn segment_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".seg"))
        .count()
}

#[test]
fn test_small_segments_merge_into_one() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(IndexConfig::new(dir.path()).with_durability(Durability::Sync)).unwrap();

    for i in 0..8 {
        index.update(doc(&format!("d{i}"), &format!("entry {i} of the log"))).unwrap();
    }
    assert_eq!(index.doc_count(), 8);

    wait_until("merges", || index.reader().segments().len() == 1);
    let reader = index.reader();
    assert_eq!(reader.doc_count(), 8);
    assert_eq!(live_ids(&reader).len(), 8);
    assert!(index.stats().tot_file_merge_ops.get() > 0);
    assert!(index.stats().tot_introduced_segments_merge.get() > 0);

    // postings survive merging
    let mut postings = reader.term_field_reader(b"log", "body", true, false).unwrap();
    assert_eq!(postings.count(), 8);
    let mut seen = 0;
    while let Some(p) = postings.next().unwrap() {
        assert_eq!(p.freq, 1);
        seen += 1;
    }
    assert_eq!(seen, 8);

    // files of merged-away segments are removed
    index.flush().unwrap();
    wait_until("file cleanup", || segment_files(dir.path()) == index.reader().segments().len());
}

#[test]
fn test_deletes_across_merges() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(IndexConfig::new(dir.path()).with_durability(Durability::Sync)).unwrap();

    for i in 0..6 {
        index.update(doc(&format!("d{i}"), "payload")).unwrap();
    }
    let mut batch = Batch::new();
    for i in 0..3 {
        batch.delete(format!("d{i}"));
    }
    index.batch(batch).unwrap();
    assert_eq!(index.doc_count(), 3);

    wait_until("merges", || index.reader().segments().len() == 1);
    let reader = index.reader();
    assert_eq!(reader.doc_count(), 3);
    let expected: BTreeSet<String> = (3..6).map(|i| format!("d{i}")).collect();
    assert_eq!(live_ids(&reader), expected);

    let dict: Vec<_> = reader.field_dict("kind").unwrap().collect();
    assert_eq!(dict.len(), 1);
    assert_eq!(dict[0].count, 3);
}

#[test]
fn test_delete_then_readd_leaves_one_live_copy() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(IndexConfig::new(dir.path()).with_durability(Durability::Sync)).unwrap();

    index.update(doc("k", "first version")).unwrap();
    let old = index.reader();
    let old_global = old.internal_id("k").unwrap().unwrap();

    index.delete("k").unwrap();
    assert!(index.document("k").unwrap().is_none());
    index.update(doc("k", "second version")).unwrap();

    let reader = index.reader();
    let matches: Vec<u64> = reader.doc_id_reader_only(&["k".to_string()]).unwrap().collect();
    assert_eq!(matches.len(), 1);
    assert_ne!(matches[0], old_global);
    let found = reader.document("k").unwrap().unwrap();
    assert_eq!(found.field("body").and_then(|f| f.as_text()), Some("second version"));
    assert_eq!(reader.doc_count(), 1);

    // the old snapshot still resolves the old copy
    assert_eq!(old.internal_id("k").unwrap(), Some(old_global));
}

#[test]
fn test_merging_disabled_by_budget() {
    let dir = TempDir::new().unwrap();
    let options = MergePlanOptions {
        floor_segment_size: 1,
        max_segments_per_tier: 100,
        ..MergePlanOptions::default()
    };
    let config = IndexConfig::new(dir.path())
        .with_durability(Durability::Sync)
        .with_merge_plan(options);
    let index = Index::open(config).unwrap();
    for i in 0..4 {
        index.update(doc(&format!("d{i}"), "x")).unwrap();
    }
    index.flush().unwrap();
    assert_eq!(index.reader().segments().len(), 4);
    assert_eq!(index.stats().tot_file_merge_ops.get(), 0);
}

#[test]
fn test_unsafe_batches_become_durable_on_flush() {
    let dir = TempDir::new().unwrap();
    let config = IndexConfig::new(dir.path()).with_durability(Durability::Unsafe);
    {
        let index = Index::open(config.clone()).unwrap();
        let mut batch = Batch::new();
        for i in 0..50 {
            batch.update(doc(&format!("u{i}"), "bulk load"));
        }
        index.batch(batch).unwrap();
        index.flush().unwrap();
        assert!(index.stats().tot_persisted_segments.get() >= 1);
    }
    let index = Index::open(config).unwrap();
    assert_eq!(index.doc_count(), 50);
}
