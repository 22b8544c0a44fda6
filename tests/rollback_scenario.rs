//! Rollback to recorded epochs of a persisted index

use std::collections::BTreeSet;

use sediment::config::{Durability, IndexConfig};
use sediment::index::META_DIR;
use sediment::models::{Batch, Document, Field};
use sediment::persistence::MetaStore;
use sediment::snapshot::IndexSnapshot;
use sediment::{rollback_points_at, Index, SedimentError};
use tempfile::TempDir;

fn doc(id: &str) -> Document {
    Document::new(id).with_field(Field::text("body", &format!("document number {id}")))
}

fn live_ids(snapshot: &IndexSnapshot) -> BTreeSet<String> {
    snapshot
        .doc_id_reader_all()
        .map(|global| snapshot.external_id(global).unwrap())
        .collect()
}

fn config(dir: &TempDir) -> IndexConfig {
    IndexConfig::new(dir.path())
        .with_durability(Durability::Sync)
        .with_snapshots_to_keep(20)
}

fn ids(list: &[&str]) -> BTreeSet<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_insert_delete_then_rollback() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(config(&dir)).unwrap();

    let mut batch = Batch::new();
    batch.update(doc("1"));
    batch.update(doc("2"));
    batch.set_internal(b"checkpoint", b"one");
    index.batch(batch).unwrap();

    let points = index.rollback_points().unwrap();
    let after_first = points.first().cloned().unwrap();
    assert_eq!(after_first.get_internal(b"checkpoint"), Some(&b"one"[..]));

    let mut batch = Batch::new();
    batch.update(doc("3"));
    batch.delete("1");
    batch.set_internal(b"checkpoint", b"two");
    index.batch(batch).unwrap();

    let reader = index.reader();
    assert_eq!(reader.doc_count(), 2);
    assert_eq!(live_ids(&reader), ids(&["2", "3"]));
    let epoch_before = index.epoch();

    index.rollback(&after_first).unwrap();
    assert!(index.epoch() > epoch_before);

    let rolled = index.reader();
    assert_eq!(rolled.doc_count(), 2);
    assert_eq!(live_ids(&rolled), ids(&["1", "2"]));
    assert_eq!(rolled.get_internal(b"checkpoint"), Some(&b"one"[..]));
    assert!(rolled.document("3").unwrap().is_none());
    assert!(rolled.document("1").unwrap().is_some());

    // snapshots taken before the rollback still see their own content
    assert_eq!(live_ids(&reader), ids(&["2", "3"]));
    assert_eq!(index.stats().tot_rollback_ops.get(), 1);
}

#[test]
fn test_rollback_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let index = Index::open(config(&dir)).unwrap();
        index.update(doc("a")).unwrap();
        let point = index.rollback_points().unwrap().remove(0);
        index.update(doc("b")).unwrap();
        index.delete("a").unwrap();
        index.rollback(&point).unwrap();
        index.close().unwrap();
    }

    let index = Index::open(config(&dir)).unwrap();
    assert_eq!(live_ids(&index.reader()), ids(&["a"]));

    // writes continue from the rolled back content
    index.update(doc("c")).unwrap();
    assert_eq!(live_ids(&index.reader()), ids(&["a", "c"]));
}

#[test]
fn test_rollback_points_newest_first() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(config(&dir)).unwrap();
    for i in 0..4 {
        index.set_internal(b"n", format!("{i}").as_bytes()).unwrap();
    }

    let points = index.rollback_points().unwrap();
    assert!(points.len() >= 4);
    for pair in points.windows(2) {
        assert!(pair[0].epoch() > pair[1].epoch());
    }
    assert_eq!(points[0].get_internal(b"n"), Some(&b"3"[..]));
    index.close().unwrap();
    drop(index);

    let closed = rollback_points_at(dir.path()).unwrap();
    assert_eq!(closed, points);
}

#[test]
fn test_rollback_to_missing_epoch() {
    let dir = TempDir::new().unwrap();
    let index = Index::open(config(&dir).with_snapshots_to_keep(1)).unwrap();
    index.update(doc("x")).unwrap();
    let stale = index.rollback_points().unwrap().remove(0);
    index.update(doc("y")).unwrap();
    index.update(doc("z")).unwrap();

    // only the newest record is retained
    let err = index.rollback(&stale).unwrap_err();
    assert!(matches!(err, SedimentError::RollbackPointNotFound(epoch) if epoch == stale.epoch()));
    assert_eq!(live_ids(&index.reader()), ids(&["x", "y", "z"]));
}

#[test]
fn test_in_memory_index_has_no_rollback_points() {
    let index = Index::open(IndexConfig::in_memory()).unwrap();
    assert!(matches!(
        index.rollback_points(),
        Err(SedimentError::InvalidRequest(_))
    ));
    let dir = TempDir::new().unwrap();
    assert!(rollback_points_at(dir.path()).unwrap().is_empty());
}

#[test]
fn test_unloadable_newer_record_does_not_shadow_new_writes() {
    let dir = TempDir::new().unwrap();
    let config = IndexConfig::new(dir.path()).with_durability(Durability::Sync);
    {
        let index = Index::open(config.clone()).unwrap();
        index.update(doc("a")).unwrap();
        index.close().unwrap();
    }

    // a newer record whose segment file is gone
    {
        let meta = MetaStore::open(&dir.path().join(META_DIR)).unwrap();
        let newest = *meta.epochs().unwrap().last().unwrap();
        let mut broken = meta.get(newest).unwrap().unwrap();
        broken.epoch = 1000;
        broken.segments[0].path = "0000000fffff.seg".to_string();
        meta.put(&broken).unwrap();
    }

    {
        let index = Index::open(config.clone()).unwrap();
        assert_eq!(live_ids(&index.reader()), ids(&["a"]));
        index.update(doc("b")).unwrap();
        assert!(index.epoch() > 1000);
        index.close().unwrap();
    }

    let index = Index::open(config).unwrap();
    assert_eq!(live_ids(&index.reader()), ids(&["a", "b"]));
    assert!(index.epoch() > 1000);
}
