//! Persistence of root metadata: a Fjall-backed store of snapshot records.

mod meta_store;

pub use meta_store::{MetaStore, SegmentRecord, SnapshotRecord};
