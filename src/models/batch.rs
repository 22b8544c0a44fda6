use std::collections::BTreeMap;

use super::document::{Document, DocumentId};

/// A set of document updates, deletions and internal metadata changes
/// applied to the index atomically
#[derive(Clone, Debug, Default)]
pub struct Batch {
    /// `Some` inserts or replaces, `None` deletes; later operations on the
    /// same id replace earlier ones
    ops: BTreeMap<DocumentId, Option<Document>>,
    internal: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a document
    pub fn update(&mut self, doc: Document) {
        self.ops.insert(doc.id.clone(), Some(doc));
    }

    pub fn delete(&mut self, id: impl Into<String>) {
        self.ops.insert(id.into(), None);
    }

    pub fn set_internal(&mut self, key: &[u8], value: &[u8]) {
        self.internal.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn delete_internal(&mut self, key: &[u8]) {
        self.internal.insert(key.to_vec(), None);
    }

    /// Number of document operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.internal.is_empty()
    }

    pub fn reset(&mut self) {
        self.ops.clear();
        self.internal.clear();
    }

    pub fn ops(&self) -> &BTreeMap<DocumentId, Option<Document>> {
        &self.ops
    }

    pub fn internal_ops(&self) -> &BTreeMap<Vec<u8>, Option<Vec<u8>>> {
        &self.internal
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        BTreeMap<DocumentId, Option<Document>>,
        BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    ) {
        (self.ops, self.internal)
    }

    /// Counts of (updates, deletes)
    pub fn op_counts(&self) -> (u64, u64) {
        let updates = self.ops.values().filter(|d| d.is_some()).count() as u64;
        (updates, self.ops.len() as u64 - updates)
    }
}
