pub mod batch;
pub mod document;

pub use batch::Batch;
pub use document::{sortable_f64, Document, DocumentId, Field, FieldKind, FieldOptions};
