//! Analysis contract consumed by the segment builder
//!
//! Each document is turned into one [`AnalyzedField`] per field: a
//! term-frequency table with token locations, plus the field's analyzed
//! length used to compute norms.

mod analyzer;

pub use analyzer::Analyzer;

use std::collections::BTreeMap;

use crate::models::Document;

/// One occurrence of a token
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenLocation {
    /// Token position within the field, starting at 1
    pub position: u64,
    /// Byte offsets of the token in the original value
    pub start: u64,
    pub end: u64,
    pub array_positions: Vec<u64>,
}

/// Frequency and occurrences of one term within a field
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenFreq {
    pub frequency: u64,
    pub locations: Vec<TokenLocation>,
}

/// Term table for one field value, sorted by term bytes
pub type TokenFrequencies = BTreeMap<Vec<u8>, TokenFreq>;

/// Analysis output for one field value of a document
#[derive(Clone, Debug, Default)]
pub struct AnalyzedField {
    /// Number of tokens the value produced
    pub length: u64,
    pub tokens: TokenFrequencies,
}

/// Analysis output for a whole document; `analyzed` runs parallel to
/// `document.fields`
#[derive(Clone, Debug)]
pub struct AnalysisResult {
    pub document: Document,
    pub analyzed: Vec<AnalyzedField>,
}

impl AnalysisResult {
    /// Fields paired with their analysis
    pub fn fields(&self) -> impl Iterator<Item = (&crate::models::Field, &AnalyzedField)> {
        self.document.fields.iter().zip(self.analyzed.iter())
    }
}
