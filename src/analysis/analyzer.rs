use rust_stemmers::{Algorithm, Stemmer};
use unicode_segmentation::UnicodeSegmentation;

use super::{AnalysisResult, AnalyzedField, TokenFreq, TokenLocation};
use crate::config::AnalyzerConfig;
use crate::models::{Document, Field, FieldKind};

/// Text analyzer with optional lowercasing and stemming
///
/// Text fields are split on Unicode word boundaries; every other field kind
/// indexes its value as one exact term.
pub struct Analyzer {
    config: AnalyzerConfig,
    stemmer: Option<Stemmer>,
}

impl Analyzer {
    /// Create a new analyzer from configuration
    pub fn new(config: &AnalyzerConfig) -> Self {
        let stemmer = if config.stem {
            Some(Stemmer::create(Algorithm::English))
        } else {
            None
        };

        Self {
            config: config.clone(),
            stemmer,
        }
    }

    /// Tokenize text into (token, position, start, end); positions start at 1
    /// and count filtered words too
    pub fn tokenize(&self, text: &str) -> Vec<(String, u64, u64, u64)> {
        let mut results = Vec::new();
        let mut pos = 0u64;

        for (offset, word) in text.unicode_word_indices() {
            pos += 1;
            let mut token = word.to_string();

            if self.config.lowercase {
                token = token.to_lowercase();
            }

            if token.len() < self.config.min_token_length
                || token.len() > self.config.max_token_length
            {
                continue;
            }

            if let Some(stemmer) = &self.stemmer {
                token = stemmer.stem(&token).to_string();
            }

            results.push((token, pos, offset as u64, (offset + word.len()) as u64));
        }

        results
    }

    /// Analyze one field value
    pub fn analyze_field(&self, field: &Field) -> AnalyzedField {
        let mut analyzed = AnalyzedField::default();
        if !field.options.index {
            return analyzed;
        }

        let tokens = match (field.kind, field.as_text()) {
            (FieldKind::Text, Some(text)) => self.tokenize(text),
            _ => {
                let term = field.exact_term();
                let len = term.len() as u64;
                // exact terms are raw bytes and need not be UTF-8
                analyzed.length = 1;
                analyzed.tokens.insert(
                    term,
                    TokenFreq {
                        frequency: 1,
                        locations: vec![TokenLocation {
                            position: 1,
                            start: 0,
                            end: len,
                            array_positions: field.array_positions.clone(),
                        }],
                    },
                );
                return analyzed;
            }
        };

        analyzed.length = tokens.len() as u64;
        for (token, position, start, end) in tokens {
            let entry = analyzed.tokens.entry(token.into_bytes()).or_default();
            entry.frequency += 1;
            entry.locations.push(TokenLocation {
                position,
                start,
                end,
                array_positions: field.array_positions.clone(),
            });
        }
        analyzed
    }

    /// Analyze every field of a document
    pub fn analyze(&self, document: Document) -> AnalysisResult {
        let analyzed = document
            .fields
            .iter()
            .map(|field| self.analyze_field(field))
            .collect();
        AnalysisResult { document, analyzed }
    }
}
