use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External document identifier
pub type DocumentId = String;

/// Kind of value a field holds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// Analyzed text
    Text,
    /// Exact term, not analyzed
    Keyword,
    Numeric,
    DateTime,
    Boolean,
    GeoPoint,
}

impl FieldKind {
    /// Byte recorded with stored values
    pub fn type_byte(&self) -> u8 {
        match self {
            FieldKind::Text => b't',
            FieldKind::Keyword => b'k',
            FieldKind::Numeric => b'n',
            FieldKind::DateTime => b'd',
            FieldKind::Boolean => b'b',
            FieldKind::GeoPoint => b'g',
        }
    }

    pub fn from_type_byte(b: u8) -> Option<Self> {
        match b {
            b't' => Some(FieldKind::Text),
            b'k' => Some(FieldKind::Keyword),
            b'n' => Some(FieldKind::Numeric),
            b'd' => Some(FieldKind::DateTime),
            b'b' => Some(FieldKind::Boolean),
            b'g' => Some(FieldKind::GeoPoint),
            _ => None,
        }
    }
}

/// Per-field indexing options
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOptions {
    pub index: bool,
    pub store: bool,
    /// Record term positions and offsets in postings
    pub include_locations: bool,
    pub doc_values: bool,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            index: true,
            store: true,
            include_locations: true,
            doc_values: true,
        }
    }
}

/// A named value within a document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    pub value: Vec<u8>,
    /// Position within nested arrays, outermost first
    pub array_positions: Vec<u64>,
    pub options: FieldOptions,
}

impl Field {
    fn new(name: &str, kind: FieldKind, value: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            value,
            array_positions: Vec::new(),
            options: FieldOptions::default(),
        }
    }

    pub fn text(name: &str, value: &str) -> Self {
        Self::new(name, FieldKind::Text, value.as_bytes().to_vec())
    }

    pub fn keyword(name: &str, value: &str) -> Self {
        let mut field = Self::new(name, FieldKind::Keyword, value.as_bytes().to_vec());
        field.options.include_locations = false;
        field
    }

    pub fn numeric(name: &str, value: f64) -> Self {
        let mut field = Self::new(name, FieldKind::Numeric, value.to_be_bytes().to_vec());
        field.options.include_locations = false;
        field
    }

    pub fn datetime(name: &str, value: DateTime<Utc>) -> Self {
        let nanos = value.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut field = Self::new(name, FieldKind::DateTime, nanos.to_be_bytes().to_vec());
        field.options.include_locations = false;
        field
    }

    pub fn boolean(name: &str, value: bool) -> Self {
        let mut field = Self::new(name, FieldKind::Boolean, vec![if value { b'T' } else { b'F' }]);
        field.options.include_locations = false;
        field
    }

    pub fn geo_point(name: &str, lon: f64, lat: f64) -> Self {
        let mut value = lon.to_be_bytes().to_vec();
        value.extend_from_slice(&lat.to_be_bytes());
        let mut field = Self::new(name, FieldKind::GeoPoint, value);
        field.options.include_locations = false;
        field
    }

    pub fn with_options(mut self, options: FieldOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_array_positions(mut self, positions: Vec<u64>) -> Self {
        self.array_positions = positions;
        self
    }

    /// Value as UTF-8, for text and keyword fields
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            FieldKind::Text | FieldKind::Keyword => std::str::from_utf8(&self.value).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            FieldKind::Numeric => decode_f64(&self.value),
            _ => None,
        }
    }

    /// Single term for fields that are not tokenized
    ///
    /// Numbers and timestamps are encoded so that byte order matches value
    /// order.
    pub fn exact_term(&self) -> Vec<u8> {
        match self.kind {
            FieldKind::Numeric => decode_f64(&self.value)
                .map(|v| sortable_f64(v).to_be_bytes().to_vec())
                .unwrap_or_default(),
            FieldKind::DateTime => decode_i64(&self.value)
                .map(|v| ((v as u64) ^ (1 << 63)).to_be_bytes().to_vec())
                .unwrap_or_default(),
            _ => self.value.clone(),
        }
    }
}

fn decode_f64(b: &[u8]) -> Option<f64> {
    let arr: [u8; 8] = b.get(..8)?.try_into().ok()?;
    Some(f64::from_be_bytes(arr))
}

fn decode_i64(b: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = b.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

/// Map an f64 onto a u64 with the same ordering
pub fn sortable_f64(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// Document with an external id and its fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub fields: Vec<Field>,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn add_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// First field named `name`
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}
