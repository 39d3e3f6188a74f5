//! Field values and field types.

use serde::{Deserialize, Serialize};

use crate::analysis::token::PreToken;
use crate::index::field_info::{DocValuesType, IndexOptions};

/// The value carried by a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Binary(Vec<u8>),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v as i64),
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Raw bytes for binary-like values.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Text(s) => Some(s.as_bytes()),
            FieldValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Representation used when a non-text value is indexed as a single term.
    pub fn to_term_string(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Long(v) => v.to_string(),
            FieldValue::Float(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Long(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Binary(value)
    }
}

/// Indexing options of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldType {
    /// What the inverted index records for this field.
    pub index_options: IndexOptions,

    /// Run the value through the analyzer. Untokenized values become one term.
    pub tokenized: bool,

    /// Keep the original value in stored fields.
    pub stored: bool,

    /// Skip the per-document field length.
    pub omit_norms: bool,

    pub store_term_vectors: bool,

    pub store_payloads: bool,

    /// Columnar value kind, if any.
    pub doc_values_type: DocValuesType,

    pub point_dimension_count: u32,

    pub point_num_bytes: u32,

    pub vector_dimension: u32,
}

impl Default for FieldType {
    fn default() -> Self {
        FieldType {
            index_options: IndexOptions::None,
            tokenized: false,
            stored: false,
            omit_norms: false,
            store_term_vectors: false,
            store_payloads: false,
            doc_values_type: DocValuesType::None,
            point_dimension_count: 0,
            point_num_bytes: 0,
            vector_dimension: 0,
        }
    }
}

impl FieldType {
    /// Analyzed full-text field with positions.
    pub fn text(stored: bool) -> Self {
        FieldType {
            index_options: IndexOptions::DocsAndFreqsAndPositions,
            tokenized: true,
            stored,
            ..Default::default()
        }
    }

    /// Un-analyzed single-term field, e.g. an id.
    pub fn string(stored: bool) -> Self {
        FieldType {
            index_options: IndexOptions::Docs,
            tokenized: false,
            stored,
            omit_norms: true,
            ..Default::default()
        }
    }

    pub fn stored_only() -> Self {
        FieldType {
            stored: true,
            ..Default::default()
        }
    }

    pub fn doc_values(doc_values_type: DocValuesType) -> Self {
        FieldType {
            doc_values_type,
            ..Default::default()
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.index_options != IndexOptions::None
    }
}

/// A named value with indexing options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub value: FieldValue,
    /// Precomputed tokens that bypass the analyzer.
    pub tokens: Option<Vec<PreToken>>,
}

impl Field {
    pub fn new<S: Into<String>>(name: S, value: FieldValue, field_type: FieldType) -> Self {
        Field {
            name: name.into(),
            field_type,
            value,
            tokens: None,
        }
    }

    pub fn text<S: Into<String>, V: Into<String>>(name: S, value: V, stored: bool) -> Self {
        Field::new(name, FieldValue::Text(value.into()), FieldType::text(stored))
    }

    pub fn string<S: Into<String>, V: Into<String>>(name: S, value: V, stored: bool) -> Self {
        Field::new(name, FieldValue::Text(value.into()), FieldType::string(stored))
    }

    pub fn stored<S: Into<String>, V: Into<FieldValue>>(name: S, value: V) -> Self {
        Field::new(name, value.into(), FieldType::stored_only())
    }

    pub fn numeric_doc_values<S: Into<String>>(name: S, value: i64) -> Self {
        Field::new(
            name,
            FieldValue::Long(value),
            FieldType::doc_values(DocValuesType::Numeric),
        )
    }

    pub fn binary_doc_values<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Field::new(
            name,
            FieldValue::Binary(value),
            FieldType::doc_values(DocValuesType::Binary),
        )
    }

    pub fn sorted_doc_values<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Field::new(
            name,
            FieldValue::Binary(value),
            FieldType::doc_values(DocValuesType::Sorted),
        )
    }

    pub fn sorted_set_doc_values<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Field::new(
            name,
            FieldValue::Binary(value),
            FieldType::doc_values(DocValuesType::SortedSet),
        )
    }

    pub fn sorted_numeric_doc_values<S: Into<String>>(name: S, value: i64) -> Self {
        Field::new(
            name,
            FieldValue::Long(value),
            FieldType::doc_values(DocValuesType::SortedNumeric),
        )
    }

    /// Attach precomputed tokens; the field must be indexed and tokenized.
    pub fn with_tokens(mut self, tokens: Vec<PreToken>) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_constructors() {
        let f = Field::text("title", "Hello", true);
        assert!(f.field_type.is_indexed());
        assert!(f.field_type.tokenized);
        assert!(f.field_type.stored);

        let id = Field::string("id", "1", true);
        assert_eq!(id.field_type.index_options, IndexOptions::Docs);
        assert!(!id.field_type.tokenized);

        let dv = Field::numeric_doc_values("price", 10);
        assert!(!dv.field_type.is_indexed());
        assert_eq!(dv.field_type.doc_values_type, DocValuesType::Numeric);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(FieldValue::Int(3).as_long(), Some(3));
        assert_eq!(FieldValue::from("x").as_bytes(), Some(&b"x"[..]));
        assert_eq!(FieldValue::Long(-2).to_term_string(), "-2");
        assert_eq!(FieldValue::Double(1.5).as_long(), None);
    }
}
