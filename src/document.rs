//! Documents: ordered collections of fields.
//!
//! A document is owned by the caller until it is handed to the writer, which
//! extracts what it needs (terms, stored values, doc values) into its own
//! buffers.

pub mod field;

use serde::{Deserialize, Serialize};

use crate::analysis::token::PreToken;

pub use field::{Field, FieldType, FieldValue};

/// An ordered sequence of fields. Field names may repeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First field with the given name.
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All values of the given field name, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a FieldValue> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.name == name)
            .map(|f| &f.value)
    }

    /// First text value of `name`.
    pub fn get_text(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .filter(|f| f.name == name)
            .find_map(|f| f.value.as_text())
    }
}

impl From<Vec<Field>> for Document {
    fn from(fields: Vec<Field>) -> Self {
        Document { fields }
    }
}

/// Builder for [`Document`].
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    fields: Vec<Field>,
}

impl DocumentBuilder {
    pub fn add_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Analyzed, stored text.
    pub fn add_text<S: Into<String>, V: Into<String>>(self, name: S, value: V) -> Self {
        self.add_field(Field::text(name, value, true))
    }

    /// Un-analyzed, stored single term.
    pub fn add_string<S: Into<String>, V: Into<String>>(self, name: S, value: V) -> Self {
        self.add_field(Field::string(name, value, true))
    }

    pub fn add_stored<S: Into<String>, V: Into<FieldValue>>(self, name: S, value: V) -> Self {
        self.add_field(Field::stored(name, value))
    }

    pub fn add_numeric_doc_value<S: Into<String>>(self, name: S, value: i64) -> Self {
        self.add_field(Field::numeric_doc_values(name, value))
    }

    /// Indexed text with caller-supplied tokens.
    pub fn add_pre_analyzed<S: Into<String>, V: Into<String>>(
        self,
        name: S,
        value: V,
        tokens: Vec<PreToken>,
    ) -> Self {
        self.add_field(Field::text(name, value, true).with_tokens(tokens))
    }

    pub fn build(self) -> Document {
        Document {
            fields: self.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let doc = Document::builder()
            .add_string("id", "1")
            .add_text("body", "hello")
            .add_text("body", "again")
            .add_numeric_doc_value("rank", 5)
            .build();

        assert_eq!(doc.len(), 4);
        assert_eq!(doc.get_text("id"), Some("1"));
        assert_eq!(doc.get_all("body").count(), 2);
        assert!(doc.get("missing").is_none());
    }

    #[test]
    fn test_lookup_outlives_field_name() {
        let doc = Document::builder().add_string("id", "42").build();
        let id = {
            let name = String::from("id");
            doc.get_text(&name)
        };
        assert_eq!(id, Some("42"));
    }
}
