//! Terms: the unit of the inverted index and of deletes/updates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(field, bytes)` pair.
///
/// Terms order by field name first, then by unsigned byte comparison of the
/// term bytes. The derived ordering gives exactly that because `String` and
/// `Vec<u8>` both compare bytewise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    field: String,
    bytes: Vec<u8>,
}

impl Term {
    pub fn new<F: Into<String>, B: Into<Vec<u8>>>(field: F, bytes: B) -> Self {
        Term {
            field: field.into(),
            bytes: bytes.into(),
        }
    }

    /// Term from UTF-8 text.
    pub fn text<F: Into<String>>(field: F, text: &str) -> Self {
        Term::new(field, text.as_bytes().to_vec())
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Term bytes as text, if valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Rough heap footprint, used for RAM accounting of buffered deletes.
    pub fn ram_bytes(&self) -> usize {
        std::mem::size_of::<Term>() + self.field.len() + self.bytes.len()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "{}:{}", self.field, text),
            None => write!(f, "{}:{:?}", self.field, self.bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_ordering() {
        let mut terms = vec![
            Term::text("b", "a"),
            Term::new("a", vec![0xFF]),
            Term::text("a", "z"),
            Term::text("a", "za"),
        ];
        terms.sort();
        assert_eq!(terms[0], Term::text("a", "z"));
        assert_eq!(terms[1], Term::text("a", "za"));
        // unsigned compare: 0xFF sorts after ASCII
        assert_eq!(terms[2], Term::new("a", vec![0xFF]));
        assert_eq!(terms[3], Term::text("b", "a"));
    }

    #[test]
    fn test_display() {
        assert_eq!(Term::text("id", "1").to_string(), "id:1");
    }
}
