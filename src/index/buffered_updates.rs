//! Buffered deletes and doc values updates.
//!
//! [`BufferedUpdates`] collects operations that still have to be resolved
//! against documents: every DWPT keeps a private one for its own buffered
//! documents, and the delete queue keeps a global one for flushed segments.
//! Each entry carries a `doc_id_upto` bound: it only affects documents whose
//! id is below the bound. Global entries use [`APPLY_ALL`].
//!
//! When a global buffer is handed off for application it is frozen into an
//! immutable [`FrozenBufferedUpdates`] packet.

use std::collections::BTreeMap;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::{QuireError, Result};
use crate::index::field_info::DocValuesType;
use crate::index::reader::TermSource;
use crate::index::segment_core::{DocValuesColumn, SegmentCore};
use crate::index::term::Term;
use crate::search::query::Query;

/// `doc_id_upto` of operations that affect every document.
pub const APPLY_ALL: u32 = u32::MAX;

const BYTES_PER_DEL_TERM: usize = 48;
const BYTES_PER_DEL_QUERY: usize = 40;
const BYTES_PER_DV_UPDATE: usize = 64;

/// A new value for one doc values field of the documents matching a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocValuesUpdate {
    /// `None` removes the value.
    Numeric { field: String, value: Option<i64> },
    Binary {
        field: String,
        value: Option<Vec<u8>>,
    },
}

impl DocValuesUpdate {
    pub fn numeric<S: Into<String>>(field: S, value: i64) -> Self {
        DocValuesUpdate::Numeric {
            field: field.into(),
            value: Some(value),
        }
    }

    pub fn binary<S: Into<String>>(field: S, value: Vec<u8>) -> Self {
        DocValuesUpdate::Binary {
            field: field.into(),
            value: Some(value),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            DocValuesUpdate::Numeric { field, .. } | DocValuesUpdate::Binary { field, .. } => field,
        }
    }

    pub fn dv_type(&self) -> DocValuesType {
        match self {
            DocValuesUpdate::Numeric { .. } => DocValuesType::Numeric,
            DocValuesUpdate::Binary { .. } => DocValuesType::Binary,
        }
    }

    /// Write this update into `column` for `doc`.
    pub fn apply_to(&self, column: &mut DocValuesColumn, doc: u32) -> Result<()> {
        match self {
            DocValuesUpdate::Numeric { value, .. } => column.set_numeric(doc, *value),
            DocValuesUpdate::Binary { value, .. } => column.set_binary(doc, value.clone()),
        }
    }

    pub fn ram_bytes(&self) -> usize {
        BYTES_PER_DV_UPDATE
            + self.field().len()
            + match self {
                DocValuesUpdate::Binary { value: Some(v), .. } => v.len(),
                _ => 0,
            }
    }
}

/// Mutable buffer of pending deletes and updates.
#[derive(Debug, Default, Clone)]
pub struct BufferedUpdates {
    delete_terms: BTreeMap<Term, u32>,
    delete_queries: Vec<(Arc<dyn Query>, u32)>,
    doc_values_updates: Vec<(Term, DocValuesUpdate, u32)>,
    bytes_used: usize,
}

impl BufferedUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a term delete.
    ///
    /// A later delete of the same term only replaces the bound when it is
    /// higher: concurrent updates of one key may finish out of order.
    pub fn add_term(&mut self, term: Term, doc_id_upto: u32) {
        match self.delete_terms.get_mut(&term) {
            Some(current) => {
                if doc_id_upto > *current {
                    *current = doc_id_upto;
                }
            }
            None => {
                self.bytes_used += BYTES_PER_DEL_TERM + term.ram_bytes();
                self.delete_terms.insert(term, doc_id_upto);
            }
        }
    }

    pub fn add_query(&mut self, query: Arc<dyn Query>, doc_id_upto: u32) {
        self.bytes_used += BYTES_PER_DEL_QUERY + query.ram_bytes();
        self.delete_queries.push((query, doc_id_upto));
    }

    pub fn add_doc_values_update(&mut self, term: Term, update: DocValuesUpdate, doc_id_upto: u32) {
        self.bytes_used += term.ram_bytes() + update.ram_bytes();
        self.doc_values_updates.push((term, update, doc_id_upto));
    }

    pub fn delete_terms(&self) -> &BTreeMap<Term, u32> {
        &self.delete_terms
    }

    pub fn delete_queries(&self) -> &[(Arc<dyn Query>, u32)] {
        &self.delete_queries
    }

    pub fn doc_values_updates(&self) -> &[(Term, DocValuesUpdate, u32)] {
        &self.doc_values_updates
    }

    pub fn num_term_deletes(&self) -> usize {
        self.delete_terms.len()
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    pub fn any(&self) -> bool {
        !self.delete_terms.is_empty()
            || !self.delete_queries.is_empty()
            || !self.doc_values_updates.is_empty()
    }

    pub fn clear(&mut self) {
        self.delete_terms.clear();
        self.delete_queries.clear();
        self.doc_values_updates.clear();
        self.bytes_used = 0;
    }

    /// Freeze the buffer into a packet that applies to whole segments.
    pub fn freeze(&self) -> FrozenBufferedUpdates {
        FrozenBufferedUpdates {
            terms: self.delete_terms.keys().cloned().collect(),
            queries: self.delete_queries.iter().map(|(q, _)| Arc::clone(q)).collect(),
            doc_values_updates: self
                .doc_values_updates
                .iter()
                .map(|(t, u, _)| (t.clone(), u.clone()))
                .collect(),
            bytes_used: self.bytes_used,
        }
    }

    /// Resolve the buffered deletes against an in-memory segment.
    ///
    /// Returns the doc ids to delete, in the segment's own (unsorted) order.
    pub fn resolve_deletes(&self, core: &SegmentCore) -> Result<BitVec> {
        let max_doc = core.max_doc();
        let mut deleted = BitVec::from_elem(max_doc as usize, false);
        for (term, upto) in &self.delete_terms {
            if let Some(postings) = core.postings(term) {
                for posting in postings {
                    if posting.doc < *upto {
                        deleted.set(posting.doc as usize, true);
                    }
                }
            }
        }
        for (query, upto) in &self.delete_queries {
            let bits = query.matches(core)?;
            for doc in 0..max_doc.min(*upto) {
                if bits.get(doc as usize).unwrap_or(false) {
                    deleted.set(doc as usize, true);
                }
            }
        }
        Ok(deleted)
    }

    /// Apply the buffered doc values updates to an in-memory segment.
    ///
    /// Updates run in the order they were issued, so the last one wins.
    pub fn apply_doc_values_updates(&self, core: &mut SegmentCore) -> Result<()> {
        for (term, update, upto) in &self.doc_values_updates {
            let docs: Vec<u32> = match core.postings(term) {
                Some(postings) => postings
                    .iter()
                    .map(|p| p.doc)
                    .filter(|d| d < upto)
                    .collect(),
                None => continue,
            };
            if docs.is_empty() {
                continue;
            }
            let number = core
                .field_infos()
                .by_name(update.field())
                .map(|info| info.number)
                .ok_or_else(|| {
                    QuireError::invalid_argument(format!(
                        "doc values update of unknown field \"{}\"",
                        update.field()
                    ))
                })?;
            let column = core.doc_values_mut(number, update.dv_type())?;
            for doc in docs {
                update.apply_to(column, doc)?;
            }
        }
        Ok(())
    }
}

/// Immutable packet of deletes and updates applied to whole segments.
#[derive(Debug, Clone, Default)]
pub struct FrozenBufferedUpdates {
    pub terms: Vec<Term>,
    pub queries: Vec<Arc<dyn Query>>,
    pub doc_values_updates: Vec<(Term, DocValuesUpdate)>,
    pub bytes_used: usize,
}

impl FrozenBufferedUpdates {
    pub fn any(&self) -> bool {
        !self.terms.is_empty() || !self.queries.is_empty() || !self.doc_values_updates.is_empty()
    }

    pub fn has_doc_values_updates(&self) -> bool {
        !self.doc_values_updates.is_empty()
    }

    /// Docs of `source` matched by the delete terms and queries.
    pub fn matching_deletes(&self, source: &dyn TermSource) -> Result<BitVec> {
        let mut matched = BitVec::from_elem(source.max_doc() as usize, false);
        for term in &self.terms {
            if let Some(postings) = source.postings(term) {
                for posting in postings {
                    matched.set(posting.doc as usize, true);
                }
            }
        }
        for query in &self.queries {
            matched.or(&query.matches(source)?);
        }
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::query::TermQuery;

    #[test]
    fn test_term_bound_only_grows() {
        let mut updates = BufferedUpdates::new();
        updates.add_term(Term::text("id", "1"), 5);
        let bytes = updates.bytes_used();
        updates.add_term(Term::text("id", "1"), 3);
        assert_eq!(updates.delete_terms()[&Term::text("id", "1")], 5);
        updates.add_term(Term::text("id", "1"), 9);
        assert_eq!(updates.delete_terms()[&Term::text("id", "1")], 9);
        assert_eq!(updates.bytes_used(), bytes);
        assert_eq!(updates.num_term_deletes(), 1);
    }

    #[test]
    fn test_freeze_and_clear() {
        let mut updates = BufferedUpdates::new();
        assert!(!updates.any());
        updates.add_term(Term::text("id", "1"), APPLY_ALL);
        updates.add_query(Arc::new(TermQuery::new(Term::text("f", "x"))), APPLY_ALL);
        updates.add_doc_values_update(
            Term::text("id", "2"),
            DocValuesUpdate::numeric("price", 3),
            APPLY_ALL,
        );
        let frozen = updates.freeze();
        assert!(frozen.any());
        assert_eq!(frozen.terms.len(), 1);
        assert_eq!(frozen.queries.len(), 1);
        assert!(frozen.has_doc_values_updates());
        assert!(frozen.bytes_used > 0);

        updates.clear();
        assert!(!updates.any());
        assert_eq!(updates.bytes_used(), 0);
    }
}
