//! Query types.

use std::fmt::Debug;
use std::sync::Arc;

use bit_vec::BitVec;

use crate::error::Result;
use crate::index::reader::TermSource;
use crate::index::term::Term;

/// A predicate over the documents of one segment.
pub trait Query: Send + Sync + Debug {
    /// One bit per document slot; deleted documents are not masked.
    fn matches(&self, source: &dyn TermSource) -> Result<BitVec>;

    /// Rough heap footprint, used for RAM accounting of buffered deletes.
    fn ram_bytes(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

/// Documents containing a term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermQuery {
    term: Term,
}

impl TermQuery {
    pub fn new(term: Term) -> Self {
        TermQuery { term }
    }

    pub fn term(&self) -> &Term {
        &self.term
    }
}

impl Query for TermQuery {
    fn matches(&self, source: &dyn TermSource) -> Result<BitVec> {
        let mut bits = BitVec::from_elem(source.max_doc() as usize, false);
        if let Some(postings) = source.postings(&self.term) {
            for posting in postings {
                bits.set(posting.doc as usize, true);
            }
        }
        Ok(bits)
    }

    fn ram_bytes(&self) -> usize {
        self.term.ram_bytes()
    }
}

/// Every document.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAllDocsQuery;

impl Query for MatchAllDocsQuery {
    fn matches(&self, source: &dyn TermSource) -> Result<BitVec> {
        Ok(BitVec::from_elem(source.max_doc() as usize, true))
    }
}

/// How a clause takes part in a [`BooleanQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occur {
    Must,
    Should,
    MustNot,
}

/// Conjunction, disjunction and exclusion of sub-queries.
///
/// With at least one `Must` clause the `Should` clauses are optional. A query
/// made only of `MustNot` clauses matches nothing.
#[derive(Debug, Clone, Default)]
pub struct BooleanQuery {
    clauses: Vec<(Occur, Arc<dyn Query>)>,
}

impl BooleanQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, occur: Occur, query: Arc<dyn Query>) -> Self {
        self.clauses.push((occur, query));
        self
    }

    pub fn must(self, query: Arc<dyn Query>) -> Self {
        self.add(Occur::Must, query)
    }

    pub fn should(self, query: Arc<dyn Query>) -> Self {
        self.add(Occur::Should, query)
    }

    pub fn must_not(self, query: Arc<dyn Query>) -> Self {
        self.add(Occur::MustNot, query)
    }

    pub fn clauses(&self) -> &[(Occur, Arc<dyn Query>)] {
        &self.clauses
    }
}

impl Query for BooleanQuery {
    fn matches(&self, source: &dyn TermSource) -> Result<BitVec> {
        let max_doc = source.max_doc() as usize;
        let mut required: Option<BitVec> = None;
        let mut optional: Option<BitVec> = None;
        let mut excluded = BitVec::from_elem(max_doc, false);

        for (occur, query) in &self.clauses {
            let bits = query.matches(source)?;
            match occur {
                Occur::Must => match required.as_mut() {
                    Some(acc) => {
                        acc.and(&bits);
                    }
                    None => required = Some(bits),
                },
                Occur::Should => match optional.as_mut() {
                    Some(acc) => {
                        acc.or(&bits);
                    }
                    None => optional = Some(bits),
                },
                Occur::MustNot => {
                    excluded.or(&bits);
                }
            }
        }

        let mut result = match (required, optional) {
            (Some(required), _) => required,
            (None, Some(optional)) => optional,
            (None, None) => return Ok(BitVec::from_elem(max_doc, false)),
        };
        excluded.negate();
        result.and(&excluded);
        Ok(result)
    }

    fn ram_bytes(&self) -> usize {
        self.clauses.iter().map(|(_, q)| q.ram_bytes()).sum::<usize>() + 16
    }
}
