//! Matching without scoring.
//!
//! The writer needs queries to resolve delete-by-query, and tests need a way
//! to look documents up. A [`Query`] produces the set of matching doc ids of
//! one segment; an [`IndexSearcher`] runs it over every segment of a reader
//! and masks deleted documents.

pub mod query;
pub mod searcher;

pub use query::{BooleanQuery, MatchAllDocsQuery, Occur, Query, TermQuery};
pub use searcher::IndexSearcher;
