//! Read-side capabilities.
//!
//! Readers are a flat two-level tree: a [`DirectoryReader`] over one
//! [`SegmentReader`] per segment. Code that only needs postings or stored
//! documents takes the narrow [`TermSource`] or [`DocSource`] capability
//! instead of a concrete reader, and [`ReaderKind`] tags the two shapes.
//!
//! [`DirectoryReader`]: crate::index::directory_reader::DirectoryReader
//! [`SegmentReader`]: crate::index::segment_reader::SegmentReader

use std::sync::Arc;

use crate::document::Document;
use crate::error::Result;
use crate::index::directory_reader::DirectoryReader;
use crate::index::segment_core::Posting;
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;

/// Postings lookup over one segment's documents.
///
/// Liveness is not applied here; callers mask deleted documents themselves.
pub trait TermSource {
    /// Number of document slots, live or deleted.
    fn max_doc(&self) -> u32;

    /// Postings of `term`, in doc id order.
    fn postings(&self, term: &Term) -> Option<&[Posting]>;

    /// Number of documents containing `term`, deleted ones included.
    fn doc_freq(&self, term: &Term) -> u32 {
        self.postings(term).map(|p| p.len() as u32).unwrap_or(0)
    }
}

/// Access to live documents and their stored fields.
pub trait DocSource {
    /// Number of live documents.
    fn num_docs(&self) -> u32;

    fn is_live(&self, doc: u32) -> bool;

    /// Stored fields of `doc`.
    fn document(&self, doc: u32) -> Result<Document>;
}

/// A reader is either one segment or a composite of segments.
#[derive(Debug, Clone)]
pub enum ReaderKind {
    Leaf(Arc<SegmentReader>),
    Composite(Arc<DirectoryReader>),
}

impl ReaderKind {
    /// Leaf readers in doc id order.
    pub fn leaves(&self) -> Vec<Arc<SegmentReader>> {
        match self {
            ReaderKind::Leaf(leaf) => vec![Arc::clone(leaf)],
            ReaderKind::Composite(reader) => reader.leaves().to_vec(),
        }
    }

    pub fn max_doc(&self) -> u32 {
        match self {
            ReaderKind::Leaf(leaf) => leaf.max_doc(),
            ReaderKind::Composite(reader) => reader.max_doc(),
        }
    }

    pub fn num_docs(&self) -> u32 {
        match self {
            ReaderKind::Leaf(leaf) => leaf.num_docs(),
            ReaderKind::Composite(reader) => reader.num_docs(),
        }
    }

    pub fn document(&self, doc: u32) -> Result<Document> {
        match self {
            ReaderKind::Leaf(leaf) => leaf.document(doc),
            ReaderKind::Composite(reader) => reader.document(doc),
        }
    }
}

impl From<Arc<SegmentReader>> for ReaderKind {
    fn from(reader: Arc<SegmentReader>) -> Self {
        ReaderKind::Leaf(reader)
    }
}

impl From<Arc<DirectoryReader>> for ReaderKind {
    fn from(reader: Arc<DirectoryReader>) -> Self {
        ReaderKind::Composite(reader)
    }
}
