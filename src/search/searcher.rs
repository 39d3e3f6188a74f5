//! Runs queries over every segment of a reader.

use log::trace;

use crate::document::Document;
use crate::error::Result;
use crate::index::reader::ReaderKind;
use crate::search::query::Query;

/// Matches queries against a reader. Results are live doc ids in index
/// order; there is no scoring.
#[derive(Debug, Clone)]
pub struct IndexSearcher {
    reader: ReaderKind,
}

impl IndexSearcher {
    pub fn new<R: Into<ReaderKind>>(reader: R) -> Self {
        IndexSearcher {
            reader: reader.into(),
        }
    }

    pub fn reader(&self) -> &ReaderKind {
        &self.reader
    }

    /// Global ids of the live documents matching `query`, ascending.
    pub fn search(&self, query: &dyn Query) -> Result<Vec<u32>> {
        let mut hits = Vec::new();
        let mut doc_base = 0u32;
        for leaf in self.reader.leaves() {
            let matched = query.matches(leaf.as_ref())?;
            hits.extend(
                matched
                    .iter()
                    .enumerate()
                    .filter(|(doc, hit)| *hit && leaf.is_live(*doc as u32))
                    .map(|(doc, _)| doc_base + doc as u32),
            );
            doc_base += leaf.max_doc();
        }
        trace!("{query:?} matched {} documents", hits.len());
        Ok(hits)
    }

    /// Number of live documents matching `query`.
    pub fn count(&self, query: &dyn Query) -> Result<usize> {
        let mut count = 0;
        for leaf in self.reader.leaves() {
            let matched = query.matches(leaf.as_ref())?;
            count += matched
                .iter()
                .enumerate()
                .filter(|(doc, hit)| *hit && leaf.is_live(*doc as u32))
                .count();
        }
        Ok(count)
    }

    /// Stored fields of global doc id `doc`.
    pub fn doc(&self, doc: u32) -> Result<Document> {
        self.reader.document(doc)
    }

    pub fn max_doc(&self) -> u32 {
        self.reader.leaves().iter().map(|leaf| leaf.max_doc()).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::analysis::StandardAnalyzer;
    use crate::index::config::IndexWriterConfig;
    use crate::index::directory_reader::DirectoryReader;
    use crate::index::index_writer::IndexWriter;
    use crate::index::term::Term;
    use crate::search::query::{BooleanQuery, MatchAllDocsQuery, Occur, TermQuery};
    use crate::storage::Storage;
    use crate::storage::memory::{MemoryStorage, MemoryStorageConfig};

    fn writer() -> IndexWriter {
        let storage: Arc<dyn Storage> =
            Arc::new(MemoryStorage::new(MemoryStorageConfig::default()));
        let mut config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
        config.max_buffered_docs = Some(2);
        IndexWriter::new(storage, config).unwrap()
    }

    fn add(writer: &IndexWriter, id: &str, body: &str) {
        let doc = Document::builder()
            .add_string("id", id)
            .add_text("body", body)
            .build();
        writer.add_document(&doc).unwrap();
    }

    #[test]
    fn test_search_across_segments() {
        let writer = writer();
        add(&writer, "1", "red apple");
        add(&writer, "2", "green apple");
        add(&writer, "3", "red car");
        add(&writer, "4", "blue car");
        writer.delete_documents(&[Term::text("id", "3")]).unwrap();

        let reader = DirectoryReader::open_from_writer(&writer, true).unwrap();
        assert!(reader.leaves().len() >= 2);
        let searcher = IndexSearcher::new(Arc::clone(&reader));

        let red = TermQuery::new(Term::text("body", "red"));
        let hits = searcher.search(&red).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(searcher.doc(hits[0]).unwrap().get_text("id"), Some("1"));

        assert_eq!(searcher.count(&MatchAllDocsQuery).unwrap(), 3);

        let query = BooleanQuery::new()
            .must(Arc::new(TermQuery::new(Term::text("body", "car"))))
            .add(Occur::MustNot, Arc::new(TermQuery::new(Term::text("body", "red"))));
        let hits = searcher.search(&query).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(searcher.doc(hits[0]).unwrap().get_text("id"), Some("4"));
    }

    #[test]
    fn test_hits_are_ascending() {
        let writer = writer();
        for i in 0..7 {
            add(&writer, &i.to_string(), "same words");
        }
        let reader = DirectoryReader::open_from_writer(&writer, true).unwrap();
        let hits = IndexSearcher::new(reader)
            .search(&TermQuery::new(Term::text("body", "same")))
            .unwrap();
        assert_eq!(hits, (0..7).collect::<Vec<u32>>());
    }
}
