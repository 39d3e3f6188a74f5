//! # Quire
//!
//! A segment-based full-text indexing engine.
//!
//! ## Features
//!
//! - Concurrent indexing through per-thread document writers
//! - Sequence-numbered adds, updates, deletes and doc values updates
//! - Two-phase commits with pluggable deletion policies
//! - Near-real-time readers over uncommitted changes
//! - Tiered and log-doc merge policies, serial or concurrent merging
//! - Soft deletes and index sorting
//! - File and in-memory storage
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use quire::{
//!     Document, IndexWriter, IndexWriterConfig, StandardAnalyzer, StorageConfig,
//!     StorageFactory, Term,
//! };
//! use quire::storage::memory::MemoryStorageConfig;
//!
//! let storage = StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default()))?;
//! let config = IndexWriterConfig::new(Arc::new(StandardAnalyzer::new()));
//! let writer = IndexWriter::new(storage, config)?;
//!
//! let doc = Document::builder()
//!     .add_string("id", "1")
//!     .add_text("body", "hello world")
//!     .build();
//! writer.add_document(&doc)?;
//! writer.update_document(Term::text("id", "1"), &doc)?;
//! writer.commit()?;
//! assert_eq!(writer.num_docs(), 1);
//! writer.close()?;
//! # Ok::<(), quire::QuireError>(())
//! ```

pub mod analysis;
pub mod document;
mod error;
pub mod index;
pub mod search;
pub mod storage;
mod util;

pub use analysis::{Analyzer, KeywordAnalyzer, StandardAnalyzer, WhitespaceAnalyzer};
pub use document::{Document, Field, FieldType, FieldValue};
pub use error::{QuireError, Result};
pub use index::{
    CheckIndex, DirectoryReader, DocValuesType, DocValuesUpdate, IndexCommit, IndexSort,
    IndexWriter, IndexWriterConfig, OpenMode, Term,
};
pub use search::{IndexSearcher, Query};
pub use storage::{Storage, StorageConfig, StorageFactory};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
