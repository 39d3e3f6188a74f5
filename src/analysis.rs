//! Text analysis for indexed fields.
//!
//! The indexing chain consumes analysis as a black box: an [`Analyzer`] hands
//! out reusable [`TokenStreamComponents`] per field, and the writer drives them
//! through the usual cycle:
//!
//! ```text
//! set_input(text) -> reset() -> increment_token()* -> end()
//! ```
//!
//! Token state lives in a fixed [`TokenAttributes`] struct (term, position
//! increment, offsets, payload).
//!
//! # Examples
//!
//! ```
//! use quire::analysis::{Analyzer, StandardAnalyzer};
//!
//! let analyzer = StandardAnalyzer::new();
//! let terms = analyzer.analyze_to_terms("body", "Hello World!").unwrap();
//! assert_eq!(terms, vec!["hello", "world"]);
//! ```

pub mod analyzer;
pub mod token;
pub mod token_filter;
pub mod tokenizer;

pub use analyzer::{
    Analyzer, KeywordAnalyzer, PerFieldAnalyzer, StandardAnalyzer, TokenStreamComponents,
    WhitespaceAnalyzer,
};
pub use token::{PreAnalyzedTokenStream, TokenAttributes, TokenStream};
pub use token_filter::{LengthFilter, LowercaseFilter, StopFilter};
pub use tokenizer::{KeywordTokenizer, StandardTokenizer, WhitespaceTokenizer};
