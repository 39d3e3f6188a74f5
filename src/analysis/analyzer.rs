//! Analyzers build per-field token stream pipelines.

use std::fmt::Debug;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};

use crate::analysis::token::TokenStream;
use crate::analysis::token_filter::{ENGLISH_STOP_WORDS, LowercaseFilter, StopFilter};
use crate::analysis::tokenizer::{KeywordTokenizer, StandardTokenizer, WhitespaceTokenizer};
use crate::error::Result;

/// A reusable analysis pipeline for one field.
pub struct TokenStreamComponents {
    stream: Box<dyn TokenStream>,
}

impl TokenStreamComponents {
    pub fn new(stream: Box<dyn TokenStream>) -> Self {
        TokenStreamComponents { stream }
    }

    /// Point the pipeline at new text and reset it for consumption.
    pub fn token_stream(&mut self, text: &str) -> Result<&mut dyn TokenStream> {
        self.stream.set_input(text);
        self.stream.reset()?;
        Ok(self.stream.as_mut())
    }
}

/// Produces token streams for field text.
pub trait Analyzer: Send + Sync + Debug {
    /// Build a fresh pipeline for `field`.
    fn create_components(&self, field: &str) -> TokenStreamComponents;

    /// Positions inserted between two values of the same field in one document.
    fn position_increment_gap(&self, _field: &str) -> u32 {
        0
    }

    /// Offset inserted between two values of the same field in one document.
    fn offset_gap(&self, _field: &str) -> usize {
        1
    }

    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Convenience: analyze `text` and collect the terms.
    fn analyze_to_terms(&self, field: &str, text: &str) -> Result<Vec<String>> {
        let mut components = self.create_components(field);
        let stream = components.token_stream(text)?;
        let mut terms = Vec::new();
        while stream.increment_token()? {
            terms.push(stream.attributes().term.clone());
        }
        stream.end()?;
        Ok(terms)
    }
}

/// Unicode word tokenizer, lowercasing, optional stop words.
#[derive(Debug, Clone, Default)]
pub struct StandardAnalyzer {
    stop_words: Option<Arc<AHashSet<String>>>,
    max_token_length: Option<usize>,
}

impl StandardAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard analysis with the English stop word list.
    pub fn english() -> Self {
        Self::with_stop_words(ENGLISH_STOP_WORDS.iter().copied())
    }

    pub fn with_stop_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StandardAnalyzer {
            stop_words: Some(Arc::new(words.into_iter().map(Into::into).collect())),
            max_token_length: None,
        }
    }

    pub fn max_token_length(mut self, len: usize) -> Self {
        self.max_token_length = Some(len);
        self
    }
}

impl Analyzer for StandardAnalyzer {
    fn create_components(&self, _field: &str) -> TokenStreamComponents {
        let tokenizer = match self.max_token_length {
            Some(len) => StandardTokenizer::with_max_token_length(len),
            None => StandardTokenizer::new(),
        };
        let lower: Box<dyn TokenStream> = Box::new(LowercaseFilter::new(Box::new(tokenizer)));
        let stream: Box<dyn TokenStream> = match &self.stop_words {
            Some(words) => Box::new(StopFilter::new(lower, words.as_ref().clone())),
            None => lower,
        };
        TokenStreamComponents::new(stream)
    }

    fn name(&self) -> &str {
        "standard"
    }
}

/// Whole value as a single token.
#[derive(Debug, Clone, Default)]
pub struct KeywordAnalyzer;

impl Analyzer for KeywordAnalyzer {
    fn create_components(&self, _field: &str) -> TokenStreamComponents {
        TokenStreamComponents::new(Box::new(KeywordTokenizer::new()))
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// Whitespace split, no normalization.
#[derive(Debug, Clone, Default)]
pub struct WhitespaceAnalyzer;

impl Analyzer for WhitespaceAnalyzer {
    fn create_components(&self, _field: &str) -> TokenStreamComponents {
        TokenStreamComponents::new(Box::new(WhitespaceTokenizer::new()))
    }

    fn name(&self) -> &str {
        "whitespace"
    }
}

/// Delegates to a per-field analyzer, falling back to a default.
#[derive(Debug, Clone)]
pub struct PerFieldAnalyzer {
    default: Arc<dyn Analyzer>,
    fields: AHashMap<String, Arc<dyn Analyzer>>,
}

impl PerFieldAnalyzer {
    pub fn new(default: Arc<dyn Analyzer>) -> Self {
        PerFieldAnalyzer {
            default,
            fields: AHashMap::new(),
        }
    }

    pub fn add_analyzer<S: Into<String>>(&mut self, field: S, analyzer: Arc<dyn Analyzer>) {
        self.fields.insert(field.into(), analyzer);
    }

    pub fn with_analyzer<S: Into<String>>(mut self, field: S, analyzer: Arc<dyn Analyzer>) -> Self {
        self.add_analyzer(field, analyzer);
        self
    }

    fn for_field(&self, field: &str) -> &Arc<dyn Analyzer> {
        self.fields.get(field).unwrap_or(&self.default)
    }
}

impl Analyzer for PerFieldAnalyzer {
    fn create_components(&self, field: &str) -> TokenStreamComponents {
        self.for_field(field).create_components(field)
    }

    fn position_increment_gap(&self, field: &str) -> u32 {
        self.for_field(field).position_increment_gap(field)
    }

    fn offset_gap(&self, field: &str) -> usize {
        self.for_field(field).offset_gap(field)
    }

    fn name(&self) -> &str {
        "per_field"
    }
}
