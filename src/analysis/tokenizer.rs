//! Tokenizers: the source end of a token stream.

use unicode_segmentation::UnicodeSegmentation;

use crate::analysis::token::{TokenAttributes, TokenStream};
use crate::error::{QuireError, Result};

/// Default maximum token length in characters for [`StandardTokenizer`].
pub const DEFAULT_MAX_TOKEN_LENGTH: usize = 255;

/// Shared bookkeeping for tokenizers that split the input into spans up front.
#[derive(Debug, Default)]
struct SpanState {
    text: String,
    spans: Vec<(usize, usize)>,
    next: usize,
    skipped_positions: u32,
    attributes: TokenAttributes,
    ready: bool,
}

impl SpanState {
    fn set_input(&mut self, text: &str) {
        self.text.clear();
        self.text.push_str(text);
        self.ready = false;
    }

    fn reset(&mut self, spans: Vec<(usize, usize)>) {
        self.spans = spans;
        self.next = 0;
        self.skipped_positions = 0;
        self.attributes.clear();
        self.ready = true;
    }

    fn advance(&mut self, max_chars: usize) -> Result<bool> {
        if !self.ready {
            return Err(QuireError::analysis(
                "reset() must be called before increment_token()",
            ));
        }
        while let Some(&(start, end)) = self.spans.get(self.next) {
            self.next += 1;
            let term = &self.text[start..end];
            if term.chars().count() > max_chars {
                self.skipped_positions += 1;
                continue;
            }
            self.attributes.clear();
            self.attributes.term.push_str(term);
            self.attributes.position_increment = 1 + self.skipped_positions;
            self.attributes.start_offset = start;
            self.attributes.end_offset = end;
            self.skipped_positions = 0;
            return Ok(true);
        }
        Ok(false)
    }

    fn end(&mut self) {
        let len = self.text.len();
        let trailing = self.skipped_positions;
        self.attributes.clear();
        self.attributes.position_increment = trailing;
        self.attributes.start_offset = len;
        self.attributes.end_offset = len;
        self.ready = false;
    }
}

/// Splits text on Unicode word boundaries (UAX #29), keeping words that
/// contain at least one alphanumeric character.
#[derive(Debug)]
pub struct StandardTokenizer {
    state: SpanState,
    max_token_length: usize,
}

impl StandardTokenizer {
    pub fn new() -> Self {
        StandardTokenizer {
            state: SpanState::default(),
            max_token_length: DEFAULT_MAX_TOKEN_LENGTH,
        }
    }

    pub fn with_max_token_length(max_token_length: usize) -> Self {
        StandardTokenizer {
            state: SpanState::default(),
            max_token_length,
        }
    }
}

impl Default for StandardTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStream for StandardTokenizer {
    fn set_input(&mut self, text: &str) {
        self.state.set_input(text);
    }

    fn reset(&mut self) -> Result<()> {
        let spans = self
            .state
            .text
            .split_word_bound_indices()
            .filter(|(_, word)| word.chars().any(char::is_alphanumeric))
            .map(|(start, word)| (start, start + word.len()))
            .collect();
        self.state.reset(spans);
        Ok(())
    }

    fn increment_token(&mut self) -> Result<bool> {
        self.state.advance(self.max_token_length)
    }

    fn attributes(&self) -> &TokenAttributes {
        &self.state.attributes
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        &mut self.state.attributes
    }

    fn end(&mut self) -> Result<()> {
        self.state.end();
        Ok(())
    }
}

/// Splits text on whitespace.
#[derive(Debug, Default)]
pub struct WhitespaceTokenizer {
    state: SpanState,
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStream for WhitespaceTokenizer {
    fn set_input(&mut self, text: &str) {
        self.state.set_input(text);
    }

    fn reset(&mut self) -> Result<()> {
        let mut spans = Vec::new();
        let mut start = None;
        for (i, c) in self.state.text.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    spans.push((s, i));
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            spans.push((s, self.state.text.len()));
        }
        self.state.reset(spans);
        Ok(())
    }

    fn increment_token(&mut self) -> Result<bool> {
        self.state.advance(usize::MAX)
    }

    fn attributes(&self) -> &TokenAttributes {
        &self.state.attributes
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        &mut self.state.attributes
    }

    fn end(&mut self) -> Result<()> {
        self.state.end();
        Ok(())
    }
}

/// Emits the entire input as a single token.
#[derive(Debug, Default)]
pub struct KeywordTokenizer {
    state: SpanState,
}

impl KeywordTokenizer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStream for KeywordTokenizer {
    fn set_input(&mut self, text: &str) {
        self.state.set_input(text);
    }

    fn reset(&mut self) -> Result<()> {
        let len = self.state.text.len();
        self.state.reset(vec![(0, len)]);
        Ok(())
    }

    fn increment_token(&mut self) -> Result<bool> {
        self.state.advance(usize::MAX)
    }

    fn attributes(&self) -> &TokenAttributes {
        &self.state.attributes
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        &mut self.state.attributes
    }

    fn end(&mut self) -> Result<()> {
        self.state.end();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(stream: &mut dyn TokenStream, text: &str) -> Vec<(String, u32, usize, usize)> {
        stream.set_input(text);
        stream.reset().unwrap();
        let mut out = Vec::new();
        while stream.increment_token().unwrap() {
            let a = stream.attributes();
            out.push((a.term.clone(), a.position_increment, a.start_offset, a.end_offset));
        }
        stream.end().unwrap();
        out
    }

    #[test]
    fn test_standard_tokenizer() {
        let mut tokenizer = StandardTokenizer::new();
        let tokens = collect(&mut tokenizer, "Hello, world! It's 2024.");
        let terms: Vec<_> = tokens.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(terms, vec!["Hello", "world", "It's", "2024"]);
        assert_eq!(tokens[1].2, 7);
        assert_eq!(tokens[1].3, 12);
        assert_eq!(tokenizer.attributes().end_offset, 24);
    }

    #[test]
    fn test_standard_tokenizer_skips_long_tokens() {
        let mut tokenizer = StandardTokenizer::with_max_token_length(3);
        let tokens = collect(&mut tokenizer, "ab abcdef cd");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].0, "cd");
        assert_eq!(tokens[1].1, 2);
    }

    #[test]
    fn test_whitespace_and_keyword() {
        let mut ws = WhitespaceTokenizer::new();
        let tokens = collect(&mut ws, "  a-b  c ");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].0, "a-b");

        let mut kw = KeywordTokenizer::new();
        let tokens = collect(&mut kw, "New York");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].0, "New York");
    }

    #[test]
    fn test_reusable_after_end() {
        let mut tokenizer = StandardTokenizer::new();
        assert_eq!(collect(&mut tokenizer, "one two").len(), 2);
        assert_eq!(collect(&mut tokenizer, "three").len(), 1);
        assert!(tokenizer.increment_token().is_err());
    }
}
