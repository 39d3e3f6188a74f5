//! Token filters wrapping another token stream.
//!
//! Filtering filters (stop words, length) drop tokens but keep their positions:
//! the increments of dropped tokens are added to the next emitted token.

use ahash::AHashSet;

use crate::analysis::token::{TokenAttributes, TokenStream};
use crate::error::Result;

/// English stop words used by [`crate::analysis::StandardAnalyzer::english`].
pub const ENGLISH_STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is", "it",
    "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these",
    "they", "this", "to", "was", "will", "with",
];

/// Lowercases each term.
pub struct LowercaseFilter {
    input: Box<dyn TokenStream>,
}

impl LowercaseFilter {
    pub fn new(input: Box<dyn TokenStream>) -> Self {
        LowercaseFilter { input }
    }
}

impl TokenStream for LowercaseFilter {
    fn set_input(&mut self, text: &str) {
        self.input.set_input(text);
    }

    fn reset(&mut self) -> Result<()> {
        self.input.reset()
    }

    fn increment_token(&mut self) -> Result<bool> {
        if !self.input.increment_token()? {
            return Ok(false);
        }
        let attributes = self.input.attributes_mut();
        if attributes.term.chars().any(char::is_uppercase) {
            attributes.term = attributes.term.to_lowercase();
        }
        Ok(true)
    }

    fn attributes(&self) -> &TokenAttributes {
        self.input.attributes()
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        self.input.attributes_mut()
    }

    fn end(&mut self) -> Result<()> {
        self.input.end()
    }
}

/// Drops tokens rejected by `accept`, carrying their position increments.
fn filter_next<F>(
    input: &mut Box<dyn TokenStream>,
    skipped: &mut u32,
    mut accept: F,
) -> Result<bool>
where
    F: FnMut(&TokenAttributes) -> bool,
{
    while input.increment_token()? {
        if accept(input.attributes()) {
            let attributes = input.attributes_mut();
            attributes.position_increment += *skipped;
            *skipped = 0;
            return Ok(true);
        }
        *skipped += input.attributes().position_increment;
    }
    Ok(false)
}

/// Removes stop words.
pub struct StopFilter {
    input: Box<dyn TokenStream>,
    stop_words: AHashSet<String>,
    skipped: u32,
}

impl StopFilter {
    pub fn new(input: Box<dyn TokenStream>, stop_words: AHashSet<String>) -> Self {
        StopFilter {
            input,
            stop_words,
            skipped: 0,
        }
    }
}

impl TokenStream for StopFilter {
    fn set_input(&mut self, text: &str) {
        self.input.set_input(text);
    }

    fn reset(&mut self) -> Result<()> {
        self.skipped = 0;
        self.input.reset()
    }

    fn increment_token(&mut self) -> Result<bool> {
        let stop_words = &self.stop_words;
        filter_next(&mut self.input, &mut self.skipped, |a| {
            !stop_words.contains(&a.term)
        })
    }

    fn attributes(&self) -> &TokenAttributes {
        self.input.attributes()
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        self.input.attributes_mut()
    }

    fn end(&mut self) -> Result<()> {
        self.input.end()?;
        self.input.attributes_mut().position_increment += self.skipped;
        self.skipped = 0;
        Ok(())
    }
}

/// Keeps tokens whose character length lies in `min..=max`.
pub struct LengthFilter {
    input: Box<dyn TokenStream>,
    min: usize,
    max: usize,
    skipped: u32,
}

impl LengthFilter {
    pub fn new(input: Box<dyn TokenStream>, min: usize, max: usize) -> Self {
        LengthFilter {
            input,
            min,
            max,
            skipped: 0,
        }
    }
}

impl TokenStream for LengthFilter {
    fn set_input(&mut self, text: &str) {
        self.input.set_input(text);
    }

    fn reset(&mut self) -> Result<()> {
        self.skipped = 0;
        self.input.reset()
    }

    fn increment_token(&mut self) -> Result<bool> {
        let (min, max) = (self.min, self.max);
        filter_next(&mut self.input, &mut self.skipped, |a| {
            let len = a.term.chars().count();
            len >= min && len <= max
        })
    }

    fn attributes(&self) -> &TokenAttributes {
        self.input.attributes()
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        self.input.attributes_mut()
    }

    fn end(&mut self) -> Result<()> {
        self.input.end()?;
        self.input.attributes_mut().position_increment += self.skipped;
        self.skipped = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tokenizer::WhitespaceTokenizer;

    fn run(stream: &mut dyn TokenStream, text: &str) -> Vec<(String, u32)> {
        stream.set_input(text);
        stream.reset().unwrap();
        let mut out = Vec::new();
        while stream.increment_token().unwrap() {
            let a = stream.attributes();
            out.push((a.term.clone(), a.position_increment));
        }
        stream.end().unwrap();
        out
    }

    #[test]
    fn test_lowercase() {
        let mut filter = LowercaseFilter::new(Box::new(WhitespaceTokenizer::new()));
        assert_eq!(
            run(&mut filter, "Hello WORLD"),
            vec![("hello".to_string(), 1), ("world".to_string(), 1)]
        );
    }

    #[test]
    fn test_stop_filter_keeps_positions() {
        let stop: AHashSet<String> = ["the", "of"].iter().map(|s| s.to_string()).collect();
        let mut filter = StopFilter::new(Box::new(WhitespaceTokenizer::new()), stop);
        assert_eq!(
            run(&mut filter, "the king of spain"),
            vec![("king".to_string(), 2), ("spain".to_string(), 2)]
        );
    }

    #[test]
    fn test_trailing_stop_word_in_end() {
        let stop: AHashSet<String> = ["the"].iter().map(|s| s.to_string()).collect();
        let mut filter = StopFilter::new(Box::new(WhitespaceTokenizer::new()), stop);
        run(&mut filter, "see the");
        assert_eq!(filter.attributes().position_increment, 1);
    }

    #[test]
    fn test_length_filter() {
        let mut filter = LengthFilter::new(Box::new(WhitespaceTokenizer::new()), 2, 4);
        assert_eq!(
            run(&mut filter, "a bb ccccc dd"),
            vec![("bb".to_string(), 2), ("dd".to_string(), 2)]
        );
    }
}
