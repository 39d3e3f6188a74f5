//! Token attributes and the token stream contract.

use serde::{Deserialize, Serialize};

use crate::error::{QuireError, Result};

/// State of the current token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenAttributes {
    /// Term text.
    pub term: String,
    /// Distance in positions from the previous token.
    pub position_increment: u32,
    /// Byte offset of the first character.
    pub start_offset: usize,
    /// Byte offset one past the last character.
    pub end_offset: usize,
    /// Optional per-position payload.
    pub payload: Option<Vec<u8>>,
}

impl TokenAttributes {
    pub fn clear(&mut self) {
        self.term.clear();
        self.position_increment = 1;
        self.start_offset = 0;
        self.end_offset = 0;
        self.payload = None;
    }
}

/// A lazy, restartable sequence of tokens.
///
/// Consumers call [`set_input`](TokenStream::set_input), then
/// [`reset`](TokenStream::reset), then [`increment_token`](TokenStream::increment_token)
/// until it returns `false`, then [`end`](TokenStream::end). After `end` the
/// attributes hold the final offset and any trailing position increment.
pub trait TokenStream: Send {
    /// Provide new text. Filters forward to their input.
    fn set_input(&mut self, text: &str);

    /// Prepare for consumption.
    fn reset(&mut self) -> Result<()>;

    /// Advance to the next token. Returns false when exhausted.
    fn increment_token(&mut self) -> Result<bool>;

    /// Current token state.
    fn attributes(&self) -> &TokenAttributes;

    /// Mutable token state, used by filters.
    fn attributes_mut(&mut self) -> &mut TokenAttributes;

    /// Finish consumption. Sets the final offset.
    fn end(&mut self) -> Result<()>;
}

/// A single token supplied by the caller instead of an analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreToken {
    pub term: String,
    pub position_increment: u32,
    pub start_offset: usize,
    pub end_offset: usize,
    pub payload: Option<Vec<u8>>,
}

impl PreToken {
    pub fn new<S: Into<String>>(term: S, start_offset: usize, end_offset: usize) -> Self {
        PreToken {
            term: term.into(),
            position_increment: 1,
            start_offset,
            end_offset,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }
}

/// Token stream replaying precomputed tokens.
#[derive(Debug, Clone)]
pub struct PreAnalyzedTokenStream {
    tokens: Vec<PreToken>,
    next: usize,
    attributes: TokenAttributes,
    reset_called: bool,
}

impl PreAnalyzedTokenStream {
    pub fn new(tokens: Vec<PreToken>) -> Self {
        PreAnalyzedTokenStream {
            tokens,
            next: 0,
            attributes: TokenAttributes::default(),
            reset_called: false,
        }
    }
}

impl TokenStream for PreAnalyzedTokenStream {
    fn set_input(&mut self, _text: &str) {}

    fn reset(&mut self) -> Result<()> {
        self.next = 0;
        self.reset_called = true;
        Ok(())
    }

    fn increment_token(&mut self) -> Result<bool> {
        if !self.reset_called {
            return Err(QuireError::analysis("reset() must be called before increment_token()"));
        }
        let Some(token) = self.tokens.get(self.next) else {
            return Ok(false);
        };
        self.next += 1;
        self.attributes.term.clone_from(&token.term);
        self.attributes.position_increment = token.position_increment;
        self.attributes.start_offset = token.start_offset;
        self.attributes.end_offset = token.end_offset;
        self.attributes.payload.clone_from(&token.payload);
        Ok(true)
    }

    fn attributes(&self) -> &TokenAttributes {
        &self.attributes
    }

    fn attributes_mut(&mut self) -> &mut TokenAttributes {
        &mut self.attributes
    }

    fn end(&mut self) -> Result<()> {
        let last = self.tokens.iter().map(|t| t.end_offset).max().unwrap_or(0);
        self.attributes.clear();
        self.attributes.position_increment = 0;
        self.attributes.start_offset = last;
        self.attributes.end_offset = last;
        self.reset_called = false;
        Ok(())
    }
}
