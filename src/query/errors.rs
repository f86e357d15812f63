//! Parse error taxonomy (§7, §4.16): a byte offset plus a sentinel kind, so
//! callers can map failures back onto the original query text for
//! highlighting.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    EmptyQuery,
    UnmatchedParen,
    UnexpectedToken,
    UnexpectedEof,
    UnterminatedString,
    UnterminatedRegex,
    InvalidEscape,
    InvalidRegex,
    InvalidGlob,
    InvalidCompare,
    DuplicateOutputName,
    InvalidArgument,
}

impl std::fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseErrorKind::EmptyQuery => "empty query",
            ParseErrorKind::UnmatchedParen => "unmatched parenthesis",
            ParseErrorKind::UnexpectedToken => "unexpected token",
            ParseErrorKind::UnexpectedEof => "unexpected end of input",
            ParseErrorKind::UnterminatedString => "unterminated string literal",
            ParseErrorKind::UnterminatedRegex => "unterminated regex literal",
            ParseErrorKind::InvalidEscape => "invalid escape sequence",
            ParseErrorKind::InvalidRegex => "invalid regex pattern",
            ParseErrorKind::InvalidGlob => "invalid glob pattern",
            ParseErrorKind::InvalidCompare => "invalid comparison operator usage",
            ParseErrorKind::DuplicateOutputName => "duplicate output field name",
            ParseErrorKind::InvalidArgument => "invalid operator argument",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind} at offset {offset}")]
pub struct ParseError {
    pub offset: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(offset: usize, kind: ParseErrorKind) -> Self {
        Self { offset, kind }
    }

    /// Re-expresses this error with its offset mapped back through
    /// directive/comment stripping (see `directives.rs`).
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}
