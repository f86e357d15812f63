//! Query language core (§2, §4.11–§4.16): dual-mode lexer, boolean filter
//! grammar + DNF normaliser, pipe-structured pipeline parser, and a scalar
//! evaluator. Dependency order (leaves first): `errors`/`scalar`/`lexer` →
//! `directives` → `filter` → `pipeline`.

pub mod directives;
pub mod errors;
pub mod filter;
pub mod lexer;
pub mod pipeline;
pub mod scalar;

pub use errors::{ParseError, ParseErrorKind};
pub use pipeline::Pipeline;

/// Strips directives/comments, then parses a full pipeline, mapping any
/// parse error's offset back through the stripped ranges (§4.16) so it
/// lands on the original query text.
pub fn parse_query(source: &str) -> Result<Pipeline, ParseError> {
    let pre = directives::preprocess(source);
    pipeline::parse(&pre.text).map_err(|e| e.with_offset(pre.map_offset(e.offset)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_is_stripped_before_parsing() {
        let pipeline = parse_query("error limit=50 | head 10").unwrap();
        assert!(pipeline.filter.is_some());
        assert_eq!(pipeline.ops.len(), 1);
    }

    #[test]
    fn error_offset_maps_back_through_stripped_directive() {
        // The unterminated string's opening quote sits after the stripped
        // `limit=50` prefix; the reported offset should land on it in the
        // *original* text, not the stripped one.
        let source = "limit=50 \"abc";
        let err = parse_query(source).unwrap_err();
        assert_eq!(&source[err.offset..err.offset + 1], "\"");
    }
}
