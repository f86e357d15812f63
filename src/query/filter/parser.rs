//! Filter parser (§4.12): recursive-descent over the dual-mode lexer.
//!
//! Precedence highest to lowest: parentheses, `NOT` (right-assoc prefix),
//! `AND` (implicit between adjacent primaries or explicit), `OR`.

use globset::{Glob, GlobMatcher};
use regex::Regex;

use crate::query::errors::{ParseError, ParseErrorKind};
use crate::query::filter::ast::{CompareOp, FilterExpr, Predicate};
use crate::query::lexer::{Lexer, Mode, Snapshot, Token, TokenKind};
use crate::query::scalar::{parse_scalar_expr, Value};

pub fn parse(source: &str) -> Result<FilterExpr, ParseError> {
    let mut lexer = Lexer::with_mode(source, Mode::Filter);
    let first = lexer.next_token()?;
    if first.kind == TokenKind::Eof {
        return Err(ParseError::new(0, ParseErrorKind::EmptyQuery));
    }
    let (expr, last) = parse_expr(&mut lexer, first)?;
    if last.kind != TokenKind::Eof {
        return Err(ParseError::new(last.start, ParseErrorKind::UnexpectedToken));
    }
    Ok(expr)
}

/// Parses one filter expression starting at `first`, stopping at the first
/// token that isn't part of the grammar (typically `Eof` or a top-level
/// pipeline `|`) rather than requiring `Eof` — used by the pipeline parser
/// to parse the optional leading `filter_expr` before its first `pipe_op`.
pub(crate) fn parse_expr(lexer: &mut Lexer<'_>, first: Token) -> Result<(FilterExpr, Token), ParseError> {
    let mut parser = Parser { lexer, current: first };
    let expr = parser.or_expr()?;
    Ok((expr, parser.current))
}

struct Parser<'p, 'a> {
    lexer: &'p mut Lexer<'a>,
    current: Token,
}

impl<'p, 'a> Parser<'p, 'a> {

    fn bump(&mut self) -> Result<Token, ParseError> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn snapshot(&self) -> (Snapshot, Token) {
        (self.lexer.save(), self.current.clone())
    }

    fn restore(&mut self, snap: (Snapshot, Token)) {
        self.lexer.restore(snap.0);
        self.current = snap.1;
    }

    fn starts_primary(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::LParen
                | TokenKind::Word
                | TokenKind::Glob
                | TokenKind::Regex
                | TokenKind::Str
                | TokenKind::Number
                | TokenKind::Not
        )
    }

    fn or_expr(&mut self) -> Result<FilterExpr, ParseError> {
        let mut terms = vec![self.and_expr()?];
        while self.current.kind == TokenKind::Or {
            self.bump()?;
            terms.push(self.and_expr()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            FilterExpr::Or(terms)
        })
    }

    fn and_expr(&mut self) -> Result<FilterExpr, ParseError> {
        let mut terms = vec![self.not_expr()?];
        loop {
            if self.current.kind == TokenKind::And {
                self.bump()?;
                terms.push(self.not_expr()?);
            } else if self.starts_primary() {
                terms.push(self.not_expr()?);
            } else {
                break;
            }
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            FilterExpr::And(terms)
        })
    }

    fn not_expr(&mut self) -> Result<FilterExpr, ParseError> {
        if self.current.kind == TokenKind::Not {
            self.bump()?;
            let inner = self.not_expr()?;
            return Ok(FilterExpr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<FilterExpr, ParseError> {
        if self.current.kind == TokenKind::LParen {
            self.bump()?;
            let inner = self.or_expr()?;
            if self.current.kind != TokenKind::RParen {
                return Err(ParseError::new(self.current.start, ParseErrorKind::UnmatchedParen));
            }
            self.bump()?;
            return Ok(inner);
        }
        Ok(FilterExpr::Pred(self.predicate()?))
    }

    fn predicate(&mut self) -> Result<Predicate, ParseError> {
        if self.current.kind == TokenKind::Word {
            if let Some(pred) = self.try_expr_pred()? {
                return Ok(pred);
            }
        }

        match self.current.kind {
            TokenKind::Regex => {
                let tok = self.bump()?;
                let re = compile_regex(&tok.text, tok.start)?;
                Ok(Predicate::regex(re, tok.text))
            }
            TokenKind::Glob | TokenKind::Word | TokenKind::Str | TokenKind::Number => self.kv_or_bare(),
            TokenKind::Eof => Err(ParseError::new(self.current.start, ParseErrorKind::UnexpectedEof)),
            _ => Err(ParseError::new(self.current.start, ParseErrorKind::UnexpectedToken)),
        }
    }

    /// Tries `WORD "(" args ")" COMPARE literal`; backtracks via a lexer
    /// snapshot on any mismatch so the caller can re-parse the same bytes
    /// as a plain predicate instead (§9 design notes).
    fn try_expr_pred(&mut self) -> Result<Option<Predicate>, ParseError> {
        let snap = self.snapshot();
        match self.attempt_expr_pred() {
            Ok(Some(pred)) => Ok(Some(pred)),
            Ok(None) => {
                self.restore(snap);
                Ok(None)
            }
            Err(_) => {
                self.restore(snap);
                Ok(None)
            }
        }
    }

    fn attempt_expr_pred(&mut self) -> Result<Option<Predicate>, ParseError> {
        if self.current.kind != TokenKind::Word {
            return Ok(None);
        }
        let name = self.current.text.clone();
        self.lexer.set_mode(Mode::Pipe);
        self.bump()?;
        if self.current.kind != TokenKind::LParen {
            return Ok(None);
        }
        self.bump()?;

        let mut args = Vec::new();
        if self.current.kind != TokenKind::RParen {
            loop {
                let first = self.current.clone();
                let (arg, next) = parse_scalar_expr(&mut self.lexer, first)?;
                args.push(arg);
                self.current = next;
                if self.current.kind == TokenKind::Comma {
                    self.bump()?;
                    continue;
                }
                break;
            }
        }
        if self.current.kind != TokenKind::RParen {
            return Ok(None);
        }
        self.bump()?;
        self.lexer.set_mode(Mode::Filter);

        let op = match self.current.kind {
            TokenKind::Eq => CompareOp::Eq,
            TokenKind::NotEq => CompareOp::Ne,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Gte => CompareOp::Ge,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Lte => CompareOp::Le,
            _ => return Ok(None),
        };
        self.bump()?;

        let rhs_tok = self.current.clone();
        let rhs = match rhs_tok.kind {
            TokenKind::Number => Value::number(
                rhs_tok
                    .text
                    .parse()
                    .map_err(|_| ParseError::new(rhs_tok.start, ParseErrorKind::UnexpectedToken))?,
            ),
            TokenKind::Word | TokenKind::Str | TokenKind::Glob => Value::string(rhs_tok.text.clone()),
            _ => return Ok(None),
        };
        self.bump()?;

        Ok(Some(Predicate::expr(
            crate::query::scalar::PipeExpr::FuncCall(name, args),
            op,
            rhs,
        )))
    }

    /// `kv_pred := (WORD|GLOB|"*") COMPARE (WORD|GLOB|"*")`, or — if no
    /// comparison operator follows — a bare `token_pred`/`glob_pred`.
    fn kv_or_bare(&mut self) -> Result<Predicate, ParseError> {
        let lhs = self.bump()?;

        let op = match self.current.kind {
            TokenKind::Eq => Some(CompareOp::Eq),
            TokenKind::NotEq => Some(CompareOp::Ne),
            TokenKind::Gt => Some(CompareOp::Gt),
            TokenKind::Gte => Some(CompareOp::Ge),
            TokenKind::Lt => Some(CompareOp::Lt),
            TokenKind::Lte => Some(CompareOp::Le),
            _ => None,
        };

        let Some(op) = op else {
            // No comparison: bare token_pred or glob_pred.
            return match lhs.kind {
                TokenKind::Glob => {
                    let matcher = compile_glob(&lhs.text, lhs.start)?;
                    Ok(Predicate::glob(matcher, lhs.text))
                }
                _ => Ok(Predicate::token(lhs.text)),
            };
        };

        self.bump()?; // consume comparison operator
        let rhs = self.bump()?;

        let lhs_is_star = lhs.kind == TokenKind::Glob && lhs.text == "*";
        let rhs_is_star = rhs.kind == TokenKind::Glob && rhs.text == "*";
        let lhs_has_glob = lhs.kind == TokenKind::Glob;
        let rhs_has_glob = rhs.kind == TokenKind::Glob;

        if lhs_is_star && rhs_is_star {
            return Err(ParseError::new(lhs.start, ParseErrorKind::InvalidCompare));
        }
        if (lhs_is_star || rhs_is_star || lhs_has_glob || rhs_has_glob) && op != CompareOp::Eq {
            return Err(ParseError::new(lhs.start, ParseErrorKind::InvalidCompare));
        }
        if lhs_is_star {
            return Ok(Predicate::value_exists(rhs.text));
        }
        if rhs_is_star {
            return Ok(Predicate::key_exists(lhs.text));
        }

        let key_pat = if lhs_has_glob {
            Some(compile_glob(&lhs.text, lhs.start)?)
        } else {
            None
        };
        let value_pat = if rhs_has_glob {
            Some(compile_glob(&rhs.text, rhs.start)?)
        } else {
            None
        };

        if key_pat.is_some() || value_pat.is_some() {
            Ok(Predicate::kv_with_patterns(lhs.text, rhs.text, key_pat, value_pat))
        } else {
            Ok(Predicate::kv(lhs.text, op, rhs.text))
        }
    }
}

fn compile_regex(pattern: &str, offset: usize) -> Result<Regex, ParseError> {
    Regex::new(&format!("(?i){pattern}")).map_err(|_| ParseError::new(offset, ParseErrorKind::InvalidRegex))
}

fn compile_glob(pattern: &str, offset: usize) -> Result<GlobMatcher, ParseError> {
    Glob::new(pattern)
        .map(|g| g.compile_matcher())
        .map_err(|_| ParseError::new(offset, ParseErrorKind::InvalidGlob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::ast::PredicateKind;

    fn pred(expr: &FilterExpr) -> &Predicate {
        match expr {
            FilterExpr::Pred(p) => p,
            _ => panic!("expected a predicate, got {expr:?}"),
        }
    }

    #[test]
    fn empty_query_errors() {
        let err = parse("").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::EmptyQuery);
    }

    #[test]
    fn bare_token_predicate() {
        let expr = parse("error").unwrap();
        assert_eq!(pred(&expr).kind, PredicateKind::Token);
        assert_eq!(pred(&expr).value.as_deref(), Some("error"));
    }

    #[test]
    fn implicit_and_between_adjacent_tokens() {
        let expr = parse("error warn").unwrap();
        match expr {
            FilterExpr::And(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn explicit_or() {
        let expr = parse("error OR warn").unwrap();
        match expr {
            FilterExpr::Or(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected Or, got {other:?}"),
        }
    }

    #[test]
    fn not_is_right_associative_prefix() {
        let expr = parse("NOT error").unwrap();
        match expr {
            FilterExpr::Not(inner) => assert_eq!(pred(&inner).kind, PredicateKind::Token),
            other => panic!("expected Not, got {other:?}"),
        }
    }

    #[test]
    fn parens_override_precedence() {
        let expr = parse("(error OR warn) AND NOT debug").unwrap();
        match expr {
            FilterExpr::And(terms) => {
                assert_eq!(terms.len(), 2);
                assert!(matches!(terms[0], FilterExpr::Or(_)));
                assert!(matches!(terms[1], FilterExpr::Not(_)));
            }
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_paren_errors() {
        let err = parse("(error").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::UnmatchedParen);
    }

    #[test]
    fn kv_predicate() {
        let expr = parse("status=500").unwrap();
        let p = pred(&expr);
        assert_eq!(p.kind, PredicateKind::Kv);
        assert_eq!(p.key.as_deref(), Some("status"));
        assert_eq!(p.value.as_deref(), Some("500"));
        assert_eq!(p.op, Some(CompareOp::Eq));
    }

    #[test]
    fn value_exists_via_star_key() {
        let expr = parse("*=foo").unwrap();
        assert_eq!(pred(&expr).kind, PredicateKind::ValueExists);
    }

    #[test]
    fn key_exists_via_star_value() {
        let expr = parse("status=*").unwrap();
        assert_eq!(pred(&expr).kind, PredicateKind::KeyExists);
    }

    #[test]
    fn star_equals_star_is_rejected() {
        let err = parse("*=*").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidCompare);
    }

    #[test]
    fn comparison_other_than_eq_with_glob_is_rejected() {
        let err = parse("sta*>5").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidCompare);
    }

    #[test]
    fn regex_literal_predicate() {
        let expr = parse("/err.*/").unwrap();
        assert_eq!(pred(&expr).kind, PredicateKind::Regex);
    }

    #[test]
    fn bare_glob_predicate() {
        let expr = parse("err*").unwrap();
        assert_eq!(pred(&expr).kind, PredicateKind::Glob);
    }

    #[test]
    fn expr_predicate_backtracks_to_token_pred_without_compare() {
        // "foo(" with no closing comparison falls back cleanly instead of
        // erroring, since `foo(bar)` alone (no compare op) isn't a valid
        // expr_pred.
        let expr = parse("status=200").unwrap();
        assert_eq!(pred(&expr).kind, PredicateKind::Kv);
    }

    #[test]
    fn expr_predicate_with_function_call() {
        let expr = parse("toNumber(duration)>5").unwrap();
        let p = pred(&expr);
        assert_eq!(p.kind, PredicateKind::Expr);
        assert_eq!(p.op, Some(CompareOp::Gt));
    }
}
