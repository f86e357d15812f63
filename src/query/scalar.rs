//! Scalar expression AST shared by the filter parser's `expr_pred`
//! production (§4.12) and the pipeline evaluator (§4.15). Lives ahead of
//! both in the dependency order since the filter grammar embeds scalar
//! expressions as predicate left-hand sides.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipeExpr {
    FieldRef(String),
    NumberLit(f64),
    StringLit(String),
    FuncCall(String, Vec<PipeExpr>),
    Arith(Box<PipeExpr>, ArithOp, Box<PipeExpr>),
    Neg(Box<PipeExpr>),
}

/// Result of evaluating a `PipeExpr` against a row. `missing` wins over
/// `is_num`/`str` — callers check `missing` first.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub str: String,
    pub num: f64,
    pub is_num: bool,
    pub missing: bool,
}

impl Value {
    pub fn missing() -> Self {
        Self {
            str: String::new(),
            num: 0.0,
            is_num: false,
            missing: true,
        }
    }

    pub fn number(n: f64) -> Self {
        Self {
            str: format_num(n),
            num: n,
            is_num: true,
            missing: false,
        }
    }

    pub fn string(s: impl Into<String>) -> Self {
        let s = s.into();
        match s.parse::<f64>() {
            Ok(n) => Self {
                str: s,
                num: n,
                is_num: true,
                missing: false,
            },
            Err(_) => Self {
                str: s,
                num: 0.0,
                is_num: false,
                missing: false,
            },
        }
    }
}

fn format_num(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

use crate::query::errors::{ParseError, ParseErrorKind};
use crate::query::lexer::{Lexer, Token, TokenKind};

/// Parses one scalar expression starting at `first` (already lexed by the
/// caller), with standard precedence: unary minus, then `*`/`/`/`%`, then
/// `+`/`-` (§4.14). Returns the parsed expression plus the token immediately
/// following it, so the caller can resume its own lookahead from there —
/// shared by the filter parser's `expr_pred` and the pipeline parser's
/// `eval`/`stats`/`sort` argument lists.
pub fn parse_scalar_expr(lexer: &mut Lexer<'_>, first: Token) -> Result<(PipeExpr, Token), ParseError> {
    parse_additive(lexer, first)
}

fn parse_additive(lexer: &mut Lexer<'_>, first: Token) -> Result<(PipeExpr, Token), ParseError> {
    let (mut left, mut cur) = parse_multiplicative(lexer, first)?;
    loop {
        let op = match cur.kind {
            TokenKind::Plus => ArithOp::Add,
            TokenKind::Minus => ArithOp::Sub,
            _ => break,
        };
        let next = lexer.next_token()?;
        let (right, after) = parse_multiplicative(lexer, next)?;
        left = PipeExpr::Arith(Box::new(left), op, Box::new(right));
        cur = after;
    }
    Ok((left, cur))
}

fn parse_multiplicative(lexer: &mut Lexer<'_>, first: Token) -> Result<(PipeExpr, Token), ParseError> {
    let (mut left, mut cur) = parse_unary(lexer, first)?;
    loop {
        let op = match cur.kind {
            TokenKind::Star => ArithOp::Mul,
            TokenKind::Slash => ArithOp::Div,
            TokenKind::Percent => ArithOp::Mod,
            _ => break,
        };
        let next = lexer.next_token()?;
        let (right, after) = parse_unary(lexer, next)?;
        left = PipeExpr::Arith(Box::new(left), op, Box::new(right));
        cur = after;
    }
    Ok((left, cur))
}

fn parse_unary(lexer: &mut Lexer<'_>, first: Token) -> Result<(PipeExpr, Token), ParseError> {
    if first.kind == TokenKind::Minus {
        let next = lexer.next_token()?;
        let (inner, after) = parse_unary(lexer, next)?;
        return Ok((PipeExpr::Neg(Box::new(inner)), after));
    }
    parse_primary(lexer, first)
}

fn parse_primary(lexer: &mut Lexer<'_>, first: Token) -> Result<(PipeExpr, Token), ParseError> {
    match first.kind {
        TokenKind::Number => {
            let n: f64 = first
                .text
                .parse()
                .map_err(|_| ParseError::new(first.start, ParseErrorKind::UnexpectedToken))?;
            let next = lexer.next_token()?;
            Ok((PipeExpr::NumberLit(n), next))
        }
        TokenKind::Str => {
            let next = lexer.next_token()?;
            Ok((PipeExpr::StringLit(first.text), next))
        }
        TokenKind::LParen => {
            let next = lexer.next_token()?;
            let (inner, after) = parse_additive(lexer, next)?;
            if after.kind != TokenKind::RParen {
                return Err(ParseError::new(after.start, ParseErrorKind::UnmatchedParen));
            }
            let next = lexer.next_token()?;
            Ok((inner, next))
        }
        TokenKind::Word => {
            let name = first.text;
            let next = lexer.next_token()?;
            if next.kind == TokenKind::LParen {
                let mut args = Vec::new();
                let mut cur = lexer.next_token()?;
                if cur.kind != TokenKind::RParen {
                    loop {
                        let (arg, after) = parse_additive(lexer, cur)?;
                        args.push(arg);
                        cur = after;
                        if cur.kind == TokenKind::Comma {
                            cur = lexer.next_token()?;
                            continue;
                        }
                        break;
                    }
                }
                if cur.kind != TokenKind::RParen {
                    return Err(ParseError::new(cur.start, ParseErrorKind::UnexpectedToken));
                }
                let after_call = lexer.next_token()?;
                Ok((PipeExpr::FuncCall(name, args), after_call))
            } else {
                Ok((PipeExpr::FieldRef(name), next))
            }
        }
        TokenKind::Eof => Err(ParseError::new(first.start, ParseErrorKind::UnexpectedEof)),
        _ => Err(ParseError::new(first.start, ParseErrorKind::UnexpectedToken)),
    }
}
