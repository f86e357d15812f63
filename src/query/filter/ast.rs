//! Filter AST (§3 Data Model, §4.12).

use globset::GlobMatcher;
use regex::Regex;

use crate::query::scalar::{PipeExpr, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    Token,
    Kv,
    KeyExists,
    ValueExists,
    Regex,
    Glob,
    Expr,
}

/// One leaf predicate. Only the fields relevant to `kind` are populated;
/// the rest are `None`, mirroring the spec's single-struct-with-optional-
/// fields data model rather than a per-kind enum, so the DNF normaliser and
/// index planner (out of scope) can treat every leaf uniformly.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub kind: PredicateKind,
    pub key: Option<String>,
    pub value: Option<String>,
    pub op: Option<CompareOp>,
    /// Compiled `(?i)`-prefixed pattern for `PredicateKind::Regex`.
    pub regex: Option<Regex>,
    /// Compiled pattern for a bare `PredicateKind::Glob` predicate.
    pub glob: Option<GlobMatcher>,
    /// kv_pred glob-in-key-slot.
    pub key_pat: Option<GlobMatcher>,
    /// kv_pred glob-in-value-slot.
    pub value_pat: Option<GlobMatcher>,
    pub expr_lhs: Option<PipeExpr>,
    /// Literal comparison value for `Expr` predicates (`toNumber(x) > 5`).
    pub expr_rhs: Option<Value>,
}

impl Predicate {
    pub fn token(text: impl Into<String>) -> Self {
        Self::blank(PredicateKind::Token).with_value(text)
    }

    pub fn glob(pattern: GlobMatcher, text: impl Into<String>) -> Self {
        let mut p = Self::blank(PredicateKind::Glob).with_value(text);
        p.glob = Some(pattern);
        p
    }

    pub fn regex(pattern: Regex, text: impl Into<String>) -> Self {
        let mut p = Self::blank(PredicateKind::Regex).with_value(text);
        p.regex = Some(pattern);
        p
    }

    pub fn key_exists(key: impl Into<String>) -> Self {
        let mut p = Self::blank(PredicateKind::KeyExists);
        p.key = Some(key.into());
        p
    }

    pub fn value_exists(value: impl Into<String>) -> Self {
        let mut p = Self::blank(PredicateKind::ValueExists);
        p.value = Some(value.into());
        p
    }

    pub fn kv(key: impl Into<String>, op: CompareOp, value: impl Into<String>) -> Self {
        let mut p = Self::blank(PredicateKind::Kv);
        p.key = Some(key.into());
        p.op = Some(op);
        p.value = Some(value.into());
        p
    }

    pub fn kv_with_patterns(
        key: impl Into<String>,
        value: impl Into<String>,
        key_pat: Option<GlobMatcher>,
        value_pat: Option<GlobMatcher>,
    ) -> Self {
        let mut p = Self::blank(PredicateKind::Kv);
        p.key = Some(key.into());
        p.op = Some(CompareOp::Eq);
        p.value = Some(value.into());
        p.key_pat = key_pat;
        p.value_pat = value_pat;
        p
    }

    pub fn expr(lhs: PipeExpr, op: CompareOp, rhs: Value) -> Self {
        let mut p = Self::blank(PredicateKind::Expr);
        p.op = Some(op);
        p.expr_lhs = Some(lhs);
        p.expr_rhs = Some(rhs);
        p
    }

    fn blank(kind: PredicateKind) -> Self {
        Self {
            kind,
            key: None,
            value: None,
            op: None,
            regex: None,
            glob: None,
            key_pat: None,
            value_pat: None,
            expr_lhs: None,
            expr_rhs: None,
        }
    }

    fn with_value(mut self, text: impl Into<String>) -> Self {
        self.value = Some(text.into());
        self
    }
}

/// Predicates carry compiled `Regex`/`GlobMatcher`/`PipeExpr` values that
/// aren't meaningfully comparable, so equality (used by tests and the DNF
/// normaliser's branch bookkeeping) compares only the textual/logical shape.
impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.key == other.key
            && self.value == other.value
            && self.op == other.op
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Pred(Predicate),
}
