//! Pipeline parser (§4.14): `pipeline := filter_expr? ("|" pipe_op)*`.
//!
//! For each `pipe_op` the lexer runs in pipe mode; `where` flips it back to
//! filter mode for its body, then restores pipe mode — the shared lexer
//! carries this mode state across the filter/pipeline boundary rather than
//! handing off between two separate lexer instances.

use std::collections::HashSet;

use crate::query::errors::{ParseError, ParseErrorKind};
use crate::query::filter::parser::parse_expr as parse_filter_expr;
use crate::query::lexer::{Lexer, Mode, Token, TokenKind};
use crate::query::pipeline::ast::{
    Aggregation, AggFunc, EvalAssignment, FieldsMode, FieldsOp, GroupBy, LookupOp, MapOp, Pipeline, PipeOp,
    RenamePair, SortKey, SortOrder, StatsOp, TimechartOp,
};
use crate::query::scalar::{parse_scalar_expr, PipeExpr};

pub fn parse(source: &str) -> Result<Pipeline, ParseError> {
    let mut lexer = Lexer::with_mode(source, Mode::Filter);
    let first = lexer.next_token()?;
    if first.kind == TokenKind::Eof {
        return Err(ParseError::new(0, ParseErrorKind::EmptyQuery));
    }

    let (filter, mut current) = if first.kind == TokenKind::Pipe {
        (None, first)
    } else {
        let (expr, last) = parse_filter_expr(&mut lexer, first)?;
        (Some(expr), last)
    };

    let mut ops = Vec::new();
    loop {
        match current.kind {
            TokenKind::Eof => break,
            TokenKind::Pipe => {
                lexer.set_mode(Mode::Pipe);
                let op_first = lexer.next_token()?;
                let (op, next) = parse_pipe_op(&mut lexer, op_first)?;
                ops.push(op);
                current = next;
            }
            _ => return Err(ParseError::new(current.start, ParseErrorKind::UnexpectedToken)),
        }
    }

    Ok(Pipeline { filter, ops })
}

fn parse_pipe_op(lexer: &mut Lexer<'_>, first: Token) -> Result<(PipeOp, Token), ParseError> {
    if first.kind != TokenKind::Word {
        return Err(ParseError::new(first.start, ParseErrorKind::UnexpectedToken));
    }
    match first.text.to_ascii_lowercase().as_str() {
        "stats" => parse_stats(lexer),
        "where" => parse_where(lexer),
        "eval" => parse_eval(lexer),
        "sort" => parse_sort(lexer),
        "head" => parse_head_tail(lexer, true),
        "tail" => parse_head_tail(lexer, false),
        "slice" => parse_slice(lexer),
        "rename" => parse_rename(lexer),
        "fields" => parse_fields(lexer),
        "timechart" => parse_timechart(lexer),
        "raw" => {
            let next = lexer.next_token()?;
            Ok((PipeOp::Raw, next))
        }
        "lookup" => parse_lookup(lexer),
        "barchart" => {
            let next = lexer.next_token()?;
            Ok((PipeOp::Barchart, next))
        }
        "donut" => {
            let next = lexer.next_token()?;
            Ok((PipeOp::Donut, next))
        }
        "map" => parse_map(lexer),
        _ => Err(ParseError::new(first.start, ParseErrorKind::UnexpectedToken)),
    }
}

fn expect_word(tok: &Token) -> Result<(), ParseError> {
    if tok.kind != TokenKind::Word {
        Err(ParseError::new(tok.start, ParseErrorKind::UnexpectedToken))
    } else {
        Ok(())
    }
}

fn parse_u64(tok: &Token) -> Result<u64, ParseError> {
    if tok.kind != TokenKind::Number {
        return Err(ParseError::new(tok.start, ParseErrorKind::UnexpectedToken));
    }
    tok.text
        .parse::<u64>()
        .map_err(|_| ParseError::new(tok.start, ParseErrorKind::InvalidArgument))
}

fn is_keyword(tok: &Token, word: &str) -> bool {
    tok.kind == TokenKind::Word && tok.text.eq_ignore_ascii_case(word)
}

fn parse_stats(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let mut aggregations = Vec::new();
    let mut seen = HashSet::new();
    let mut current = lexer.next_token()?;
    loop {
        let (agg, next) = parse_aggregation(lexer, current)?;
        if !seen.insert(agg.alias.clone()) {
            return Err(ParseError::new(next.start, ParseErrorKind::DuplicateOutputName));
        }
        aggregations.push(agg);
        current = next;
        if current.kind == TokenKind::Comma {
            current = lexer.next_token()?;
            continue;
        }
        break;
    }

    let mut group_by = Vec::new();
    if is_keyword(&current, "by") {
        current = lexer.next_token()?;
        loop {
            let (g, next) = parse_group(lexer, current)?;
            group_by.push(g);
            current = next;
            if current.kind == TokenKind::Comma {
                current = lexer.next_token()?;
                continue;
            }
            break;
        }
    }

    Ok((PipeOp::Stats(StatsOp { aggregations, group_by }), current))
}

fn parse_aggregation(lexer: &mut Lexer<'_>, first: Token) -> Result<(Aggregation, Token), ParseError> {
    expect_word(&first)?;
    let lower = first.text.to_ascii_lowercase();

    if lower == "count" {
        let next = lexer.next_token()?;
        let (alias, after) = parse_optional_alias(lexer, next, "count".to_string())?;
        return Ok((
            Aggregation {
                func: AggFunc::Count,
                arg: None,
                alias,
            },
            after,
        ));
    }

    let func = match lower.as_str() {
        "sum" => AggFunc::Sum,
        "avg" => AggFunc::Avg,
        "min" => AggFunc::Min,
        "max" => AggFunc::Max,
        _ => return Err(ParseError::new(first.start, ParseErrorKind::UnexpectedToken)),
    };

    let lparen = lexer.next_token()?;
    if lparen.kind != TokenKind::LParen {
        return Err(ParseError::new(lparen.start, ParseErrorKind::UnexpectedToken));
    }
    let arg_first = lexer.next_token()?;
    let (expr, after_expr) = parse_scalar_expr(lexer, arg_first)?;
    if after_expr.kind != TokenKind::RParen {
        return Err(ParseError::new(after_expr.start, ParseErrorKind::UnmatchedParen));
    }
    let next = lexer.next_token()?;
    let default_alias = default_alias_for(func, &expr);
    let (alias, after) = parse_optional_alias(lexer, next, default_alias)?;

    Ok((
        Aggregation {
            func,
            arg: Some(expr),
            alias,
        },
        after,
    ))
}

fn default_alias_for(func: AggFunc, expr: &PipeExpr) -> String {
    match expr {
        PipeExpr::FieldRef(name) => format!("{}_{}", func.name(), name),
        _ => func.name().to_string(),
    }
}

fn parse_optional_alias(
    lexer: &mut Lexer<'_>,
    current: Token,
    default: String,
) -> Result<(String, Token), ParseError> {
    if is_keyword(&current, "as") {
        let alias_tok = lexer.next_token()?;
        expect_word(&alias_tok)?;
        let after = lexer.next_token()?;
        Ok((alias_tok.text, after))
    } else {
        Ok((default, current))
    }
}

fn parse_group(lexer: &mut Lexer<'_>, first: Token) -> Result<(GroupBy, Token), ParseError> {
    expect_word(&first)?;
    if !first.text.eq_ignore_ascii_case("bin") {
        let after = lexer.next_token()?;
        return Ok((GroupBy::Field(first.text), after));
    }

    let lparen = lexer.next_token()?;
    if lparen.kind != TokenKind::LParen {
        return Err(ParseError::new(lparen.start, ParseErrorKind::UnexpectedToken));
    }
    let dur_tok = lexer.next_token()?;
    if !matches!(dur_tok.kind, TokenKind::Word | TokenKind::Str) {
        return Err(ParseError::new(dur_tok.start, ParseErrorKind::UnexpectedToken));
    }
    let duration = dur_tok.text;

    let mut next = lexer.next_token()?;
    let mut field = None;
    if next.kind == TokenKind::Comma {
        let field_tok = lexer.next_token()?;
        expect_word(&field_tok)?;
        field = Some(field_tok.text);
        next = lexer.next_token()?;
    }
    if next.kind != TokenKind::RParen {
        return Err(ParseError::new(next.start, ParseErrorKind::UnmatchedParen));
    }
    let after = lexer.next_token()?;
    Ok((GroupBy::Bin { duration, field }, after))
}

fn parse_where(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    lexer.set_mode(Mode::Filter);
    let first = lexer.next_token()?;
    let (expr, last) = parse_filter_expr(lexer, first)?;
    lexer.set_mode(Mode::Pipe);
    Ok((PipeOp::Where(expr), last))
}

fn parse_eval(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let mut assignments = Vec::new();
    let mut current = lexer.next_token()?;
    loop {
        expect_word(&current)?;
        let field = current.text.clone();
        let eq = lexer.next_token()?;
        if eq.kind != TokenKind::Eq {
            return Err(ParseError::new(eq.start, ParseErrorKind::UnexpectedToken));
        }
        let expr_first = lexer.next_token()?;
        let (expr, next) = parse_scalar_expr(lexer, expr_first)?;
        assignments.push(EvalAssignment { field, expr });
        current = next;
        if current.kind == TokenKind::Comma {
            current = lexer.next_token()?;
            continue;
        }
        break;
    }
    Ok((PipeOp::Eval(assignments), current))
}

fn parse_sort(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let mut keys = Vec::new();
    let mut current = lexer.next_token()?;
    loop {
        let (order, field_tok) = if current.kind == TokenKind::Minus {
            (SortOrder::Descending, lexer.next_token()?)
        } else {
            (SortOrder::Ascending, current.clone())
        };
        expect_word(&field_tok)?;
        keys.push(SortKey {
            field: field_tok.text,
            order,
        });
        current = lexer.next_token()?;
        if current.kind == TokenKind::Comma {
            current = lexer.next_token()?;
            continue;
        }
        break;
    }
    Ok((PipeOp::Sort(keys), current))
}

fn parse_head_tail(lexer: &mut Lexer<'_>, is_head: bool) -> Result<(PipeOp, Token), ParseError> {
    let n_tok = lexer.next_token()?;
    let n = parse_u64(&n_tok)?;
    if n < 1 {
        return Err(ParseError::new(n_tok.start, ParseErrorKind::InvalidArgument));
    }
    let after = lexer.next_token()?;
    Ok((if is_head { PipeOp::Head(n) } else { PipeOp::Tail(n) }, after))
}

fn parse_slice(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let start_tok = lexer.next_token()?;
    let start = parse_u64(&start_tok)?;
    if start < 1 {
        return Err(ParseError::new(start_tok.start, ParseErrorKind::InvalidArgument));
    }
    let end_tok = lexer.next_token()?;
    let end = parse_u64(&end_tok)?;
    if end < start {
        return Err(ParseError::new(end_tok.start, ParseErrorKind::InvalidArgument));
    }
    let after = lexer.next_token()?;
    Ok((PipeOp::Slice { start, end }, after))
}

fn parse_rename(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let mut pairs = Vec::new();
    let mut current = lexer.next_token()?;
    loop {
        expect_word(&current)?;
        let old = current.text.clone();
        let as_tok = lexer.next_token()?;
        if !is_keyword(&as_tok, "as") {
            return Err(ParseError::new(as_tok.start, ParseErrorKind::UnexpectedToken));
        }
        let new_tok = lexer.next_token()?;
        expect_word(&new_tok)?;
        pairs.push(RenamePair {
            old,
            new: new_tok.text,
        });
        current = lexer.next_token()?;
        if current.kind == TokenKind::Comma {
            current = lexer.next_token()?;
            continue;
        }
        break;
    }
    Ok((PipeOp::Rename(pairs), current))
}

fn parse_fields(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let mut current = lexer.next_token()?;
    let mode = if current.kind == TokenKind::Minus {
        current = lexer.next_token()?;
        FieldsMode::Drop
    } else {
        FieldsMode::Keep
    };

    let mut names = Vec::new();
    loop {
        expect_word(&current)?;
        names.push(current.text.clone());
        current = lexer.next_token()?;
        if current.kind == TokenKind::Comma {
            current = lexer.next_token()?;
            continue;
        }
        break;
    }
    Ok((PipeOp::Fields(FieldsOp { mode, names }), current))
}

fn parse_timechart(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let n_tok = lexer.next_token()?;
    let span = parse_u64(&n_tok)?;
    if span < 1 {
        return Err(ParseError::new(n_tok.start, ParseErrorKind::InvalidArgument));
    }
    let mut current = lexer.next_token()?;
    let mut group_by = None;
    if is_keyword(&current, "by") {
        let field_tok = lexer.next_token()?;
        expect_word(&field_tok)?;
        group_by = Some(field_tok.text);
        current = lexer.next_token()?;
    }
    Ok((PipeOp::Timechart(TimechartOp { span, group_by }), current))
}

fn parse_lookup(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let table_tok = lexer.next_token()?;
    expect_word(&table_tok)?;
    let field_tok = lexer.next_token()?;
    expect_word(&field_tok)?;
    let after = lexer.next_token()?;
    Ok((
        PipeOp::Lookup(LookupOp {
            table: table_tok.text,
            field: field_tok.text,
        }),
        after,
    ))
}

fn parse_map(lexer: &mut Lexer<'_>) -> Result<(PipeOp, Token), ParseError> {
    let variant_tok = lexer.next_token()?;
    expect_word(&variant_tok)?;
    match variant_tok.text.to_ascii_lowercase().as_str() {
        "choropleth" => {
            let field_tok = lexer.next_token()?;
            expect_word(&field_tok)?;
            let after = lexer.next_token()?;
            Ok((
                PipeOp::Map(MapOp::Choropleth {
                    country_field: field_tok.text,
                }),
                after,
            ))
        }
        "scatter" => {
            let lat_tok = lexer.next_token()?;
            expect_word(&lat_tok)?;
            let lon_tok = lexer.next_token()?;
            expect_word(&lon_tok)?;
            let after = lexer.next_token()?;
            Ok((
                PipeOp::Map(MapOp::Scatter {
                    lat_field: lat_tok.text,
                    lon_field: lon_tok.text,
                }),
                after,
            ))
        }
        _ => Err(ParseError::new(variant_tok.start, ParseErrorKind::UnexpectedToken)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_pipeline_has_no_filter() {
        let p = parse("| head 5").unwrap();
        assert!(p.filter.is_none());
        assert_eq!(p.ops, vec![PipeOp::Head(5)]);
    }

    #[test]
    fn filter_only_query_has_no_ops() {
        let p = parse("error").unwrap();
        assert!(p.filter.is_some());
        assert!(p.ops.is_empty());
    }

    #[test]
    fn stats_default_aliases() {
        let p = parse("error | stats count, avg(toNumber(duration)) by host").unwrap();
        match &p.ops[0] {
            PipeOp::Stats(s) => {
                assert_eq!(s.aggregations[0].alias, "count");
                assert_eq!(s.aggregations[1].alias, "avg");
                assert_eq!(s.group_by, vec![GroupBy::Field("host".into())]);
            }
            other => panic!("expected Stats, got {other:?}"),
        }
    }

    #[test]
    fn stats_field_ref_gets_func_field_alias() {
        let p = parse("error | stats avg(duration)").unwrap();
        match &p.ops[0] {
            PipeOp::Stats(s) => assert_eq!(s.aggregations[0].alias, "avg_duration"),
            other => panic!("expected Stats, got {other:?}"),
        }
    }

    #[test]
    fn stats_duplicate_alias_errors() {
        let err = parse("error | stats avg(duration), avg(duration)").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::DuplicateOutputName);
    }

    #[test]
    fn where_reuses_filter_grammar_and_restores_pipe_mode() {
        let p = parse("error | where status=500 | head 10").unwrap();
        assert!(matches!(p.ops[0], PipeOp::Where(_)));
        assert_eq!(p.ops[1], PipeOp::Head(10));
    }

    #[test]
    fn eval_assignment() {
        let p = parse("error | eval sec = toNumber(duration)/1000").unwrap();
        match &p.ops[0] {
            PipeOp::Eval(assigns) => assert_eq!(assigns[0].field, "sec"),
            other => panic!("expected Eval, got {other:?}"),
        }
    }

    #[test]
    fn sort_descending_marker() {
        let p = parse("error | sort -duration, host").unwrap();
        match &p.ops[0] {
            PipeOp::Sort(keys) => {
                assert_eq!(keys[0].order, SortOrder::Descending);
                assert_eq!(keys[1].order, SortOrder::Ascending);
            }
            other => panic!("expected Sort, got {other:?}"),
        }
    }

    #[test]
    fn head_rejects_zero() {
        let err = parse("error | head 0").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidArgument);
    }

    #[test]
    fn slice_rejects_end_before_start() {
        let err = parse("error | slice 10 5").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidArgument);
    }

    #[test]
    fn fields_drop_mode() {
        let p = parse("error | fields -secret, token").unwrap();
        match &p.ops[0] {
            PipeOp::Fields(f) => {
                assert_eq!(f.mode, FieldsMode::Drop);
                assert_eq!(f.names, vec!["secret".to_string(), "token".to_string()]);
            }
            other => panic!("expected Fields, got {other:?}"),
        }
    }

    #[test]
    fn rename_pairs() {
        let p = parse("error | rename src as source, dst as destination").unwrap();
        match &p.ops[0] {
            PipeOp::Rename(pairs) => assert_eq!(pairs.len(), 2),
            other => panic!("expected Rename, got {other:?}"),
        }
    }

    #[test]
    fn map_scatter_variant() {
        let p = parse("error | map scatter lat lon").unwrap();
        assert_eq!(
            p.ops[0],
            PipeOp::Map(MapOp::Scatter {
                lat_field: "lat".into(),
                lon_field: "lon".into()
            })
        );
    }

    #[test]
    fn lookup_op() {
        let p = parse("error | lookup geoip ip").unwrap();
        assert_eq!(
            p.ops[0],
            PipeOp::Lookup(LookupOp {
                table: "geoip".into(),
                field: "ip".into()
            })
        );
    }
}
