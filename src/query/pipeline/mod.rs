//! Pipeline parsing and scalar evaluation (§4.14, §4.15).

pub mod ast;
pub mod eval;
pub mod parser;

pub use ast::{
    AggFunc, Aggregation, EvalAssignment, FieldsMode, FieldsOp, GroupBy, LookupOp, MapOp, PipeOp, Pipeline,
    RenamePair, SortKey, SortOrder, StatsOp, TimechartOp,
};
pub use eval::{eval, EvalError, FunctionTable, ScalarFn};

use crate::query::errors::ParseError;

pub fn parse(source: &str) -> Result<Pipeline, ParseError> {
    parser::parse(source)
}
