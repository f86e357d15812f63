//! Scalar evaluator (§4.15, SPEC_FULL.md ADD function table).
//!
//! Evaluates a `PipeExpr` against a row (`field name -> string value`).
//! Built-in functions are looked up through a registrable table so callers
//! can add domain-specific scalars without touching this module.

use std::collections::HashMap;

use thiserror::Error;

use crate::query::scalar::{ArithOp, PipeExpr, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("{0} expects {1} argument(s), got {2}")]
    ArityMismatch(String, usize, usize),
    #[error("non-numeric operand in arithmetic expression")]
    NonNumericOperand,
}

pub type ScalarFn = fn(&[Value]) -> Result<Value, EvalError>;

/// Holds the registrable function table (§4.15's "Registrable scalar
/// functions"). Cloning is cheap — it's a handful of function pointers.
#[derive(Clone)]
pub struct FunctionTable {
    functions: HashMap<String, ScalarFn>,
}

impl Default for FunctionTable {
    fn default() -> Self {
        let mut functions: HashMap<String, ScalarFn> = HashMap::new();
        functions.insert("toNumber".to_string(), fn_to_number);
        functions.insert("len".to_string(), fn_len);
        functions.insert("lower".to_string(), fn_lower);
        functions.insert("upper".to_string(), fn_upper);
        functions.insert("coalesce".to_string(), fn_coalesce);
        Self { functions }
    }
}

impl FunctionTable {
    pub fn register(&mut self, name: impl Into<String>, f: ScalarFn) {
        self.functions.insert(name.into(), f);
    }

    fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| EvalError::UnknownFunction(name.to_string()))?;
        f(args)
    }
}

/// `toNumber` coerces a value to numeric, returning `Missing` on parse
/// failure (§4.15).
fn fn_to_number(args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("toNumber", args, 1)?;
    let v = &args[0];
    if v.missing {
        return Ok(Value::missing());
    }
    if v.is_num {
        return Ok(Value::number(v.num));
    }
    match v.str.parse::<f64>() {
        Ok(n) => Ok(Value::number(n)),
        Err(_) => Ok(Value::missing()),
    }
}

fn fn_len(args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("len", args, 1)?;
    let v = &args[0];
    if v.missing {
        return Ok(Value::missing());
    }
    Ok(Value::number(v.str.chars().count() as f64))
}

fn fn_lower(args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("lower", args, 1)?;
    let v = &args[0];
    if v.missing {
        return Ok(Value::missing());
    }
    Ok(Value::string(v.str.to_lowercase()))
}

fn fn_upper(args: &[Value]) -> Result<Value, EvalError> {
    expect_arity("upper", args, 1)?;
    let v = &args[0];
    if v.missing {
        return Ok(Value::missing());
    }
    Ok(Value::string(v.str.to_uppercase()))
}

/// `coalesce(a, b, ...)` returns the first non-missing argument, or
/// `Missing` if every argument is missing.
fn fn_coalesce(args: &[Value]) -> Result<Value, EvalError> {
    if args.is_empty() {
        return Err(EvalError::ArityMismatch("coalesce".to_string(), 1, 0));
    }
    for arg in args {
        if !arg.missing {
            return Ok(arg.clone());
        }
    }
    Ok(Value::missing())
}

fn expect_arity(name: &str, args: &[Value], expected: usize) -> Result<(), EvalError> {
    if args.len() != expected {
        Err(EvalError::ArityMismatch(name.to_string(), expected, args.len()))
    } else {
        Ok(())
    }
}

/// Evaluates `expr` against `row`, using `table` for function calls.
pub fn eval(expr: &PipeExpr, row: &HashMap<String, String>, table: &FunctionTable) -> Result<Value, EvalError> {
    match expr {
        PipeExpr::NumberLit(n) => Ok(Value::number(*n)),
        PipeExpr::StringLit(s) => Ok(Value::string(s.clone())),
        PipeExpr::FieldRef(name) => Ok(match row.get(name) {
            None => Value::missing(),
            Some(raw) => Value::string(raw.clone()),
        }),
        PipeExpr::FuncCall(name, arg_exprs) => {
            let mut args = Vec::with_capacity(arg_exprs.len());
            for a in arg_exprs {
                args.push(eval(a, row, table)?);
            }
            table.call(name, &args)
        }
        PipeExpr::Neg(inner) => {
            let v = eval(inner, row, table)?;
            if v.missing {
                return Ok(Value::missing());
            }
            if !v.is_num {
                return Err(EvalError::NonNumericOperand);
            }
            Ok(Value::number(-v.num))
        }
        PipeExpr::Arith(lhs, op, rhs) => {
            let l = eval(lhs, row, table)?;
            let r = eval(rhs, row, table)?;
            if l.missing || r.missing {
                return Ok(Value::missing());
            }
            if !l.is_num || !r.is_num {
                return Err(EvalError::NonNumericOperand);
            }
            Ok(Value::number(apply_arith(*op, l.num, r.num)))
        }
    }
}

fn apply_arith(op: ArithOp, l: f64, r: f64) -> f64 {
    match op {
        ArithOp::Add => l + r,
        ArithOp::Sub => l - r,
        ArithOp::Mul => l * r,
        // Division and modulo by zero yield NaN rather than a panic or
        // error (§4.15) — Rust's f64 division already does this.
        ArithOp::Div => l / r,
        ArithOp::Mod => l % r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn field_ref_missing_field_is_missing() {
        let table = FunctionTable::default();
        let r = row(&[]);
        let v = eval(&PipeExpr::FieldRef("duration".into()), &r, &table).unwrap();
        assert!(v.missing);
    }

    #[test]
    fn field_ref_numeric_string_is_numeric() {
        let table = FunctionTable::default();
        let r = row(&[("duration", "1500")]);
        let v = eval(&PipeExpr::FieldRef("duration".into()), &r, &table).unwrap();
        assert!(v.is_num);
        assert_eq!(v.num, 1500.0);
    }

    #[test]
    fn to_number_over_division_matches_spec_scenario() {
        let table = FunctionTable::default();
        let r = row(&[("duration", "1500")]);
        let expr = PipeExpr::Arith(
            Box::new(PipeExpr::FuncCall("toNumber".into(), vec![PipeExpr::FieldRef("duration".into())])),
            ArithOp::Div,
            Box::new(PipeExpr::NumberLit(1000.0)),
        );
        let v = eval(&expr, &r, &table).unwrap();
        assert_eq!(v.num, 1.5);
    }

    #[test]
    fn arithmetic_propagates_missing() {
        let table = FunctionTable::default();
        let r = row(&[]);
        let expr = PipeExpr::Arith(
            Box::new(PipeExpr::FieldRef("duration".into())),
            ArithOp::Add,
            Box::new(PipeExpr::NumberLit(1.0)),
        );
        let v = eval(&expr, &r, &table).unwrap();
        assert!(v.missing);
    }

    #[test]
    fn arithmetic_on_non_numeric_string_errors() {
        let table = FunctionTable::default();
        let r = row(&[("host", "alpha")]);
        let expr = PipeExpr::Arith(
            Box::new(PipeExpr::FieldRef("host".into())),
            ArithOp::Add,
            Box::new(PipeExpr::NumberLit(1.0)),
        );
        let err = eval(&expr, &r, &table).unwrap_err();
        assert_eq!(err, EvalError::NonNumericOperand);
    }

    #[test]
    fn division_by_zero_yields_nan() {
        let table = FunctionTable::default();
        let r = row(&[]);
        let expr = PipeExpr::Arith(Box::new(PipeExpr::NumberLit(1.0)), ArithOp::Div, Box::new(PipeExpr::NumberLit(0.0)));
        let v = eval(&expr, &r, &table).unwrap();
        assert!(v.num.is_nan());
    }

    #[test]
    fn to_number_parse_failure_is_missing() {
        let table = FunctionTable::default();
        let r = row(&[("host", "alpha")]);
        let expr = PipeExpr::FuncCall("toNumber".into(), vec![PipeExpr::FieldRef("host".into())]);
        let v = eval(&expr, &r, &table).unwrap();
        assert!(v.missing);
    }

    #[test]
    fn len_counts_characters() {
        let table = FunctionTable::default();
        let r = row(&[("host", "alpha")]);
        let v = eval(&PipeExpr::FuncCall("len".into(), vec![PipeExpr::FieldRef("host".into())]), &r, &table).unwrap();
        assert_eq!(v.num, 5.0);
    }

    #[test]
    fn lower_and_upper() {
        let table = FunctionTable::default();
        let r = row(&[("host", "AlPhA")]);
        let lower = eval(&PipeExpr::FuncCall("lower".into(), vec![PipeExpr::FieldRef("host".into())]), &r, &table).unwrap();
        assert_eq!(lower.str, "alpha");
        let upper = eval(&PipeExpr::FuncCall("upper".into(), vec![PipeExpr::FieldRef("host".into())]), &r, &table).unwrap();
        assert_eq!(upper.str, "ALPHA");
    }

    #[test]
    fn coalesce_returns_first_present() {
        let table = FunctionTable::default();
        let r = row(&[("b", "present")]);
        let expr = PipeExpr::FuncCall(
            "coalesce".into(),
            vec![PipeExpr::FieldRef("a".into()), PipeExpr::FieldRef("b".into())],
        );
        let v = eval(&expr, &r, &table).unwrap();
        assert_eq!(v.str, "present");
    }

    #[test]
    fn coalesce_all_missing_is_missing() {
        let table = FunctionTable::default();
        let r = row(&[]);
        let expr = PipeExpr::FuncCall(
            "coalesce".into(),
            vec![PipeExpr::FieldRef("a".into()), PipeExpr::FieldRef("b".into())],
        );
        let v = eval(&expr, &r, &table).unwrap();
        assert!(v.missing);
    }

    #[test]
    fn unknown_function_errors() {
        let table = FunctionTable::default();
        let r = row(&[]);
        let expr = PipeExpr::FuncCall("nope".into(), vec![]);
        let err = eval(&expr, &r, &table).unwrap_err();
        assert!(matches!(err, EvalError::UnknownFunction(_)));
    }
}
