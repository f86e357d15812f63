//! DNF normalisation (§4.13): pushes `NOT` to the leaves via De Morgan's and
//! double-negation elimination, then distributes AND over OR into a flat set
//! of conjunctive branches so the (out-of-scope) index planner can evaluate
//! each branch independently.

use crate::query::errors::{ParseError, ParseErrorKind};
use crate::query::filter::ast::{FilterExpr, Predicate};

/// A single conjunctive branch: all of `positive` must match, none of
/// `negative` may.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conjunction {
    pub positive: Vec<Predicate>,
    pub negative: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dnf {
    pub branches: Vec<Conjunction>,
}

/// Branch-count cap from the design notes (§9) — pathological inputs like
/// deeply nested ORs-of-ANDs-of-ORs would otherwise blow up combinatorially.
const MAX_BRANCHES: usize = 1024;

pub fn to_dnf(expr: &FilterExpr) -> Result<Dnf, ParseError> {
    let nnf = push_not(expr, false);
    let branches = distribute(&nnf)?;
    if branches.len() > MAX_BRANCHES {
        return Err(ParseError::new(0, ParseErrorKind::InvalidCompare));
    }
    Ok(Dnf { branches })
}

/// Negation-normal-form intermediate: `NOT` only ever wraps a leaf.
enum Nnf {
    And(Vec<Nnf>),
    Or(Vec<Nnf>),
    Leaf(Predicate, bool), // (predicate, negated)
}

fn push_not(expr: &FilterExpr, negate: bool) -> Nnf {
    match expr {
        FilterExpr::Pred(p) => Nnf::Leaf(p.clone(), negate),
        FilterExpr::Not(inner) => push_not(inner, !negate),
        FilterExpr::And(terms) => {
            let pushed = terms.iter().map(|t| push_not(t, negate)).collect();
            if negate {
                Nnf::Or(pushed)
            } else {
                Nnf::And(pushed)
            }
        }
        FilterExpr::Or(terms) => {
            let pushed = terms.iter().map(|t| push_not(t, negate)).collect();
            if negate {
                Nnf::And(pushed)
            } else {
                Nnf::Or(pushed)
            }
        }
    }
}

/// Cross-product distribution of AND over OR, producing a flat `Vec<Conjunction>`.
fn distribute(nnf: &Nnf) -> Result<Vec<Conjunction>, ParseError> {
    match nnf {
        Nnf::Leaf(pred, negated) => {
            let mut c = Conjunction::default();
            if *negated {
                c.negative.push(pred.clone());
            } else {
                c.positive.push(pred.clone());
            }
            Ok(vec![c])
        }
        Nnf::Or(terms) => {
            let mut out = Vec::new();
            for term in terms {
                out.extend(distribute(term)?);
                if out.len() > MAX_BRANCHES {
                    return Err(ParseError::new(0, ParseErrorKind::InvalidCompare));
                }
            }
            Ok(out)
        }
        Nnf::And(terms) => {
            let mut acc = vec![Conjunction::default()];
            for term in terms {
                let term_branches = distribute(term)?;
                let mut next = Vec::with_capacity(acc.len() * term_branches.len());
                for left in &acc {
                    for right in &term_branches {
                        let mut merged = left.clone();
                        merged.positive.extend(right.positive.iter().cloned());
                        merged.negative.extend(right.negative.iter().cloned());
                        next.push(merged);
                    }
                }
                if next.len() > MAX_BRANCHES {
                    return Err(ParseError::new(0, ParseErrorKind::InvalidCompare));
                }
                acc = next;
            }
            Ok(acc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::parser::parse;

    #[test]
    fn single_predicate_is_one_branch() {
        let expr = parse("error").unwrap();
        let dnf = to_dnf(&expr).unwrap();
        assert_eq!(dnf.branches.len(), 1);
        assert_eq!(dnf.branches[0].positive.len(), 1);
        assert!(dnf.branches[0].negative.is_empty());
    }

    #[test]
    fn or_produces_one_branch_per_term() {
        let expr = parse("error OR warn OR info").unwrap();
        let dnf = to_dnf(&expr).unwrap();
        assert_eq!(dnf.branches.len(), 3);
    }

    #[test]
    fn and_of_or_splits_into_two_branches_each_with_the_and_term() {
        // "(error OR warn) AND NOT debug" -> two branches, each with one
        // positive (error/warn) and one negative (debug).
        let expr = parse("(error OR warn) AND NOT debug").unwrap();
        let dnf = to_dnf(&expr).unwrap();
        assert_eq!(dnf.branches.len(), 2);
        for branch in &dnf.branches {
            assert_eq!(branch.positive.len(), 1);
            assert_eq!(branch.negative.len(), 1);
        }
    }

    #[test]
    fn double_negation_cancels() {
        let expr = parse("NOT NOT error").unwrap();
        let dnf = to_dnf(&expr).unwrap();
        assert_eq!(dnf.branches.len(), 1);
        assert_eq!(dnf.branches[0].positive.len(), 1);
        assert!(dnf.branches[0].negative.is_empty());
    }

    #[test]
    fn not_of_or_demorgans_into_and_of_negatives() {
        let expr = parse("NOT (error OR warn)").unwrap();
        let dnf = to_dnf(&expr).unwrap();
        assert_eq!(dnf.branches.len(), 1);
        assert!(dnf.branches[0].positive.is_empty());
        assert_eq!(dnf.branches[0].negative.len(), 2);
    }
}
