//! Formula evaluation over a caller-supplied cell lookup.

use std::fmt;

use super::parser::{Expr, Op};

/// Why a formula could not produce a number.
///
/// This doubles as the payload of an errored cell value, so the reason is
/// written for display to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaError {
    pub reason: String,
}

impl FormulaError {
    pub fn new(reason: impl Into<String>) -> FormulaError {
        FormulaError {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for FormulaError {}

/// Evaluate `expr`, resolving variables through `lookup`.
///
/// `lookup` returns `None` for a cell that is missing or whose value is not
/// a number; either case fails the whole evaluation.
pub fn evaluate(expr: &Expr, lookup: &dyn Fn(&str) -> Option<f64>) -> Result<f64, FormulaError> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(name) => lookup(name)
            .ok_or_else(|| FormulaError::new(format!("{} has no numeric value", name))),
        Expr::BinaryOp { op, left, right } => {
            let l = evaluate(left, lookup)?;
            let r = evaluate(right, lookup)?;
            match op {
                Op::Add => Ok(l + r),
                Op::Sub => Ok(l - r),
                Op::Mul => Ok(l * r),
                Op::Div => {
                    if r == 0.0 {
                        Err(FormulaError::new("division by zero"))
                    } else {
                        Ok(l / r)
                    }
                }
            }
        }
    }
}
