//! Tree-walking evaluator for [`PlanExpr`].
//!
//! Three-valued logic: comparisons against null yield null, `AND`/`OR`
//! short-circuit and a predicate passes only on `true`. Failures raised by an
//! operator or method are reported as [`MusoqError::RuntimeEvaluation`] with
//! the failing node's text as the expression.

use musoq_ast::{BinaryOp, UnaryOp};
use musoq_error::{MusoqError, Result};
use musoq_planner::PlanExpr;
use musoq_schema::{CallContext, SourceContext};
use musoq_types::{like_match, ArithOp, BitOp, Value};

/// Everything an expression may read while it is evaluated.
#[derive(Clone, Copy, Default)]
pub struct EvalRow<'a> {
    pub values: &'a [Value],
    /// Source context per block source, by source index.
    pub contexts: &'a [Option<SourceContext>],
    pub keys: &'a [Value],
    pub slots: &'a [Value],
    /// 1-based ordinal handed to `RowNumber()`.
    pub row_number: u64,
}

impl<'a> EvalRow<'a> {
    #[must_use]
    pub fn new(values: &'a [Value], contexts: &'a [Option<SourceContext>]) -> Self {
        Self {
            values,
            contexts,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn grouped(keys: &'a [Value], slots: &'a [Value]) -> Self {
        Self {
            keys,
            slots,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_contexts(mut self, contexts: &'a [Option<SourceContext>]) -> Self {
        self.contexts = contexts;
        self
    }

    #[must_use]
    pub const fn with_row_number(mut self, row_number: u64) -> Self {
        self.row_number = row_number;
        self
    }
}

/// Evaluate `expr` over `row`.
pub fn eval(expr: &PlanExpr, row: &EvalRow<'_>) -> Result<Value> {
    match expr {
        PlanExpr::Literal(v) => Ok(v.clone()),
        PlanExpr::Column { offset, label } => row.values.get(*offset).cloned().ok_or_else(|| {
            MusoqError::internal(format!("column {label} at offset {offset} is out of range"))
        }),
        PlanExpr::GroupKey(i) => row
            .keys
            .get(*i)
            .cloned()
            .ok_or_else(|| MusoqError::internal(format!("group key {i} is out of range"))),
        PlanExpr::AggregateSlot(j) => row
            .slots
            .get(*j)
            .cloned()
            .ok_or_else(|| MusoqError::internal(format!("aggregate slot {j} is out of range"))),
        PlanExpr::Binary { left, op, right } => eval_binary(expr, left, *op, right, row),
        PlanExpr::Unary { op, expr: inner } => {
            let v = eval(inner, row)?;
            match op {
                UnaryOp::Not => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(not_boolean(expr, &other)),
                },
                UnaryOp::Negate => v.negate().map_err(|e| locate(e, expr)),
                UnaryOp::BitNot => match v {
                    Value::Null => Ok(Value::Null),
                    Value::Int(i) => Ok(Value::Int(!i)),
                    Value::Long(l) => Ok(Value::Long(!l)),
                    other => Err(MusoqError::runtime(
                        format!("~ expects an integral operand, got {}", other.kind()),
                        expr.to_string(),
                    )),
                },
            }
        }
        PlanExpr::Call {
            method,
            args,
            context_source,
            ..
        } => {
            let values = args
                .iter()
                .map(|a| eval(a, row))
                .collect::<Result<Vec<_>>>()?;
            let cx = CallContext {
                source_context: context_source
                    .and_then(|i| row.contexts.get(i))
                    .and_then(Option::as_ref),
                row_number: row.row_number,
            };
            method.invoke(&cx, &values).map_err(|e| locate(e, expr))
        }
        PlanExpr::Case { whens, else_expr } => {
            for (when, then) in whens {
                if matches!(eval(when, row)?, Value::Bool(true)) {
                    return eval(then, row);
                }
            }
            else_expr
                .as_ref()
                .map_or(Ok(Value::Null), |e| eval(e, row))
        }
        PlanExpr::In {
            expr: needle,
            list,
            not,
        } => {
            let needle = eval(needle, row)?;
            if needle.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for item in list {
                match needle.sql_eq(&eval(item, row)?) {
                    Some(true) => return Ok(Value::Bool(!not)),
                    Some(false) => {}
                    None => saw_null = true,
                }
            }
            Ok(if saw_null {
                Value::Null
            } else {
                Value::Bool(*not)
            })
        }
        PlanExpr::Like {
            expr: text,
            pattern,
            not,
        } => {
            let text = eval(text, row)?;
            let pattern = eval(pattern, row)?;
            match (&text, &pattern) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::String(t), Value::String(p)) => Ok(Value::Bool(like_match(t, p) != *not)),
                _ => Err(MusoqError::runtime(
                    format!(
                        "LIKE expects string operands, got {} and {}",
                        text.kind(),
                        pattern.kind()
                    ),
                    expr.to_string(),
                )),
            }
        }
        PlanExpr::IsNull { expr: inner, not } => {
            Ok(Value::Bool(eval(inner, row)?.is_null() != *not))
        }
        PlanExpr::Convert { expr: inner, kind } => {
            let v = eval(inner, row)?;
            v.convert(*kind).ok_or_else(|| {
                MusoqError::runtime(format!("cannot convert {v} to {kind}"), expr.to_string())
            })
        }
    }
}

/// Predicate test: only `true` passes; null and false reject.
pub fn eval_predicate(expr: &PlanExpr, row: &EvalRow<'_>) -> Result<bool> {
    match eval(expr, row)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => Err(not_boolean(expr, &other)),
    }
}

pub fn eval_all(exprs: &[PlanExpr], row: &EvalRow<'_>) -> Result<Vec<Value>> {
    exprs.iter().map(|e| eval(e, row)).collect()
}

fn eval_binary(
    node: &PlanExpr,
    left: &PlanExpr,
    op: BinaryOp,
    right: &PlanExpr,
    row: &EvalRow<'_>,
) -> Result<Value> {
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        return eval_logical(node, left, op, right, row);
    }
    let a = eval(left, row)?;
    let b = eval(right, row)?;
    let arith = |op: ArithOp| a.arith(op, &b).map_err(|e| locate(e, node));
    let bits = |op: BitOp| a.bitwise(op, &b).map_err(|e| locate(e, node));
    match op {
        BinaryOp::Add => arith(ArithOp::Add),
        BinaryOp::Subtract => arith(ArithOp::Sub),
        BinaryOp::Multiply => arith(ArithOp::Mul),
        BinaryOp::Divide => arith(ArithOp::Div),
        BinaryOp::Modulo => arith(ArithOp::Rem),
        BinaryOp::BitAnd => bits(BitOp::And),
        BinaryOp::BitOr => bits(BitOp::Or),
        BinaryOp::BitXor => bits(BitOp::Xor),
        BinaryOp::ShiftLeft => bits(BitOp::ShiftLeft),
        BinaryOp::ShiftRight => bits(BitOp::ShiftRight),
        BinaryOp::Eq => Ok(a.sql_eq(&b).map_or(Value::Null, Value::Bool)),
        BinaryOp::Ne => Ok(a.sql_eq(&b).map_or(Value::Null, |eq| Value::Bool(!eq))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if a.is_null() || b.is_null() {
                return Ok(Value::Null);
            }
            let ord = a.compare(&b);
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord.is_lt(),
                BinaryOp::Le => ord.is_le(),
                BinaryOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinaryOp::And | BinaryOp::Or => Err(MusoqError::internal(format!(
            "logical operator in strict evaluation: {node}"
        ))),
    }
}

fn eval_logical(
    node: &PlanExpr,
    left: &PlanExpr,
    op: BinaryOp,
    right: &PlanExpr,
    row: &EvalRow<'_>,
) -> Result<Value> {
    // Dominant value: false for AND, true for OR.
    let dominant = op == BinaryOp::Or;
    let a = truth(node, eval(left, row)?)?;
    if a == Some(dominant) {
        return Ok(Value::Bool(dominant));
    }
    let b = truth(node, eval(right, row)?)?;
    Ok(match (a, b) {
        (_, Some(v)) if v == dominant => Value::Bool(dominant),
        (Some(_), Some(_)) => Value::Bool(!dominant),
        _ => Value::Null,
    })
}

fn truth(node: &PlanExpr, v: Value) -> Result<Option<bool>> {
    match v {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(b)),
        other => Err(not_boolean(node, &other)),
    }
}

fn not_boolean(node: &PlanExpr, v: &Value) -> MusoqError {
    MusoqError::runtime(
        format!("expected a boolean, got {}", v.kind()),
        node.to_string(),
    )
}

/// Re-home an operator or method failure onto the node that raised it.
fn locate(err: MusoqError, node: &PlanExpr) -> MusoqError {
    match err {
        MusoqError::RuntimeEvaluation { detail, row, .. } => MusoqError::RuntimeEvaluation {
            detail,
            expression: node.to_string(),
            row,
        },
        MusoqError::Cancelled | MusoqError::SourceFailure { .. } | MusoqError::Internal(_) => err,
        other => MusoqError::runtime(other.to_string(), node.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use musoq_schema::MethodRegistry;
    use musoq_types::{SemanticType, TypeKind};

    use super::*;

    fn lit(v: impl Into<Value>) -> PlanExpr {
        PlanExpr::Literal(v.into())
    }

    fn null() -> PlanExpr {
        PlanExpr::Literal(Value::Null)
    }

    fn col(offset: usize) -> PlanExpr {
        PlanExpr::Column {
            offset,
            label: format!("t.c{offset}"),
        }
    }

    fn bin(left: PlanExpr, op: BinaryOp, right: PlanExpr) -> PlanExpr {
        PlanExpr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    fn call(name: &str, args: Vec<PlanExpr>, arg_types: &[TypeKind]) -> PlanExpr {
        let registry = MethodRegistry::with_base_library();
        let types: Vec<SemanticType> = arg_types.iter().map(|k| SemanticType::non_null(*k)).collect();
        let resolved = registry.resolve_scalar(name, &types).unwrap();
        PlanExpr::Call {
            name: name.to_owned(),
            method: Arc::clone(&resolved.method),
            args,
            context_source: None,
        }
    }

    fn run(expr: &PlanExpr) -> Result<Value> {
        eval(expr, &EvalRow::default())
    }

    #[test]
    fn columns_and_arithmetic() {
        let values = [Value::Int(4), Value::Long(10)];
        let row = EvalRow::new(&values, &[]);
        let e = bin(col(0), BinaryOp::Multiply, col(1));
        assert_eq!(eval(&e, &row).unwrap(), Value::Long(40));
        let e = bin(lit("a"), BinaryOp::Add, lit(1));
        assert_eq!(run(&e).unwrap(), Value::from("a1"));
        let e = bin(null(), BinaryOp::Add, lit(1));
        assert_eq!(run(&e).unwrap(), Value::Null);
    }

    #[test]
    fn three_valued_logic() {
        let t = || lit(true);
        let f = || lit(false);
        assert_eq!(run(&bin(null(), BinaryOp::And, f())).unwrap(), Value::Bool(false));
        assert_eq!(run(&bin(null(), BinaryOp::And, t())).unwrap(), Value::Null);
        assert_eq!(run(&bin(null(), BinaryOp::Or, t())).unwrap(), Value::Bool(true));
        assert_eq!(run(&bin(f(), BinaryOp::Or, null())).unwrap(), Value::Null);
        assert_eq!(run(&bin(t(), BinaryOp::And, t())).unwrap(), Value::Bool(true));
        let not_null = PlanExpr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(null()),
        };
        assert_eq!(run(&not_null).unwrap(), Value::Null);
    }

    #[test]
    fn logical_operators_short_circuit() {
        let boom = bin(lit(1), BinaryOp::Divide, lit(0));
        let guarded = bin(
            lit(false),
            BinaryOp::And,
            bin(boom.clone(), BinaryOp::Eq, lit(1)),
        );
        assert_eq!(run(&guarded).unwrap(), Value::Bool(false));
        let unguarded = bin(lit(true), BinaryOp::And, bin(boom, BinaryOp::Eq, lit(1)));
        assert!(run(&unguarded).is_err());
    }

    #[test]
    fn comparisons_with_null_are_null() {
        assert_eq!(run(&bin(null(), BinaryOp::Eq, null())).unwrap(), Value::Null);
        assert_eq!(run(&bin(lit(1), BinaryOp::Lt, null())).unwrap(), Value::Null);
        assert_eq!(
            run(&bin(lit(1), BinaryOp::Eq, PlanExpr::Literal(Value::Long(1)))).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(run(&bin(lit("b"), BinaryOp::Ge, lit("a"))).unwrap(), Value::Bool(true));
        assert!(!eval_predicate(&bin(null(), BinaryOp::Ne, lit(1)), &EvalRow::default()).unwrap());
    }

    #[test]
    fn in_like_and_is_null() {
        let in_list = |needle: PlanExpr, list: Vec<PlanExpr>, not: bool| PlanExpr::In {
            expr: Box::new(needle),
            list,
            not,
        };
        assert_eq!(run(&in_list(lit(2), vec![lit(1), lit(2)], false)).unwrap(), Value::Bool(true));
        assert_eq!(run(&in_list(lit(3), vec![lit(1), null()], false)).unwrap(), Value::Null);
        assert_eq!(run(&in_list(lit(3), vec![lit(1)], true)).unwrap(), Value::Bool(true));
        assert_eq!(run(&in_list(null(), vec![lit(1)], false)).unwrap(), Value::Null);

        let like = PlanExpr::Like {
            expr: Box::new(lit("Warsaw")),
            pattern: Box::new(lit("W%w")),
            not: false,
        };
        assert_eq!(run(&like).unwrap(), Value::Bool(true));
        let is_not_null = PlanExpr::IsNull {
            expr: Box::new(null()),
            not: true,
        };
        assert_eq!(run(&is_not_null).unwrap(), Value::Bool(false));
    }

    #[test]
    fn case_picks_first_true_branch() {
        let case = PlanExpr::Case {
            whens: vec![(null(), lit(1)), (lit(true), lit(2)), (lit(true), lit(3))],
            else_expr: None,
        };
        assert_eq!(run(&case).unwrap(), Value::Int(2));
        let fallthrough = PlanExpr::Case {
            whens: vec![(lit(false), lit(1))],
            else_expr: None,
        };
        assert_eq!(run(&fallthrough).unwrap(), Value::Null);
    }

    #[test]
    fn division_by_zero_names_the_node() {
        let e = bin(col(0), BinaryOp::Divide, lit(0));
        let values = [Value::Int(5)];
        let err = eval(&e, &EvalRow::new(&values, &[])).unwrap_err();
        let MusoqError::RuntimeEvaluation {
            detail, expression, ..
        } = err
        else {
            unreachable!("expected RuntimeEvaluation");
        };
        assert!(detail.contains("division by zero"));
        assert_eq!(expression, "(#0:t.c0 / 0)");
    }

    #[test]
    fn failed_conversion_is_runtime_error() {
        let e = PlanExpr::Convert {
            expr: Box::new(lit("x")),
            kind: TypeKind::Int,
        };
        assert!(matches!(run(&e), Err(MusoqError::RuntimeEvaluation { .. })));
        let e = PlanExpr::Convert {
            expr: Box::new(lit(3)),
            kind: TypeKind::Long,
        };
        assert_eq!(run(&e).unwrap(), Value::Long(3));
    }

    #[test]
    fn calls_see_row_number() {
        let e = call("RowNumber", Vec::new(), &[]);
        let row = EvalRow::default().with_row_number(7);
        assert_eq!(eval(&e, &row).unwrap(), Value::Long(7));
        let e = call("ToUpper", vec![lit("abc")], &[TypeKind::String]);
        assert_eq!(run(&e).unwrap(), Value::from("ABC"));
    }

    #[test]
    fn grouped_rows_read_keys_and_slots() {
        let keys = [Value::from("a")];
        let slots = [Value::Int(3)];
        let row = EvalRow::grouped(&keys, &slots);
        let e = bin(PlanExpr::AggregateSlot(0), BinaryOp::Add, lit(1));
        assert_eq!(eval(&e, &row).unwrap(), Value::Int(4));
        assert_eq!(eval(&PlanExpr::GroupKey(0), &row).unwrap(), Value::from("a"));
        assert!(matches!(
            eval(&PlanExpr::GroupKey(1), &row),
            Err(MusoqError::Internal(_))
        ));
    }
}
