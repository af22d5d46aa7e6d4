//! Statement execution: set operations, ORDER BY, SKIP and TAKE.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::thread;

use musoq_ast::{CompoundOp, SortDirection};
use musoq_error::{MusoqError, Result};
use musoq_planner::{OrderPlan, SetPlan, StatementPlan};
use musoq_types::{Row, Table};
use tracing::debug;

use crate::block::{distinct, exec_block};
use crate::scan::ExecContext;

/// Run a statement into a table named `name`.
pub(crate) fn exec_statement(
    cx: &ExecContext<'_>,
    plan: &StatementPlan,
    name: &str,
) -> Result<Table> {
    let mut rows = exec_set(cx, &plan.body)?;
    if !plan.order_by.is_empty() {
        sort_rows(&mut rows, &plan.order_by);
    }
    let skip = usize::try_from(plan.skip.unwrap_or(0)).unwrap_or(usize::MAX);
    let take = plan
        .take
        .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
    let visible = plan.columns.len();
    let rows: Vec<Row> = rows
        .into_iter()
        .skip(skip)
        .take(take)
        .map(|row| {
            if plan.hidden == 0 {
                row
            } else {
                let mut values = row.into_values();
                values.truncate(visible);
                Row::new(values)
            }
        })
        .collect();
    debug!(target: "musoq.exec", table = name, rows = rows.len(), "statement done");
    Table::with_rows(name, plan.columns.clone(), rows)
}

fn exec_set(cx: &ExecContext<'_>, plan: &SetPlan) -> Result<Vec<Row>> {
    match plan {
        SetPlan::Block(block) => exec_block(cx, block),
        SetPlan::Combine { op, left, right } => {
            let (l, r) = if cx.options.parallelism > 1 {
                thread::scope(|s| {
                    let handle = s.spawn(|| {
                        let r = exec_set(cx, right);
                        if r.is_err() {
                            cx.token.cancel_with_reason("sibling set branch failed");
                        }
                        r
                    });
                    let l = exec_set(cx, left);
                    if l.is_err() {
                        cx.token.cancel_with_reason("sibling set branch failed");
                    }
                    let r = handle
                        .join()
                        .unwrap_or_else(|_| Err(MusoqError::internal("set branch worker panicked")));
                    both(l, r)
                })?
            } else {
                let l = exec_set(cx, left)?;
                (l, exec_set(cx, right)?)
            };
            Ok(combine(*op, l, r))
        }
    }
}

/// Pair two branch results. A real failure wins over the cancellation it
/// caused in the other branch.
fn both(l: Result<Vec<Row>>, r: Result<Vec<Row>>) -> Result<(Vec<Row>, Vec<Row>)> {
    match (l, r) {
        (Ok(l), Ok(r)) => Ok((l, r)),
        (Err(l), Err(r)) if l.is_cancellation() => Err(r),
        (Err(err), _) | (_, Err(err)) => Err(err),
    }
}

/// Combine two branch results. UNION ALL keeps duplicates; the others
/// return distinct rows in left-then-right first-seen order.
pub(crate) fn combine(op: CompoundOp, left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
    match op {
        CompoundOp::UnionAll => {
            let mut out = left;
            out.extend(right);
            out
        }
        CompoundOp::Union => {
            let mut all = left;
            all.extend(right);
            distinct(all)
        }
        CompoundOp::Intersect | CompoundOp::Except => {
            let other: HashSet<Row> = right.into_iter().collect();
            let keep = op == CompoundOp::Intersect;
            distinct(left)
                .into_iter()
                .filter(|row| other.contains(row) == keep)
                .collect()
        }
    }
}

/// Stable sort; descending terms reverse the total value order.
fn sort_rows(rows: &mut [Row], order: &[OrderPlan]) {
    rows.sort_by(|a, b| {
        order
            .iter()
            .map(|term| {
                let ord = match (a.get(term.column), b.get(term.column)) {
                    (Some(x), Some(y)) => x.compare(y),
                    _ => Ordering::Equal,
                };
                match term.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use musoq_types::Value;

    use super::*;

    fn rows(values: &[i32]) -> Vec<Row> {
        values.iter().map(|v| Row::new(vec![Value::Int(*v)])).collect()
    }

    fn ints(rows: &[Row]) -> Vec<i32> {
        rows.iter()
            .map(|r| match r[0] {
                Value::Int(i) => i,
                _ => unreachable!("expected Int"),
            })
            .collect()
    }

    #[test]
    fn set_operators() {
        let l = || rows(&[1, 2, 2, 3]);
        let r = || rows(&[3, 4, 4]);
        assert_eq!(ints(&combine(CompoundOp::UnionAll, l(), r())), vec![1, 2, 2, 3, 3, 4, 4]);
        assert_eq!(ints(&combine(CompoundOp::Union, l(), r())), vec![1, 2, 3, 4]);
        assert_eq!(ints(&combine(CompoundOp::Intersect, l(), r())), vec![3]);
        assert_eq!(ints(&combine(CompoundOp::Except, l(), r())), vec![1, 2]);
    }

    #[test]
    fn sort_is_stable_and_honours_direction() {
        let mut data = vec![
            Row::new(vec![Value::Int(2), Value::from("a")]),
            Row::new(vec![Value::Null, Value::from("b")]),
            Row::new(vec![Value::Int(2), Value::from("c")]),
            Row::new(vec![Value::Int(1), Value::from("d")]),
        ];
        sort_rows(
            &mut data,
            &[OrderPlan {
                column: 0,
                direction: SortDirection::Desc,
            }],
        );
        let tags: Vec<String> = data.iter().map(|r| r[1].to_string()).collect();
        assert_eq!(tags, vec!["a", "c", "d", "b"]);
        sort_rows(
            &mut data,
            &[OrderPlan {
                column: 0,
                direction: SortDirection::Asc,
            }],
        );
        let tags: Vec<String> = data.iter().map(|r| r[1].to_string()).collect();
        assert_eq!(tags, vec!["b", "d", "a", "c"]);
    }
}
