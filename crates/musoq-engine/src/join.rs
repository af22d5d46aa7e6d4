//! Join operators.
//!
//! All strategies produce the same multiset of rows for a given plan; only
//! the emission order differs. Null join keys never match. Unmatched rows of
//! the preserved side of an outer join are padded with nulls; unmatched
//! right rows of a RIGHT join are emitted after the matched rows.

use std::cmp::Ordering;
use std::collections::HashMap;

use musoq_ast::JoinKind;
use musoq_error::Result;
use musoq_planner::{JoinPlan, JoinStrategy, PlanExpr, SourceBinding, SourcePlan};
use musoq_types::Value;
use tracing::debug;

use crate::eval::{eval_all, eval_predicate, EvalRow};
use crate::scan::{scan, ExecContext, JoinedRow};

/// Shape of the rows on the left of a join.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LeftShape {
    pub width: usize,
    pub sources: usize,
}

/// Join `binding` onto `left`.
pub(crate) fn join(
    cx: &ExecContext<'_>,
    left: Vec<JoinedRow>,
    shape: LeftShape,
    binding: &SourceBinding,
    plan: &JoinPlan,
) -> Result<Vec<JoinedRow>> {
    let left_rows = left.len();
    let out = if plan.strategy == JoinStrategy::Apply {
        apply(cx, left, binding, plan)?
    } else {
        let args = source_args(binding, &EvalRow::default())?;
        let right = scan(cx, binding, &args)?;
        let joiner = Joiner {
            cx,
            plan,
            shape,
            right_width: binding.width,
        };
        match plan.strategy {
            JoinStrategy::Hash => joiner.hash(&left, &right)?,
            JoinStrategy::SortMerge => joiner.sort_merge(&left, &right)?,
            JoinStrategy::NestedLoop | JoinStrategy::Apply => joiner.nested_loop(&left, &right)?,
        }
    };
    debug!(
        target: "musoq.exec",
        alias = %binding.alias,
        strategy = %plan.strategy,
        left_rows,
        rows_out = out.len(),
        "join done"
    );
    Ok(out)
}

/// Evaluate a source's FROM arguments.
pub(crate) fn source_args(binding: &SourceBinding, row: &EvalRow<'_>) -> Result<Vec<Value>> {
    match &binding.plan {
        SourcePlan::Schema { args, .. } => eval_all(args, row),
        SourcePlan::Cte { .. } | SourcePlan::Subquery(_) => Ok(Vec::new()),
    }
}

fn apply(
    cx: &ExecContext<'_>,
    left: Vec<JoinedRow>,
    binding: &SourceBinding,
    plan: &JoinPlan,
) -> Result<Vec<JoinedRow>> {
    let outer = plan.kind == JoinKind::OuterApply;
    let mut out = Vec::new();
    for row in left {
        cx.token.checkpoint()?;
        let args = source_args(binding, &EvalRow::new(&row.values, &row.contexts))?;
        let right = scan(cx, binding, &args)?;
        if right.is_empty() {
            if outer {
                out.push(row.concat(&JoinedRow::nulls(binding.width, 1)));
            }
            continue;
        }
        for r in &right {
            out.push(row.concat(r));
        }
    }
    Ok(out)
}

struct Joiner<'a, 'c> {
    cx: &'a ExecContext<'c>,
    plan: &'a JoinPlan,
    shape: LeftShape,
    right_width: usize,
}

impl Joiner<'_, '_> {
    fn keep_left(&self) -> bool {
        self.plan.kind == JoinKind::LeftOuter
    }

    fn keep_right(&self) -> bool {
        self.plan.kind == JoinKind::RightOuter
    }

    /// Combined row if the residual predicate accepts it.
    fn accept(&self, left: &JoinedRow, right: &JoinedRow) -> Result<Option<JoinedRow>> {
        let row = left.concat(right);
        match &self.plan.predicate {
            Some(p) if !eval_predicate(p, &EvalRow::new(&row.values, &row.contexts))? => Ok(None),
            _ => Ok(Some(row)),
        }
    }

    fn pad_left(&self, left: &JoinedRow) -> JoinedRow {
        left.concat(&JoinedRow::nulls(self.right_width, 1))
    }

    fn pad_right(&self, right: &JoinedRow) -> JoinedRow {
        JoinedRow::nulls(self.shape.width, self.shape.sources).concat(right)
    }

    fn finish_right(&self, right: &[JoinedRow], matched: &[bool], out: &mut Vec<JoinedRow>) {
        if self.keep_right() {
            out.extend(
                right
                    .iter()
                    .zip(matched)
                    .filter(|(_, m)| !**m)
                    .map(|(r, _)| self.pad_right(r)),
            );
        }
    }

    fn nested_loop(&self, left: &[JoinedRow], right: &[JoinedRow]) -> Result<Vec<JoinedRow>> {
        let mut out = Vec::new();
        let mut right_matched = vec![false; right.len()];
        for l in left {
            self.cx.token.checkpoint()?;
            let mut matched = false;
            for (j, r) in right.iter().enumerate() {
                if let Some(row) = self.accept(l, r)? {
                    matched = true;
                    right_matched[j] = true;
                    out.push(row);
                }
            }
            if !matched && self.keep_left() {
                out.push(self.pad_left(l));
            }
        }
        self.finish_right(right, &right_matched, &mut out);
        Ok(out)
    }

    fn hash(&self, left: &[JoinedRow], right: &[JoinedRow]) -> Result<Vec<JoinedRow>> {
        let mut table: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for (j, r) in right.iter().enumerate() {
            if let Some(key) = keys(&self.plan.right_keys, r)? {
                table.entry(key).or_default().push(j);
            }
        }
        let mut out = Vec::new();
        let mut right_matched = vec![false; right.len()];
        for l in left {
            self.cx.token.checkpoint()?;
            let mut matched = false;
            if let Some(key) = keys(&self.plan.left_keys, l)? {
                for &j in table.get(&key).map_or(&[][..], Vec::as_slice) {
                    if let Some(row) = self.accept(l, &right[j])? {
                        matched = true;
                        right_matched[j] = true;
                        out.push(row);
                    }
                }
            }
            if !matched && self.keep_left() {
                out.push(self.pad_left(l));
            }
        }
        self.finish_right(right, &right_matched, &mut out);
        Ok(out)
    }

    fn sort_merge(&self, left: &[JoinedRow], right: &[JoinedRow]) -> Result<Vec<JoinedRow>> {
        let sorted_left = sorted_keys(&self.plan.left_keys, left)?;
        let sorted_right = sorted_keys(&self.plan.right_keys, right)?;
        let mut left_matched = vec![false; left.len()];
        let mut right_matched = vec![false; right.len()];
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < sorted_left.len() && j < sorted_right.len() {
            self.cx.token.checkpoint()?;
            match compare_keys(&sorted_left[i].0, &sorted_right[j].0) {
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
                Ordering::Equal => {
                    let i_end = run_end(&sorted_left, i);
                    let j_end = run_end(&sorted_right, j);
                    for (_, li) in &sorted_left[i..i_end] {
                        for (_, rj) in &sorted_right[j..j_end] {
                            if let Some(row) = self.accept(&left[*li], &right[*rj])? {
                                left_matched[*li] = true;
                                right_matched[*rj] = true;
                                out.push(row);
                            }
                        }
                    }
                    i = i_end;
                    j = j_end;
                }
            }
        }
        if self.keep_left() {
            out.extend(
                left.iter()
                    .zip(&left_matched)
                    .filter(|(_, m)| !**m)
                    .map(|(l, _)| self.pad_left(l)),
            );
        }
        self.finish_right(right, &right_matched, &mut out);
        Ok(out)
    }
}

/// Join key of a row, or `None` when any component is null.
fn keys(exprs: &[PlanExpr], row: &JoinedRow) -> Result<Option<Vec<Value>>> {
    let key = eval_all(exprs, &EvalRow::new(&row.values, &row.contexts))?;
    Ok(if key.iter().any(Value::is_null) {
        None
    } else {
        Some(key)
    })
}

/// Non-null keys with their row indexes, stably sorted.
fn sorted_keys(exprs: &[PlanExpr], rows: &[JoinedRow]) -> Result<Vec<(Vec<Value>, usize)>> {
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        if let Some(key) = keys(exprs, row)? {
            out.push((key, i));
        }
    }
    out.sort_by(|a, b| compare_keys(&a.0, &b.0));
    Ok(out)
}

fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.compare(y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn run_end(sorted: &[(Vec<Value>, usize)], start: usize) -> usize {
    let key = &sorted[start].0;
    start
        + sorted[start..]
            .iter()
            .take_while(|(k, _)| compare_keys(k, key).is_eq())
            .count()
}
