//! Execution of one query block.
//!
//! Source → joins → filter → [group → having] → project → [distinct].
//! `RowNumber()` is the 1-based ordinal among rows accepted by the filter,
//! in emission order. In grouped blocks it is the group ordinal.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::thread;

use musoq_error::{MusoqError, Result};
use musoq_planner::{AggregatePlan, BlockPlan, GroupPlan, PlanExpr};
use musoq_schema::SourceContext;
use musoq_types::{CancellationToken, Row, Value};
use tracing::debug;

use crate::eval::{eval_all, eval_predicate, EvalRow};
use crate::join::{join, source_args, LeftShape};
use crate::scan::{scan, ExecContext, JoinedRow};

/// Run a block and return its projected rows (visible then hidden columns).
pub(crate) fn exec_block(cx: &ExecContext<'_>, block: &BlockPlan) -> Result<Vec<Row>> {
    let span = tracing::debug_span!(
        target: "musoq.exec",
        "block",
        scope = %block.scope,
        rows_in = tracing::field::Empty,
        rows_out = tracing::field::Empty,
    );
    let _guard = span.enter();

    let rows = joined_rows(cx, block)?;
    span.record("rows_in", rows.len());
    let accepted = filter(cx, block.filter.as_ref(), rows)?;

    let mut out = match &block.group {
        Some(group) => {
            let groups = group_rows(cx, group, &accepted)?;
            project_groups(cx, block, groups)?
        }
        None => project(cx, &block.project, &accepted)?,
    };
    if block.distinct {
        out = distinct(out);
    }
    span.record("rows_out", out.len());
    debug!(target: "musoq.exec", rows_out = out.len(), "block done");
    Ok(out)
}

fn joined_rows(cx: &ExecContext<'_>, block: &BlockPlan) -> Result<Vec<JoinedRow>> {
    let Some(first) = block.sources.first() else {
        // FROM-less query: one empty row.
        return Ok(vec![JoinedRow::empty()]);
    };
    let args = source_args(first, &EvalRow::default())?;
    let mut rows = scan(cx, first, &args)?;
    let mut shape = LeftShape {
        width: first.width,
        sources: 1,
    };
    for (binding, plan) in block.sources.iter().skip(1).zip(&block.joins) {
        rows = join(cx, rows, shape, binding, plan)?;
        shape.width += binding.width;
        shape.sources += 1;
    }
    Ok(rows)
}

/// Accepted rows paired with their row number.
fn filter(
    cx: &ExecContext<'_>,
    predicate: Option<&PlanExpr>,
    rows: Vec<JoinedRow>,
) -> Result<Vec<(JoinedRow, u64)>> {
    let mut accepted = Vec::with_capacity(rows.len());
    for row in rows {
        cx.token.checkpoint()?;
        let number = accepted.len() as u64 + 1;
        if let Some(p) = predicate {
            let view = EvalRow::new(&row.values, &row.contexts).with_row_number(number);
            if !eval_predicate(p, &view).map_err(|e| e.at_row(number))? {
                continue;
            }
        }
        accepted.push((row, number));
    }
    Ok(accepted)
}

// ── Grouping ──────────────────────────────────────────────────────────────

struct Group {
    keys: Vec<Value>,
    states: Vec<Box<dyn Any + Send>>,
    /// Contexts of the first row seen for the group.
    contexts: Vec<Option<SourceContext>>,
}

/// A finished group: key values, aggregate results and first-row contexts.
struct GroupRow {
    keys: Vec<Value>,
    slots: Vec<Value>,
    contexts: Vec<Option<SourceContext>>,
}

fn aggregate_label(agg: &AggregatePlan) -> String {
    let args: Vec<String> = agg.args.iter().map(ToString::to_string).collect();
    format!("{}({})", agg.name, args.join(", "))
}

fn aggregate_error(err: MusoqError, agg: &AggregatePlan) -> MusoqError {
    match err {
        MusoqError::RuntimeEvaluation { detail, row, .. } => MusoqError::RuntimeEvaluation {
            detail,
            expression: aggregate_label(agg),
            row,
        },
        MusoqError::Cancelled | MusoqError::SourceFailure { .. } | MusoqError::Internal(_) => err,
        other => MusoqError::runtime(other.to_string(), aggregate_label(agg)),
    }
}

fn new_group(group: &GroupPlan, keys: Vec<Value>, contexts: Vec<Option<SourceContext>>) -> Group {
    Group {
        keys,
        states: group
            .aggregates
            .iter()
            .map(|a| a.method.initial_state())
            .collect(),
        contexts,
    }
}

/// Partition rows by key in first-seen order and fold every aggregate.
fn group_rows(
    cx: &ExecContext<'_>,
    group: &GroupPlan,
    rows: &[(JoinedRow, u64)],
) -> Result<Vec<GroupRow>> {
    let mut index: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for (row, number) in rows {
        cx.token.checkpoint()?;
        let view = EvalRow::new(&row.values, &row.contexts).with_row_number(*number);
        let keys = eval_all(&group.keys, &view).map_err(|e| e.at_row(*number))?;
        let slot = match index.get(&keys) {
            Some(&i) => i,
            None => {
                index.insert(keys.clone(), groups.len());
                groups.push(new_group(group, keys, row.contexts.clone()));
                groups.len() - 1
            }
        };
        let state = &mut groups[slot];
        for (agg, acc) in group.aggregates.iter().zip(state.states.iter_mut()) {
            let args = eval_all(&agg.args, &view).map_err(|e| e.at_row(*number))?;
            agg.method
                .set(acc, &args)
                .map_err(|e| aggregate_error(e, agg).at_row(*number))?;
        }
    }
    // Aggregates without GROUP BY yield one row even for empty input.
    if groups.is_empty() && group.keys.is_empty() {
        groups.push(new_group(group, Vec::new(), Vec::new()));
    }
    debug!(
        target: "musoq.exec",
        rows = rows.len(),
        groups = groups.len(),
        "grouping done"
    );
    groups
        .into_iter()
        .map(|g| {
            let slots = group
                .aggregates
                .iter()
                .zip(g.states)
                .map(|(agg, state)| agg.method.get(state).map_err(|e| aggregate_error(e, agg)))
                .collect::<Result<Vec<_>>>()?;
            Ok(GroupRow {
                keys: g.keys,
                slots,
                contexts: g.contexts,
            })
        })
        .collect()
}

fn project_groups(
    cx: &ExecContext<'_>,
    block: &BlockPlan,
    groups: Vec<GroupRow>,
) -> Result<Vec<Row>> {
    let mut out = Vec::with_capacity(groups.len());
    for (i, g) in groups.iter().enumerate() {
        cx.token.checkpoint()?;
        let number = i as u64 + 1;
        let view = EvalRow::grouped(&g.keys, &g.slots)
            .with_contexts(&g.contexts)
            .with_row_number(number);
        if let Some(having) = &block.having {
            if !eval_predicate(having, &view).map_err(|e| e.at_row(number))? {
                continue;
            }
        }
        let values = eval_all(&block.project, &view).map_err(|e| e.at_row(number))?;
        out.push(Row::new(values));
    }
    Ok(out)
}

// ── Projection ────────────────────────────────────────────────────────────

fn project_chunk(
    token: &CancellationToken,
    exprs: &[PlanExpr],
    rows: &[(JoinedRow, u64)],
) -> Result<Vec<Row>> {
    let mut out = Vec::with_capacity(rows.len());
    for (row, number) in rows {
        token.checkpoint()?;
        let view = EvalRow::new(&row.values, &row.contexts).with_row_number(*number);
        let values = eval_all(exprs, &view).map_err(|e| e.at_row(*number))?;
        out.push(Row::new(values));
    }
    Ok(out)
}

/// Project accepted rows, fanning out across scoped workers for large
/// inputs. Output order matches input order.
fn project(
    cx: &ExecContext<'_>,
    exprs: &[PlanExpr],
    rows: &[(JoinedRow, u64)],
) -> Result<Vec<Row>> {
    let workers = cx.options.parallelism;
    if workers <= 1 || rows.len() < cx.options.parallel_threshold.max(2) {
        return project_chunk(&cx.token, exprs, rows);
    }
    let token = cx.token.child();
    let chunk_len = rows.len().div_ceil(workers);
    debug!(
        target: "musoq.exec",
        rows = rows.len(),
        workers,
        chunk_len,
        "parallel projection"
    );
    let results: Vec<Result<Vec<Row>>> = thread::scope(|s| {
        let handles: Vec<_> = rows
            .chunks(chunk_len)
            .map(|chunk| {
                let token = &token;
                s.spawn(move || {
                    let result = project_chunk(token, exprs, chunk);
                    if result.is_err() {
                        token.cancel_with_reason("sibling projection worker failed");
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(MusoqError::internal("projection worker panicked")))
            })
            .collect()
    });
    merge_chunks(results)
}

/// Concatenate worker output in chunk order. A real failure wins over the
/// cancellations it caused in sibling workers.
fn merge_chunks(results: Vec<Result<Vec<Row>>>) -> Result<Vec<Row>> {
    let mut out = Vec::new();
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(rows) => out.extend(rows),
            Err(err) if err.is_cancellation() => cancelled = Some(err),
            Err(err) => return Err(err),
        }
    }
    cancelled.map_or(Ok(out), Err)
}

/// Keep the first occurrence of every row.
pub(crate) fn distinct(rows: Vec<Row>) -> Vec<Row> {
    let mut seen = HashSet::with_capacity(rows.len());
    rows.into_iter()
        .filter(|row| seen.insert(row.clone()))
        .collect()
}
