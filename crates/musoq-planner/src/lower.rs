//! Lowering from the rewritten typed model to a [`QueryPlan`].
//!
//! Column references become offsets into the row the expression is evaluated
//! against. Equi-join right keys are rebased onto the right source row alone.
//! Structural problems found on the way (an unplaced aggregate, an offset
//! outside its row, a join without a strategy) do not stop lowering: they are
//! collected, and the finished plan text is attached to the
//! [`MusoqError::Compilation`] that reports them.
//!
//! Lowering replays the scope arena in creation order. Join strategies are
//! read from the symbols the rewrite pass recorded on each source scope, and
//! output columns, set shapes and grouping layouts are checked against theirs.

use std::collections::HashMap;
use std::sync::Arc;

use musoq_ast::CompoundOp;
use musoq_error::{MusoqError, Result};
use musoq_types::{SchemaColumn, TypeKind, Value};
use tracing::warn;

use crate::plan::{
    AggregatePlan, BlockPlan, CtePlan, GroupPlan, JoinPlan, OrderPlan, PlanExpr, QueryPlan,
    SetPlan, SourceBinding, SourcePlan, StatementPlan,
};
use crate::scope::{JoinStrategy, ScopeArena, ScopeId, ScopeKind, ScopeWalker, Symbol};
use crate::typed::{
    BoundBlock, BoundCte, BoundQuery, BoundStatement, SourceKind, TypedExpr, TypedExprKind,
};

/// What an expression may reference where it is evaluated.
#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Offset of the first visible column within the block's joined row.
    base: usize,
    /// Block source index of the first visible source.
    base_source: usize,
    width: usize,
    columns: bool,
    keys: usize,
    slots: usize,
}

impl Frame {
    const fn row(width: usize) -> Self {
        Self {
            base: 0,
            base_source: 0,
            width,
            columns: true,
            keys: 0,
            slots: 0,
        }
    }

    const fn grouped(keys: usize, slots: usize) -> Self {
        Self {
            base: 0,
            base_source: 0,
            width: 0,
            columns: false,
            keys,
            slots,
        }
    }
}

/// Lower a rewritten query against the scopes its metadata and rewrite
/// passes recorded.
pub fn lower(query: &BoundQuery, scopes: &ScopeArena) -> Result<QueryPlan> {
    let span = tracing::debug_span!(
        target: "musoq.lower",
        "lower",
        blocks = tracing::field::Empty,
        problems = tracing::field::Empty,
    );
    let _guard = span.enter();

    let mut cte_children: HashMap<ScopeId, Vec<usize>> = HashMap::new();
    for (i, cte) in query.ctes.iter().enumerate() {
        if let Some(parent) = scopes.get(cte.scope)?.parent {
            cte_children.entry(parent).or_default().push(i);
        }
    }
    let names: Vec<&str> = query.ctes.iter().map(|c| c.name.as_str()).collect();
    let mut lowerer = Lowerer {
        cte_names: &names,
        cte_bodies: &query.ctes,
        cte_children,
        cte_plans: query.ctes.iter().map(|_| None).collect(),
        scopes,
        walker: Some(scopes.walker()),
        problems: Vec::new(),
        blocks: 0,
    };
    let root = lowerer.statement(&query.root, ScopeKind::Query);
    if let Some(walker) = lowerer.walker.take() {
        if let Err(err) = walker.finish() {
            lowerer.problems.push(err.to_string());
        }
    }
    let mut ctes = Vec::with_capacity(query.ctes.len());
    for (i, cte) in query.ctes.iter().enumerate() {
        let plan = match lowerer.cte_plans[i].take() {
            Some(plan) => plan,
            None => {
                lowerer
                    .problems
                    .push(format!("CTE {} was not reached by the scope replay", cte.name));
                lowerer.statement(&cte.statement, ScopeKind::Cte)
            }
        };
        ctes.push(CtePlan {
            name: cte.name.clone(),
            plan,
        });
    }
    let plan = QueryPlan { ctes, root };

    span.record("blocks", lowerer.blocks);
    span.record("problems", lowerer.problems.len());
    if lowerer.problems.is_empty() {
        Ok(plan)
    } else {
        let detail = lowerer.problems.join("; ");
        warn!(target: "musoq.lower", %detail, "lowering failed");
        Err(MusoqError::Compilation {
            detail,
            plan: plan.to_string(),
        })
    }
}

struct Lowerer<'q> {
    cte_names: &'q [&'q str],
    cte_bodies: &'q [BoundCte],
    cte_children: HashMap<ScopeId, Vec<usize>>,
    cte_plans: Vec<Option<StatementPlan>>,
    scopes: &'q ScopeArena,
    /// `None` once the replay has gone out of step.
    walker: Option<ScopeWalker<'q>>,
    problems: Vec<String>,
    blocks: usize,
}

impl<'q> Lowerer<'q> {
    fn problem(&mut self, detail: String) -> PlanExpr {
        self.problems.push(detail);
        PlanExpr::Literal(Value::Null)
    }

    // ── Scope replay ──────────────────────────────────────────────────────

    fn enter(&mut self, kind: ScopeKind, bound: ScopeId) -> Option<ScopeId> {
        let entered = self.walker.as_mut()?.enter(kind);
        match entered {
            Ok(id) if id == bound => Some(id),
            Ok(id) => {
                self.problems
                    .push(format!("scope replay entered {id} where the tree has {bound}"));
                self.walker = None;
                None
            }
            Err(err) => {
                self.problems.push(err.to_string());
                self.walker = None;
                None
            }
        }
    }

    fn exit(&mut self) {
        let Some(walker) = self.walker.as_mut() else {
            return;
        };
        if let Err(err) = walker.exit() {
            self.problems.push(err.to_string());
            self.walker = None;
        }
    }

    fn symbols(&self, scope: ScopeId) -> &'q [Symbol] {
        self.scopes.get(scope).map_or(&[][..], |s| s.symbols())
    }

    fn check_statement(&mut self, scope: ScopeId, stmt: &BoundStatement) {
        let symbols = self.symbols(scope);
        let columns = symbols.iter().find_map(|s| match s {
            Symbol::OutputColumns(c) => Some(c.as_slice()),
            _ => None,
        });
        if columns != Some(stmt.columns.as_slice()) {
            self.problems.push(format!(
                "output columns of {scope} differ from the recorded {}",
                describe_columns(columns)
            ));
        }
        let shape = symbols.iter().find_map(|s| match s {
            Symbol::SetShape { ops, arity } => Some((ops.as_slice(), *arity)),
            _ => None,
        });
        let ops: Vec<CompoundOp> = stmt.compounds.iter().map(|(op, _)| *op).collect();
        let expected = (!ops.is_empty()).then_some((ops.as_slice(), stmt.columns.len()));
        if shape != expected {
            self.problems
                .push(format!("set operations of {scope} differ from the recorded shape"));
        }
    }

    fn recorded_join(&mut self, scope: ScopeId) -> Option<(JoinStrategy, usize)> {
        let found = self.symbols(scope).iter().find_map(|s| match s {
            Symbol::Join {
                strategy, key_pairs, ..
            } => Some((*strategy, *key_pairs)),
            _ => None,
        });
        if found.is_none() {
            self.problems.push(format!("no join recorded on {scope}"));
        }
        found
    }

    // ── Statements and blocks ─────────────────────────────────────────────

    fn statement(&mut self, stmt: &'q BoundStatement, kind: ScopeKind) -> StatementPlan {
        let scope = self.enter(kind, stmt.scope);
        let bodies = self.cte_bodies;
        for i in self.cte_children.get(&stmt.scope).cloned().unwrap_or_default() {
            if let Some(cte) = bodies.get(i) {
                let plan = self.statement(&cte.statement, ScopeKind::Cte);
                self.cte_plans[i] = Some(plan);
            }
        }

        let mut body = SetPlan::Block(Box::new(self.block(&stmt.first)));
        for (op, block) in &stmt.compounds {
            body = SetPlan::Combine {
                op: *op,
                left: Box::new(body),
                right: Box::new(SetPlan::Block(Box::new(self.block(block)))),
            };
        }
        if let Some(scope) = scope {
            self.check_statement(scope, stmt);
        }
        self.exit();
        let hidden = if stmt.compounds.is_empty() {
            stmt.first.hidden
        } else {
            0
        };
        let arity = stmt.columns.len() + hidden;
        let mut order_by = Vec::with_capacity(stmt.order_by.len());
        for term in &stmt.order_by {
            if term.column >= arity {
                self.problems.push(format!(
                    "ORDER BY column {} outside a row of {arity}",
                    term.column
                ));
            }
            order_by.push(OrderPlan {
                column: term.column,
                direction: term.direction,
            });
        }
        StatementPlan {
            body,
            order_by,
            skip: stmt.skip,
            take: stmt.take,
            columns: stmt.columns.clone(),
            hidden,
        }
    }

    fn block(&mut self, block: &'q BoundBlock) -> BlockPlan {
        self.blocks += 1;
        let scope = self.enter(ScopeKind::Branch, block.scope);
        let mut sources = Vec::with_capacity(block.sources.len());
        let mut source_scopes = Vec::with_capacity(block.sources.len());
        for source in &block.sources {
            let source_scope = self.enter(ScopeKind::Source, source.scope);
            if let Some(id) = source_scope {
                let recorded = self.symbols(id).iter().find_map(|s| match s {
                    Symbol::Table {
                        alias, position, ..
                    } => Some((alias.as_str(), *position)),
                    _ => None,
                });
                if recorded != Some((source.alias.as_str(), source.position)) {
                    self.problems.push(format!(
                        "source {} differs from the one recorded on {id}",
                        source.alias
                    ));
                }
            }
            let plan = match &source.kind {
                SourceKind::Schema {
                    schema,
                    schema_name,
                    table,
                    args,
                    correlated,
                } => SourcePlan::Schema {
                    schema: Arc::clone(schema),
                    schema_name: schema_name.clone(),
                    table: table.clone(),
                    args: args
                        .iter()
                        .map(|a| self.expr(a, Frame::row(source.offset)))
                        .collect(),
                    correlated: *correlated,
                },
                SourceKind::Cte(index) => match self.cte_names.get(*index) {
                    Some(name) => SourcePlan::Cte {
                        index: *index,
                        name: (*name).to_owned(),
                    },
                    None => {
                        self.problems.push(format!("unknown CTE index {index}"));
                        SourcePlan::Cte {
                            index: *index,
                            name: String::from("?"),
                        }
                    }
                },
                SourceKind::Subquery(sub) => {
                    SourcePlan::Subquery(Box::new(self.statement(sub, ScopeKind::Subquery)))
                }
            };
            self.exit();
            source_scopes.push(source_scope);
            sources.push(SourceBinding {
                alias: source.alias.clone(),
                position: source.position,
                width: source.columns.len(),
                plan,
            });
        }

        let mut joins = Vec::with_capacity(block.joins.len());
        for (i, join) in block.joins.iter().enumerate() {
            let Some(right) = block.sources.get(i + 1) else {
                self.problems.push(format!("join {i} has no right source"));
                continue;
            };
            let left_frame = Frame::row(right.offset);
            let right_frame = Frame {
                base: right.offset,
                base_source: i + 1,
                width: right.columns.len(),
                ..Frame::row(0)
            };
            let combined = Frame::row(right.offset + right.columns.len());
            let recorded = match source_scopes.get(i + 1).copied().flatten() {
                Some(id) => self.recorded_join(id),
                None => None,
            };
            let strategy = match (join.strategy, recorded) {
                (Some(chosen), Some((strategy, pairs)))
                    if chosen != strategy || pairs != join.keys.len() =>
                {
                    self.problems.push(format!(
                        "join on {} is {chosen} with {} keys, recorded {strategy} with {pairs}",
                        right.alias,
                        join.keys.len()
                    ));
                    strategy
                }
                (_, Some((strategy, _))) => strategy,
                (Some(chosen), None) => chosen,
                (None, None) => {
                    self.problems
                        .push(format!("no join strategy chosen for {}", right.alias));
                    JoinStrategy::NestedLoop
                }
            };
            let mut left_keys = Vec::with_capacity(join.keys.len());
            let mut right_keys = Vec::with_capacity(join.keys.len());
            for key in &join.keys {
                let l = self.expr(&key.left, left_frame);
                let r = self.expr(&key.right, right_frame);
                left_keys.push(widen(l, &key.left, key.kind));
                right_keys.push(widen(r, &key.right, key.kind));
            }
            joins.push(JoinPlan {
                kind: join.kind,
                strategy,
                left_keys,
                right_keys,
                predicate: join.on.as_ref().map(|p| self.expr(p, combined)),
            });
        }

        let row = Frame::row(block.width);
        let filter = block.filter.as_ref().map(|f| self.expr(f, row));
        let (group, get_frame) = match &block.group {
            Some(g) => {
                let keys: Vec<PlanExpr> = g.keys.iter().map(|k| self.expr(k, row)).collect();
                let mut aggregates = Vec::with_capacity(g.aggregates.len());
                for a in &g.aggregates {
                    if let TypedExprKind::Aggregate { name, method, args } = &a.kind {
                        aggregates.push(AggregatePlan {
                            name: name.clone(),
                            method: Arc::clone(&method.method),
                            args: args.iter().map(|x| self.expr(x, row)).collect(),
                        });
                    } else {
                        self.problems
                            .push(format!("aggregate slot {} is not an aggregate call", aggregates.len()));
                    }
                }
                if let Some(id) = scope {
                    self.check_grouping(id, &g.keys, &g.aggregates);
                }
                let frame = Frame::grouped(keys.len(), aggregates.len());
                (Some(GroupPlan { keys, aggregates }), frame)
            }
            None => (None, row),
        };
        if block.group.is_none() && block.is_grouped() {
            self.problems
                .push(format!("block {} aggregates without a grouping", block.scope));
        }
        let having = block.having.as_ref().map(|h| self.expr(h, get_frame));
        let project = block
            .projection
            .iter()
            .map(|c| self.expr(&c.expr, get_frame))
            .collect();
        self.exit();

        BlockPlan {
            scope: block.scope,
            sources,
            joins,
            filter,
            group,
            having,
            project,
            distinct: block.distinct,
            width: block.width,
        }
    }

    fn check_grouping(&mut self, scope: ScopeId, keys: &[TypedExpr], slots: &[TypedExpr]) {
        let prints =
            |exprs: &[TypedExpr]| exprs.iter().map(TypedExpr::fingerprint).collect::<Vec<_>>();
        let symbols = self.symbols(scope);
        let recorded_keys = symbols.iter().find_map(|s| match s {
            Symbol::GroupKeys(k) => Some(k),
            _ => None,
        });
        let recorded_slots = symbols.iter().find_map(|s| match s {
            Symbol::AggregateSlots(a) => Some(a),
            _ => None,
        });
        if recorded_keys != Some(&prints(keys)) || recorded_slots != Some(&prints(slots)) {
            self.problems
                .push(format!("grouping of {scope} differs from the recorded keys and slots"));
        }
    }

    fn exprs(&mut self, items: &[TypedExpr], frame: Frame) -> Vec<PlanExpr> {
        items.iter().map(|e| self.expr(e, frame)).collect()
    }

    fn boxed(&mut self, e: &TypedExpr, frame: Frame) -> Box<PlanExpr> {
        Box::new(self.expr(e, frame))
    }

    fn expr(&mut self, e: &TypedExpr, frame: Frame) -> PlanExpr {
        match &e.kind {
            TypedExprKind::Literal(v) => PlanExpr::Literal(v.clone()),
            TypedExprKind::Column(c) => {
                let label = format!("{}.{}", c.alias, c.name);
                if !frame.columns {
                    return self.problem(format!(
                        "column {label} referenced after grouping"
                    ));
                }
                match c.offset.checked_sub(frame.base) {
                    Some(offset) if offset < frame.width => PlanExpr::Column { offset, label },
                    _ => self.problem(format!(
                        "column {label} at offset {} outside a row of {} starting at {}",
                        c.offset, frame.width, frame.base
                    )),
                }
            }
            TypedExprKind::Binary { left, op, right } => PlanExpr::Binary {
                left: self.boxed(left, frame),
                op: *op,
                right: self.boxed(right, frame),
            },
            TypedExprKind::Unary { op, expr } => PlanExpr::Unary {
                op: *op,
                expr: self.boxed(expr, frame),
            },
            TypedExprKind::Call {
                name,
                method,
                args,
                context_source,
            } => PlanExpr::Call {
                name: name.clone(),
                method: Arc::clone(&method.method),
                args: self.exprs(args, frame),
                context_source: context_source.and_then(|s| s.checked_sub(frame.base_source)),
            },
            TypedExprKind::Aggregate { name, .. } => {
                self.problem(format!("aggregate {name} outside a grouped projection"))
            }
            TypedExprKind::Case { whens, else_expr } => PlanExpr::Case {
                whens: whens
                    .iter()
                    .map(|(w, t)| (self.expr(w, frame), self.expr(t, frame)))
                    .collect(),
                else_expr: else_expr.as_ref().map(|x| self.boxed(x, frame)),
            },
            TypedExprKind::In { expr, list, not } => PlanExpr::In {
                expr: self.boxed(expr, frame),
                list: self.exprs(list, frame),
                not: *not,
            },
            TypedExprKind::Like { expr, pattern, not } => PlanExpr::Like {
                expr: self.boxed(expr, frame),
                pattern: self.boxed(pattern, frame),
                not: *not,
            },
            TypedExprKind::IsNull { expr, not } => PlanExpr::IsNull {
                expr: self.boxed(expr, frame),
                not: *not,
            },
            TypedExprKind::Convert { expr, kind } => PlanExpr::Convert {
                expr: self.boxed(expr, frame),
                kind: *kind,
            },
            TypedExprKind::GroupKey(i) => {
                if *i < frame.keys {
                    PlanExpr::GroupKey(*i)
                } else {
                    self.problem(format!("group key {i} of {}", frame.keys))
                }
            }
            TypedExprKind::AggregateSlot(j) => {
                if *j < frame.slots {
                    PlanExpr::AggregateSlot(*j)
                } else {
                    self.problem(format!("aggregate slot {j} of {}", frame.slots))
                }
            }
        }
    }
}

fn describe_columns(columns: Option<&[SchemaColumn]>) -> String {
    columns.map_or_else(
        || String::from("(none)"),
        |c| {
            let names: Vec<String> = c.iter().map(|c| format!("{} {}", c.name, c.ty)).collect();
            format!("[{}]", names.join(", "))
        },
    )
}

/// Convert a join key to the kind both sides are compared in.
fn widen(lowered: PlanExpr, typed: &TypedExpr, kind: TypeKind) -> PlanExpr {
    if typed.ty.kind == kind {
        lowered
    } else {
        PlanExpr::Convert {
            expr: Box::new(lowered),
            kind,
        }
    }
}
