//! Executable query plan.
//!
//! Per block: Source → [Join | Apply]* → Filter → [Group] → [Having] →
//! Project → [Distinct]. Per statement: branches combined left to right, then
//! OrderBy → Skip → Take. CTE plans run first, in definition order.
//!
//! `Display` renders the plan as an indented intermediate representation; it
//! is what [`musoq_error::MusoqError::Compilation`] carries.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use musoq_ast::{BinaryOp, CompoundOp, JoinKind, SortDirection, UnaryOp};
use musoq_schema::{ErasedAggregateMethod, ScalarMethod, Schema};
use musoq_types::{SchemaColumn, TypeKind, Value};

use crate::scope::{JoinStrategy, ScopeId};

// ── Expressions ───────────────────────────────────────────────────────────

/// Expression over a flat row: columns are offsets, methods are resolved.
#[derive(Clone)]
pub enum PlanExpr {
    Literal(Value),
    Column {
        offset: usize,
        /// `alias.name`, kept for diagnostics.
        label: String,
    },
    Binary {
        left: Box<PlanExpr>,
        op: BinaryOp,
        right: Box<PlanExpr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<PlanExpr>,
    },
    Call {
        name: String,
        method: Arc<dyn ScalarMethod>,
        args: Vec<PlanExpr>,
        /// Source index (within the evaluated row) whose context is injected.
        context_source: Option<usize>,
    },
    Case {
        whens: Vec<(PlanExpr, PlanExpr)>,
        else_expr: Option<Box<PlanExpr>>,
    },
    In {
        expr: Box<PlanExpr>,
        list: Vec<PlanExpr>,
        not: bool,
    },
    Like {
        expr: Box<PlanExpr>,
        pattern: Box<PlanExpr>,
        not: bool,
    },
    IsNull {
        expr: Box<PlanExpr>,
        not: bool,
    },
    Convert {
        expr: Box<PlanExpr>,
        kind: TypeKind,
    },
    GroupKey(usize),
    AggregateSlot(usize),
}

impl fmt::Display for PlanExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(Value::String(s)) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Literal(v) => write!(f, "{v}"),
            Self::Column { offset, label } => write!(f, "#{offset}:{label}"),
            Self::Binary { left, op, right } => write!(f, "({left} {op} {right})"),
            Self::Unary { op, expr } => write!(f, "{op}{expr}"),
            Self::Call { name, args, .. } => {
                f.write_str(name)?;
                write_list(f, args)
            }
            Self::Case { whens, else_expr } => {
                f.write_str("case")?;
                for (w, t) in whens {
                    write!(f, " when {w} then {t}")?;
                }
                if let Some(e) = else_expr {
                    write!(f, " else {e}")?;
                }
                f.write_str(" end")
            }
            Self::In { expr, list, not } => {
                write!(f, "{expr} {}in ", if *not { "not " } else { "" })?;
                write_list(f, list)
            }
            Self::Like { expr, pattern, not } => {
                write!(f, "{expr} {}like {pattern}", if *not { "not " } else { "" })
            }
            Self::IsNull { expr, not } => {
                write!(f, "{expr} is {}null", if *not { "not " } else { "" })
            }
            Self::Convert { expr, kind } => write!(f, "{kind}({expr})"),
            Self::GroupKey(i) => write!(f, "key{i}"),
            Self::AggregateSlot(j) => write!(f, "agg{j}"),
        }
    }
}

impl fmt::Debug for PlanExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[PlanExpr]) -> fmt::Result {
    f.write_char('(')?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_char(')')
}

// ── Operators ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum SourcePlan {
    Schema {
        schema: Arc<dyn Schema>,
        schema_name: String,
        table: String,
        /// Evaluated against the joined row to the left (APPLY) or an empty
        /// row.
        args: Vec<PlanExpr>,
        correlated: bool,
    },
    Cte { index: usize, name: String },
    Subquery(Box<StatementPlan>),
}

/// One source of a block with its query-wide position.
#[derive(Clone)]
pub struct SourceBinding {
    pub alias: String,
    pub position: u32,
    pub width: usize,
    pub plan: SourcePlan,
}

/// Join of `sources[i + 1]` onto the rows built so far.
#[derive(Clone)]
pub struct JoinPlan {
    pub kind: JoinKind,
    pub strategy: JoinStrategy,
    /// Over the left joined row.
    pub left_keys: Vec<PlanExpr>,
    /// Over the right source row alone.
    pub right_keys: Vec<PlanExpr>,
    /// Residual predicate over the combined row.
    pub predicate: Option<PlanExpr>,
}

#[derive(Clone)]
pub struct AggregatePlan {
    pub name: String,
    pub method: Arc<ErasedAggregateMethod>,
    /// Refresh expressions over the joined row.
    pub args: Vec<PlanExpr>,
}

#[derive(Clone)]
pub struct GroupPlan {
    pub keys: Vec<PlanExpr>,
    pub aggregates: Vec<AggregatePlan>,
}

#[derive(Clone)]
pub struct BlockPlan {
    pub scope: ScopeId,
    pub sources: Vec<SourceBinding>,
    pub joins: Vec<JoinPlan>,
    pub filter: Option<PlanExpr>,
    pub group: Option<GroupPlan>,
    pub having: Option<PlanExpr>,
    /// Visible columns followed by hidden ORDER BY columns.
    pub project: Vec<PlanExpr>,
    pub distinct: bool,
    /// Width of the joined row.
    pub width: usize,
}

impl BlockPlan {
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.group.is_some()
    }
}

#[derive(Clone)]
pub enum SetPlan {
    Block(Box<BlockPlan>),
    Combine {
        op: CompoundOp,
        left: Box<SetPlan>,
        right: Box<SetPlan>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderPlan {
    pub column: usize,
    pub direction: SortDirection,
}

#[derive(Clone)]
pub struct StatementPlan {
    pub body: SetPlan,
    pub order_by: Vec<OrderPlan>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
    /// Visible output columns.
    pub columns: Vec<SchemaColumn>,
    /// Hidden ORDER BY columns trailing the visible ones.
    pub hidden: usize,
}

#[derive(Clone)]
pub struct CtePlan {
    pub name: String,
    pub plan: StatementPlan,
}

/// Lowered query: CTE plans in definition order, then the root statement.
#[derive(Clone)]
pub struct QueryPlan {
    pub ctes: Vec<CtePlan>,
    pub root: StatementPlan,
}

impl QueryPlan {
    /// Join strategies used anywhere in the plan, in plan order.
    #[must_use]
    pub fn join_strategies(&self) -> Vec<JoinStrategy> {
        let mut out = Vec::new();
        for cte in &self.ctes {
            cte.plan.collect_strategies(&mut out);
        }
        self.root.collect_strategies(&mut out);
        out
    }
}

impl StatementPlan {
    fn collect_strategies(&self, out: &mut Vec<JoinStrategy>) {
        self.body.collect_strategies(out);
    }
}

impl SetPlan {
    fn collect_strategies(&self, out: &mut Vec<JoinStrategy>) {
        match self {
            Self::Block(b) => {
                for s in &b.sources {
                    if let SourcePlan::Subquery(sub) = &s.plan {
                        sub.collect_strategies(out);
                    }
                }
                out.extend(b.joins.iter().map(|j| j.strategy));
            }
            Self::Combine { left, right, .. } => {
                left.collect_strategies(out);
                right.collect_strategies(out);
            }
        }
    }
}

// ── Display ───────────────────────────────────────────────────────────────

struct Indent(usize);

impl fmt::Display for Indent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for _ in 0..self.0 {
            f.write_str("  ")?;
        }
        Ok(())
    }
}

fn exprs(items: &[PlanExpr]) -> String {
    let mut out = String::new();
    for (i, e) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{e}");
    }
    out
}

const fn join_name(kind: JoinKind) -> &'static str {
    match kind {
        JoinKind::Inner => "inner join",
        JoinKind::LeftOuter => "left join",
        JoinKind::RightOuter => "right join",
        JoinKind::CrossApply => "cross apply",
        JoinKind::OuterApply => "outer apply",
    }
}

impl SourceBinding {
    fn fmt_at(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match &self.plan {
            SourcePlan::Schema {
                schema_name,
                table,
                args,
                correlated,
                ..
            } => {
                writeln!(
                    f,
                    "{}scan #{schema_name}.{table}({}) as {} @{} width={}{}",
                    Indent(depth),
                    exprs(args),
                    self.alias,
                    self.position,
                    self.width,
                    if *correlated { " correlated" } else { "" }
                )
            }
            SourcePlan::Cte { index, name } => writeln!(
                f,
                "{}cte {name}[{index}] as {} @{} width={}",
                Indent(depth),
                self.alias,
                self.position,
                self.width
            ),
            SourcePlan::Subquery(plan) => {
                writeln!(
                    f,
                    "{}subquery as {} @{} width={}",
                    Indent(depth),
                    self.alias,
                    self.position,
                    self.width
                )?;
                plan.fmt_at(f, depth + 1)
            }
        }
    }
}

impl BlockPlan {
    fn fmt_at(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "{}block {} width={}", Indent(depth), self.scope, self.width)?;
        let inner = depth + 1;
        for (i, source) in self.sources.iter().enumerate() {
            if i > 0 {
                if let Some(join) = self.joins.get(i - 1) {
                    write!(f, "{}{} {}", Indent(inner), join_name(join.kind), join.strategy)?;
                    if !join.left_keys.is_empty() {
                        write!(
                            f,
                            " keys [{}] = [{}]",
                            exprs(&join.left_keys),
                            exprs(&join.right_keys)
                        )?;
                    }
                    if let Some(p) = &join.predicate {
                        write!(f, " on {p}")?;
                    }
                    writeln!(f)?;
                }
            }
            source.fmt_at(f, inner)?;
        }
        if let Some(filter) = &self.filter {
            writeln!(f, "{}filter {filter}", Indent(inner))?;
        }
        if let Some(group) = &self.group {
            let aggs: Vec<String> = group
                .aggregates
                .iter()
                .map(|a| format!("{}({})", a.name, exprs(&a.args)))
                .collect();
            writeln!(
                f,
                "{}group keys [{}] aggregates [{}]",
                Indent(inner),
                exprs(&group.keys),
                aggs.join(", ")
            )?;
        }
        if let Some(having) = &self.having {
            writeln!(f, "{}having {having}", Indent(inner))?;
        }
        writeln!(f, "{}project [{}]", Indent(inner), exprs(&self.project))?;
        if self.distinct {
            writeln!(f, "{}distinct", Indent(inner))?;
        }
        Ok(())
    }
}

impl SetPlan {
    fn fmt_at(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Self::Block(b) => b.fmt_at(f, depth),
            Self::Combine { op, left, right } => {
                writeln!(f, "{}{op}", Indent(depth))?;
                left.fmt_at(f, depth + 1)?;
                right.fmt_at(f, depth + 1)
            }
        }
    }
}

impl StatementPlan {
    fn fmt_at(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        write!(f, "{}statement [{}]", Indent(depth), names.join(", "))?;
        if self.hidden > 0 {
            write!(f, " hidden={}", self.hidden)?;
        }
        writeln!(f)?;
        self.body.fmt_at(f, depth + 1)?;
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self
                .order_by
                .iter()
                .map(|o| match o.direction {
                    SortDirection::Asc => format!("#{}", o.column),
                    SortDirection::Desc => format!("#{} desc", o.column),
                })
                .collect();
            writeln!(f, "{}order by {}", Indent(depth + 1), terms.join(", "))?;
        }
        if let Some(n) = self.skip {
            writeln!(f, "{}skip {n}", Indent(depth + 1))?;
        }
        if let Some(n) = self.take {
            writeln!(f, "{}take {n}", Indent(depth + 1))?;
        }
        Ok(())
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cte) in self.ctes.iter().enumerate() {
            writeln!(f, "cte[{i}] {}", cte.name)?;
            cte.plan.fmt_at(f, 1)?;
        }
        self.root.fmt_at(f, 0)
    }
}

impl fmt::Debug for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(offset: usize) -> PlanExpr {
        PlanExpr::Column {
            offset,
            label: format!("a.c{offset}"),
        }
    }

    #[test]
    fn expression_ir() {
        let e = PlanExpr::Binary {
            left: Box::new(col(1)),
            op: BinaryOp::Add,
            right: Box::new(PlanExpr::Literal(Value::Int(2))),
        };
        assert_eq!(e.to_string(), "(#1:a.c1 + 2)");
        let like = PlanExpr::Like {
            expr: Box::new(col(0)),
            pattern: Box::new(PlanExpr::Literal("it's%".into())),
            not: true,
        };
        assert_eq!(like.to_string(), "#0:a.c0 not like 'it''s%'");
        let conv = PlanExpr::Convert {
            expr: Box::new(PlanExpr::AggregateSlot(0)),
            kind: TypeKind::Long,
        };
        assert_eq!(conv.to_string(), "Long(agg0)");
    }

    #[test]
    fn statement_ir_lists_operators_in_order() {
        let block = BlockPlan {
            scope: ScopeId(1),
            sources: Vec::new(),
            joins: Vec::new(),
            filter: Some(PlanExpr::Literal(Value::Bool(true))),
            group: None,
            having: None,
            project: vec![PlanExpr::Literal(Value::Int(1))],
            distinct: true,
            width: 0,
        };
        let plan = QueryPlan {
            ctes: Vec::new(),
            root: StatementPlan {
                body: SetPlan::Block(Box::new(block)),
                order_by: vec![OrderPlan {
                    column: 0,
                    direction: SortDirection::Desc,
                }],
                skip: Some(1),
                take: Some(2),
                columns: Vec::new(),
                hidden: 0,
            },
        };
        let text = plan.to_string();
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        assert_eq!(
            lines,
            vec![
                "statement []",
                "block s1 width=0",
                "filter true",
                "project [1]",
                "distinct",
                "order by #0 desc",
                "skip 1",
                "take 2",
            ]
        );
        assert!(plan.join_strategies().is_empty());
    }
}
