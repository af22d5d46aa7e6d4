//! Typed query model produced by the metadata pass.
//!
//! Every expression carries its [`SemanticType`]. Column references are bound
//! to a flat offset into the joined row of their query block, so later passes
//! never look names up again.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use musoq_ast::{BinaryOp, CompoundOp, JoinKind, SortDirection, Span, UnaryOp};
use musoq_schema::{ResolvedAggregate, ResolvedMethod, Schema};
use musoq_types::{SchemaColumn, SemanticType, TypeKind, Value};

use crate::scope::{JoinStrategy, ScopeId};

/// A column bound to a source of the enclosing block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundColumn {
    /// Index of the source within the block (0 = FROM, then joins).
    pub source: usize,
    pub alias: String,
    pub name: String,
    /// Index of the column within its source.
    pub index: usize,
    /// Offset into the block's joined row.
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub enum TypedExprKind {
    Literal(Value),
    Column(BoundColumn),
    Binary {
        left: Box<TypedExpr>,
        op: BinaryOp,
        right: Box<TypedExpr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<TypedExpr>,
    },
    Call {
        name: String,
        method: ResolvedMethod,
        args: Vec<TypedExpr>,
        /// Source whose row context is injected, for methods that ask for it.
        context_source: Option<usize>,
    },
    Aggregate {
        name: String,
        method: ResolvedAggregate,
        args: Vec<TypedExpr>,
    },
    Case {
        whens: Vec<(TypedExpr, TypedExpr)>,
        else_expr: Option<Box<TypedExpr>>,
    },
    In {
        expr: Box<TypedExpr>,
        list: Vec<TypedExpr>,
        not: bool,
    },
    Like {
        expr: Box<TypedExpr>,
        pattern: Box<TypedExpr>,
        not: bool,
    },
    IsNull {
        expr: Box<TypedExpr>,
        not: bool,
    },
    /// Widening conversion inserted by the rewrite pass.
    Convert {
        expr: Box<TypedExpr>,
        kind: TypeKind,
    },
    /// i-th GROUP BY key of the enclosing grouped block.
    GroupKey(usize),
    /// j-th aggregate slot of the enclosing grouped block.
    AggregateSlot(usize),
}

#[derive(Debug, Clone)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub ty: SemanticType,
    pub span: Span,
}

impl TypedExpr {
    #[must_use]
    pub const fn new(kind: TypedExprKind, ty: SemanticType, span: Span) -> Self {
        Self { kind, ty, span }
    }

    /// Direct children in evaluation order.
    #[must_use]
    pub fn children(&self) -> Vec<&Self> {
        match &self.kind {
            TypedExprKind::Literal(_)
            | TypedExprKind::Column(_)
            | TypedExprKind::GroupKey(_)
            | TypedExprKind::AggregateSlot(_) => Vec::new(),
            TypedExprKind::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            TypedExprKind::Unary { expr, .. }
            | TypedExprKind::IsNull { expr, .. }
            | TypedExprKind::Convert { expr, .. } => vec![expr.as_ref()],
            TypedExprKind::Call { args, .. } | TypedExprKind::Aggregate { args, .. } => {
                args.iter().collect()
            }
            TypedExprKind::Case { whens, else_expr } => {
                let mut out: Vec<&Self> = whens.iter().flat_map(|(w, t)| [w, t]).collect();
                out.extend(else_expr.as_deref());
                out
            }
            TypedExprKind::In { expr, list, .. } => {
                let mut out = vec![expr.as_ref()];
                out.extend(list);
                out
            }
            TypedExprKind::Like { expr, pattern, .. } => vec![expr.as_ref(), pattern.as_ref()],
        }
    }

    /// Rebuild this node with every direct child passed through `f`.
    pub fn map_children(
        self,
        f: &mut impl FnMut(Self) -> musoq_error::Result<Self>,
    ) -> musoq_error::Result<Self> {
        let Self { kind, ty, span } = self;
        let kind = match kind {
            k @ (TypedExprKind::Literal(_)
            | TypedExprKind::Column(_)
            | TypedExprKind::GroupKey(_)
            | TypedExprKind::AggregateSlot(_)) => k,
            TypedExprKind::Binary { left, op, right } => TypedExprKind::Binary {
                left: f(*left).map(Box::new)?,
                op,
                right: f(*right).map(Box::new)?,
            },
            TypedExprKind::Unary { op, expr } => TypedExprKind::Unary {
                op,
                expr: f(*expr).map(Box::new)?,
            },
            TypedExprKind::Call {
                name,
                method,
                args,
                context_source,
            } => TypedExprKind::Call {
                name,
                method,
                args: args.into_iter().map(&mut *f).collect::<musoq_error::Result<_>>()?,
                context_source,
            },
            TypedExprKind::Aggregate { name, method, args } => TypedExprKind::Aggregate {
                name,
                method,
                args: args.into_iter().map(&mut *f).collect::<musoq_error::Result<_>>()?,
            },
            TypedExprKind::Case { whens, else_expr } => TypedExprKind::Case {
                whens: whens
                    .into_iter()
                    .map(|(w, t)| -> musoq_error::Result<_> { Ok((f(w)?, f(t)?)) })
                    .collect::<musoq_error::Result<_>>()?,
                else_expr: else_expr.map(|e| f(*e).map(Box::new)).transpose()?,
            },
            TypedExprKind::In { expr, list, not } => TypedExprKind::In {
                expr: f(*expr).map(Box::new)?,
                list: list.into_iter().map(&mut *f).collect::<musoq_error::Result<_>>()?,
                not,
            },
            TypedExprKind::Like { expr, pattern, not } => TypedExprKind::Like {
                expr: f(*expr).map(Box::new)?,
                pattern: f(*pattern).map(Box::new)?,
                not,
            },
            TypedExprKind::IsNull { expr, not } => TypedExprKind::IsNull {
                expr: f(*expr).map(Box::new)?,
                not,
            },
            TypedExprKind::Convert { expr, kind } => TypedExprKind::Convert {
                expr: f(*expr).map(Box::new)?,
                kind,
            },
        };
        Ok(Self { kind, ty, span })
    }

    /// Whether any node satisfies `pred`.
    pub fn any(&self, pred: &mut impl FnMut(&Self) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        self.children().into_iter().any(|c| c.any(pred))
    }

    #[must_use]
    pub fn contains_aggregate(&self) -> bool {
        self.any(&mut |e| matches!(e.kind, TypedExprKind::Aggregate { .. }))
    }

    #[must_use]
    pub fn references_columns(&self) -> bool {
        self.any(&mut |e| matches!(e.kind, TypedExprKind::Column(_)))
    }

    /// Smallest and largest column offset referenced, if any.
    #[must_use]
    pub fn offset_range(&self) -> Option<(usize, usize)> {
        let mut range: Option<(usize, usize)> = None;
        self.any(&mut |e| {
            if let TypedExprKind::Column(c) = &e.kind {
                range = Some(match range {
                    None => (c.offset, c.offset),
                    Some((lo, hi)) => (lo.min(c.offset), hi.max(c.offset)),
                });
            }
            false
        });
        range
    }

    /// Canonical text used to match GROUP BY keys and deduplicate aggregate
    /// slots. Columns print as their flat offset, method names uppercased.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        self.write_fingerprint(&mut out);
        out
    }

    fn write_fingerprint(&self, out: &mut String) {
        match &self.kind {
            TypedExprKind::Literal(v) => {
                let _ = write!(out, "{}:{v:?}", v.kind());
            }
            TypedExprKind::Column(c) => {
                let _ = write!(out, "#{}", c.offset);
            }
            TypedExprKind::Binary { left, op, right } => {
                out.push('(');
                left.write_fingerprint(out);
                let _ = write!(out, " {op:?} ");
                right.write_fingerprint(out);
                out.push(')');
            }
            TypedExprKind::Unary { op, expr } => {
                let _ = write!(out, "{op:?}(");
                expr.write_fingerprint(out);
                out.push(')');
            }
            TypedExprKind::Call { name, args, .. } | TypedExprKind::Aggregate { name, args, .. } => {
                out.push_str(&name.to_ascii_uppercase());
                write_list(out, args);
            }
            TypedExprKind::Case { whens, else_expr } => {
                out.push_str("CASE");
                for (w, t) in whens {
                    out.push_str(" WHEN ");
                    w.write_fingerprint(out);
                    out.push_str(" THEN ");
                    t.write_fingerprint(out);
                }
                if let Some(e) = else_expr {
                    out.push_str(" ELSE ");
                    e.write_fingerprint(out);
                }
                out.push_str(" END");
            }
            TypedExprKind::In { expr, list, not } => {
                expr.write_fingerprint(out);
                out.push_str(if *not { " NOT IN " } else { " IN " });
                write_list(out, list);
            }
            TypedExprKind::Like { expr, pattern, not } => {
                expr.write_fingerprint(out);
                out.push_str(if *not { " NOT LIKE " } else { " LIKE " });
                pattern.write_fingerprint(out);
            }
            TypedExprKind::IsNull { expr, not } => {
                expr.write_fingerprint(out);
                out.push_str(if *not { " IS NOT NULL" } else { " IS NULL" });
            }
            TypedExprKind::Convert { expr, kind } => {
                let _ = write!(out, "{kind}(");
                expr.write_fingerprint(out);
                out.push(')');
            }
            TypedExprKind::GroupKey(i) => {
                let _ = write!(out, "key{i}");
            }
            TypedExprKind::AggregateSlot(j) => {
                let _ = write!(out, "agg{j}");
            }
        }
    }
}

fn write_list(out: &mut String, items: &[TypedExpr]) {
    out.push('(');
    for (i, a) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        a.write_fingerprint(out);
    }
    out.push(')');
}

impl fmt::Display for TypedExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

// ── Sources ───────────────────────────────────────────────────────────────

/// Where a bound source reads its rows from.
#[derive(Clone)]
pub enum SourceKind {
    Schema {
        schema: Arc<dyn Schema>,
        schema_name: String,
        table: String,
        args: Vec<TypedExpr>,
        /// Arguments reference columns of earlier sources (APPLY).
        correlated: bool,
    },
    /// Global CTE index.
    Cte(usize),
    Subquery(Box<BoundStatement>),
}

impl fmt::Debug for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Schema {
                schema_name,
                table,
                args,
                correlated,
                ..
            } => f
                .debug_struct("Schema")
                .field("schema", schema_name)
                .field("table", table)
                .field("args", &args.len())
                .field("correlated", correlated)
                .finish_non_exhaustive(),
            Self::Cte(i) => f.debug_tuple("Cte").field(i).finish(),
            Self::Subquery(s) => f.debug_tuple("Subquery").field(s).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundSource {
    pub alias: String,
    /// Query-wide ordinal in FROM/JOIN/APPLY order.
    pub position: u32,
    pub kind: SourceKind,
    /// Columns as seen by expressions of the block (nullability adjusted
    /// for outer joins).
    pub columns: Vec<SchemaColumn>,
    /// Offset of the first column in the block's joined row.
    pub offset: usize,
    pub scope: ScopeId,
}

/// One equality pair of an equi-join, left side over the joined row so far,
/// right side over the joined row including the new source.
#[derive(Debug, Clone)]
pub struct JoinKeyPair {
    pub left: TypedExpr,
    pub right: TypedExpr,
    /// Unified key kind both sides are compared in.
    pub kind: TypeKind,
}

/// How `sources[i + 1]` of a block joins the rows before it.
#[derive(Debug, Clone)]
pub struct BoundJoin {
    pub kind: JoinKind,
    pub on: Option<TypedExpr>,
    /// Chosen by the rewrite pass.
    pub strategy: Option<JoinStrategy>,
    pub keys: Vec<JoinKeyPair>,
}

// ── Blocks and statements ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub name: String,
    pub expr: TypedExpr,
}

/// Grouping computed by the rewrite pass.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub keys: Vec<TypedExpr>,
    /// Aggregate calls in slot order; arguments are refresh expressions over
    /// the joined row.
    pub aggregates: Vec<TypedExpr>,
}

/// One SELECT with its sources.
#[derive(Debug, Clone)]
pub struct BoundBlock {
    pub scope: ScopeId,
    pub distinct: bool,
    /// FROM source followed by joined and applied sources.
    pub sources: Vec<BoundSource>,
    pub joins: Vec<BoundJoin>,
    pub filter: Option<TypedExpr>,
    pub group_by: Vec<TypedExpr>,
    pub having: Option<TypedExpr>,
    /// Visible columns followed by hidden ORDER BY columns.
    pub projection: Vec<OutputColumn>,
    pub hidden: usize,
    /// Any aggregate call appears in the SELECT list, HAVING or ORDER BY.
    pub has_aggregates: bool,
    /// Set by the rewrite pass for grouped blocks.
    pub group: Option<GroupSpec>,
    /// Width of the joined row.
    pub width: usize,
}

impl BoundBlock {
    #[must_use]
    pub fn is_grouped(&self) -> bool {
        self.has_aggregates || !self.group_by.is_empty()
    }

    /// Visible output columns.
    #[must_use]
    pub fn visible(&self) -> &[OutputColumn] {
        &self.projection[..self.projection.len() - self.hidden]
    }
}

#[derive(Debug, Clone)]
pub struct BoundOrderTerm {
    /// Index into the statement's output row (visible or hidden).
    pub column: usize,
    pub direction: SortDirection,
}

#[derive(Debug, Clone)]
pub struct BoundCte {
    pub name: String,
    pub scope: ScopeId,
    pub statement: BoundStatement,
}

#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub scope: ScopeId,
    /// First branch, then `(op, branch)` pairs combined left to right.
    pub first: BoundBlock,
    pub compounds: Vec<(CompoundOp, BoundBlock)>,
    pub order_by: Vec<BoundOrderTerm>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
    /// Visible output columns of the whole statement.
    pub columns: Vec<SchemaColumn>,
}

impl BoundStatement {
    pub fn blocks(&self) -> impl Iterator<Item = &BoundBlock> {
        std::iter::once(&self.first).chain(self.compounds.iter().map(|(_, b)| b))
    }
}

/// Output of the metadata pass for a whole query.
#[derive(Debug, Clone)]
pub struct BoundQuery {
    /// CTEs in definition order; [`SourceKind::Cte`] indexes this list.
    pub ctes: Vec<BoundCte>,
    pub root: BoundStatement,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(offset: usize) -> TypedExpr {
        TypedExpr::new(
            TypedExprKind::Column(BoundColumn {
                source: 0,
                alias: "a".into(),
                name: format!("c{offset}"),
                index: offset,
                offset,
            }),
            SemanticType::non_null(TypeKind::Int),
            Span::ZERO,
        )
    }

    fn lit(v: i32) -> TypedExpr {
        TypedExpr::new(
            TypedExprKind::Literal(Value::Int(v)),
            SemanticType::non_null(TypeKind::Int),
            Span::ZERO,
        )
    }

    fn add(l: TypedExpr, r: TypedExpr) -> TypedExpr {
        TypedExpr::new(
            TypedExprKind::Binary {
                left: Box::new(l),
                op: BinaryOp::Add,
                right: Box::new(r),
            },
            SemanticType::non_null(TypeKind::Int),
            Span::new(3, 9),
        )
    }

    #[test]
    fn fingerprint_ignores_spans_and_names() {
        let a = add(col(2), lit(1));
        let mut b = add(col(2), lit(1));
        b.span = Span::new(40, 50);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), add(col(3), lit(1)).fingerprint());
        assert_eq!(a.fingerprint(), "(#2 Add Int:Int(1))");
    }

    #[test]
    fn offset_range_spans_all_columns() {
        let e = add(col(4), add(col(1), lit(0)));
        assert_eq!(e.offset_range(), Some((1, 4)));
        assert_eq!(lit(3).offset_range(), None);
        assert!(e.references_columns());
        assert!(!e.contains_aggregate());
    }
}
