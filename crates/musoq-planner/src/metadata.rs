//! Metadata and type-inference pass.
//!
//! Walks the AST once, FROM before every other clause, and produces a
//! [`BoundQuery`] plus the [`ScopeArena`] it built on the way. Sources are
//! resolved through the [`SchemaProvider`], columns to flat offsets, calls to
//! registry overloads. The first unresolved name aborts the pass.

use std::collections::HashMap;
use std::sync::Arc;

use musoq_ast::{
    BinaryOp, ColumnRef, CompoundOp, Cte, Expr, FromSource, JoinKind, Literal, OrderingTerm, ResultColumn,
    SelectCore, SelectStatement, Span, UnaryOp,
};
use musoq_error::{MusoqError, Result};
use musoq_schema::{
    MethodRegistry, MethodSignature, ReturnType, RuntimeContext, Schema, SchemaProvider,
};
use musoq_types::{CancellationToken, SchemaColumn, SemanticType, TypeKind, Value};
use tracing::debug;

use crate::scope::{ScopeArena, ScopeId, ScopeKind, Symbol};
use crate::typed::{
    BoundBlock, BoundColumn, BoundCte, BoundJoin, BoundOrderTerm, BoundQuery, BoundSource,
    BoundStatement, OutputColumn, SourceKind, TypedExpr, TypedExprKind,
};

/// Environment variables per query-wide source position.
pub type EnvironmentVariables = HashMap<u32, HashMap<String, String>>;

/// Result of the metadata pass.
#[derive(Debug)]
pub struct MetadataOutput {
    pub query: BoundQuery,
    pub scopes: ScopeArena,
    pub columns_bound: usize,
}

/// Clause an expression is bound in; decides where aggregates may appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    Select,
    Where,
    GroupBy,
    Having,
    OrderBy,
    On,
    FromArgs,
}

impl Clause {
    const fn allows_aggregates(self) -> bool {
        matches!(self, Self::Select | Self::Having | Self::OrderBy)
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Where => "WHERE",
            Self::GroupBy => "GROUP BY",
            Self::Having => "HAVING",
            Self::OrderBy => "ORDER BY",
            Self::On => "ON",
            Self::FromArgs => "FROM arguments",
        }
    }
}

/// Bind and type-check a parsed statement.
pub fn analyze(
    stmt: &SelectStatement,
    provider: &dyn SchemaProvider,
    environment: &EnvironmentVariables,
    token: &CancellationToken,
) -> Result<MetadataOutput> {
    let span = tracing::debug_span!(
        target: "musoq.metadata",
        "metadata",
        scopes = tracing::field::Empty,
        columns_bound = tracing::field::Empty,
    );
    let _guard = span.enter();

    let mut binder = Binder {
        provider,
        environment,
        token,
        arena: ScopeArena::new(),
        base: MethodRegistry::with_base_library(),
        ctes: Vec::new(),
        visible_ctes: Vec::new(),
        next_position: 0,
        columns_bound: 0,
    };
    let root = binder.bind_statement(stmt, None, ScopeKind::Query)?;

    span.record("scopes", binder.arena.len());
    span.record("columns_bound", binder.columns_bound);
    Ok(MetadataOutput {
        query: BoundQuery {
            ctes: binder.ctes,
            root,
        },
        scopes: binder.arena,
        columns_bound: binder.columns_bound,
    })
}

struct Binder<'a> {
    provider: &'a dyn SchemaProvider,
    environment: &'a EnvironmentVariables,
    token: &'a CancellationToken,
    arena: ScopeArena,
    /// Library for FROM-less queries and names no source schema defines.
    base: MethodRegistry,
    ctes: Vec<BoundCte>,
    /// `(name, index into ctes)` visible at the current point, innermost last.
    visible_ctes: Vec<(String, usize)>,
    next_position: u32,
    columns_bound: usize,
}

fn width(sources: &[BoundSource]) -> usize {
    sources.iter().map(|s| s.columns.len()).sum()
}

fn find_source<'s>(sources: &'s [BoundSource], alias: &str) -> Result<(usize, &'s BoundSource)> {
    sources
        .iter()
        .enumerate()
        .find(|(_, s)| s.alias.eq_ignore_ascii_case(alias))
        .ok_or_else(|| MusoqError::SourceNotFound {
            name: alias.to_owned(),
        })
}

fn schema_of(source: &BoundSource) -> Option<&Arc<dyn Schema>> {
    match &source.kind {
        SourceKind::Schema { schema, .. } => Some(schema),
        SourceKind::Cte(_) | SourceKind::Subquery(_) => None,
    }
}

fn literal_value(lit: &Literal) -> (Value, SemanticType) {
    match lit {
        Literal::Int(i) => (Value::Int(*i), SemanticType::non_null(TypeKind::Int)),
        Literal::Long(i) => (Value::Long(*i), SemanticType::non_null(TypeKind::Long)),
        Literal::Decimal(d) => (Value::Decimal(*d), SemanticType::non_null(TypeKind::Decimal)),
        Literal::Double(f) => (Value::Double(*f), SemanticType::non_null(TypeKind::Double)),
        Literal::String(s) => (Value::String(s.clone()), SemanticType::non_null(TypeKind::String)),
        Literal::Bool(b) => (Value::Bool(*b), SemanticType::BOOL),
        Literal::Null => (Value::Null, SemanticType::NULL),
    }
}

/// Compile-time value of a FROM argument, or NULL when it depends on rows.
fn placeholder_value(expr: &TypedExpr) -> Value {
    match &expr.kind {
        TypedExprKind::Literal(v) => v.clone(),
        TypedExprKind::Unary {
            op: UnaryOp::Negate,
            expr,
        } => match &expr.kind {
            TypedExprKind::Literal(v) => v.negate().unwrap_or(Value::Null),
            _ => Value::Null,
        },
        _ => Value::Null,
    }
}

fn default_name(expr: &Expr) -> String {
    match expr {
        Expr::Column(c, _) => c.name.clone(),
        other => other.to_string(),
    }
}

const fn loose(kind: TypeKind) -> bool {
    matches!(kind, TypeKind::Null | TypeKind::Any)
}

fn comparable(a: TypeKind, b: TypeKind) -> bool {
    a == b || loose(a) || loose(b) || (a.is_numeric() && b.is_numeric())
}

fn is_boolish(kind: TypeKind) -> bool {
    kind == TypeKind::Bool || loose(kind)
}

fn expect_bool(expr: &TypedExpr, context: &str) -> Result<()> {
    if is_boolish(expr.ty.kind) {
        Ok(())
    } else {
        Err(MusoqError::type_mismatch(context, "Bool", expr.ty.to_string()))
    }
}

/// Result type of a binary operator.
pub(crate) fn binary_type(op: BinaryOp, l: SemanticType, r: SemanticType) -> Result<SemanticType> {
    let nullable = l.nullable || r.nullable;
    let mismatch = |expected: &str| {
        MusoqError::type_mismatch(format!("operator {op}"), expected, format!("{l} and {r}"))
    };
    let kind = if op.is_arithmetic() {
        if op == BinaryOp::Add && (l.kind == TypeKind::String || r.kind == TypeKind::String) {
            TypeKind::String
        } else {
            l.kind.promote(r.kind).ok_or_else(|| mismatch("numeric operands"))?
        }
    } else if op.is_comparison() {
        if !comparable(l.kind, r.kind) {
            return Err(mismatch("comparable operands"));
        }
        TypeKind::Bool
    } else if op.is_logical() {
        if !(is_boolish(l.kind) && is_boolish(r.kind)) {
            return Err(mismatch("Bool operands"));
        }
        TypeKind::Bool
    } else {
        let integral = |k: TypeKind| k.is_integral() || loose(k);
        if !(integral(l.kind) && integral(r.kind)) {
            return Err(mismatch("integral operands"));
        }
        l.kind.promote(r.kind).ok_or_else(|| mismatch("integral operands"))?
    };
    Ok(SemanticType::new(kind, nullable || kind == TypeKind::Null))
}

fn unary_type(op: UnaryOp, t: SemanticType) -> Result<SemanticType> {
    let ok = match op {
        UnaryOp::Negate => t.kind.is_numeric() || loose(t.kind),
        UnaryOp::BitNot => t.kind.is_integral() || loose(t.kind),
        UnaryOp::Not => is_boolish(t.kind),
    };
    if !ok {
        let expected = match op {
            UnaryOp::Negate => "numeric operand",
            UnaryOp::BitNot => "integral operand",
            UnaryOp::Not => "Bool operand",
        };
        return Err(MusoqError::type_mismatch(
            format!("operator {op}"),
            expected,
            t.to_string(),
        ));
    }
    Ok(match op {
        UnaryOp::Not => SemanticType::new(TypeKind::Bool, t.nullable),
        UnaryOp::Negate | UnaryOp::BitNot => t,
    })
}

impl Binder<'_> {
    // ── Statements ────────────────────────────────────────────────────────

    fn bind_statement(
        &mut self,
        stmt: &SelectStatement,
        parent: Option<ScopeId>,
        kind: ScopeKind,
    ) -> Result<BoundStatement> {
        let scope = self.arena.push(parent, kind)?;
        let cte_mark = self.visible_ctes.len();
        if let Some(with) = &stmt.with {
            for cte in &with.ctes {
                self.bind_cte(cte, scope)?;
            }
        }

        let mut first = self.bind_block(&stmt.body.select, scope)?;
        let mut compounds = Vec::with_capacity(stmt.body.compounds.len());
        for (op, core) in &stmt.body.compounds {
            compounds.push((*op, self.bind_block(core, scope)?));
        }
        let order_by = self.bind_order_by(&stmt.order_by, &mut first, compounds.is_empty())?;

        let columns = set_columns(&first, &compounds)?;
        if !compounds.is_empty() {
            self.arena.add_symbol(
                scope,
                Symbol::SetShape {
                    ops: compounds.iter().map(|(op, _)| *op).collect(),
                    arity: columns.len(),
                },
            )?;
        }
        self.arena
            .add_symbol(scope, Symbol::OutputColumns(columns.clone()))?;
        self.visible_ctes.truncate(cte_mark);

        Ok(BoundStatement {
            scope,
            first,
            compounds,
            order_by,
            skip: stmt.skip,
            take: stmt.take,
            columns,
        })
    }

    fn bind_cte(&mut self, cte: &Cte, parent: ScopeId) -> Result<()> {
        if self
            .visible_ctes
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(&cte.name))
        {
            return Err(MusoqError::semantic(format!(
                "CTE {} is defined more than once",
                cte.name
            )));
        }
        let statement = self.bind_statement(&cte.query, Some(parent), ScopeKind::Cte)?;
        self.arena.add_symbol(
            statement.scope,
            Symbol::CteOutput {
                name: cte.name.clone(),
                columns: statement.columns.clone(),
            },
        )?;
        let index = self.ctes.len();
        debug!(target: "musoq.metadata", cte = %cte.name, index, columns = statement.columns.len(), "cte bound");
        self.ctes.push(BoundCte {
            name: cte.name.clone(),
            scope: statement.scope,
            statement,
        });
        self.visible_ctes.push((cte.name.clone(), index));
        Ok(())
    }

    // ── Blocks ────────────────────────────────────────────────────────────

    fn bind_block(&mut self, core: &SelectCore, parent: ScopeId) -> Result<BoundBlock> {
        let scope = self.arena.push(Some(parent), ScopeKind::Branch)?;
        let mut sources: Vec<BoundSource> = Vec::new();
        let mut joins = Vec::new();

        if let Some(from) = &core.from {
            let first = self.bind_source(&from.source, scope, &[], 0)?;
            sources.push(first);
            for join in &from.joins {
                let outer: &[BoundSource] = if join.kind.is_apply() { &sources } else { &[] };
                let source = self.bind_source(&join.source, scope, outer, width(&sources))?;
                if sources.iter().any(|s| s.alias.eq_ignore_ascii_case(&source.alias)) {
                    return Err(MusoqError::semantic(format!(
                        "source alias {} is used more than once",
                        source.alias
                    )));
                }
                sources.push(source);
                let on = match &join.on {
                    Some(e) => {
                        let bound = self.bind_expr(e, &sources, Clause::On, false)?;
                        expect_bool(&bound, "ON")?;
                        Some(bound)
                    }
                    None => None,
                };
                let last = sources.len() - 1;
                match join.kind {
                    JoinKind::LeftOuter | JoinKind::OuterApply => mark_nullable(&mut sources[last]),
                    JoinKind::RightOuter => sources[..last].iter_mut().for_each(mark_nullable),
                    JoinKind::Inner | JoinKind::CrossApply => {}
                }
                joins.push(BoundJoin {
                    kind: join.kind,
                    on,
                    strategy: None,
                    keys: Vec::new(),
                });
            }
        }

        let filter = match &core.where_clause {
            Some(e) => {
                let bound = self.bind_expr(e, &sources, Clause::Where, false)?;
                expect_bool(&bound, "WHERE")?;
                Some(bound)
            }
            None => None,
        };
        let group_by = core
            .group_by
            .iter()
            .map(|e| self.bind_expr(e, &sources, Clause::GroupBy, false))
            .collect::<Result<Vec<_>>>()?;

        let mut projection = Vec::new();
        let mut aliases: Vec<&str> = Vec::new();
        for rc in &core.columns {
            match rc {
                ResultColumn::Star => {
                    for (si, s) in sources.iter().enumerate() {
                        projection.extend(star_columns(si, s));
                    }
                }
                ResultColumn::TableStar(alias) => {
                    let (si, s) = find_source(&sources, alias)?;
                    projection.extend(star_columns(si, s));
                }
                ResultColumn::Expr { expr, alias } => {
                    if let Some(a) = alias {
                        if aliases.iter().any(|x| x.eq_ignore_ascii_case(a)) {
                            return Err(MusoqError::semantic(format!(
                                "column alias {a} is used more than once"
                            )));
                        }
                        aliases.push(a);
                    }
                    let bound = self.bind_expr(expr, &sources, Clause::Select, false)?;
                    projection.push(OutputColumn {
                        name: alias.clone().unwrap_or_else(|| default_name(expr)),
                        expr: bound,
                    });
                }
            }
        }
        self.columns_bound += projection.len();

        let having = match &core.having {
            Some(e) => {
                let bound = self.bind_expr(e, &sources, Clause::Having, false)?;
                expect_bool(&bound, "HAVING")?;
                Some(bound)
            }
            None => None,
        };
        let has_aggregates = projection.iter().any(|c| c.expr.contains_aggregate())
            || having.as_ref().is_some_and(TypedExpr::contains_aggregate);
        if having.is_some() && !has_aggregates && group_by.is_empty() {
            return Err(MusoqError::semantic(
                "HAVING requires GROUP BY or an aggregate",
            ));
        }

        let block_width = width(&sources);
        Ok(BoundBlock {
            scope,
            distinct: core.distinct,
            sources,
            joins,
            filter,
            group_by,
            having,
            projection,
            hidden: 0,
            has_aggregates,
            group: None,
            width: block_width,
        })
    }

    fn bind_order_by(
        &mut self,
        terms: &[OrderingTerm],
        block: &mut BoundBlock,
        single_branch: bool,
    ) -> Result<Vec<BoundOrderTerm>> {
        let mut out = Vec::with_capacity(terms.len());
        for term in terms {
            if let Expr::Column(ColumnRef { qualifier: None, name }, _) = &term.expr {
                if let Some(i) = block
                    .visible()
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
                {
                    out.push(BoundOrderTerm {
                        column: i,
                        direction: term.direction,
                    });
                    continue;
                }
            }
            if !single_branch {
                return Err(MusoqError::semantic(format!(
                    "ORDER BY term {} must name an output column of the set operation",
                    term.expr
                )));
            }
            let bound = self.bind_expr(&term.expr, &block.sources, Clause::OrderBy, false)?;
            let fp = bound.fingerprint();
            let column = if let Some(i) = block
                .visible()
                .iter()
                .position(|c| c.expr.fingerprint() == fp)
            {
                i
            } else {
                if block.distinct {
                    return Err(MusoqError::semantic(format!(
                        "ORDER BY term {} must appear in the SELECT list of a DISTINCT query",
                        term.expr
                    )));
                }
                block.has_aggregates |= bound.contains_aggregate();
                block.projection.push(OutputColumn {
                    name: format!("__order{}", block.hidden),
                    expr: bound,
                });
                block.hidden += 1;
                block.projection.len() - 1
            };
            out.push(BoundOrderTerm {
                column,
                direction: term.direction,
            });
        }
        Ok(out)
    }

    // ── Sources ───────────────────────────────────────────────────────────

    fn bind_source(
        &mut self,
        source: &FromSource,
        parent: ScopeId,
        outer: &[BoundSource],
        offset: usize,
    ) -> Result<BoundSource> {
        let scope = self.arena.push(Some(parent), ScopeKind::Source)?;
        let position = self.next_position;
        self.next_position += 1;

        let (alias, kind, columns, symbol) = match source {
            FromSource::SchemaMethod {
                schema,
                method,
                args,
                alias,
                ..
            } => {
                let resolved = self.provider.get_schema(schema)?;
                let bound_args = args
                    .iter()
                    .map(|a| self.bind_expr(a, outer, Clause::FromArgs, false))
                    .collect::<Result<Vec<_>>>()?;
                let kinds: Vec<TypeKind> = bound_args.iter().map(|a| a.ty.kind).collect();
                resolved.validate_constructor(method, &kinds)?;

                let alias = alias.clone().unwrap_or_else(|| method.clone());
                let correlated = bound_args.iter().any(TypedExpr::references_columns);
                let values: Vec<Value> = bound_args.iter().map(placeholder_value).collect();
                let cx = RuntimeContext::new(self.token.clone(), position, alias.clone())
                    .with_environment(
                        self.environment.get(&position).cloned().unwrap_or_default(),
                    )
                    .correlated(correlated);
                let descriptor = resolved.get_table(method, &cx, &values)?;
                debug!(
                    target: "musoq.metadata",
                    schema = %schema,
                    table = %method,
                    alias = %alias,
                    position,
                    columns = descriptor.columns.len(),
                    correlated,
                    "source bound"
                );
                let symbol = Symbol::Table {
                    alias: alias.clone(),
                    schema: Some(schema.clone()),
                    table: method.clone(),
                    columns: descriptor.columns.clone(),
                    position,
                };
                let kind = SourceKind::Schema {
                    schema: resolved,
                    schema_name: schema.clone(),
                    table: method.clone(),
                    args: bound_args,
                    correlated,
                };
                (alias, kind, descriptor.columns, symbol)
            }
            FromSource::Reference { name, alias, .. } => {
                let index = self
                    .visible_ctes
                    .iter()
                    .rev()
                    .find(|(n, _)| n.eq_ignore_ascii_case(name))
                    .map(|(_, i)| *i)
                    .ok_or_else(|| MusoqError::SourceNotFound { name: name.clone() })?;
                let columns = self.ctes[index].statement.columns.clone();
                let alias = alias.clone().unwrap_or_else(|| name.clone());
                let symbol = Symbol::Table {
                    alias: alias.clone(),
                    schema: None,
                    table: name.clone(),
                    columns: columns.clone(),
                    position,
                };
                (alias, SourceKind::Cte(index), columns, symbol)
            }
            FromSource::Subquery { query, alias, .. } => {
                let statement = self.bind_statement(query, Some(scope), ScopeKind::Subquery)?;
                let alias = alias.clone().unwrap_or_else(|| format!("subquery{position}"));
                let columns = statement.columns.clone();
                let symbol = Symbol::Table {
                    alias: alias.clone(),
                    schema: None,
                    table: alias.clone(),
                    columns: columns.clone(),
                    position,
                };
                (alias, SourceKind::Subquery(Box::new(statement)), columns, symbol)
            }
        };
        self.arena.add_symbol(scope, symbol)?;
        Ok(BoundSource {
            alias,
            position,
            kind,
            columns,
            offset,
            scope,
        })
    }

    // ── Expressions ───────────────────────────────────────────────────────

    fn bind_expr(
        &mut self,
        expr: &Expr,
        sources: &[BoundSource],
        clause: Clause,
        in_aggregate: bool,
    ) -> Result<TypedExpr> {
        let span = expr.span();
        match expr {
            Expr::Literal(lit, _) => {
                let (value, ty) = literal_value(lit);
                Ok(TypedExpr::new(TypedExprKind::Literal(value), ty, span))
            }
            Expr::Column(col, _) => bind_column(col, span, sources),
            Expr::BinaryOp {
                left, op, right, ..
            } => {
                let l = self.bind_expr(left, sources, clause, in_aggregate)?;
                let r = self.bind_expr(right, sources, clause, in_aggregate)?;
                let ty = binary_type(*op, l.ty, r.ty)?;
                Ok(TypedExpr::new(
                    TypedExprKind::Binary {
                        left: Box::new(l),
                        op: *op,
                        right: Box::new(r),
                    },
                    ty,
                    span,
                ))
            }
            Expr::UnaryOp { op, expr: inner, .. } => {
                let e = self.bind_expr(inner, sources, clause, in_aggregate)?;
                let ty = unary_type(*op, e.ty)?;
                Ok(TypedExpr::new(
                    TypedExprKind::Unary {
                        op: *op,
                        expr: Box::new(e),
                    },
                    ty,
                    span,
                ))
            }
            Expr::FunctionCall {
                qualifier,
                name,
                args,
                ..
            } => self.bind_call(
                qualifier.as_deref(),
                name,
                args,
                span,
                sources,
                clause,
                in_aggregate,
            ),
            Expr::Case {
                whens, else_expr, ..
            } => {
                let mut bound = Vec::with_capacity(whens.len());
                let mut result: Option<SemanticType> = None;
                for (cond, then) in whens {
                    let c = self.bind_expr(cond, sources, clause, in_aggregate)?;
                    expect_bool(&c, "CASE WHEN")?;
                    let t = self.bind_expr(then, sources, clause, in_aggregate)?;
                    result = Some(unify_branch(result, t.ty)?);
                    bound.push((c, t));
                }
                let else_bound = match else_expr {
                    Some(e) => {
                        let e = self.bind_expr(e, sources, clause, in_aggregate)?;
                        result = Some(unify_branch(result, e.ty)?);
                        Some(Box::new(e))
                    }
                    None => None,
                };
                let mut ty = result.unwrap_or(SemanticType::NULL);
                if else_bound.is_none() {
                    ty = ty.with_nullable(true);
                }
                let bound = bound
                    .into_iter()
                    .map(|(c, t)| (c, convert_to(t, ty.kind)))
                    .collect();
                let else_bound = else_bound.map(|e| Box::new(convert_to(*e, ty.kind)));
                Ok(TypedExpr::new(
                    TypedExprKind::Case {
                        whens: bound,
                        else_expr: else_bound,
                    },
                    ty,
                    span,
                ))
            }
            Expr::In {
                expr: inner,
                list,
                not,
                ..
            } => {
                let e = self.bind_expr(inner, sources, clause, in_aggregate)?;
                let mut nullable = e.ty.nullable;
                let mut items = Vec::with_capacity(list.len());
                for item in list {
                    let b = self.bind_expr(item, sources, clause, in_aggregate)?;
                    if !comparable(e.ty.kind, b.ty.kind) {
                        return Err(MusoqError::type_mismatch(
                            "IN list",
                            e.ty.to_string(),
                            b.ty.to_string(),
                        ));
                    }
                    nullable |= b.ty.nullable;
                    items.push(b);
                }
                Ok(TypedExpr::new(
                    TypedExprKind::In {
                        expr: Box::new(e),
                        list: items,
                        not: *not,
                    },
                    SemanticType::new(TypeKind::Bool, nullable),
                    span,
                ))
            }
            Expr::Like {
                expr: inner,
                pattern,
                not,
                ..
            } => {
                let e = self.bind_expr(inner, sources, clause, in_aggregate)?;
                let p = self.bind_expr(pattern, sources, clause, in_aggregate)?;
                for side in [&e, &p] {
                    if side.ty.kind != TypeKind::String && !loose(side.ty.kind) {
                        return Err(MusoqError::type_mismatch(
                            "LIKE",
                            "String",
                            side.ty.to_string(),
                        ));
                    }
                }
                let ty = SemanticType::new(TypeKind::Bool, e.ty.nullable || p.ty.nullable);
                Ok(TypedExpr::new(
                    TypedExprKind::Like {
                        expr: Box::new(e),
                        pattern: Box::new(p),
                        not: *not,
                    },
                    ty,
                    span,
                ))
            }
            Expr::IsNull {
                expr: inner, not, ..
            } => {
                let e = self.bind_expr(inner, sources, clause, in_aggregate)?;
                Ok(TypedExpr::new(
                    TypedExprKind::IsNull {
                        expr: Box::new(e),
                        not: *not,
                    },
                    SemanticType::BOOL,
                    span,
                ))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn bind_call(
        &mut self,
        qualifier: Option<&str>,
        name: &str,
        args: &[Expr],
        span: Span,
        sources: &[BoundSource],
        clause: Clause,
        in_aggregate: bool,
    ) -> Result<TypedExpr> {
        // Library owner: the qualified source, else the first source whose
        // schema defines the name, else the base library.
        let owner: Option<(usize, Arc<dyn Schema>)> = if let Some(q) = qualifier {
            let (si, s) = find_source(sources, q)?;
            schema_of(s).map(|sch| (si, Arc::clone(sch)))
        } else {
            sources.iter().enumerate().find_map(|(si, s)| {
                schema_of(s)
                    .filter(|sch| sch.library().contains(name))
                    .map(|sch| (si, Arc::clone(sch)))
            })
        };
        let registry = match &owner {
            Some((_, sch)) if sch.library().contains(name) => sch.library(),
            _ => &self.base,
        };
        let is_aggregate = registry.is_aggregate(name);

        if is_aggregate {
            if !clause.allows_aggregates() {
                return Err(MusoqError::semantic(format!(
                    "aggregate {name} is not allowed in {}",
                    clause.as_str()
                )));
            }
            if in_aggregate {
                return Err(MusoqError::semantic(format!(
                    "aggregate {name} cannot be nested inside another aggregate"
                )));
            }
        }

        let owner_index = owner.as_ref().map(|(i, _)| *i);
        let owner_schema = owner.map(|(_, s)| s);
        let mut bound_args = Vec::with_capacity(args.len());
        for a in args {
            bound_args.push(self.bind_expr(a, sources, clause, in_aggregate || is_aggregate)?);
        }
        let arg_types: Vec<SemanticType> = bound_args.iter().map(|a| a.ty).collect();
        let registry = match &owner_schema {
            Some(sch) if sch.library().contains(name) => sch.library(),
            _ => &self.base,
        };

        if is_aggregate {
            let mut method = registry.resolve_aggregate(name, &arg_types)?;
            let bound_args = convert_args(bound_args, &method.signature, method.return_type);
            method.return_type = method.signature.result_type(&types_of(&bound_args))?;
            let ty = method.return_type;
            return Ok(TypedExpr::new(
                TypedExprKind::Aggregate {
                    name: name.to_owned(),
                    method,
                    args: bound_args,
                },
                ty,
                span,
            ));
        }

        let mut method = registry.resolve_scalar(name, &arg_types)?;
        let bound_args = convert_args(bound_args, &method.signature, method.return_type);
        method.return_type = method.signature.result_type(&types_of(&bound_args))?;
        let context_source = if method.signature.injects_source {
            owner_index.or(if sources.is_empty() { None } else { Some(0) })
        } else {
            None
        };
        let ty = method.return_type;
        Ok(TypedExpr::new(
            TypedExprKind::Call {
                name: name.to_owned(),
                method,
                args: bound_args,
                context_source,
            },
            ty,
            span,
        ))
    }
}

/// Output columns of a statement: names from the first branch, types unified
/// across every branch.
fn set_columns(
    first: &BoundBlock,
    compounds: &[(CompoundOp, BoundBlock)],
) -> Result<Vec<SchemaColumn>> {
    let mut columns: Vec<SchemaColumn> = first
        .visible()
        .iter()
        .enumerate()
        .map(|(i, c)| SchemaColumn::new(c.name.clone(), i, c.expr.ty))
        .collect();
    for (op, block) in compounds {
        let branch = block.visible();
        if branch.len() != columns.len() {
            return Err(MusoqError::SetOperationTypeMismatch {
                operator: op.to_string(),
                detail: format!(
                    "left side has {} columns, right side has {}",
                    columns.len(),
                    branch.len()
                ),
            });
        }
        for (column, other) in columns.iter_mut().zip(branch) {
            column.ty = column.ty.unify(other.expr.ty).ok_or_else(|| {
                MusoqError::SetOperationTypeMismatch {
                    operator: op.to_string(),
                    detail: format!(
                        "column {} is {} on the left and {} on the right",
                        column.name, column.ty, other.expr.ty
                    ),
                }
            })?;
        }
    }
    Ok(columns)
}

fn mark_nullable(source: &mut BoundSource) {
    for c in &mut source.columns {
        c.ty = c.ty.with_nullable(true);
    }
}

/// Wrap `expr` in a conversion when its declared kind is not `kind`.
/// NULL literals and `Any` targets pass through.
fn convert_to(expr: TypedExpr, kind: TypeKind) -> TypedExpr {
    if expr.ty.kind == kind
        || matches!(kind, TypeKind::Null | TypeKind::Any)
        || matches!(expr.ty.kind, TypeKind::Null | TypeKind::Any)
    {
        return expr;
    }
    let span = expr.span;
    let ty = SemanticType::new(kind, expr.ty.nullable);
    TypedExpr::new(
        TypedExprKind::Convert {
            expr: Box::new(expr),
            kind,
        },
        ty,
        span,
    )
}

/// Bring call arguments to the chosen overload's parameter kinds. Methods
/// whose result is the common type of their arguments get every argument in
/// that common kind, so the value they pick matches the declared result.
fn convert_args(
    args: Vec<TypedExpr>,
    signature: &MethodSignature,
    result: SemanticType,
) -> Vec<TypedExpr> {
    args.into_iter()
        .enumerate()
        .map(|(i, arg)| {
            let target = if signature.return_type == ReturnType::CommonOfArgs {
                Some(result.kind)
            } else {
                signature.param_at(i)
            };
            match target {
                Some(kind) => convert_to(arg, kind),
                None => arg,
            }
        })
        .collect()
}

fn types_of(args: &[TypedExpr]) -> Vec<SemanticType> {
    args.iter().map(|a| a.ty).collect()
}

fn unify_branch(acc: Option<SemanticType>, next: SemanticType) -> Result<SemanticType> {
    match acc {
        None => Ok(next),
        Some(prev) => prev.unify(next).ok_or_else(|| {
            MusoqError::type_mismatch("CASE branches", prev.to_string(), next.to_string())
        }),
    }
}

fn star_columns(source_index: usize, source: &BoundSource) -> Vec<OutputColumn> {
    source
        .columns
        .iter()
        .enumerate()
        .map(|(ci, c)| OutputColumn {
            name: c.name.clone(),
            expr: column_expr(source_index, source, ci, c, Span::ZERO),
        })
        .collect()
}

fn column_expr(
    source_index: usize,
    source: &BoundSource,
    column_index: usize,
    column: &SchemaColumn,
    span: Span,
) -> TypedExpr {
    TypedExpr::new(
        TypedExprKind::Column(BoundColumn {
            source: source_index,
            alias: source.alias.clone(),
            name: column.name.clone(),
            index: column.index,
            offset: source.offset + column_index,
        }),
        column.ty,
        span,
    )
}

fn bind_column(col: &ColumnRef, span: Span, sources: &[BoundSource]) -> Result<TypedExpr> {
    if let Some(q) = &col.qualifier {
        let (si, s) = find_source(sources, q)?;
        let (ci, c) = s
            .columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name.eq_ignore_ascii_case(&col.name))
            .ok_or_else(|| MusoqError::ColumnNotFound {
                name: format!("{q}.{}", col.name),
                available: s.columns.iter().map(|c| c.name.clone()).collect(),
            })?;
        return Ok(column_expr(si, s, ci, c, span));
    }

    let mut hits = Vec::new();
    for (si, s) in sources.iter().enumerate() {
        for (ci, c) in s.columns.iter().enumerate() {
            if c.name.eq_ignore_ascii_case(&col.name) {
                hits.push((si, ci));
            }
        }
    }
    match hits.as_slice() {
        [(si, ci)] => {
            let s = &sources[*si];
            Ok(column_expr(*si, s, *ci, &s.columns[*ci], span))
        }
        [] => Err(MusoqError::ColumnNotFound {
            name: col.name.clone(),
            available: sources
                .iter()
                .flat_map(|s| s.columns.iter().map(move |c| format!("{}.{}", s.alias, c.name)))
                .collect(),
        }),
        many => Err(MusoqError::AmbiguousColumn {
            name: col.name.clone(),
            candidates: many
                .iter()
                .map(|(si, ci)| format!("{}.{}", sources[*si].alias, sources[*si].columns[*ci].name))
                .collect(),
        }),
    }
}
