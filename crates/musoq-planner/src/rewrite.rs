//! Rewrite pass.
//!
//! Replays the scope arena recorded by the metadata pass and, per block:
//! picks a join strategy for every JOIN/APPLY, splits grouped blocks into
//! refresh expressions (aggregate arguments) and get expressions (projection
//! and HAVING over group keys and aggregate slots), and widens set-operation
//! branch columns to the unified statement types. The arena keeps its shape;
//! only symbols are appended.

use std::collections::HashMap;

use musoq_ast::BinaryOp;
use musoq_error::{MusoqError, Result};
use musoq_types::{SchemaColumn, SemanticType, TypeKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scope::{JoinStrategy, ScopeArena, ScopeId, ScopeKind, ScopeWalker, Symbol};
use crate::typed::{
    BoundBlock, BoundJoin, BoundQuery, BoundStatement, GroupSpec, JoinKeyPair, SourceKind,
    TypedExpr, TypedExprKind,
};

/// Knobs that change the compiled plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationOptions {
    /// Equi-joins run as sort-merge joins.
    pub use_sort_merge_join: bool,
    /// Equi-joins run as hash joins when sort-merge is off.
    pub use_hash_join: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self {
            use_sort_merge_join: true,
            use_hash_join: false,
        }
    }
}

impl CompilationOptions {
    #[must_use]
    pub const fn equi_join_strategy(&self) -> JoinStrategy {
        if self.use_sort_merge_join {
            JoinStrategy::SortMerge
        } else if self.use_hash_join {
            JoinStrategy::Hash
        } else {
            JoinStrategy::NestedLoop
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    pub joins: usize,
    pub equi_joins: usize,
    pub grouped_blocks: usize,
    pub conversions: usize,
}

/// Run the rewrite pass over a bound query.
pub fn rewrite(
    query: &mut BoundQuery,
    scopes: &mut ScopeArena,
    options: &CompilationOptions,
) -> Result<RewriteStats> {
    let span = tracing::debug_span!(
        target: "musoq.rewrite",
        "rewrite",
        joins = tracing::field::Empty,
        grouped_blocks = tracing::field::Empty,
    );
    let _guard = span.enter();

    // CTE statements are stored flat; replay needs them under their parent.
    let mut cte_children: HashMap<ScopeId, Vec<usize>> = HashMap::new();
    for (i, cte) in query.ctes.iter().enumerate() {
        if let Some(parent) = scopes.get(cte.scope)?.parent {
            cte_children.entry(parent).or_default().push(i);
        }
    }
    let mut ctes: Vec<Option<BoundStatement>> = query
        .ctes
        .iter_mut()
        .map(|c| Some(std::mem::replace(&mut c.statement, placeholder(c.scope))))
        .collect();

    let (stats, symbols) = {
        let mut rw = Rewriter {
            walker: scopes.walker(),
            options,
            cte_children,
            symbols: Vec::new(),
            stats: RewriteStats::default(),
        };
        rw.statement(&mut query.root, ScopeKind::Query, &mut ctes)?;
        rw.walker.finish()?;
        (rw.stats, rw.symbols)
    };
    for (scope, symbol) in symbols {
        scopes.add_symbol(scope, symbol)?;
    }
    for (cte, stmt) in query.ctes.iter_mut().zip(ctes) {
        cte.statement = stmt.ok_or_else(|| {
            MusoqError::internal(format!("CTE {} was not visited by the rewrite pass", cte.name))
        })?;
    }

    span.record("joins", stats.joins);
    span.record("grouped_blocks", stats.grouped_blocks);
    Ok(stats)
}

/// Empty statement parked in a CTE slot while its body is being rewritten.
fn placeholder(scope: ScopeId) -> BoundStatement {
    BoundStatement {
        scope,
        first: BoundBlock {
            scope,
            distinct: false,
            sources: Vec::new(),
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            having: None,
            projection: Vec::new(),
            hidden: 0,
            has_aggregates: false,
            group: None,
            width: 0,
        },
        compounds: Vec::new(),
        order_by: Vec::new(),
        skip: None,
        take: None,
        columns: Vec::new(),
    }
}

struct Rewriter<'a> {
    walker: ScopeWalker<'a>,
    options: &'a CompilationOptions,
    cte_children: HashMap<ScopeId, Vec<usize>>,
    /// Symbols to append once the replay is over.
    symbols: Vec<(ScopeId, Symbol)>,
    stats: RewriteStats,
}

impl Rewriter<'_> {
    fn statement(
        &mut self,
        stmt: &mut BoundStatement,
        kind: ScopeKind,
        ctes: &mut [Option<BoundStatement>],
    ) -> Result<()> {
        let scope = self.walker.enter(kind)?;
        for i in self.cte_children.get(&scope).cloned().unwrap_or_default() {
            let mut body = ctes
                .get_mut(i)
                .and_then(Option::take)
                .ok_or_else(|| MusoqError::internal(format!("CTE slot {i} visited twice")))?;
            self.statement(&mut body, ScopeKind::Cte, ctes)?;
            ctes[i] = Some(body);
        }

        self.block(&mut stmt.first, ctes)?;
        for (_, block) in &mut stmt.compounds {
            self.block(block, ctes)?;
        }
        if !stmt.compounds.is_empty() {
            let columns = stmt.columns.clone();
            self.widen(&mut stmt.first, &columns);
            for (_, block) in &mut stmt.compounds {
                self.widen(block, &columns);
            }
        }
        self.walker.exit()
    }

    fn block(&mut self, block: &mut BoundBlock, ctes: &mut [Option<BoundStatement>]) -> Result<()> {
        let scope = self.walker.enter(ScopeKind::Branch)?;
        for (i, source) in block.sources.iter_mut().enumerate() {
            let source_scope = self.walker.enter(ScopeKind::Source)?;
            if let SourceKind::Subquery(sub) = &mut source.kind {
                self.statement(sub, ScopeKind::Subquery, ctes)?;
            }
            if i > 0 {
                let right = (source.offset, source.offset + source.columns.len());
                if let Some(join) = block.joins.get_mut(i - 1) {
                    self.plan_join(join, right, source_scope);
                }
            }
            self.walker.exit()?;
        }
        if block.is_grouped() {
            self.split_aggregates(block, scope)?;
        }
        self.walker.exit()
    }

    // ── Joins ─────────────────────────────────────────────────────────────

    fn plan_join(&mut self, join: &mut BoundJoin, right: (usize, usize), scope: ScopeId) {
        self.stats.joins += 1;
        let strategy = if join.kind.is_apply() {
            JoinStrategy::Apply
        } else if let Some(on) = join.on.take() {
            let (keys, residual) = split_equi_keys(on, right);
            if keys.is_empty() {
                join.on = residual;
                JoinStrategy::NestedLoop
            } else {
                self.stats.equi_joins += 1;
                join.keys = keys;
                join.on = residual;
                self.options.equi_join_strategy()
            }
        } else {
            JoinStrategy::NestedLoop
        };
        // A nested loop evaluates the whole predicate; fold keys back in.
        if strategy == JoinStrategy::NestedLoop && !join.keys.is_empty() {
            join.on = fold_keys(std::mem::take(&mut join.keys), join.on.take());
        }
        join.strategy = Some(strategy);
        debug!(
            target: "musoq.rewrite",
            scope = %scope,
            kind = ?join.kind,
            strategy = %strategy,
            keys = join.keys.len(),
            "join planned"
        );
        self.symbols.push((
            scope,
            Symbol::Join {
                kind: join.kind,
                strategy,
                key_pairs: join.keys.len(),
            },
        ));
    }

    // ── Aggregation ───────────────────────────────────────────────────────

    fn split_aggregates(&mut self, block: &mut BoundBlock, scope: ScopeId) -> Result<()> {
        self.stats.grouped_blocks += 1;
        let keys = block.group_by.clone();
        let key_prints: Vec<String> = keys.iter().map(TypedExpr::fingerprint).collect();
        let mut slots = SlotTable::default();

        let projection = std::mem::take(&mut block.projection);
        for mut column in projection {
            column.expr = lift(column.expr, &key_prints, &mut slots)?;
            block.projection.push(column);
        }
        if let Some(having) = block.having.take() {
            block.having = Some(lift(having, &key_prints, &mut slots)?);
        }

        debug!(
            target: "musoq.rewrite",
            scope = %scope,
            keys = keys.len(),
            slots = slots.exprs.len(),
            "aggregation split"
        );
        self.symbols.push((scope, Symbol::GroupKeys(key_prints)));
        self.symbols.push((scope, Symbol::AggregateSlots(slots.prints)));
        block.group = Some(GroupSpec {
            keys,
            aggregates: slots.exprs,
        });
        Ok(())
    }

    // ── Set operations ────────────────────────────────────────────────────

    fn widen(&mut self, block: &mut BoundBlock, columns: &[SchemaColumn]) {
        let projection = std::mem::take(&mut block.projection);
        block.projection = projection
            .into_iter()
            .enumerate()
            .map(|(i, mut column)| {
                let Some(target) = columns.get(i) else {
                    return column;
                };
                let to = target.ty.kind;
                if column.expr.ty.kind != to && !matches!(to, TypeKind::Null | TypeKind::Any) {
                    self.stats.conversions += 1;
                    let span = column.expr.span;
                    column.expr = TypedExpr::new(
                        TypedExprKind::Convert {
                            expr: Box::new(column.expr),
                            kind: to,
                        },
                        target.ty,
                        span,
                    );
                }
                column
            })
            .collect();
    }
}

#[derive(Default)]
struct SlotTable {
    exprs: Vec<TypedExpr>,
    prints: Vec<String>,
}

impl SlotTable {
    fn slot(&mut self, expr: TypedExpr) -> usize {
        let print = expr.fingerprint();
        if let Some(i) = self.prints.iter().position(|p| *p == print) {
            return i;
        }
        self.prints.push(print);
        self.exprs.push(expr);
        self.exprs.len() - 1
    }
}

/// Rewrite a get expression over group keys and aggregate slots.
fn lift(expr: TypedExpr, keys: &[String], slots: &mut SlotTable) -> Result<TypedExpr> {
    if !keys.is_empty() {
        let print = expr.fingerprint();
        if let Some(i) = keys.iter().position(|k| *k == print) {
            return Ok(TypedExpr::new(TypedExprKind::GroupKey(i), expr.ty, expr.span));
        }
    }
    if matches!(expr.kind, TypedExprKind::Aggregate { .. }) {
        let (ty, span) = (expr.ty, expr.span);
        let j = slots.slot(expr);
        return Ok(TypedExpr::new(TypedExprKind::AggregateSlot(j), ty, span));
    }
    if let TypedExprKind::Column(c) = &expr.kind {
        return Err(MusoqError::semantic(format!(
            "column {}.{} must appear in GROUP BY or inside an aggregate",
            c.alias, c.name
        )));
    }
    expr.map_children(&mut |child| lift(child, keys, slots))
}

fn conjuncts(expr: TypedExpr, out: &mut Vec<TypedExpr>) {
    match expr.kind {
        TypedExprKind::Binary {
            left,
            op: BinaryOp::And,
            right,
        } => {
            conjuncts(*left, out);
            conjuncts(*right, out);
        }
        kind => out.push(TypedExpr::new(kind, expr.ty, expr.span)),
    }
}

fn within(expr: &TypedExpr, lo: usize, hi: usize) -> bool {
    expr.offset_range().is_some_and(|(a, b)| a >= lo && b < hi)
}

/// Kind both sides of an equality key are compared in.
fn key_kind(left: TypeKind, right: TypeKind) -> Option<TypeKind> {
    match (left, right) {
        (TypeKind::Any | TypeKind::Null, _) | (_, TypeKind::Any | TypeKind::Null) => None,
        (a, b) if a == b => Some(a),
        (a, b) => a.promote(b),
    }
}

/// Split an ON predicate into equality key pairs and a residual predicate.
fn split_equi_keys(
    on: TypedExpr,
    (right_lo, right_hi): (usize, usize),
) -> (Vec<JoinKeyPair>, Option<TypedExpr>) {
    let mut parts = Vec::new();
    conjuncts(on, &mut parts);
    let mut keys = Vec::new();
    let mut residual = Vec::new();
    for part in parts {
        let pair = match &part.kind {
            TypedExprKind::Binary {
                left,
                op: BinaryOp::Eq,
                right,
            } => {
                let kind = key_kind(left.ty.kind, right.ty.kind);
                if within(left, 0, right_lo) && within(right, right_lo, right_hi) {
                    kind.map(|k| (left.as_ref().clone(), right.as_ref().clone(), k))
                } else if within(right, 0, right_lo) && within(left, right_lo, right_hi) {
                    kind.map(|k| (right.as_ref().clone(), left.as_ref().clone(), k))
                } else {
                    None
                }
            }
            _ => None,
        };
        match pair {
            Some((left, right, kind)) => keys.push(JoinKeyPair { left, right, kind }),
            None => residual.push(part),
        }
    }
    (keys, and_all(residual))
}

fn and_all(parts: Vec<TypedExpr>) -> Option<TypedExpr> {
    parts.into_iter().reduce(|acc, next| {
        let span = acc.span.merge(next.span);
        let ty = SemanticType::new(TypeKind::Bool, acc.ty.nullable || next.ty.nullable);
        TypedExpr::new(
            TypedExprKind::Binary {
                left: Box::new(acc),
                op: BinaryOp::And,
                right: Box::new(next),
            },
            ty,
            span,
        )
    })
}

fn fold_keys(keys: Vec<JoinKeyPair>, residual: Option<TypedExpr>) -> Option<TypedExpr> {
    let mut parts: Vec<TypedExpr> = keys
        .into_iter()
        .map(|k| {
            let span = k.left.span.merge(k.right.span);
            let ty = SemanticType::new(
                TypeKind::Bool,
                k.left.ty.nullable || k.right.ty.nullable,
            );
            TypedExpr::new(
                TypedExprKind::Binary {
                    left: Box::new(k.left),
                    op: BinaryOp::Eq,
                    right: Box::new(k.right),
                },
                ty,
                span,
            )
        })
        .collect();
    parts.extend(residual);
    and_all(parts)
}

#[cfg(test)]
mod tests {
    use musoq_parser::parse_query;
    use musoq_schema::{InMemorySchema, InMemorySchemaProvider};
    use musoq_types::{CancellationToken, Row, Table, Value};

    use super::*;
    use crate::metadata::{analyze, EnvironmentVariables, MetadataOutput};

    fn table(name: &str) -> Table {
        Table::with_rows(
            name,
            vec![
                SchemaColumn::new("Id", 0, SemanticType::non_null(TypeKind::Int)),
                SchemaColumn::new("Key", 1, SemanticType::non_null(TypeKind::Long)),
                SchemaColumn::new("Name", 2, SemanticType::nullable(TypeKind::String)),
            ],
            vec![Row::new(vec![Value::Int(1), Value::Long(1), "a".into()])],
        )
        .unwrap()
    }

    fn compile(text: &str, options: &CompilationOptions) -> Result<(MetadataOutput, RewriteStats)> {
        let provider = InMemorySchemaProvider::new().with_schema(
            InMemorySchema::new("s")
                .with_table(table("left"))
                .with_table(table("right")),
        );
        let stmt = parse_query(text)?;
        let mut out = analyze(
            &stmt,
            &provider,
            &EnvironmentVariables::new(),
            &CancellationToken::new(),
        )?;
        let stats = rewrite(&mut out.query, &mut out.scopes, options)?;
        Ok((out, stats))
    }

    const EQUI: &str =
        "SELECT a.Id FROM #s.left() a INNER JOIN #s.right() b ON a.Id = b.Key AND b.Name <> 'x'";

    #[test]
    fn equi_join_strategy_follows_options() {
        let cases = [
            (CompilationOptions::default(), JoinStrategy::SortMerge, 1),
            (
                CompilationOptions {
                    use_sort_merge_join: false,
                    use_hash_join: true,
                },
                JoinStrategy::Hash,
                1,
            ),
            (
                CompilationOptions {
                    use_sort_merge_join: false,
                    use_hash_join: false,
                },
                JoinStrategy::NestedLoop,
                0,
            ),
        ];
        for (options, expected, key_count) in cases {
            let (out, stats) = compile(EQUI, &options).unwrap();
            let join = &out.query.root.first.joins[0];
            assert_eq!(join.strategy, Some(expected));
            assert_eq!(join.keys.len(), key_count);
            assert!(join.on.is_some());
            assert_eq!(stats.joins, 1);
            let recorded = out
                .scopes
                .iter()
                .flat_map(|s| s.symbols())
                .find_map(|s| match s {
                    Symbol::Join { strategy, .. } => Some(*strategy),
                    _ => None,
                });
            assert_eq!(recorded, Some(expected));
        }
    }

    #[test]
    fn key_pairs_are_oriented_and_widened() {
        let (out, _) = compile(
            "SELECT a.Id FROM #s.left() a INNER JOIN #s.right() b ON b.Key = a.Id",
            &CompilationOptions::default(),
        )
        .unwrap();
        let join = &out.query.root.first.joins[0];
        assert!(join.on.is_none());
        let key = &join.keys[0];
        assert_eq!(key.kind, TypeKind::Long);
        assert_eq!(key.left.offset_range(), Some((0, 0)));
        assert_eq!(key.right.offset_range(), Some((4, 4)));
    }

    #[test]
    fn non_equi_joins_use_nested_loop() {
        let (out, stats) = compile(
            "SELECT a.Id FROM #s.left() a INNER JOIN #s.right() b ON a.Id < b.Id",
            &CompilationOptions::default(),
        )
        .unwrap();
        assert_eq!(out.query.root.first.joins[0].strategy, Some(JoinStrategy::NestedLoop));
        assert_eq!(stats.equi_joins, 0);

        let (out, _) = compile(
            "SELECT a.Id FROM #s.left() a CROSS APPLY #s.right() b",
            &CompilationOptions::default(),
        )
        .unwrap();
        assert_eq!(out.query.root.first.joins[0].strategy, Some(JoinStrategy::Apply));
    }

    #[test]
    fn aggregation_split_dedups_slots() {
        let (out, stats) = compile(
            "SELECT Name, Count(Id), Count(Id) + 1 FROM #s.left() GROUP BY Name HAVING Count(Id) > 0",
            &CompilationOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.grouped_blocks, 1);
        let block = &out.query.root.first;
        let group = block.group.as_ref().unwrap();
        assert_eq!(group.keys.len(), 1);
        assert_eq!(group.aggregates.len(), 1);
        assert!(matches!(block.projection[0].expr.kind, TypedExprKind::GroupKey(0)));
        assert!(matches!(block.projection[1].expr.kind, TypedExprKind::AggregateSlot(0)));
        assert!(!block.having.as_ref().unwrap().references_columns());
    }

    #[test]
    fn implicit_group_and_ungrouped_columns() {
        let (out, _) = compile("SELECT Count(Id) FROM #s.left()", &CompilationOptions::default())
            .unwrap();
        assert!(out.query.root.first.group.as_ref().unwrap().keys.is_empty());

        let err = compile(
            "SELECT Name, Count(Id) FROM #s.left()",
            &CompilationOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MusoqError::Semantic { .. }), "{err:?}");
        assert!(compile(
            "SELECT Id FROM #s.left() GROUP BY Name",
            &CompilationOptions::default()
        )
        .is_err());
    }

    #[test]
    fn set_branches_are_widened() {
        let (out, stats) = compile(
            "SELECT Id FROM #s.left() UNION SELECT Key FROM #s.right()",
            &CompilationOptions::default(),
        )
        .unwrap();
        assert_eq!(stats.conversions, 1);
        let first = &out.query.root.first.projection[0].expr;
        assert!(matches!(first.kind, TypedExprKind::Convert { kind: TypeKind::Long, .. }));
        assert_eq!(first.ty.kind, TypeKind::Long);
    }

    #[test]
    fn replay_covers_ctes_and_subqueries() {
        let (out, _) = compile(
            "WITH c AS (SELECT Id FROM #s.left()) \
             SELECT x.Id FROM c x INNER JOIN (SELECT Id FROM #s.right()) y ON x.Id = y.Id",
            &CompilationOptions::default(),
        )
        .unwrap();
        assert_eq!(out.query.ctes[0].statement.first.sources.len(), 1);
        assert_eq!(out.query.root.first.joins[0].strategy, Some(JoinStrategy::SortMerge));
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: CompilationOptions = serde_json::from_str(r#"{"use_hash_join":true}"#).unwrap();
        assert!(options.use_sort_merge_join);
        assert!(options.use_hash_join);
        assert_eq!(options.equi_join_strategy(), JoinStrategy::SortMerge);
    }
}
