//! Compilation passes between the AST and the execution engine.
//!
//! - [`metadata`]: binds sources, columns and methods, infers types and
//!   records the scope arena.
//! - [`rewrite`]: join strategies, aggregation split and set-operation
//!   widening, replaying the arena with a [`ScopeWalker`].
//! - [`lower`]: produces the executable [`QueryPlan`].
//!
//! [`plan_query`] runs all three in order.

pub mod lower;
pub mod metadata;
pub mod plan;
pub mod rewrite;
pub mod scope;
pub mod typed;

use musoq_ast::SelectStatement;
use musoq_error::Result;
use musoq_schema::SchemaProvider;
use musoq_types::CancellationToken;

pub use lower::lower;
pub use metadata::{analyze, EnvironmentVariables, MetadataOutput};
pub use plan::{
    AggregatePlan, BlockPlan, CtePlan, GroupPlan, JoinPlan, OrderPlan, PlanExpr, QueryPlan,
    SetPlan, SourceBinding, SourcePlan, StatementPlan,
};
pub use rewrite::{rewrite, CompilationOptions, RewriteStats};
pub use scope::{JoinStrategy, Scope, ScopeArena, ScopeId, ScopeKind, ScopeWalker, Symbol};

/// Output of the full compilation pipeline.
#[derive(Debug)]
pub struct PlannedQuery {
    pub plan: QueryPlan,
    pub scopes: ScopeArena,
    pub rewrite: RewriteStats,
}

/// Bind, rewrite and lower a parsed statement.
pub fn plan_query(
    stmt: &SelectStatement,
    provider: &dyn SchemaProvider,
    environment: &EnvironmentVariables,
    options: &CompilationOptions,
    token: &CancellationToken,
) -> Result<PlannedQuery> {
    let MetadataOutput {
        mut query,
        mut scopes,
        ..
    } = analyze(stmt, provider, environment, token)?;
    token.checkpoint()?;
    let rewrite = rewrite(&mut query, &mut scopes, options)?;
    let plan = lower(&query, &scopes)?;
    Ok(PlannedQuery {
        plan,
        scopes,
        rewrite,
    })
}
