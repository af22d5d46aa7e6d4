//! Compiled queries and their results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use musoq_ast::SelectStatement;
use musoq_error::Result;
use musoq_planner::{plan_query, EnvironmentVariables, PlannedQuery, QueryPlan};
use musoq_schema::SchemaProvider;
use musoq_types::{CancellationToken, SchemaColumn, Table};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{EngineConfig, ExecutionOptions};
use crate::scan::ExecContext;
use crate::statement::exec_statement;

/// Name of the table a query produces.
pub const RESULT_TABLE: &str = "result";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryStats {
    pub compile_duration: Duration,
    pub execution_duration: Duration,
    /// Rows pulled from every row source, CTE and derived table included.
    pub rows_read: u64,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub table: Table,
    pub stats: QueryStats,
}

/// A plan bound to its environment, ready to run any number of times.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    plan: Arc<QueryPlan>,
    environment: EnvironmentVariables,
    options: ExecutionOptions,
    compile_duration: Duration,
}

impl CompiledQuery {
    #[must_use]
    pub fn new(
        plan: Arc<QueryPlan>,
        environment: EnvironmentVariables,
        options: ExecutionOptions,
        compile_duration: Duration,
    ) -> Self {
        Self {
            plan,
            environment,
            options,
            compile_duration,
        }
    }

    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    #[must_use]
    pub fn shared_plan(&self) -> Arc<QueryPlan> {
        Arc::clone(&self.plan)
    }

    /// Output columns of the result table.
    #[must_use]
    pub fn columns(&self) -> &[SchemaColumn] {
        &self.plan.root.columns
    }

    #[must_use]
    pub const fn compile_duration(&self) -> Duration {
        self.compile_duration
    }

    /// Execute the plan: CTEs in definition order, then the root statement.
    ///
    /// Cancelling `token` aborts at the next row or chunk boundary with
    /// [`musoq_error::MusoqError::Cancelled`].
    pub fn run(&self, token: &CancellationToken) -> Result<QueryResult> {
        let span = tracing::debug_span!(
            target: "musoq.exec",
            "run",
            ctes = self.plan.ctes.len(),
            rows_out = tracing::field::Empty,
            rows_read = tracing::field::Empty,
        );
        let _guard = span.enter();
        let started = Instant::now();

        // Workers cancel this child on failure; the caller's token is untouched.
        let cx = ExecContext::new(token.child(), &self.environment, self.options);
        let outcome = self.execute(cx);
        let execution_duration = started.elapsed();
        match outcome {
            Ok((table, rows_read)) => {
                span.record("rows_out", table.count());
                span.record("rows_read", rows_read);
                debug!(
                    target: "musoq.exec",
                    rows_out = table.count(),
                    rows_read,
                    elapsed_us = u64::try_from(execution_duration.as_micros()).unwrap_or(u64::MAX),
                    "query done"
                );
                Ok(QueryResult {
                    table,
                    stats: QueryStats {
                        compile_duration: self.compile_duration,
                        execution_duration,
                        rows_read,
                    },
                })
            }
            Err(err) if err.is_cancellation() => {
                warn!(
                    target: "musoq.exec",
                    reason = token.reason().as_deref().unwrap_or("cancelled"),
                    "query cancelled"
                );
                Err(err)
            }
            Err(err) => {
                warn!(target: "musoq.exec", error = %err, code = ?err.error_code(), "query failed");
                Err(err)
            }
        }
    }

    fn execute(&self, mut cx: ExecContext<'_>) -> Result<(Table, u64)> {
        cx.token.checkpoint()?;
        for cte in &self.plan.ctes {
            let table = exec_statement(&cx, &cte.plan, &cte.name)?;
            debug!(target: "musoq.exec", cte = %cte.name, rows = table.count(), "cte materialized");
            cx.ctes.push(table);
        }
        let table = exec_statement(&cx, &self.plan.root, RESULT_TABLE)?;
        Ok((table, cx.rows_read()))
    }
}

/// Plan `stmt` and bind it to `environment`.
pub fn compile(
    stmt: &SelectStatement,
    provider: &dyn SchemaProvider,
    environment: EnvironmentVariables,
    config: &EngineConfig,
    token: &CancellationToken,
) -> Result<CompiledQuery> {
    let started = Instant::now();
    let PlannedQuery { plan, .. } =
        plan_query(stmt, provider, &environment, &config.compilation, token)?;
    Ok(CompiledQuery::new(
        Arc::new(plan),
        environment,
        config.execution,
        started.elapsed(),
    ))
}
