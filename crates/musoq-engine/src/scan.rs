//! Opening and draining row sources.

use std::sync::atomic::{AtomicU64, Ordering};

use musoq_error::{MusoqError, Result};
use musoq_planner::{EnvironmentVariables, SourceBinding, SourcePlan};
use musoq_schema::{RowSource, RuntimeContext, SourceContext, TableRowSource};
use musoq_types::{CancellationToken, Table, Value};
use tracing::debug;

use crate::config::ExecutionOptions;
use crate::statement::exec_statement;

/// State shared by every operator of one query run.
pub(crate) struct ExecContext<'a> {
    pub token: CancellationToken,
    pub environment: &'a EnvironmentVariables,
    pub options: ExecutionOptions,
    /// Materialized CTEs, in definition order.
    pub ctes: Vec<Table>,
    pub rows_read: AtomicU64,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        token: CancellationToken,
        environment: &'a EnvironmentVariables,
        options: ExecutionOptions,
    ) -> Self {
        Self {
            token,
            environment,
            options,
            ctes: Vec::new(),
            rows_read: AtomicU64::new(0),
        }
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read.load(Ordering::Relaxed)
    }
}

/// One row of a block as it moves through the joins: flat values plus the
/// source context of each joined source.
#[derive(Clone)]
pub(crate) struct JoinedRow {
    pub values: Vec<Value>,
    pub contexts: Vec<Option<SourceContext>>,
}

impl JoinedRow {
    pub const fn empty() -> Self {
        Self {
            values: Vec::new(),
            contexts: Vec::new(),
        }
    }

    /// Row of nulls standing in for `sources` missing sources.
    pub fn nulls(width: usize, sources: usize) -> Self {
        Self {
            values: vec![Value::Null; width],
            contexts: vec![None; sources],
        }
    }

    pub fn concat(&self, right: &Self) -> Self {
        let mut values = Vec::with_capacity(self.values.len() + right.values.len());
        values.extend_from_slice(&self.values);
        values.extend_from_slice(&right.values);
        let mut contexts = Vec::with_capacity(self.contexts.len() + right.contexts.len());
        contexts.extend_from_slice(&self.contexts);
        contexts.extend_from_slice(&right.contexts);
        Self { values, contexts }
    }
}

fn open(
    cx: &ExecContext<'_>,
    binding: &SourceBinding,
    args: &[Value],
) -> Result<Box<dyn RowSource>> {
    match &binding.plan {
        SourcePlan::Schema {
            schema,
            table,
            correlated,
            ..
        } => {
            let environment = cx
                .environment
                .get(&binding.position)
                .cloned()
                .unwrap_or_default();
            let runtime = RuntimeContext::new(cx.token.clone(), binding.position, &binding.alias)
                .with_environment(environment)
                .correlated(*correlated)
                .with_channel_capacity(cx.options.channel_capacity);
            schema.get_row_source(table, &runtime, args)
        }
        SourcePlan::Cte { index, name } => {
            let table = cx
                .ctes
                .get(*index)
                .cloned()
                .ok_or_else(|| MusoqError::internal(format!("CTE {name} is not materialized")))?;
            Ok(Box::new(TableRowSource::new(table, cx.options.chunk_size)))
        }
        SourcePlan::Subquery(plan) => {
            let table = exec_statement(cx, plan, &binding.alias)?;
            Ok(Box::new(TableRowSource::new(table, cx.options.chunk_size)))
        }
    }
}

/// Read every row of one source, `binding.width` columns by index.
pub(crate) fn scan(
    cx: &ExecContext<'_>,
    binding: &SourceBinding,
    args: &[Value],
) -> Result<Vec<JoinedRow>> {
    let mut source = open(cx, binding, args)?;
    let mut rows = Vec::new();
    loop {
        cx.token.checkpoint()?;
        let Some(chunk) = source.next_chunk()? else {
            break;
        };
        for resolver in chunk {
            cx.token.checkpoint()?;
            let values = (0..binding.width)
                .map(|i| resolver.get_by_index(i).unwrap_or(Value::Null))
                .collect();
            rows.push(JoinedRow {
                values,
                contexts: vec![resolver.context()],
            });
        }
    }
    cx.rows_read.fetch_add(rows.len() as u64, Ordering::Relaxed);
    debug!(
        target: "musoq.exec",
        alias = %binding.alias,
        position = binding.position,
        rows = rows.len(),
        "source drained"
    );
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use musoq_schema::{InMemorySchema, RowFn};
    use musoq_types::{Row, SchemaColumn, SemanticType, TypeKind};

    use super::*;

    fn binding(schema: InMemorySchema, table: &str, width: usize, position: u32) -> SourceBinding {
        SourceBinding {
            alias: "a".to_owned(),
            position,
            width,
            plan: SourcePlan::Schema {
                schema: Arc::new(schema),
                schema_name: "s".to_owned(),
                table: table.to_owned(),
                args: Vec::new(),
                correlated: false,
            },
        }
    }

    fn numbers(n: i32) -> Table {
        let cols = vec![SchemaColumn::new("N", 0, SemanticType::non_null(TypeKind::Int))];
        let rows = (0..n).map(|i| Row::new(vec![Value::Int(i)])).collect();
        Table::with_rows("numbers", cols, rows).unwrap()
    }

    #[test]
    fn scan_reads_all_chunks_and_counts_rows() {
        let schema = InMemorySchema::new("s").with_table(numbers(5)).with_chunk_size(2);
        let env = EnvironmentVariables::new();
        let cx = ExecContext::new(CancellationToken::new(), &env, ExecutionOptions::default());
        let rows = scan(&cx, &binding(schema, "numbers", 1, 0), &[]).unwrap();
        let values: Vec<Value> = rows.iter().map(|r| r.values[0].clone()).collect();
        assert_eq!(values, (0..5).map(Value::Int).collect::<Vec<_>>());
        assert_eq!(cx.rows_read(), 5);
        assert!(rows.iter().all(|r| r.contexts.len() == 1));
    }

    #[test]
    fn environment_is_passed_by_position() {
        let seen: RowFn = Arc::new(|cx: &RuntimeContext, _: &[Value]| {
            let value = cx
                .environment_variables
                .get("KEY")
                .cloned()
                .unwrap_or_default();
            Ok(vec![Row::new(vec![Value::String(value)])])
        });
        let schema = InMemorySchema::new("s").with_table_fn(
            "env",
            vec![SchemaColumn::new("V", 0, SemanticType::non_null(TypeKind::String))],
            &[],
            seen,
        );
        let mut env = EnvironmentVariables::new();
        env.insert(3, HashMap::from([("KEY".to_owned(), "three".to_owned())]));
        let cx = ExecContext::new(CancellationToken::new(), &env, ExecutionOptions::default());
        let rows = scan(&cx, &binding(schema, "env", 1, 3), &[]).unwrap();
        assert_eq!(rows[0].values, vec![Value::from("three")]);
    }

    #[test]
    fn cancelled_token_stops_the_scan() {
        let schema = InMemorySchema::new("s").with_table(numbers(3));
        let env = EnvironmentVariables::new();
        let token = CancellationToken::new();
        token.cancel();
        let cx = ExecContext::new(token, &env, ExecutionOptions::default());
        let err = scan(&cx, &binding(schema, "numbers", 1, 0), &[]).err().unwrap();
        assert!(err.is_cancellation());
    }

    #[test]
    fn missing_cte_is_internal() {
        let env = EnvironmentVariables::new();
        let cx = ExecContext::new(CancellationToken::new(), &env, ExecutionOptions::default());
        let b = SourceBinding {
            alias: "c".to_owned(),
            position: 0,
            width: 1,
            plan: SourcePlan::Cte {
                index: 0,
                name: "x".to_owned(),
            },
        };
        assert!(matches!(scan(&cx, &b, &[]), Err(MusoqError::Internal(_))));
    }

    #[test]
    fn joined_rows_concatenate_contexts() {
        let left = JoinedRow {
            values: vec![Value::Int(1)],
            contexts: vec![Some(Arc::new(1_u8) as SourceContext)],
        };
        let right = JoinedRow::nulls(2, 1);
        let row = left.concat(&right);
        assert_eq!(row.values, vec![Value::Int(1), Value::Null, Value::Null]);
        assert_eq!(row.contexts.len(), 2);
        assert!(row.contexts[1].is_none());
    }
}
