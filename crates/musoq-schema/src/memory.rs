//! In-memory schemas and provider.
//!
//! Tables are either fixed [`Table`]s or row functions that receive the
//! call-site arguments and the [`RuntimeContext`]. Row functions are how
//! table-valued arguments, APPLY correlation and environment variables are
//! exercised without external data.

use std::collections::HashMap;
use std::sync::Arc;

use musoq_error::{MusoqError, Result};
use musoq_types::{Row, SchemaColumn, Table, TypeKind, Value};
use parking_lot::Mutex;
use tracing::debug;

use crate::method::{AggregateMethod, MethodRegistry, ScalarMethod};
use crate::schema::{ConstructorInfo, RuntimeContext, Schema, SchemaProvider, TableDescriptor};
use crate::source::{ChunkedRowSource, ObjectResolver, RowResolver, RowSource, VecRowSource};

/// Produces a table's rows for one call site.
pub type RowFn = Arc<dyn Fn(&RuntimeContext, &[Value]) -> Result<Vec<Row>> + Send + Sync>;

const DEFAULT_CHUNK_SIZE: usize = 256;

struct MemoryTable {
    name: String,
    columns: Vec<SchemaColumn>,
    params: Vec<TypeKind>,
    rows: RowFn,
}

/// One `(table, args)` pair recorded when a row source is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRecord {
    pub table: String,
    pub args: Vec<Value>,
    pub source_position: u32,
    pub environment_variables: HashMap<String, String>,
}

/// Schema whose tables live in memory.
pub struct InMemorySchema {
    name: String,
    tables: HashMap<String, MemoryTable>,
    library: MethodRegistry,
    chunk_size: usize,
    threaded: bool,
    row_context: bool,
    opened: Mutex<Vec<OpenRecord>>,
}

impl InMemorySchema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: HashMap::new(),
            library: MethodRegistry::with_base_library(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            threaded: false,
            row_context: false,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Expose a fixed table, callable with no arguments.
    #[must_use]
    pub fn with_table(self, table: Table) -> Self {
        let columns = table.columns().to_vec();
        let name = table.name().to_owned();
        let table = Arc::new(table);
        self.with_table_fn(name, columns, &[], Arc::new(move |_: &RuntimeContext, _: &[Value]| {
            Ok(table.rows().to_vec())
        }))
    }

    /// Expose a table whose rows depend on the call-site arguments.
    #[must_use]
    pub fn with_table_fn(
        mut self,
        name: impl Into<String>,
        columns: Vec<SchemaColumn>,
        params: &[TypeKind],
        rows: RowFn,
    ) -> Self {
        let name = name.into();
        self.tables.insert(
            name.to_ascii_lowercase(),
            MemoryTable {
                name,
                columns,
                params: params.to_vec(),
                rows,
            },
        );
        self
    }

    #[must_use]
    pub fn with_method<F: ScalarMethod + 'static>(mut self, method: F) -> Self {
        self.library.register_scalar(method);
        self
    }

    #[must_use]
    pub fn with_aggregate<F>(mut self, method: F) -> Self
    where
        F: AggregateMethod + 'static,
        F::State: 'static,
    {
        self.library.register_aggregate(method);
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Produce rows on a background thread instead of the caller's.
    #[must_use]
    pub const fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    /// Attach each row as its resolver's source context.
    #[must_use]
    pub const fn with_row_context(mut self, enabled: bool) -> Self {
        self.row_context = enabled;
        self
    }

    /// Every row source opened so far, in order.
    #[must_use]
    pub fn opened(&self) -> Vec<OpenRecord> {
        self.opened.lock().clone()
    }

    fn table(&self, table: &str) -> Result<&MemoryTable> {
        self.tables
            .get(&table.to_ascii_lowercase())
            .ok_or_else(|| MusoqError::TableNotFound {
                schema: self.name.clone(),
                name: table.to_owned(),
            })
    }
}

fn to_resolvers(
    names: &Arc<HashMap<String, usize>>,
    rows: Vec<Row>,
    row_context: bool,
) -> Vec<Box<dyn RowResolver>> {
    rows.into_iter()
        .map(|row| {
            let resolver = if row_context {
                let context = Arc::new(row.clone());
                ObjectResolver::new(Arc::clone(names), row.into_values()).with_context(context)
            } else {
                ObjectResolver::new(Arc::clone(names), row.into_values())
            };
            Box::new(resolver) as Box<dyn RowResolver>
        })
        .collect()
}

fn as_source_failure(table: &str, err: MusoqError) -> MusoqError {
    match err {
        MusoqError::SourceFailure { .. } | MusoqError::Cancelled => err,
        other => MusoqError::SourceFailure {
            source_name: table.to_owned(),
            detail: other.to_string(),
        },
    }
}

impl Schema for InMemorySchema {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_table(
        &self,
        table: &str,
        _cx: &RuntimeContext,
        _args: &[Value],
    ) -> Result<TableDescriptor> {
        let t = self.table(table)?;
        Ok(TableDescriptor::new(t.name.clone(), t.columns.clone()))
    }

    fn get_row_source(
        &self,
        table: &str,
        cx: &RuntimeContext,
        args: &[Value],
    ) -> Result<Box<dyn RowSource>> {
        let t = self.table(table)?;
        self.opened.lock().push(OpenRecord {
            table: t.name.clone(),
            args: args.to_vec(),
            source_position: cx.source_position,
            environment_variables: cx.environment_variables.clone(),
        });
        debug!(
            target: "musoq.exec",
            schema = %self.name,
            table = %t.name,
            args = args.len(),
            threaded = self.threaded,
            "opening in-memory source"
        );
        let names = ObjectResolver::name_index(t.columns.iter().map(|c| c.name.as_str()));
        if !self.threaded {
            let rows = (t.rows)(cx, args).map_err(|e| as_source_failure(&t.name, e))?;
            return Ok(Box::new(VecRowSource::new(
                to_resolvers(&names, rows, self.row_context),
                self.chunk_size,
            )));
        }
        let produce = Arc::clone(&t.rows);
        let cx_owned = cx.clone();
        let args_owned = args.to_vec();
        let row_context = self.row_context;
        let source = ChunkedRowSource::spawn(
            &t.name,
            cx.token.clone(),
            self.chunk_size,
            cx.channel_capacity,
            move |tx| {
                let rows = produce(&cx_owned, &args_owned)?;
                for resolver in to_resolvers(&names, rows, row_context) {
                    tx.send(resolver)?;
                }
                Ok(())
            },
        )?;
        Ok(Box::new(source))
    }

    fn library(&self) -> &MethodRegistry {
        &self.library
    }

    fn get_constructors(&self) -> Vec<ConstructorInfo> {
        self.tables
            .values()
            .map(|t| ConstructorInfo::new(t.name.clone(), &t.params))
            .collect()
    }
}

/// Case-insensitive map from schema name to schema.
#[derive(Default, Clone)]
pub struct InMemorySchemaProvider {
    schemas: HashMap<String, Arc<dyn Schema>>,
}

impl InMemorySchemaProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Schema + 'static) -> Self {
        self.register(Arc::new(schema));
        self
    }

    /// Register a shared schema under its own name.
    pub fn register(&mut self, schema: Arc<dyn Schema>) {
        self.schemas
            .insert(schema.name().trim_start_matches('#').to_ascii_lowercase(), schema);
    }
}

impl SchemaProvider for InMemorySchemaProvider {
    fn get_schema(&self, name: &str) -> Result<Arc<dyn Schema>> {
        self.schemas
            .get(&name.trim_start_matches('#').to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| MusoqError::SchemaNotFound {
                name: name.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use musoq_types::{CancellationToken, SemanticType};

    use super::*;
    use crate::source::drain_source;

    fn people() -> Table {
        let columns = vec![
            SchemaColumn::new("Name", 0, SemanticType::non_null(TypeKind::String)),
            SchemaColumn::new("Age", 1, SemanticType::nullable(TypeKind::Int)),
        ];
        Table::with_rows(
            "people",
            columns,
            vec![
                Row::new(vec!["ann".into(), Value::Int(31)]),
                Row::new(vec!["bob".into(), Value::Null]),
                Row::new(vec!["cid".into(), Value::Int(7)]),
            ],
        )
        .unwrap()
    }

    fn range_fn() -> RowFn {
        Arc::new(|_: &RuntimeContext, args: &[Value]| {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok((0..n).map(|i| Row::new(vec![Value::Long(i)])).collect())
        })
    }

    fn range_schema() -> InMemorySchema {
        InMemorySchema::new("gen").with_table_fn(
            "range",
            vec![SchemaColumn::new("Value", 0, SemanticType::non_null(TypeKind::Long))],
            &[TypeKind::Long],
            range_fn(),
        )
    }

    #[test]
    fn provider_lookup_is_case_insensitive() {
        let provider = InMemorySchemaProvider::new().with_schema(InMemorySchema::new("A"));
        assert_eq!(provider.get_schema("#a").unwrap().name(), "A");
        assert!(matches!(
            provider.get_schema("missing"),
            Err(MusoqError::SchemaNotFound { .. })
        ));
    }

    #[test]
    fn fixed_table_reads_back_in_chunks() {
        let schema = InMemorySchema::new("A").with_table(people()).with_chunk_size(2);
        let cx = RuntimeContext::default();
        let desc = schema.get_table("PEOPLE", &cx, &[]).unwrap();
        assert_eq!(desc.columns.len(), 2);
        let mut source = schema.get_row_source("people", &cx, &[]).unwrap();
        let first = source.next_chunk().unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[1].get_by_name("age"), Some(Value::Null));
        assert_eq!(source.next_chunk().unwrap().unwrap().len(), 1);
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn constructors_are_validated() {
        let schema = range_schema();
        assert!(schema.validate_constructor("range", &[TypeKind::Int]).is_ok());
        assert!(matches!(
            schema.validate_constructor("range", &[TypeKind::String]),
            Err(MusoqError::MethodNotFound { .. })
        ));
        assert!(matches!(
            schema.validate_constructor("nope", &[]),
            Err(MusoqError::TableNotFound { .. })
        ));
    }

    #[test]
    fn threaded_source_matches_inline_source() {
        let cx = RuntimeContext::new(CancellationToken::new(), 0, "r");
        let args = [Value::Long(1000)];
        let inline = drain_source(
            range_schema().get_row_source("range", &cx, &args).unwrap().as_mut(),
            1,
        )
        .unwrap();
        let schema = range_schema().threaded(true).with_chunk_size(64);
        let threaded =
            drain_source(schema.get_row_source("range", &cx, &args).unwrap().as_mut(), 1).unwrap();
        assert_eq!(inline.len(), 1000);
        assert_eq!(inline, threaded);
    }

    #[test]
    fn failing_row_fn_is_source_failure() {
        let schema = InMemorySchema::new("bad").threaded(true).with_table_fn(
            "boom",
            vec![],
            &[],
            Arc::new(|_: &RuntimeContext, _: &[Value]| {
                Err(MusoqError::internal("disk on fire"))
            }),
        );
        let mut source = schema
            .get_row_source("boom", &RuntimeContext::default(), &[])
            .unwrap();
        let err = source.next_chunk().err().expect("expected an error");
        assert!(matches!(err, MusoqError::SourceFailure { .. }), "{err:?}");
    }

    #[test]
    fn opened_sources_are_recorded() {
        let schema = range_schema();
        let cx = RuntimeContext::new(CancellationToken::new(), 3, "r")
            .with_environment(HashMap::from([("K".to_owned(), "V".to_owned())]));
        let _ = schema.get_row_source("range", &cx, &[Value::Long(2)]).unwrap();
        let opened = schema.opened();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].source_position, 3);
        assert_eq!(opened[0].args, vec![Value::Long(2)]);
        assert_eq!(opened[0].environment_variables["K"], "V");
    }

    #[test]
    fn row_context_is_attached_on_request() {
        let schema = InMemorySchema::new("A").with_table(people()).with_row_context(true);
        let mut source = schema
            .get_row_source("people", &RuntimeContext::default(), &[])
            .unwrap();
        let chunk = source.next_chunk().unwrap().unwrap();
        let context = chunk[0].context().unwrap();
        let row = context.downcast_ref::<Row>().unwrap();
        assert_eq!(row[0], Value::from("ann"));
    }
}
