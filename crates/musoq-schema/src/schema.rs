//! Schema and schema-provider contracts.
//!
//! A query names its data through `#schema.table(args)`. The provider maps
//! the schema name to a [`Schema`]; the schema describes the table's columns
//! at compile time and produces a [`RowSource`] at run time.

use std::collections::HashMap;
use std::sync::Arc;

use musoq_error::{MusoqError, Result};
use musoq_types::{CancellationToken, SchemaColumn, SemanticType, TypeKind, Value};

use crate::method::{MethodRegistry, ResolvedAggregate, ResolvedMethod};
use crate::source::RowSource;

const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// Information handed to a schema when a table is described or opened.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub token: CancellationToken,
    /// Environment variables for this source position.
    pub environment_variables: HashMap<String, String>,
    /// Ordinal of the source in FROM/JOIN/APPLY order, starting at 0.
    pub source_position: u32,
    pub alias: String,
    /// Arguments depend on the outer row (APPLY); values passed while
    /// describing the table are placeholders.
    pub correlated: bool,
    /// Chunks a producer-backed source may buffer ahead of the engine.
    pub channel_capacity: usize,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(token: CancellationToken, source_position: u32, alias: impl Into<String>) -> Self {
        Self {
            token,
            environment_variables: HashMap::new(),
            source_position,
            alias: alias.into(),
            correlated: false,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_environment(mut self, vars: HashMap<String, String>) -> Self {
        self.environment_variables = vars;
        self
    }

    #[must_use]
    pub const fn correlated(mut self, correlated: bool) -> Self {
        self.correlated = correlated;
        self
    }

    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }
}

/// Column layout of one table as seen by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
    pub name: String,
    pub columns: Vec<SchemaColumn>,
}

impl TableDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<SchemaColumn>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Build from `(name, type)` pairs, assigning indices in order.
    #[must_use]
    pub fn from_pairs(name: impl Into<String>, pairs: &[(&str, SemanticType)]) -> Self {
        Self::new(
            name,
            pairs
                .iter()
                .enumerate()
                .map(|(i, (n, ty))| SchemaColumn::new(*n, i, *ty))
                .collect(),
        )
    }

    /// Column by name, case-insensitive.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&SchemaColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// One accepted argument list for `#schema.table(...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructorInfo {
    pub table: String,
    pub params: Vec<TypeKind>,
}

impl ConstructorInfo {
    #[must_use]
    pub fn new(table: impl Into<String>, params: &[TypeKind]) -> Self {
        Self {
            table: table.into(),
            params: params.to_vec(),
        }
    }

    /// Whether a call with these argument kinds matches this constructor.
    #[must_use]
    pub fn accepts(&self, args: &[TypeKind]) -> bool {
        self.params.len() == args.len()
            && args
                .iter()
                .zip(&self.params)
                .all(|(a, p)| a.is_assignable_to(*p))
    }
}

/// A named data source with tables and a method library.
pub trait Schema: Send + Sync {
    fn name(&self) -> &str;

    /// Describe `table` for the given arguments.
    ///
    /// Fails with [`MusoqError::TableNotFound`] for unknown tables.
    fn get_table(&self, table: &str, cx: &RuntimeContext, args: &[Value])
        -> Result<TableDescriptor>;

    /// Open `table` for reading.
    fn get_row_source(
        &self,
        table: &str,
        cx: &RuntimeContext,
        args: &[Value],
    ) -> Result<Box<dyn RowSource>>;

    /// Methods callable on rows of this schema's tables.
    fn library(&self) -> &MethodRegistry;

    fn get_constructors(&self) -> Vec<ConstructorInfo>;

    fn resolve_method(&self, name: &str, args: &[SemanticType]) -> Result<ResolvedMethod> {
        self.library().resolve_scalar(name, args)
    }

    fn resolve_aggregate_method(
        &self,
        name: &str,
        args: &[SemanticType],
    ) -> Result<ResolvedAggregate> {
        self.library().resolve_aggregate(name, args)
    }

    /// Check a FROM call site against the declared constructors.
    ///
    /// An unknown table is [`MusoqError::TableNotFound`]; a known table with
    /// no matching argument list is [`MusoqError::MethodNotFound`].
    fn validate_constructor(&self, table: &str, args: &[TypeKind]) -> Result<()> {
        let constructors: Vec<ConstructorInfo> = self
            .get_constructors()
            .into_iter()
            .filter(|c| c.table.eq_ignore_ascii_case(table))
            .collect();
        if constructors.is_empty() {
            return Err(MusoqError::TableNotFound {
                schema: self.name().to_owned(),
                name: table.to_owned(),
            });
        }
        if constructors.iter().any(|c| c.accepts(args)) {
            Ok(())
        } else {
            Err(MusoqError::MethodNotFound {
                name: format!("{}.{table}", self.name()),
                arg_types: args.iter().map(ToString::to_string).collect(),
            })
        }
    }
}

/// Maps `#name` to a [`Schema`].
pub trait SchemaProvider: Send + Sync {
    /// Fails with [`MusoqError::SchemaNotFound`] for unknown names.
    fn get_schema(&self, name: &str) -> Result<Arc<dyn Schema>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_matching_uses_assignability() {
        let ctor = ConstructorInfo::new("file", &[TypeKind::String, TypeKind::Long]);
        assert!(ctor.accepts(&[TypeKind::String, TypeKind::Int]));
        assert!(ctor.accepts(&[TypeKind::Null, TypeKind::Long]));
        assert!(!ctor.accepts(&[TypeKind::String]));
        assert!(!ctor.accepts(&[TypeKind::Int, TypeKind::Int]));
    }

    #[test]
    fn descriptor_lookup_is_case_insensitive() {
        let desc = TableDescriptor::from_pairs(
            "entities",
            &[
                ("Name", SemanticType::non_null(TypeKind::String)),
                ("Age", SemanticType::nullable(TypeKind::Int)),
            ],
        );
        assert_eq!(desc.column("age").map(|c| c.index), Some(1));
        assert!(desc.column("missing").is_none());
    }

    #[test]
    fn runtime_context_builder() {
        let vars = HashMap::from([("HOME".to_owned(), "/tmp".to_owned())]);
        let cx = RuntimeContext::new(CancellationToken::new(), 2, "e")
            .with_environment(vars)
            .correlated(true)
            .with_channel_capacity(8);
        assert_eq!(cx.source_position, 2);
        assert_eq!(cx.channel_capacity, 8);
        assert_eq!(cx.environment_variables["HOME"], "/tmp");
        assert!(cx.correlated);
    }
}
