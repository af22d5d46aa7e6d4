//! Data-source contracts and the method library.
//!
//! - [`Schema`] / [`SchemaProvider`]: how `#schema.table(args)` resolves to a
//!   column layout at compile time and a [`RowSource`] at run time.
//! - [`MethodRegistry`]: scalar and aggregate overloads with
//!   exact-then-assignable resolution.
//! - [`library`] / [`agg_library`]: the base methods every schema exposes.
//! - [`memory`]: in-memory schemas for embedding and tests.

pub mod agg_library;
pub mod library;
pub mod memory;
pub mod method;
pub mod schema;
pub mod source;

pub use agg_library::register_base_aggregates;
pub use library::register_base_library;
pub use memory::{InMemorySchema, InMemorySchemaProvider, OpenRecord, RowFn};
pub use method::{
    AggregateAdapter, AggregateMethod, CallContext, ErasedAggregateMethod, MethodKind,
    MethodRegistry, MethodSignature, ResolvedAggregate, ResolvedMethod, ReturnType, ScalarMethod,
};
pub use schema::{ConstructorInfo, RuntimeContext, Schema, SchemaProvider, TableDescriptor};
pub use source::{
    drain_source, ChunkSender, ChunkedRowSource, ObjectResolver, RowResolver, RowSource,
    SourceContext, TableRowSource, VecRowSource,
};
