//! Shared runtime model for the Musoq pipeline.
//!
//! - [`Value`]: dynamically-typed cell value.
//! - [`TypeKind`] / [`SemanticType`]: compile-time types with the numeric
//!   tower `Int < Long < Decimal < Double`.
//! - [`SchemaColumn`], [`Row`], [`Key`], [`Table`]: the row/column shapes that
//!   flow between the planner and the engine.
//! - [`CancellationToken`]: cooperative cancellation shared by the engine and
//!   row-source producers.

pub mod cx;
pub mod row;
pub mod ty;
pub mod value;

pub use cx::CancellationToken;
pub use row::{Key, Row, Table};
pub use ty::{SchemaColumn, SemanticType, TypeKind};
pub use value::{ArithOp, BitOp, Value, like_match};

pub use rust_decimal::Decimal;
