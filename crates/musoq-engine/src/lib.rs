//! Execution engine for Musoq query plans.
//!
//! [`compile`] runs the planner and binds the plan to its environment
//! variables; [`CompiledQuery::run`] executes it against the schemas the plan
//! resolved. Row sources are pulled chunk by chunk on the calling thread.
//! Projection and set-operation branches may fan out across scoped worker
//! threads when [`ExecutionOptions::parallelism`] allows it.
//!
//! [`PlanCache`] keeps compiled plans keyed by canonical query text.

mod block;
pub mod cache;
pub mod config;
pub mod eval;
mod join;
pub mod query;
mod scan;
mod statement;

pub use cache::{cache_key, PlanCache, PlanCacheStats};
pub use config::{EngineConfig, ExecutionOptions, PlanCacheConfig};
pub use eval::{eval, eval_predicate, EvalRow};
pub use query::{compile, CompiledQuery, QueryResult, QueryStats, RESULT_TABLE};
