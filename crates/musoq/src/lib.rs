//! Public API facade for Musoq.
//!
//! [`Engine`] owns a schema provider, an [`EngineConfig`] and a plan cache.
//! Query text is parsed, pretty-printed into canonical form and looked up in
//! the cache before the planner runs.
//!
//! ```ignore
//! let engine = Engine::new(Arc::new(provider));
//! let table = engine.query("SELECT Name FROM #test.entities()")?;
//! ```

use std::sync::Arc;
use std::time::Instant;

pub use musoq_ast as ast;
pub use musoq_engine::{
    cache_key, compile, CompiledQuery, EngineConfig, ExecutionOptions, PlanCache,
    PlanCacheConfig, PlanCacheStats, QueryResult, QueryStats, RESULT_TABLE,
};
pub use musoq_error::{ErrorCode, MusoqError, Result};
pub use musoq_parser::parse_query;
pub use musoq_planner::{CompilationOptions, EnvironmentVariables, QueryPlan};
pub use musoq_schema::{
    AggregateMethod, CallContext, InMemorySchema, InMemorySchemaProvider, MethodSignature,
    ReturnType, RowResolver, RowSource, RuntimeContext, ScalarMethod, Schema, SchemaProvider,
    SourceContext, TableDescriptor,
};
pub use musoq_types::{CancellationToken, Row, SchemaColumn, SemanticType, Table, TypeKind, Value};

use tracing::debug;

/// Query entry point bound to one schema provider.
pub struct Engine {
    provider: Arc<dyn SchemaProvider>,
    config: EngineConfig,
    cache: PlanCache,
}

impl Engine {
    #[must_use]
    pub fn new(provider: Arc<dyn SchemaProvider>) -> Self {
        let config = EngineConfig::default();
        Self {
            provider,
            cache: PlanCache::new(config.plan_cache),
            config,
        }
    }

    /// Engine with a validated configuration.
    pub fn with_config(provider: Arc<dyn SchemaProvider>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            cache: PlanCache::new(config.plan_cache),
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn cache(&self) -> &PlanCache {
        &self.cache
    }

    /// Parse and plan `text`, reusing a cached plan for the same canonical
    /// text, options and environment.
    pub fn compile(
        &self,
        text: &str,
        environment: EnvironmentVariables,
        token: &CancellationToken,
    ) -> Result<CompiledQuery> {
        let started = Instant::now();
        let stmt = parse_query(text)?;
        let canonical = stmt.to_string();
        let key = cache_key(&canonical, &self.config.compilation, &environment);
        if let Some(plan) = self.cache.get(key, &canonical) {
            return Ok(CompiledQuery::new(
                plan,
                environment,
                self.config.execution,
                started.elapsed(),
            ));
        }
        let compiled = compile(&stmt, self.provider.as_ref(), environment, &self.config, token)?;
        if self.cache.is_enabled() {
            self.cache.insert(key, &canonical, compiled.shared_plan());
            debug!(target: "musoq.cache", key, "plan cached");
        }
        Ok(compiled)
    }

    /// Compile and run `text` once.
    pub fn execute(
        &self,
        text: &str,
        environment: EnvironmentVariables,
        token: &CancellationToken,
    ) -> Result<QueryResult> {
        self.compile(text, environment, token)?.run(token)
    }

    /// Run `text` with no environment variables and a fresh token.
    pub fn query(&self, text: &str) -> Result<Table> {
        let token = CancellationToken::new();
        Ok(self.execute(text, EnvironmentVariables::new(), &token)?.table)
    }
}
