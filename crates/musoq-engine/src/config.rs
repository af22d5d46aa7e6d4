//! Engine configuration.
//!
//! Every section deserializes with defaults, so `{}` is a valid document.
//! [`EngineConfig::validate`] collects all problems before reporting them.

use musoq_error::{MusoqError, Result};
use musoq_planner::CompilationOptions;
use serde::{Deserialize, Serialize};

/// Runtime knobs for query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Worker threads for projection and set-operation branches. `1` keeps
    /// execution on the calling thread.
    pub parallelism: usize,
    /// Minimum rows in a block before projection is fanned out.
    pub parallel_threshold: usize,
    /// Rows per chunk when materialized tables are read back.
    pub chunk_size: usize,
    /// Chunks buffered between a producer thread and the engine.
    pub channel_capacity: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            parallel_threshold: 4096,
            chunk_size: 1024,
            channel_capacity: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanCacheConfig {
    pub enabled: bool,
    /// Maximum cached plans; the oldest entry is evicted first.
    pub capacity: usize,
}

impl Default for PlanCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 128,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub compilation: CompilationOptions,
    pub execution: ExecutionOptions,
    pub plan_cache: PlanCacheConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|err| MusoqError::InvalidConfig(format!("malformed engine config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let exec = &self.execution;
        if exec.parallelism == 0 {
            problems.push("execution.parallelism must be at least 1".to_owned());
        }
        if exec.chunk_size == 0 {
            problems.push("execution.chunk_size must be at least 1".to_owned());
        }
        if exec.channel_capacity == 0 {
            problems.push("execution.channel_capacity must be at least 1".to_owned());
        }
        if self.plan_cache.enabled && self.plan_cache.capacity == 0 {
            problems.push("plan_cache.capacity must be at least 1 when enabled".to_owned());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(MusoqError::InvalidConfig(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_json_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.execution.parallelism, 1);
        assert!(config.plan_cache.enabled);
        assert!(config.compilation.use_sort_merge_join);
    }

    #[test]
    fn partial_sections_fill_missing_fields() {
        let config = EngineConfig::from_json_str(
            r#"{"execution": {"parallelism": 4}, "plan_cache": {"capacity": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.execution.chunk_size, 1024);
        assert_eq!(config.plan_cache.capacity, 2);
        assert!(config.plan_cache.enabled);
    }

    #[test]
    fn invalid_values_are_all_reported() {
        let err = EngineConfig::from_json_str(
            r#"{"execution": {"parallelism": 0, "chunk_size": 0}}"#,
        )
        .unwrap_err();
        let MusoqError::InvalidConfig(detail) = err else {
            unreachable!("expected InvalidConfig");
        };
        assert!(detail.contains("parallelism"));
        assert!(detail.contains("chunk_size"));
    }

    #[test]
    fn malformed_json_is_invalid_config() {
        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, MusoqError::InvalidConfig(_)));
    }

    #[test]
    fn disabled_cache_may_have_zero_capacity() {
        let config =
            EngineConfig::from_json_str(r#"{"plan_cache": {"enabled": false, "capacity": 0}}"#)
                .unwrap();
        assert!(!config.plan_cache.enabled);
    }
}
