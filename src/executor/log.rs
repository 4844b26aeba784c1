//! Log Executor - dry run that only logs the rendered mutation.
//!
//! Useful when pointing the bridge at a live queue without touching the
//! downstream store.

use super::{ExecutionError, ExecutionResult, MutationExecutor};
use crate::mutation::ProjectedMutation;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone)]
pub struct LogExecutor {
    /// Prefix for log messages
    prefix: String,
}

impl LogExecutor {
    /// Create a LogExecutor with the default `dry-run` prefix.
    pub fn new() -> Self {
        Self {
            prefix: "dry-run".to_string(),
        }
    }

    /// Create a LogExecutor with a custom log prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MutationExecutor for LogExecutor {
    fn name(&self) -> &str {
        "log"
    }

    async fn execute(&self, mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError> {
        let request = mutation.to_graphql();

        info!(
            prefix = %self.prefix,
            operation = mutation.operation.as_str(),
            user_id = %mutation.target_id,
            variables = %request.variables,
            "[{}] Would execute {} for {}",
            self.prefix,
            mutation.operation.as_str(),
            mutation.target_id
        );

        Ok(ExecutionResult::success(
            self.name(),
            json!({ "dry_run": true, "id": mutation.target_id }),
        ))
    }
}
