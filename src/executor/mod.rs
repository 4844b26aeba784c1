//! Mutation execution against the downstream store.
//!
//! The [`MutationExecutor`] trait is the seam between projection and the
//! GraphQL API. A single executor handle is built at startup and shared by
//! both workers; implementations must hold no per-call mutable state.
//!
//! ## Built-in Executors
//!
//! - [`HasuraExecutor`]: POSTs the rendered mutation to a Hasura endpoint
//! - [`LogExecutor`]: logs the rendered mutation and reports success (dry run)
//!
//! ## Custom Executors
//!
//! ```rust,ignore
//! use keybridge::executor::{ExecutionError, ExecutionResult, MutationExecutor};
//! use keybridge::mutation::ProjectedMutation;
//! use async_trait::async_trait;
//!
//! struct Recorder;
//!
//! #[async_trait]
//! impl MutationExecutor for Recorder {
//!     fn name(&self) -> &str {
//!         "recorder"
//!     }
//!
//!     async fn execute(&self, mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError> {
//!         Ok(ExecutionResult::success(self.name(), serde_json::Value::Null))
//!     }
//! }
//! ```

pub mod hasura;
pub mod log;

use crate::mutation::ProjectedMutation;
use async_trait::async_trait;
use thiserror::Error;

pub use hasura::HasuraExecutor;
pub use log::LogExecutor;

/// Errors that can occur while executing a mutation.
///
/// Every variant means the mutation is treated as not applied.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The request did not complete within the configured timeout
    #[error("mutation timed out after {0}ms")]
    Timeout(u64),

    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered with a non-success status
    #[error("endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The API reported errors in the GraphQL response body
    #[error("GraphQL error: {}", .0.join("; "))]
    Graphql(Vec<String>),

    /// The response body could not be decoded
    #[error("invalid response: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

/// Result of a successful mutation.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Name of the executor that applied the mutation
    pub executor: String,

    /// `data` section returned by the API
    pub echo: serde_json::Value,
}

impl ExecutionResult {
    /// Create a successful result carrying the API's `data` echo.
    pub fn success(executor: &str, echo: serde_json::Value) -> Self {
        Self {
            executor: executor.to_string(),
            echo,
        }
    }
}

/// Applies projected mutations to the downstream store.
///
/// # Thread Safety
///
/// Executors are shared across worker tasks behind an `Arc` and must be
/// `Send + Sync`.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    /// Short name for logs (e.g., "hasura", "log")
    fn name(&self) -> &str;

    /// Execute a mutation.
    ///
    /// Implementations perform no retries; redelivery is the queue's job.
    async fn execute(&self, mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError>;
}
