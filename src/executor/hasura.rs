//! Hasura Executor - GraphQL mutations over HTTP.
//!
//! # Example
//!
//! ```rust,ignore
//! use keybridge::executor::HasuraExecutor;
//! use std::time::Duration;
//!
//! let executor = HasuraExecutor::new("http://127.0.0.1:8080/v1/graphql")
//!     .with_admin_secret("secret")
//!     .with_timeout(Duration::from_secs(10));
//! ```

use super::{ExecutionError, ExecutionResult, MutationExecutor};
use crate::mutation::ProjectedMutation;
use crate::ADMIN_SECRET_HEADER;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for mutation requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest response body kept in a status error
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    #[serde(default)]
    data: Value,

    #[serde(default)]
    errors: Vec<GraphqlErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorEntry {
    message: String,
}

/// Sends mutations to a Hasura GraphQL endpoint.
///
/// The HTTP client is reused for connection pooling; the admin secret is
/// attached to every request when non-empty.
#[derive(Debug, Clone)]
pub struct HasuraExecutor {
    endpoint: String,
    client: Client,
    admin_secret: Option<String>,
    timeout: Duration,
}

impl HasuraExecutor {
    /// Create an executor for the given GraphQL endpoint with the default timeout and no secret.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::new(),
            admin_secret: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the shared admin secret. An empty secret sends no header.
    pub fn with_admin_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        self.admin_secret = Some(secret).filter(|s| !s.is_empty());
        self
    }

    /// Set the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The GraphQL endpoint mutations are posted to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, mutation: &ProjectedMutation) -> Result<reqwest::Response, ExecutionError> {
        let request = mutation.to_graphql();
        let body = json!({
            "query": request.query,
            "variables": request.variables,
        });

        let mut builder = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&body);

        if let Some(secret) = &self.admin_secret {
            builder = builder.header(ADMIN_SECRET_HEADER, secret);
        }

        builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExecutionError::Timeout(self.timeout.as_millis() as u64)
            } else {
                ExecutionError::Http(e)
            }
        })
    }
}

#[async_trait]
impl MutationExecutor for HasuraExecutor {
    fn name(&self) -> &str {
        "hasura"
    }

    async fn execute(&self, mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError> {
        debug!(
            endpoint = %self.endpoint,
            operation = mutation.operation.as_str(),
            user_id = %mutation.target_id,
            "Sending mutation"
        );

        let response = self.send(mutation).await?;
        let status = response.status();

        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }

            warn!(
                endpoint = %self.endpoint,
                status = %status,
                user_id = %mutation.target_id,
                "Mutation rejected by endpoint"
            );
            return Err(ExecutionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        let parsed: GraphqlResponse = serde_json::from_slice(&bytes)?;

        if !parsed.errors.is_empty() {
            let messages: Vec<String> = parsed.errors.into_iter().map(|e| e.message).collect();
            warn!(
                user_id = %mutation.target_id,
                errors = ?messages,
                "Mutation returned GraphQL errors"
            );
            return Err(ExecutionError::Graphql(messages));
        }

        info!(
            operation = mutation.operation.as_str(),
            user_id = %mutation.target_id,
            "Mutation applied"
        );

        Ok(ExecutionResult::success(self.name(), parsed.data))
    }
}
