//! Per-delivery processing.
//!
//! ```text
//! body ──► envelope decode ──► router (detail decode + projection)
//!                                   │
//!                      mutation? ───┴──► executor ──► Outcome ──► AckDecision
//! ```
//!
//! Any decode failure short-circuits: nothing is executed and the delivery is
//! requeued. The pipeline holds no per-delivery state, so one instance is
//! shared by both workers.

use crate::ack::{AckDecision, Outcome};
use crate::dlq::RetryLimit;
use crate::event::EventFamily;
use crate::executor::MutationExecutor;
use crate::details::DetailPayload;
use crate::router::{self, DispatchError};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct Pipeline {
    executor: Arc<dyn MutationExecutor>,
    retry_limit: RetryLimit,
}

impl Pipeline {
    /// Create a pipeline around a shared executor, with unbounded redelivery.
    pub fn new(executor: Arc<dyn MutationExecutor>) -> Self {
        Self {
            executor,
            retry_limit: RetryLimit::unbounded(),
        }
    }

    /// Set the poison-message cutoff.
    pub fn with_retry_limit(mut self, retry_limit: RetryLimit) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// The configured poison-message cutoff.
    pub fn retry_limit(&self) -> RetryLimit {
        self.retry_limit
    }

    /// Name of the executor mutations are sent to.
    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Decode, route and apply one delivery body.
    pub async fn process(&self, family: EventFamily, body: &[u8]) -> Outcome {
        let dispatch = match router::dispatch(family, body) {
            Ok(dispatch) => dispatch,
            Err(DispatchError {
                summary: Some(summary),
                error,
            }) => {
                error!(
                    family = %family,
                    class = %summary.class,
                    event_type = %summary.event_type,
                    realm_id = %summary.realm_id,
                    user_id = summary.user_id.as_deref().unwrap_or_default(),
                    time = %summary.time,
                    error = %error,
                    "Failed to decode event payload"
                );
                return Outcome::DecodeFailed(error);
            }
            Err(DispatchError {
                summary: None,
                error,
            }) => {
                error!(
                    family = %family,
                    error = %error,
                    body_len = body.len(),
                    "Failed to decode event envelope"
                );
                return Outcome::DecodeFailed(error);
            }
        };

        let summary = &dispatch.summary;

        if !dispatch.recognized {
            info!(
                family = %family,
                event_type = %summary.event_type,
                realm_id = %summary.realm_id,
                "Do nothing"
            );
            return Outcome::Unrecognized;
        }

        let Some(mutation) = dispatch.mutation else {
            return Outcome::NothingToApply;
        };

        info!(
            family = %family,
            class = %summary.class,
            event_type = %summary.event_type,
            realm_id = %summary.realm_id,
            user_id = %mutation.target_id,
            operation = mutation.operation.as_str(),
            detail = dispatch.detail.as_ref().map(DetailPayload::shape).unwrap_or_default(),
            "Projecting event"
        );

        match self.executor.execute(&mutation).await {
            Ok(result) => Outcome::Applied(result),
            Err(e) => {
                warn!(
                    family = %family,
                    class = %summary.class,
                    event_type = %summary.event_type,
                    realm_id = %summary.realm_id,
                    user_id = %mutation.target_id,
                    executor = %self.executor.name(),
                    error = %e,
                    "Mutation failed"
                );
                Outcome::ExecutionFailed(e)
            }
        }
    }

    /// Final decision for an outcome, applying the retry limit.
    pub fn decide(&self, outcome: &Outcome, prior_deliveries: Option<u32>) -> AckDecision {
        self.retry_limit.apply(outcome.decision(), prior_deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionError, ExecutionResult, LogExecutor};
    use crate::mutation::ProjectedMutation;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts calls and fails on demand.
    struct CountingExecutor {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingExecutor {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl MutationExecutor for CountingExecutor {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self, _mutation: &ProjectedMutation) -> Result<ExecutionResult, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ExecutionError::Graphql(vec!["rejected".into()]))
            } else {
                Ok(ExecutionResult::success("counting", Value::Null))
            }
        }
    }

    fn client(event_type: &str, details: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"type": event_type, "userId": "u1", "details": details})).unwrap()
    }

    #[tokio::test]
    async fn test_unrecognized_is_acknowledged_without_execution() {
        let executor = CountingExecutor::new(false);
        let pipeline = Pipeline::new(executor.clone());

        let outcome = pipeline.process(EventFamily::Client, &client("CODE_TO_TOKEN", json!({}))).await;
        assert!(matches!(outcome, Outcome::Unrecognized));
        assert_eq!(pipeline.decide(&outcome, Some(0)), AckDecision::Acknowledge);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_login_is_acknowledged_without_execution() {
        let executor = CountingExecutor::new(true);
        let pipeline = Pipeline::new(executor.clone());

        let outcome = pipeline.process(EventFamily::Client, &client("LOGIN", json!({"username": "ab"}))).await;
        assert!(matches!(outcome, Outcome::NothingToApply));
        assert_eq!(outcome.decision(), AckDecision::Acknowledge);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_detail_requeues_without_execution() {
        let executor = CountingExecutor::new(false);
        let pipeline = Pipeline::new(executor.clone());

        let outcome = pipeline.process(EventFamily::Client, &client("REGISTER", json!("oops"))).await;
        assert!(matches!(outcome, Outcome::DecodeFailed(_)));
        assert_eq!(pipeline.decide(&outcome, Some(0)), AckDecision::RequeueAndRetry);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_array_detail_requeues_without_execution() {
        let executor = CountingExecutor::new(false);
        let pipeline = Pipeline::new(executor.clone());

        let outcome = pipeline
            .process(EventFamily::Client, &client("REGISTER", json!(["A", "B", "a@b.com"])))
            .await;
        assert!(matches!(outcome, Outcome::DecodeFailed(_)));
        assert_eq!(pipeline.decide(&outcome, Some(0)), AckDecision::RequeueAndRetry);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_array_envelope_requeues_without_execution() {
        let executor = CountingExecutor::new(false);
        let pipeline = Pipeline::new(executor.clone());

        let outcome = pipeline
            .process(EventFamily::Client, br#"["ClientMsg", 0, "REGISTER", "master", "web", "u1"]"#)
            .await;
        assert_eq!(outcome.decision(), AckDecision::RequeueAndRetry);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_null_login_detail_is_acknowledged() {
        let pipeline = Pipeline::new(CountingExecutor::new(false));

        let outcome = pipeline.process(EventFamily::Client, &client("LOGIN", Value::Null)).await;
        assert!(matches!(outcome, Outcome::NothingToApply));
        assert_eq!(pipeline.decide(&outcome, None), AckDecision::Acknowledge);
    }

    #[tokio::test]
    async fn test_malformed_envelope_requeues() {
        let pipeline = Pipeline::new(CountingExecutor::new(false));
        let outcome = pipeline.process(EventFamily::Admin, b"{").await;
        assert_eq!(outcome.decision(), AckDecision::RequeueAndRetry);
    }

    #[tokio::test]
    async fn test_execution_failure_requeues() {
        let executor = CountingExecutor::new(true);
        let pipeline = Pipeline::new(executor.clone());

        let outcome = pipeline.process(EventFamily::Client, &client("VERIFY_EMAIL", json!({}))).await;
        assert!(matches!(outcome, Outcome::ExecutionFailed(_)));
        assert_eq!(pipeline.decide(&outcome, None), AckDecision::RequeueAndRetry);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_acknowledges() {
        let pipeline = Pipeline::new(Arc::new(LogExecutor::new()));
        assert_eq!(pipeline.executor_name(), "log");

        let outcome = pipeline
            .process(EventFamily::Client, &client("REGISTER", json!({"first_name": "A"})))
            .await;
        assert!(matches!(outcome, Outcome::Applied(_)));
        assert_eq!(pipeline.decide(&outcome, Some(0)), AckDecision::Acknowledge);
    }

    #[tokio::test]
    async fn test_retry_limit_dead_letters() {
        let pipeline = Pipeline::new(CountingExecutor::new(true)).with_retry_limit(RetryLimit::new(2));
        assert_eq!(pipeline.retry_limit().max_deliveries(), Some(2));

        let outcome = pipeline.process(EventFamily::Client, &client("VERIFY_EMAIL", json!({}))).await;
        assert_eq!(pipeline.decide(&outcome, Some(0)), AckDecision::RequeueAndRetry);
        assert_eq!(pipeline.decide(&outcome, Some(1)), AckDecision::DeadLetter);
    }
}
