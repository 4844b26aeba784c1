//! Acknowledgment policy.
//!
//! Every delivery ends in exactly one terminal [`AckDecision`]. The decision
//! is a pure function of the processing [`Outcome`], optionally escalated to
//! a dead-letter by the configured [`RetryLimit`](crate::dlq::RetryLimit).
//!
//! ```text
//! Outcome                         | Decision
//! --------------------------------|------------------
//! envelope/detail decode failure  | RequeueAndRetry
//! unrecognized type               | Acknowledge
//! recognized, nothing to apply    | Acknowledge
//! mutation failed                 | RequeueAndRetry
//! mutation applied                | Acknowledge
//! ```

use crate::event::DecodeError;
use crate::executor::{ExecutionError, ExecutionResult};
use crate::transport::{Delivery, TransportError};
use tracing::debug;

/// How a single delivery was processed.
#[derive(Debug)]
pub enum Outcome {
    /// The projected mutation was applied downstream
    Applied(ExecutionResult),

    /// Recognized type whose projection is intentionally empty
    NothingToApply,

    /// Type with no dispatch entry
    Unrecognized,

    /// Envelope or detail payload could not be decoded
    DecodeFailed(DecodeError),

    /// The downstream mutation failed
    ExecutionFailed(ExecutionError),
}

impl Outcome {
    /// Terminal decision for this outcome, before any retry limit applies.
    pub fn decision(&self) -> AckDecision {
        match self {
            Outcome::Applied(_) | Outcome::NothingToApply | Outcome::Unrecognized => {
                AckDecision::Acknowledge
            }
            Outcome::DecodeFailed(_) | Outcome::ExecutionFailed(_) => AckDecision::RequeueAndRetry,
        }
    }

    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied(_) => "applied",
            Outcome::NothingToApply => "nothing-to-apply",
            Outcome::Unrecognized => "unrecognized",
            Outcome::DecodeFailed(_) => "decode-failed",
            Outcome::ExecutionFailed(_) => "execution-failed",
        }
    }

    /// Failure description, if this outcome is a failure.
    pub fn error(&self) -> Option<String> {
        match self {
            Outcome::DecodeFailed(e) => Some(e.to_string()),
            Outcome::ExecutionFailed(e) => Some(e.to_string()),
            _ => None,
        }
    }
}

/// Terminal delivery outcome reported to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Remove the message permanently
    Acknowledge,

    /// Return the message to the queue for redelivery
    RequeueAndRetry,

    /// Reject without requeue; only reachable with a retry limit configured
    DeadLetter,
}

impl AckDecision {
    /// Label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            AckDecision::Acknowledge => "ack",
            AckDecision::RequeueAndRetry => "requeue",
            AckDecision::DeadLetter => "dead-letter",
        }
    }
}

impl std::fmt::Display for AckDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Report a decision to the queue.
pub async fn settle<D: Delivery>(delivery: &D, decision: AckDecision) -> Result<(), TransportError> {
    debug!(decision = %decision, "Settling delivery");

    match decision {
        AckDecision::Acknowledge => delivery.ack().await,
        AckDecision::RequeueAndRetry => delivery.requeue().await,
        AckDecision::DeadLetter => delivery.dead_letter().await,
    }
}
