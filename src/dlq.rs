//! Poison-message handling.
//!
//! Without a limit, a message that can never be decoded or applied is
//! redelivered forever. [`RetryLimit`] caps the number of deliveries: once a
//! failing message reaches the cap it is rejected without requeue, which the
//! broker routes to the queue's dead-letter exchange (or drops if none is
//! configured). A [`FailedDelivery`] record is logged for the operator.
//!
//! The prior delivery count comes from the broker (`x-delivery-count` on
//! quorum queues). Queues that do not report it are never dead-lettered.

use crate::ack::AckDecision;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Bytes of the original body kept in a [`FailedDelivery`] record
const BODY_PREVIEW_LEN: usize = 256;

/// Upper bound on deliveries of a failing message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryLimit {
    max_deliveries: Option<u32>,
}

impl RetryLimit {
    /// Redeliver failing messages indefinitely.
    pub fn unbounded() -> Self {
        Self {
            max_deliveries: None,
        }
    }

    /// Allow at most `max_deliveries` deliveries (including the first).
    pub fn new(max_deliveries: u32) -> Self {
        Self {
            max_deliveries: Some(max_deliveries.max(1)),
        }
    }

    /// Build from the optional `max_deliveries` setting.
    pub fn from_config(max_deliveries: Option<u32>) -> Self {
        max_deliveries.map(Self::new).unwrap_or_default()
    }

    /// `None` when redelivery is unbounded.
    pub fn max_deliveries(&self) -> Option<u32> {
        self.max_deliveries
    }

    /// Escalate a requeue to a dead-letter once the limit is reached.
    ///
    /// `prior_deliveries` counts earlier deliveries of the same message, so
    /// the first delivery has a count of zero.
    pub fn apply(&self, decision: AckDecision, prior_deliveries: Option<u32>) -> AckDecision {
        match (decision, self.max_deliveries, prior_deliveries) {
            (AckDecision::RequeueAndRetry, Some(max), Some(prior)) if prior.saturating_add(1) >= max => {
                AckDecision::DeadLetter
            }
            (decision, _, _) => decision,
        }
    }
}

/// A delivery rejected after exhausting its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDelivery {
    pub queue: String,

    /// Error from the final attempt
    pub error: String,

    /// Deliveries made, including the final one
    pub deliveries: u32,

    /// RFC 3339 timestamp of the rejection
    pub failed_at: String,

    /// Leading bytes of the body, lossily decoded
    pub body_preview: String,
}

impl FailedDelivery {
    /// Capture a failed delivery; the body is cut to a short preview.
    pub fn new(queue: &str, error: &str, prior_deliveries: u32, body: &[u8]) -> Self {
        let preview = &body[..body.len().min(BODY_PREVIEW_LEN)];
        Self {
            queue: queue.to_string(),
            error: error.to_string(),
            deliveries: prior_deliveries.saturating_add(1),
            failed_at: chrono::Utc::now().to_rfc3339(),
            body_preview: String::from_utf8_lossy(preview).into_owned(),
        }
    }

    /// Emit the record as a structured warning.
    pub fn report(&self) {
        let record = serde_json::to_string(self).unwrap_or_default();
        warn!(
            queue = %self.queue,
            deliveries = self.deliveries,
            error = %self.error,
            record = %record,
            "Delivery exceeded retry limit, dead-lettering"
        );
    }
}
