//! Consumer loop for a single queue.
//!
//! A [`Worker`] takes deliveries one at a time, runs them through the
//! [`Pipeline`], settles each one before pulling the next, and stops when the
//! shutdown signal fires. A delivery already taken is always finished: the
//! shutdown check only happens between deliveries.

use crate::ack::{settle, AckDecision};
use crate::dlq::FailedDelivery;
use crate::event::EventFamily;
use crate::health::Metrics;
use crate::pipeline::Pipeline;
use crate::shutdown::ShutdownSignal;
use crate::transport::{Delivery, TransportError};
use std::sync::Arc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Shutdown was requested
    Shutdown,

    /// The delivery stream ended on its own
    StreamClosed,
}

/// Totals for a worker's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub acknowledged: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub settle_failures: u64,
}

#[derive(Debug)]
pub struct WorkerExit {
    pub queue: String,
    pub reason: ExitReason,
    pub stats: WorkerStats,
}

pub struct Worker {
    family: EventFamily,
    queue: String,
    pipeline: Arc<Pipeline>,
    metrics: Arc<Metrics>,
    shutdown: ShutdownSignal,
}

impl Worker {
    /// Create a worker for one queue. Nothing is consumed until [`Worker::run`].
    pub fn new(
        family: EventFamily,
        queue: impl Into<String>,
        pipeline: Arc<Pipeline>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            family,
            queue: queue.into(),
            pipeline,
            metrics,
            shutdown,
        }
    }

    /// Consume deliveries until shutdown or until the stream ends.
    pub async fn run<S, D>(self, deliveries: S) -> Result<WorkerExit, TransportError>
    where
        S: Stream<Item = Result<D, TransportError>> + Unpin,
        D: Delivery,
    {
        let mut deliveries = deliveries;
        let mut stats = WorkerStats::default();

        info!(queue = %self.queue, family = %self.family, "Worker started");

        let reason = loop {
            if self.shutdown.is_shutdown() {
                break ExitReason::Shutdown;
            }

            let next = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break ExitReason::Shutdown,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.handle(&delivery, &mut stats).await,
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "Delivery stream failed");
                    return Err(e);
                }
                None => {
                    warn!(queue = %self.queue, "Delivery stream closed");
                    break ExitReason::StreamClosed;
                }
            }
        };

        info!(
            queue = %self.queue,
            reason = ?reason,
            processed = stats.processed,
            acknowledged = stats.acknowledged,
            requeued = stats.requeued,
            dead_lettered = stats.dead_lettered,
            "Worker stopped"
        );

        Ok(WorkerExit {
            queue: self.queue,
            reason,
            stats,
        })
    }

    /// Process and settle one delivery.
    async fn handle<D: Delivery>(&self, delivery: &D, stats: &mut WorkerStats) {
        let prior = delivery.prior_deliveries();
        let outcome = self.pipeline.process(self.family, delivery.body()).await;
        let decision = self.pipeline.decide(&outcome, prior);

        if decision == AckDecision::DeadLetter {
            let error = outcome.error().unwrap_or_default();
            FailedDelivery::new(&self.queue, &error, prior.unwrap_or_default(), delivery.body()).report();
        }

        debug!(
            queue = %self.queue,
            outcome = outcome.as_str(),
            decision = %decision,
            prior_deliveries = ?prior,
            "Delivery processed"
        );

        stats.processed += 1;
        match decision {
            AckDecision::Acknowledge => stats.acknowledged += 1,
            AckDecision::RequeueAndRetry => stats.requeued += 1,
            AckDecision::DeadLetter => stats.dead_lettered += 1,
        }
        self.metrics.record(self.family, &outcome, decision);

        // An unsettled delivery is redelivered by the broker once the channel closes
        if let Err(e) = settle(delivery, decision).await {
            stats.settle_failures += 1;
            error!(
                queue = %self.queue,
                decision = %decision,
                error = %e,
                "Failed to settle delivery"
            );
        }

        if stats.processed % 100 == 0 {
            info!(
                queue = %self.queue,
                processed = stats.processed,
                requeued = stats.requeued,
                "Worker statistics"
            );
        }
    }
}
