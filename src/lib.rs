//! # Keybridge
//!
//! Projects identity-provider lifecycle events into the application's user
//! table. Keycloak publishes client and admin events to RabbitMQ; each event
//! type with a projection becomes an idempotent Hasura mutation, and the
//! delivery is acknowledged only once that mutation succeeds.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ ─► Worker ─► Pipeline ─► Router ─► ProjectedMutation ─► Executor ─► Hasura
//!                 ▲                                                    │
//!                 └──────────────── ack / requeue / dead-letter ◄──────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: wire envelopes and decode errors
//! - [`details`]: typed detail payloads
//! - [`router`]: per-family dispatch tables
//! - [`mutation`]: projections and their GraphQL rendering
//! - [`executor`]: the executor trait and built-in executors
//! - [`ack`] / [`dlq`]: acknowledgment and retry-limit policy
//! - [`pipeline`] / [`worker`]: per-delivery processing and the consumer loop
//! - [`transport`]: RabbitMQ deliveries and connection
//! - [`config`], [`shutdown`], [`health`]: process plumbing

pub mod ack;
pub mod config;
pub mod details;
pub mod dlq;
pub mod event;
pub mod executor;
pub mod health;
pub mod mutation;
pub mod pipeline;
pub mod router;
pub mod shutdown;
pub mod transport;
pub mod worker;

// Re-export commonly used types at crate root
pub use ack::{AckDecision, Outcome};
pub use event::{AdminEvent, ClientEvent, DecodeError, EventFamily};
pub use executor::{ExecutionError, ExecutionResult, MutationExecutor};
pub use mutation::{MutationOp, ProjectedMutation};
pub use pipeline::Pipeline;

/// Header carrying the shared Hasura admin secret
pub const ADMIN_SECRET_HEADER: &str = "x-hasura-admin-secret";
