//! Queue transport.
//!
//! Workers only see the [`Delivery`] trait: a body plus the three ways of
//! settling it. [`Transport`] provides the RabbitMQ implementation on top of
//! `lapin`, one channel per consumed queue.
//!
//! Connection health is reported on an observer channel as
//! [`ConnectionState`] transitions. Reconnection is left to the process
//! supervisor: when the connection drops, the delivery streams end and the
//! workers exit.

use async_trait::async_trait;
use lapin::message::Delivery as LapinDelivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties};
use std::pin::Pin;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

/// Header carrying the prior delivery count on quorum queues
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Errors raised by the queue transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// The connection or channel went away
    #[error("transport closed: {0}")]
    Closed(String),
}

/// Connectivity transitions, reported for observability only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    Unready(String),
}

/// A single message handed to a worker.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Exact message payload
    fn body(&self) -> &[u8];

    /// Earlier deliveries of this message, if the broker reports them
    fn prior_deliveries(&self) -> Option<u32>;

    /// Remove the message from the queue
    async fn ack(&self) -> Result<(), TransportError>;

    /// Return the message to the queue for redelivery
    async fn requeue(&self) -> Result<(), TransportError>;

    /// Reject the message without requeue
    async fn dead_letter(&self) -> Result<(), TransportError>;
}

/// Stream of deliveries from one queue.
pub type DeliveryStream =
    Pin<Box<dyn Stream<Item = Result<AmqpDelivery, TransportError>> + Send>>;

/// A RabbitMQ delivery.
pub struct AmqpDelivery(LapinDelivery);

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    fn prior_deliveries(&self) -> Option<u32> {
        prior_deliveries(self.0.properties.headers().as_ref(), self.0.redelivered)
    }

    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn requeue(&self) -> Result<(), TransportError> {
        self.0
            .acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }

    async fn dead_letter(&self) -> Result<(), TransportError> {
        self.0
            .acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(TransportError::from)
    }
}

/// Work out how many times a message was delivered before.
///
/// Quorum queues report the count in a header. Without it, a first delivery
/// is known to be zero and a redelivery is unknown.
pub fn prior_deliveries(headers: Option<&FieldTable>, redelivered: bool) -> Option<u32> {
    let from_header = headers.and_then(|table| {
        table
            .inner()
            .iter()
            .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
            .and_then(|(_, value)| header_count(value))
    });

    match from_header {
        Some(count) => Some(count),
        None if !redelivered => Some(0),
        None => None,
    }
}

fn header_count(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        _ => None,
    }
}

/// Consumer tag for a queue: `keybridge-<host>-<queue>`.
pub fn consumer_tag(queue: &str) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.to_str().map(str::to_string))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    format!("keybridge-{}-{}", host, queue)
}

/// An open RabbitMQ connection.
pub struct Transport {
    connection: Connection,
    channels: Mutex<Vec<Channel>>,
}

impl Transport {
    /// Connect to the broker.
    ///
    /// Returns the transport and a receiver of connectivity transitions. A
    /// `Ready` state is queued immediately on success.
    pub async fn connect(
        uri: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionState>), TransportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let error_tx = tx.clone();
        connection.on_error(move |err| {
            let _ = error_tx.send(ConnectionState::Unready(err.to_string()));
        });
        let _ = tx.send(ConnectionState::Ready);

        info!("Connected to RabbitMQ");

        Ok((
            Self {
                connection,
                channels: Mutex::new(Vec::new()),
            },
            rx,
        ))
    }

    /// Start consuming a queue on its own channel.
    pub async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, TransportError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;

        let tag = consumer_tag(queue);
        let consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(queue = %queue, consumer_tag = %tag, prefetch = prefetch, "Consuming queue");

        if let Ok(mut channels) = self.channels.lock() {
            channels.push(channel);
        }

        let stream = consumer.map(|result| result.map(AmqpDelivery).map_err(TransportError::from));
        Ok(Box::pin(stream))
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Close all channels, then the connection.
    pub async fn close(&self) {
        let channels: Vec<Channel> = match self.channels.lock() {
            Ok(mut channels) => channels.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        for channel in channels {
            if let Err(e) = channel.close(200, "shutting down").await {
                debug!(error = %e, "Channel close failed");
            }
        }

        if self.is_connected() {
            if let Err(e) = self.connection.close(200, "shutting down").await {
                warn!(error = %e, "Connection close failed");
            }
        }

        info!("RabbitMQ connection closed");
    }
}
