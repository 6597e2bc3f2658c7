//! Message broker abstractions.
//!
//! The producer and consumer talk to the queue through two traits:
//!
//! - [`Connector`] opens a fully initialized session (connection, channel,
//!   declared queue) in a single attempt.
//! - [`QueueSession`] publishes to and consumes from that queue.
//!
//! Reconnect policy lives in [`ConnectionManager`], which wraps any
//! connector and retries until it succeeds or shutdown is requested.

pub mod amqp;
pub mod connection;
#[cfg(test)]
pub(crate) mod memory;

use async_trait::async_trait;

use crate::error::Result;

pub use amqp::{AmqpConnector, AmqpSession};
pub use connection::{ConnectionManager, ConnectionState, RetryPolicy};

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// Survives broker restarts
    pub durable: bool,
    /// Append-only stream queue (`x-queue-type = stream`)
    pub stream: bool,
}

impl QueueSpec {
    /// A durable stream queue, the only kind the pipeline uses.
    pub fn stream(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            stream: true,
        }
    }
}

/// A message received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped delivery tag used for ack/reject
    pub tag: u64,
    /// Position in the stream, when the broker reports one
    pub offset: Option<u64>,
    pub data: Vec<u8>,
}

/// An open channel bound to the declared queue.
#[async_trait]
pub trait QueueSession: Send {
    /// Publish one payload and wait for the broker to confirm it.
    async fn publish(&mut self, payload: &[u8]) -> Result<()>;

    /// Start consuming the queue.
    ///
    /// `resume_from` is the stream offset to start at. `None` uses the
    /// configured starting point.
    async fn subscribe(&mut self, consumer_tag: &str, resume_from: Option<u64>) -> Result<()>;

    /// Next delivery, or `None` once the subscription has ended.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Reject a delivery without requeueing it.
    async fn reject(&mut self, tag: u64) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens sessions against a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: QueueSession;

    /// One connection attempt. Either returns a session whose queue is
    /// declared, or an error; never a half-open session.
    async fn connect(&self) -> Result<Self::Session>;

    /// Broker address for log lines.
    fn describe(&self) -> String;
}
