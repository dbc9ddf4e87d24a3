//! Broker adapter for the sito message router
//!
//! The only component that touches broker wire state. Provides:
//! - BrokerChannel: the wire-level trait (declare, bind, publish, poll, ack)
//! - MemoryBroker: in-process broker with TTL + dead-letter semantics
//! - BrokerAdapter: idempotent topology declaration and the long-lived
//!   multi-queue consumer loop
//! - DelayScheduler: wall-clock delayed redelivery via per-minute delay queues

pub mod adapter;
pub mod channel;
pub mod delay;
pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use adapter::{BrokerAdapter, ConsumeCallback, ConsumeOutcome, ConsumeStats, QueueBinding};
pub use channel::{ArgValue, BrokerChannel, Delivery, ExchangeOptions, QueueOptions};
pub use delay::{DelayScheduler, DelaySpec};
pub use memory::MemoryBroker;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Passive declare of an exchange or queue that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("declare failed for '{name}': {reason}")]
    DeclareFailed { name: String, reason: String },

    #[error("publish to '{exchange}' failed: {reason}")]
    PublishFailed { exchange: String, reason: String },

    #[error("consumer failed on '{queue}': {reason}")]
    ConsumerFailed { queue: String, reason: String },

    #[error("broker connection error: {0}")]
    Connection(String),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
