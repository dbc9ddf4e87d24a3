//! Wire-level broker channel trait
//!
//! Transport bindings implement this; everything above it (adapter, delay
//! scheduler, DB-update publisher) is transport-agnostic. Exchanges are
//! direct type, non-durable, non-internal; the empty exchange name routes
//! straight to the queue named by the routing key.

use async_trait::async_trait;

use crate::Result;

/// Queue/exchange declare argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
}

/// Declared-queue arguments understood by the delay topology.
pub const ARG_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
pub const ARG_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
pub const ARG_MESSAGE_TTL: &str = "x-message-ttl";
pub const ARG_QUEUE_EXPIRES: &str = "x-expires";

#[derive(Debug, Clone, Default)]
pub struct ExchangeOptions {
    /// Check existence only; error with NotFound instead of creating.
    pub passive: bool,
}

#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub passive: bool,
    pub args: Vec<(String, ArgValue)>,
}

impl QueueOptions {
    pub fn passive() -> Self {
        Self {
            passive: true,
            args: Vec::new(),
        }
    }
}

/// One message handed to a consumer callback.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// Transport seam. One channel per worker process; callers serialize their
/// own per-queue processing on top.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn exchange_declare(&self, name: &str, opts: ExchangeOptions) -> Result<()>;

    async fn queue_declare(&self, name: &str, opts: QueueOptions) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Best-effort publish, ack disabled for throughput.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<()>;

    /// Fetch up to `max` ready messages without blocking on an empty queue.
    async fn poll(&self, queue: &str, max: u32) -> Result<Vec<Delivery>>;

    async fn ack(&self, queue: &str, tag: u64) -> Result<()>;

    /// Negative-acknowledge; `requeue` puts the message back at the head,
    /// otherwise it dead-letters (or drops when no DLX is configured).
    async fn nack(&self, queue: &str, tag: u64, requeue: bool) -> Result<()>;
}
