//! Batch state store
//!
//! One originator submission fans out into many requests; this crate tracks
//! the batch in a KV hash at `Sr_<batch_id>`: monotonic good/bad counters,
//! state, an external deliver-condition override, serialized common tags and
//! request list, and a TTL. Creating a batch also parks a delayed DLR
//! message that fires at the TTL and lets a downstream stage finalize or
//! time the batch out. Counter updates go through the KV store's atomic
//! hash ops; the router holds no locks of its own.

use serde::{Deserialize, Serialize};

pub mod kv;
pub mod store;

#[cfg(feature = "redis-store")]
pub mod redis_store;

pub use kv::{KvStore, MemoryKvStore};
pub use store::{BatchRecord, BatchStore, BatchTtl};

#[cfg(feature = "redis-store")]
pub use redis_store::RedisKvStore;

use sito_broker::BrokerError;

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Re-entry blocked: the batch's deliver condition is ABORT.
    #[error("batch '{0}' is not GO")]
    NotGo(String),

    #[error("batch '{0}' not found")]
    Missing(String),

    #[error("kv store error: {0}")]
    Store(String),

    #[error("unparseable batch field {field}: '{value}'")]
    BadField { field: String, value: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub type Result<T> = std::result::Result<T, BatchError>;

/// Batch lifecycle state. The string form keeps the delay epoch visible for
/// introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Processing,
    Delayed(i64),
    Aborted,
    Done,
}

impl BatchState {
    pub fn render(&self) -> String {
        match self {
            BatchState::Processing => "PROCESSING".to_string(),
            BatchState::Delayed(epoch) => format!("DELAYED:{epoch}"),
            BatchState::Aborted => "ABORTED".to_string(),
            BatchState::Done => "DONE".to_string(),
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PROCESSING" => Some(BatchState::Processing),
            "ABORTED" => Some(BatchState::Aborted),
            "DONE" => Some(BatchState::Done),
            other => other
                .strip_prefix("DELAYED:")
                .and_then(|epoch| epoch.parse().ok())
                .map(BatchState::Delayed),
        }
    }
}

/// External override consulted when a delayed batch re-enters the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliverCondition {
    #[default]
    Go,
    Abort,
}

impl DeliverCondition {
    pub fn render(&self) -> &'static str {
        match self {
            DeliverCondition::Go => "GO",
            DeliverCondition::Abort => "ABORT",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "GO" => Some(DeliverCondition::Go),
            "ABORT" => Some(DeliverCondition::Abort),
            _ => None,
        }
    }
}

/// Payload of the delayed batch-timeout message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlrMessage {
    pub batch_id: String,
    pub fire_epoch: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_including_delay_epoch() {
        for state in [
            BatchState::Processing,
            BatchState::Delayed(1_700_000_160),
            BatchState::Aborted,
            BatchState::Done,
        ] {
            assert_eq!(BatchState::parse(&state.render()), Some(state));
        }
        assert_eq!(BatchState::parse("DELAYED:nope"), None);
        assert_eq!(BatchState::parse("???"), None);
    }

    #[test]
    fn deliver_condition_round_trips() {
        assert_eq!(DeliverCondition::parse("GO"), Some(DeliverCondition::Go));
        assert_eq!(
            DeliverCondition::parse("ABORT"),
            Some(DeliverCondition::Abort)
        );
        assert_eq!(DeliverCondition::parse("MAYBE"), None);
    }
}
