//! Router core for the sito message queue router
//!
//! Owns the message packet while a stage runs and moves it along its process
//! route:
//! - RouterCore: publish_start / publish_next / publish_notify /
//!   publish_abort / set_branch_class
//! - route: the history/route prefix-matching algorithm and the retry/abort
//!   route surgery
//! - expand: `%%ident%%` substitution of router fields into publish args
//! - stage: the Stage plugin trait, static registry, and the consume-side
//!   dispatch glue
//! - collab: traits for the external collaborators the router consumes but
//!   never implements

pub mod collab;
pub mod core;
pub mod expand;
pub mod route;
pub mod stage;

pub use crate::core::{AbortArgs, RouterContext, RouterCore};
pub use route::NextClass;
pub use stage::{RequestResultsStage, Stage, StageDispatch, StageRegistry};

use sito_broker::BrokerError;
use sito_common::{CodecError, SitoReturn};
use sito_config::ConfigError;
use sito_dbqueue::DbQueueError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("'{0}' is not a configured work class")]
    UnknownWorkClass(String),

    #[error("'{0}' is not a configured notify class")]
    UnknownNotifyClass(String),

    #[error("'{0}' is not a configured exchange class")]
    NotExchangeClass(String),

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("work class '{0}' has an empty process route")]
    NoProcessRoute(String),

    /// Router operation called before the packet was initialized.
    #[error("out of sequence: {0}")]
    OutOfSequence(String),

    #[error("history drifted past route at '{last}'")]
    HistoryDriftedPastRoute { last: String },

    #[error("last history entry '{last}' is absent from the route")]
    MissingLastInRoute { last: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    DbQueue(#[from] DbQueueError),

    #[error("invalid time zone: {0}")]
    TimeZoneInvalid(String),

    #[error("unparseable time: {0}")]
    TimeParseError(String),

    /// Opaque stage failure carried onward in sito_return.
    #[error("stage error {0}")]
    Stage(SitoReturn),
}

pub type Result<T> = std::result::Result<T, RouterError>;
