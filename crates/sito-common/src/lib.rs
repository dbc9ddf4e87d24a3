//! Shared types for the sito message router
//!
//! This crate holds everything that flows between router components:
//! - MessagePacket: the cargo + settings envelope that traverses a route
//! - PacketCodec: JSON wire codec with configurable top-level keys
//! - Clock: injectable wall-clock so tests can pin time

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod packet;

pub use clock::{Clock, ManualClock, SystemClock};
pub use packet::{MessagePacket, PacketCodec, PacketSettings, PublishArgs, RetryEvent};

/// Sentinel route entry recording one scheduled retry hop.
pub const RETRY_CLASS: &str = "Retry";
/// Sentinel route entry marking the switch onto an abort route.
pub const ABORT_CLASS: &str = "Abort";
/// Global fallback abort route when a class declares none.
pub const DEFAULT_ABORT_CLASS: &str = "RequestResults";

/// Default top-level payload key for router-managed metadata.
pub const DEFAULT_SETTINGS_KEY: &str = "settings";
/// Default top-level payload key for the opaque originator payload.
pub const DEFAULT_CARGO_KEY: &str = "cargo";

/// Reserved request tag names written by the DB-update publisher.
pub const TAG_SETTINGS: &str = "_sito_settings";
pub const TAG_CARGO: &str = "_sito_cargo";
pub const TAG_HISTORY: &str = "_sito_history";
pub const TAG_STATUS_DETAIL: &str = "_sito_status_detail";
pub const TAG_RETRY: &str = "_sito_retry";

/// Terminal request status applied when a flow diverts to its abort route.
pub const STATUS_ABORTED: &str = "ABORTED";
/// Suffix appended to the request status while a retry is pending.
pub const STATUS_RETRY_SUFFIX: &str = "_RETRY";

/// Structured error carried on the packet after an abort.
///
/// Short machine-readable `code` plus a long human-readable `description`;
/// stages set it, the abort route reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitoReturn {
    pub code: String,
    pub description: String,
}

impl SitoReturn {
    pub fn new(code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            description: description.into(),
        }
    }
}

impl std::fmt::Display for SitoReturn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.description)
    }
}

/// Packet wire codec failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("JSON decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("payload missing top-level key '{0}'")]
    MissingKey(String),
}
