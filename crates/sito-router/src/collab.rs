//! External collaborator contracts
//!
//! The router consumes these through traits and never implements them; real
//! bindings live with the deployment. Tests stub them.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::Result;

/// Context passed to a message-text lookup.
#[derive(Debug, Clone, Default)]
pub struct TextLookup<'a> {
    pub system_id: Option<&'a str>,
    pub carrier: Option<&'a str>,
    pub language: Option<&'a str>,
}

/// Named user-visible message texts (abort reasons and the like).
#[async_trait]
pub trait MessageTextSource: Send + Sync {
    async fn lookup(
        &self,
        name: &str,
        context: &Map<String, Value>,
        opts: TextLookup<'_>,
    ) -> Result<String>;
}

/// The macro-expansion text engine; distinct from the router's own
/// `%%ident%%` publish-arg substitution.
#[async_trait]
pub trait MacroExpander: Send + Sync {
    async fn expand(&self, source: &str, bindings: &Map<String, Value>) -> Result<String>;
}

#[derive(Debug, Clone)]
pub enum SystemQuery {
    ById(String),
    ByName(String),
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub system_name: String,
    pub system_csc: String,
}

#[async_trait]
pub trait SystemDirectory: Send + Sync {
    async fn lookup(&self, query: SystemQuery) -> Result<SystemInfo>;
}

/// Epoch or date-string time reference for zone mapping.
#[derive(Debug, Clone)]
pub enum TimeRef {
    Epoch(i64),
    Date(String),
}

#[async_trait]
pub trait TimeZoneService: Send + Sync {
    /// Resolve a time reference in an optional zone to an epoch, rounded to
    /// the requested granularity in seconds.
    async fn map_epoch(&self, when: TimeRef, zone: Option<&str>, granularity: i64) -> Result<i64>;

    async fn convert_zone(&self, time: &str, from_tz: &str, to_tz: &str) -> Result<String>;
}

/// Out-of-band notification path used by notify-class stages.
#[async_trait]
pub trait ApiBridge: Send + Sync {
    async fn post_request(&self, args: Map<String, Value>) -> Result<()>;
}
