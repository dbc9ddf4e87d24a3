//! The message packet and its wire codec
//!
//! A packet is the single unit that flows end-to-end through a process route:
//! an opaque `cargo` payload owned by the originator plus router-managed
//! `settings`. Known settings fields are typed; everything else (class-local
//! parameters spread in at flow start) rides in the open `extras` map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{CodecError, SitoReturn, DEFAULT_CARGO_KEY, DEFAULT_SETTINGS_KEY};

/// Broker publish parameters for one hop. Values may carry `%%ident%%`
/// macros that the router expands just before publishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishArgs {
    pub exchange: String,
    pub routing_key: String,
    #[serde(flatten, default)]
    pub extras: Map<String, Value>,
}

impl PublishArgs {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            extras: Map::new(),
        }
    }
}

/// One recorded retry of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEvent {
    pub epoch: i64,
    pub code: String,
    pub description: String,
}

/// Router-managed packet metadata.
///
/// `history` is a prefix-matching trace of `process_route`: walking history
/// left to right hits the same class names at the same route positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketSettings {
    /// Ordered classes still to execute. Mutated by branch/retry/abort.
    #[serde(default)]
    pub process_route: Vec<String>,

    /// Ordered classes already executed. Append-only during a run.
    #[serde(default)]
    pub history: Vec<String>,

    /// Per-class publish-parameter overrides, consumed on the next hop.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub route_args: BTreeMap<String, PublishArgs>,

    /// Persistent request row id; assigned exactly once per request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Epoch of the first publish in the current transaction; drives
    /// DB-queue consumer affinity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_start: Option<i64>,

    /// Set by a consumer once its own sanity checks passed; retries are
    /// only eligible while this is true.
    #[serde(default)]
    pub retry_ready: bool,

    /// Per-class retry attempt counts.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_count: BTreeMap<String, u32>,

    /// Per-class retry event log, mirrored into the `_sito_retry` tag.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_history: BTreeMap<String, Vec<RetryEvent>>,

    /// Structured error recorded on abort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sito_return: Option<SitoReturn>,

    /// Programmatic request status override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_status: Option<String>,

    /// User-visible status text composed on abort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_status_detail: Option<String>,

    /// Status to apply on abort instead of the global default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_status: Option<String>,

    /// Abort route override; falls back to the class default, then the
    /// global single-element route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_route: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_id: Option<String>,

    /// Request row columns picked up by the DB-update publisher when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_time: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_mode: Option<String>,

    /// Class-local parameters and anything else a stage stashes on the
    /// packet (`default_common`, `min_delay`, ...).
    #[serde(flatten, default)]
    pub extras: Map<String, Value>,
}

impl PacketSettings {
    /// Retry attempts recorded for `class` so far.
    pub fn retries_of(&self, class: &str) -> u32 {
        self.retry_count.get(class).copied().unwrap_or(0)
    }

    /// Record one more retry of `class`.
    pub fn record_retry(&mut self, class: &str, event: RetryEvent) {
        *self.retry_count.entry(class.to_string()).or_insert(0) += 1;
        self.retry_history
            .entry(class.to_string())
            .or_default()
            .push(event);
    }

    /// Overlay a JSON object onto these settings, keeping typed fields
    /// typed. Used to spread work-class parameters and caller-supplied
    /// initial settings at flow start.
    pub fn overlay(&mut self, overlay: Map<String, Value>) -> Result<(), CodecError> {
        if overlay.is_empty() {
            return Ok(());
        }
        let mut base = match serde_json::to_value(&*self).map_err(CodecError::Encode)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in overlay {
            base.insert(key, value);
        }
        *self = serde_json::from_value(Value::Object(base)).map_err(CodecError::Decode)?;
        Ok(())
    }
}

/// The envelope that traverses a route. The router owns it within a process
/// invocation; between hops ownership transfers via the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePacket {
    pub cargo: Value,
    pub settings: PacketSettings,
}

impl MessagePacket {
    pub fn new(cargo: Value, settings: PacketSettings) -> Self {
        Self { cargo, settings }
    }
}

/// JSON wire codec. Top-level keys are deployment-configurable so multiple
/// routers with different conventions can share a broker.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    settings_key: String,
    cargo_key: String,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SETTINGS_KEY, DEFAULT_CARGO_KEY)
    }
}

impl PacketCodec {
    pub fn new(settings_key: impl Into<String>, cargo_key: impl Into<String>) -> Self {
        Self {
            settings_key: settings_key.into(),
            cargo_key: cargo_key.into(),
        }
    }

    pub fn encode(&self, packet: &MessagePacket) -> Result<Vec<u8>, CodecError> {
        let mut top = Map::with_capacity(2);
        top.insert(
            self.settings_key.clone(),
            serde_json::to_value(&packet.settings).map_err(CodecError::Encode)?,
        );
        top.insert(self.cargo_key.clone(), packet.cargo.clone());
        serde_json::to_vec(&Value::Object(top)).map_err(CodecError::Encode)
    }

    pub fn decode(&self, payload: &[u8]) -> Result<MessagePacket, CodecError> {
        let mut top: Map<String, Value> =
            serde_json::from_slice(payload).map_err(CodecError::Decode)?;
        let settings = top
            .remove(&self.settings_key)
            .ok_or_else(|| CodecError::MissingKey(self.settings_key.clone()))?;
        let settings: PacketSettings =
            serde_json::from_value(settings).map_err(CodecError::Decode)?;
        let cargo = top.remove(&self.cargo_key).unwrap_or(Value::Null);
        Ok(MessagePacket { cargo, settings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> MessagePacket {
        let mut settings = PacketSettings {
            process_route: vec!["A".into(), "B".into(), "C".into()],
            history: vec!["A".into()],
            record_id: Some("req-17".into()),
            task_start: Some(1_700_000_000),
            retry_ready: true,
            ..Default::default()
        };
        settings
            .route_args
            .insert("B".into(), PublishArgs::new("sito.b", "b-queue"));
        settings.record_retry(
            "B",
            RetryEvent {
                epoch: 1_700_000_100,
                code: "CARRIER_TIMEOUT".into(),
                description: "upstream gateway timed out".into(),
            },
        );
        settings
            .extras
            .insert("min_delay".into(), Value::from(3600));
        MessagePacket::new(serde_json::json!({"text": "hello"}), settings)
    }

    #[test]
    fn codec_round_trips() {
        let codec = PacketCodec::default();
        let packet = sample_packet();
        let bytes = codec.encode(&packet).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn codec_honors_configured_keys() {
        let codec = PacketCodec::new("meta", "body");
        let packet = sample_packet();
        let bytes = codec.encode(&packet).unwrap();

        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(raw.get("meta").is_some());
        assert!(raw.get("body").is_some());
        assert!(raw.get("settings").is_none());

        assert_eq!(codec.decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn decode_requires_settings_key() {
        let codec = PacketCodec::default();
        let err = codec.decode(br#"{"cargo": "x"}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingKey(k) if k == "settings"));
    }

    #[test]
    fn decode_defaults_missing_cargo_to_null() {
        let codec = PacketCodec::default();
        let packet = codec.decode(br#"{"settings": {}}"#).unwrap();
        assert_eq!(packet.cargo, Value::Null);
        assert!(packet.settings.process_route.is_empty());
    }

    #[test]
    fn overlay_keeps_typed_fields_and_extras() {
        let mut settings = PacketSettings::default();
        let mut overlay = Map::new();
        overlay.insert("process_route".into(), serde_json::json!(["X", "Y"]));
        overlay.insert("default_common".into(), serde_json::json!({"tz": "UTC"}));
        settings.overlay(overlay).unwrap();

        assert_eq!(settings.process_route, vec!["X", "Y"]);
        assert_eq!(
            settings.extras.get("default_common"),
            Some(&serde_json::json!({"tz": "UTC"}))
        );
    }

    #[test]
    fn retry_bookkeeping_counts_per_class() {
        let mut settings = PacketSettings::default();
        assert_eq!(settings.retries_of("B"), 0);
        settings.record_retry(
            "B",
            RetryEvent {
                epoch: 1,
                code: "E".into(),
                description: "first".into(),
            },
        );
        settings.record_retry(
            "B",
            RetryEvent {
                epoch: 2,
                code: "E".into(),
                description: "second".into(),
            },
        );
        assert_eq!(settings.retries_of("B"), 2);
        assert_eq!(settings.retry_history["B"].len(), 2);
        assert_eq!(settings.retries_of("C"), 0);
    }
}
