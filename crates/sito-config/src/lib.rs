//! Router configuration
//!
//! Loads the `QueueRouter` section from a hierarchical settings store,
//! validates the mandatory keys, and exposes the class registry that the
//! broker adapter and router core work from. Class configuration is
//! read-only after load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

/// Top-level configuration section the router reads.
pub const ROUTER_SECTION: &str = "QueueRouter";

const MANDATORY_KEYS: &[&str] = &["exchange_class", "work_class", "cargo_key", "settings_key"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing mandatory configuration key '{0}'")]
    MissingConfig(String),

    #[error("configuration section '{0}' is not an object")]
    BadSection(String),

    #[error("class '{name}' failed to parse: {source}")]
    BadClass {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("settings store error: {0}")]
    Store(String),
}

/// Hierarchical key/value settings source. Paths are `/`-separated object
/// keys from the root.
pub trait SettingsStore: Send + Sync {
    fn section(&self, path: &str) -> Result<Option<Value>, ConfigError>;
}

/// Settings held in memory; the usual store for tests.
pub struct MemorySettingsStore {
    root: Value,
}

impl MemorySettingsStore {
    pub fn new(root: Value) -> Self {
        Self { root }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn section(&self, path: &str) -> Result<Option<Value>, ConfigError> {
        let mut node = &self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match node.get(segment) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        Ok(Some(node.clone()))
    }
}

/// Settings loaded once from a JSON file at startup.
pub struct FileSettingsStore {
    inner: MemorySettingsStore,
}

impl FileSettingsStore {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path.as_ref())
            .map_err(|e| ConfigError::Store(format!("{}: {e}", path.as_ref().display())))?;
        let root: Value = serde_json::from_slice(&raw)
            .map_err(|e| ConfigError::Store(format!("{}: {e}", path.as_ref().display())))?;
        Ok(Self {
            inner: MemorySettingsStore::new(root),
        })
    }
}

impl SettingsStore for FileSettingsStore {
    fn section(&self, path: &str) -> Result<Option<Value>, ConfigError> {
        self.inner.section(path)
    }
}

/// What a class is to the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Defines a full process route; entry point for publish_start.
    Work,
    /// A single stage in a route.
    Exchange,
    /// Side-channel publish target outside the route; queue externally owned.
    Notify,
}

impl Default for ClassKind {
    fn default() -> Self {
        ClassKind::Exchange
    }
}

/// Per-class configuration as loaded from the settings store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassConfig {
    #[serde(skip)]
    pub kind: ClassKind,

    pub exchange: String,

    /// Consume queue; notify classes may omit it.
    #[serde(default)]
    pub queue: Option<String>,

    /// Explicit binding key; defaults to the queue name.
    #[serde(default)]
    pub route_key: Option<String>,

    /// Consumer-callback identifier resolved through the stage registry.
    #[serde(default)]
    pub consume_pm: Option<String>,

    /// Optional load path hint for the callback, carried through unchanged.
    #[serde(default)]
    pub consume_lib: Option<String>,

    /// Default ordered class list; work kind only.
    #[serde(default)]
    pub process_route: Option<Vec<String>>,

    /// Default abort sequence for flows failing in this class.
    #[serde(default)]
    pub abort_route: Option<Vec<String>>,

    /// Bounded transient-failure retries; exchange kind.
    #[serde(default)]
    pub retry_max: Option<u32>,

    #[serde(default)]
    pub retry_seconds: Option<u64>,

    /// Delays below this many seconds publish immediately instead of
    /// going through the delay scheduler.
    #[serde(default)]
    pub min_delay: Option<i64>,

    #[serde(default)]
    pub default_common: Option<Value>,

    /// Remaining class-local parameters, spread into packet settings at
    /// flow start.
    #[serde(flatten, default)]
    pub params: Map<String, Value>,
}

/// All configured classes by name.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: BTreeMap<String, ClassConfig>,
}

impl ClassRegistry {
    pub fn get(&self, name: &str) -> Option<&ClassConfig> {
        self.classes.get(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<ClassKind> {
        self.classes.get(name).map(|c| c.kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassConfig)> {
        self.classes.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn absorb(
        &mut self,
        kind: ClassKind,
        section: Option<&Value>,
    ) -> Result<(), ConfigError> {
        let Some(Value::Object(map)) = section else {
            return Ok(());
        };
        for (name, raw) in map {
            let mut class: ClassConfig = serde_json::from_value(raw.clone())
                .map_err(|source| ConfigError::BadClass {
                    name: name.clone(),
                    source,
                })?;
            class.kind = kind;
            debug!(class = %name, kind = ?kind, exchange = %class.exchange, "Registered class");
            self.classes.insert(name.clone(), class);
        }
        Ok(())
    }
}

/// Validated router configuration.
#[derive(Debug)]
pub struct RouterSettings {
    pub settings_key: String,
    pub cargo_key: String,
    /// Exchange the DB-update publisher publishes mutations to.
    pub db_update_exchange: String,
    /// Number of DB-update queue shards for task-start affinity.
    pub db_update_shards: u32,
    pub registry: ClassRegistry,
}

impl RouterSettings {
    /// Load and validate the `QueueRouter` section. Fails with
    /// `MissingConfig` when a mandatory key is absent.
    pub fn load(store: &dyn SettingsStore) -> Result<Self, ConfigError> {
        let section = store
            .section(ROUTER_SECTION)?
            .ok_or_else(|| ConfigError::MissingConfig(ROUTER_SECTION.to_string()))?;
        let Value::Object(section) = section else {
            return Err(ConfigError::BadSection(ROUTER_SECTION.to_string()));
        };

        for key in MANDATORY_KEYS {
            if !section.contains_key(*key) {
                return Err(ConfigError::MissingConfig(format!(
                    "{ROUTER_SECTION}/{key}"
                )));
            }
        }

        let string_key = |key: &str| -> String {
            section
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let mut registry = ClassRegistry::default();
        registry.absorb(ClassKind::Work, section.get("work_class"))?;
        registry.absorb(ClassKind::Exchange, section.get("exchange_class"))?;
        registry.absorb(ClassKind::Notify, section.get("notify_class"))?;

        let db_update_exchange = section
            .get("db_update_exchange")
            .and_then(Value::as_str)
            .unwrap_or("sito.db-updates")
            .to_string();
        let db_update_shards = section
            .get("db_update_shards")
            .and_then(Value::as_u64)
            .unwrap_or(4) as u32;

        Ok(Self {
            settings_key: string_key("settings_key"),
            cargo_key: string_key("cargo_key"),
            db_update_exchange,
            db_update_shards,
            registry,
        })
    }
}
