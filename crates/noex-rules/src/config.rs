//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine instance name, used as the default event source.
    pub name: String,

    /// Trace collector settings.
    pub trace: TraceConfig,

    /// Event store settings.
    pub event_store: EventStoreConfig,

    /// Backward-chaining query settings.
    pub backward_chaining: BackwardChainingConfig,

    /// Hot-reload watcher settings.
    pub hot_reload: HotReloadConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "noex-rules".to_string(),
            trace: TraceConfig::default(),
            event_store: EventStoreConfig::default(),
            backward_chaining: BackwardChainingConfig::default(),
            hot_reload: HotReloadConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the given engine name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Trace collector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Whether trace recording is enabled.
    pub enabled: bool,

    /// Ring buffer capacity.
    pub max_entries: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: 10_000,
        }
    }
}

/// Event store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventStoreConfig {
    /// Ring buffer capacity.
    pub max_events: usize,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self { max_events: 10_000 }
    }
}

/// Backward-chaining query settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackwardChainingConfig {
    /// Maximum proof depth per branch.
    pub max_depth: usize,

    /// Maximum rules attempted across a whole query.
    pub max_explored_rules: usize,
}

impl Default for BackwardChainingConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_explored_rules: 100,
        }
    }
}

/// Hot-reload watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Polling interval in milliseconds.
    pub interval_ms: u64,

    /// Abort the whole batch when any rule fails validation.
    pub atomic_reload: bool,

    /// Validate new and modified rules before applying.
    pub validate_before_apply: bool,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            atomic_reload: true,
            validate_before_apply: true,
        }
    }
}
