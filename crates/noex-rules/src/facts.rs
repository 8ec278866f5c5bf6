//! Versioned fact store with synchronous change notifications.

use crate::pattern;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;
use uuid::Uuid;

/// A stored fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Colon-delimited key, unique in the store.
    pub key: String,

    /// Current value.
    pub value: Value,

    /// Timestamp of the last write.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Who wrote the value.
    pub source: String,

    /// Monotonic version, starting at 1.
    pub version: u64,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct FactChange {
    /// The fact key.
    pub key: String,

    /// Value before the change; `None` on first write.
    pub previous_value: Option<Value>,

    /// Value after the change; `None` on delete.
    pub new_value: Option<Value>,

    /// Version after the change (the deleted version on delete).
    pub version: u64,

    /// Who made the change.
    pub source: String,

    /// When the change happened.
    pub timestamp: DateTime<Utc>,
}

impl FactChange {
    /// Whether this change removed the fact.
    pub fn is_delete(&self) -> bool {
        self.new_value.is_none()
    }
}

/// Fact subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactSubscriptionId(Uuid);

impl FactSubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for FactSubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type FactCallback = Box<dyn Fn(&FactChange) + Send + Sync>;

/// Keyed fact store with versioning and change subscriptions.
///
/// Notifications are synchronous with respect to the mutating caller, and a
/// panicking subscriber never affects the mutation or other subscribers.
pub struct FactStore {
    facts: RwLock<HashMap<String, Fact>>,
    subscribers: RwLock<HashMap<FactSubscriptionId, FactCallback>>,
}

impl Default for FactStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FactStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            facts: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Get a fact by key.
    pub fn get(&self, key: &str) -> Option<Fact> {
        self.facts.read().get(key).cloned()
    }

    /// Get a fact's value by key.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.facts.read().get(key).map(|f| f.value.clone())
    }

    /// Whether a fact exists.
    pub fn has(&self, key: &str) -> bool {
        self.facts.read().contains_key(key)
    }

    /// All keys in the store.
    pub fn keys(&self) -> Vec<String> {
        self.facts.read().keys().cloned().collect()
    }

    /// Number of stored facts.
    pub fn len(&self) -> usize {
        self.facts.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.facts.read().is_empty()
    }

    /// Facts whose keys match a wildcard pattern (`:` separator).
    pub fn get_by_pattern(&self, key_pattern: &str) -> Vec<Fact> {
        self.facts
            .read()
            .values()
            .filter(|f| pattern::matches_key(&f.key, key_pattern))
            .cloned()
            .collect()
    }

    /// Set a fact, returning the previous version when the key existed.
    ///
    /// The write is visible to `get` before subscribers are notified.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: Value,
        source: impl Into<String>,
    ) -> Option<u64> {
        let change = self.set_returning(key, value, source);
        (change.version > 1).then(|| change.version - 1)
    }

    /// Set a fact and return the full change record.
    pub fn set_returning(
        &self,
        key: impl Into<String>,
        value: Value,
        source: impl Into<String>,
    ) -> FactChange {
        let key = key.into();
        let source = source.into();
        let now = Utc::now();

        let change = {
            let mut facts = self.facts.write();
            let previous = facts.get(&key).cloned();
            let version = previous.as_ref().map(|f| f.version + 1).unwrap_or(1);
            facts.insert(
                key.clone(),
                Fact {
                    key: key.clone(),
                    value: value.clone(),
                    timestamp: now,
                    source: source.clone(),
                    version,
                },
            );
            FactChange {
                key,
                previous_value: previous.map(|f| f.value),
                new_value: Some(value),
                version,
                source,
                timestamp: now,
            }
        };

        self.notify(&change);
        change
    }

    /// Delete a fact, returning whether it existed.
    pub fn delete(&self, key: &str, source: impl Into<String>) -> bool {
        self.delete_returning(key, source).is_some()
    }

    /// Delete a fact and return the change record when it existed.
    pub fn delete_returning(&self, key: &str, source: impl Into<String>) -> Option<FactChange> {
        let source = source.into();
        let now = Utc::now();

        let change = {
            let mut facts = self.facts.write();
            let previous = facts.remove(key)?;
            FactChange {
                key: key.to_string(),
                previous_value: Some(previous.value),
                new_value: None,
                version: previous.version,
                source,
                timestamp: now,
            }
        };

        self.notify(&change);
        Some(change)
    }

    /// Subscribe to change notifications.
    pub fn subscribe<F>(&self, callback: F) -> FactSubscriptionId
    where
        F: Fn(&FactChange) + Send + Sync + 'static,
    {
        let id = FactSubscriptionId::new();
        self.subscribers.write().insert(id, Box::new(callback));
        id
    }

    /// Remove a subscription.
    pub fn unsubscribe(&self, id: FactSubscriptionId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn notify(&self, change: &FactChange) {
        let subscribers = self.subscribers.read();
        for (id, callback) in subscribers.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback(change))).is_err() {
                warn!("Fact subscriber {} panicked; change {} dropped for it", id, change.key);
            }
        }
    }
}
