//! Persistence contract for rule and group definitions.
//!
//! The engine persists nothing else: events, facts, timers, and traces are
//! in-memory only. Adapters implement this trait; anything storage-specific
//! (schema evolution, migrations) lives inside the adapter.

use crate::error::Result;
use crate::rule::{Group, Rule};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Current persisted-state schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// The persisted snapshot: rule and group records, exactly as registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    /// Schema version of the snapshot.
    #[serde(default)]
    pub schema_version: u32,

    /// Registered rules.
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Registered groups.
    #[serde(default)]
    pub groups: Vec<Group>,
}

/// Storage adapter contract.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Persist the full rule and group set.
    async fn save(&self, rules: &[Rule], groups: &[Group]) -> Result<()>;

    /// Load the last persisted snapshot.
    async fn load(&self) -> Result<PersistedState>;

    /// Drop the persisted snapshot.
    async fn clear(&self) -> Result<()>;

    /// Whether a snapshot exists.
    async fn exists(&self) -> Result<bool>;

    /// Adapter-specific storage key (file path, table name, ...).
    fn key(&self) -> String;

    /// Schema version the adapter writes.
    fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }
}

/// In-memory adapter, used in tests and for embedding without storage.
pub struct MemoryPersistence {
    state: RwLock<Option<PersistedState>>,
    key: String,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
            key: "memory".to_string(),
        }
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn save(&self, rules: &[Rule], groups: &[Group]) -> Result<()> {
        *self.state.write() = Some(PersistedState {
            schema_version: SCHEMA_VERSION,
            rules: rules.to_vec(),
            groups: groups.to_vec(),
        });
        Ok(())
    }

    async fn load(&self) -> Result<PersistedState> {
        Ok(self.state.read().clone().unwrap_or_default())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.write() = None;
        Ok(())
    }

    async fn exists(&self) -> Result<bool> {
        Ok(self.state.read().is_some())
    }

    fn key(&self) -> String {
        self.key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{GroupId, RuleId};
    use crate::rule::RuleInput;
    use chrono::TimeZone;
    use serde_json::json;

    fn sample_rule() -> Rule {
        let input: RuleInput = serde_json::from_value(json!({
            "id": "r1",
            "name": "Rule one",
            "priority": 5,
            "tags": ["loyalty"],
            "trigger": {"type": "event", "topic": "order.*"},
            "conditions": [
                {"source": {"type": "fact", "pattern": "customer:active"},
                 "operator": "eq", "value": true}
            ],
            "actions": [
                {"type": "set_fact", "key": "loyalty:points", "value": 500}
            ]
        }))
        .unwrap();
        // Millisecond-precision timestamp, matching the persisted shape.
        let now = chrono::Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        Rule::from_input(input, 1, now)
    }

    fn sample_group() -> Group {
        Group {
            id: GroupId::new("billing"),
            name: "Billing".into(),
            description: None,
            enabled: true,
            created_at: chrono::Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            updated_at: chrono::Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let adapter = MemoryPersistence::new();
        assert!(!adapter.exists().await.unwrap());

        let rule = sample_rule();
        let group = sample_group();
        adapter
            .save(std::slice::from_ref(&rule), std::slice::from_ref(&group))
            .await
            .unwrap();

        assert!(adapter.exists().await.unwrap());
        let state = adapter.load().await.unwrap();
        assert_eq!(state.schema_version, SCHEMA_VERSION);
        assert_eq!(state.rules, vec![rule]);
        assert_eq!(state.groups, vec![group]);
    }

    #[tokio::test]
    async fn test_clear() {
        let adapter = MemoryPersistence::new();
        adapter.save(&[sample_rule()], &[]).await.unwrap();
        adapter.clear().await.unwrap();

        assert!(!adapter.exists().await.unwrap());
        assert!(adapter.load().await.unwrap().rules.is_empty());
    }

    #[test]
    fn test_serialized_shape_round_trips() {
        let rule = sample_rule();
        let value = serde_json::to_value(&rule).unwrap();

        // Timestamps persist as integer milliseconds.
        assert_eq!(value["created_at"], json!(1_700_000_000_000i64));
        assert_eq!(value["version"], json!(1));

        let back: Rule = serde_json::from_value(value).unwrap();
        assert_eq!(back, rule);

        let rule_id: RuleId = back.id;
        assert_eq!(rule_id.as_str(), "r1");
    }
}
