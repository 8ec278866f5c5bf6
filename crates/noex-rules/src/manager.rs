//! Rule manager: canonical rule table, trigger indexes, and groups.

use crate::error::{Result, RuleError};
use crate::ids::{GroupId, RuleId};
use crate::pattern::{PatternCache, FACT_SEPARATOR, TOPIC_SEPARATOR};
use crate::rule::{Action, Group, GroupInput, Rule, RuleInput, TriggerSpec};
use chrono::Utc;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

fn placeholder_segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{[^}]+\}").expect("placeholder regex"))
}

/// Rewrite `${...}` placeholders in an action key or topic into single-
/// segment wildcards, so a concrete goal can be matched against it.
pub fn action_pattern(key_or_topic: &str) -> String {
    placeholder_segment_regex()
        .replace_all(key_or_topic, "*")
        .into_owned()
}

struct ManagerInner {
    rules: HashMap<RuleId, Rule>,
    groups: HashMap<GroupId, Group>,
    by_event_topic: HashMap<String, Vec<RuleId>>,
    by_fact_pattern: HashMap<String, Vec<RuleId>>,
    by_timer_name: HashMap<String, Vec<RuleId>>,
    temporal_rules: Vec<RuleId>,
    by_fact_action: HashMap<String, Vec<RuleId>>,
    by_event_action: HashMap<String, Vec<RuleId>>,
}

impl ManagerInner {
    fn index(&mut self, rule: &Rule) {
        match &rule.trigger {
            TriggerSpec::Event { topic } => {
                self.by_event_topic
                    .entry(topic.clone())
                    .or_default()
                    .push(rule.id.clone());
            }
            TriggerSpec::Fact { pattern } => {
                self.by_fact_pattern
                    .entry(pattern.clone())
                    .or_default()
                    .push(rule.id.clone());
            }
            TriggerSpec::Timer { name } => {
                self.by_timer_name
                    .entry(name.clone())
                    .or_default()
                    .push(rule.id.clone());
            }
            TriggerSpec::Temporal { .. } => {
                self.temporal_rules.push(rule.id.clone());
            }
        }

        for action in &rule.actions {
            match action {
                Action::SetFact { key, .. } | Action::IncrementFact { key, .. } => {
                    self.by_fact_action
                        .entry(key.clone())
                        .or_default()
                        .push(rule.id.clone());
                }
                Action::EmitEvent { topic, .. } => {
                    self.by_event_action
                        .entry(topic.clone())
                        .or_default()
                        .push(rule.id.clone());
                }
                _ => {}
            }
        }
    }

    fn unindex(&mut self, rule: &Rule) {
        fn remove(index: &mut HashMap<String, Vec<RuleId>>, key: &str, id: &RuleId) {
            let emptied = match index.get_mut(key) {
                Some(ids) => {
                    ids.retain(|other| other != id);
                    ids.is_empty()
                }
                None => false,
            };
            if emptied {
                index.remove(key);
            }
        }

        match &rule.trigger {
            TriggerSpec::Event { topic } => remove(&mut self.by_event_topic, topic, &rule.id),
            TriggerSpec::Fact { pattern } => remove(&mut self.by_fact_pattern, pattern, &rule.id),
            TriggerSpec::Timer { name } => remove(&mut self.by_timer_name, name, &rule.id),
            TriggerSpec::Temporal { .. } => {
                self.temporal_rules.retain(|other| other != &rule.id);
            }
        }

        for action in &rule.actions {
            match action {
                Action::SetFact { key, .. } | Action::IncrementFact { key, .. } => {
                    remove(&mut self.by_fact_action, key, &rule.id);
                }
                Action::EmitEvent { topic, .. } => {
                    remove(&mut self.by_event_action, topic, &rule.id);
                }
                _ => {}
            }
        }
    }

    fn is_active(&self, rule: &Rule) -> bool {
        if !rule.enabled {
            return false;
        }
        match &rule.group {
            // A dangling group reference gates nothing.
            Some(group_id) => self.groups.get(group_id).map(|g| g.enabled).unwrap_or(true),
            None => true,
        }
    }

    fn collect_sorted(&self, ids: impl IntoIterator<Item = RuleId>) -> Vec<Rule> {
        let mut rules: Vec<Rule> = ids
            .into_iter()
            .filter_map(|id| self.rules.get(&id))
            .filter(|rule| self.is_active(rule))
            .cloned()
            .collect();
        sort_candidates(&mut rules);
        rules
    }
}

/// Deterministic candidate order: priority descending, then registration
/// time ascending, then id ascending.
pub fn sort_candidates(rules: &mut [Rule]) {
    rules.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Owns the canonical rule table, the trigger and reverse-action indexes,
/// and the group table.
pub struct RuleManager {
    inner: RwLock<ManagerInner>,
    patterns: Arc<PatternCache>,
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ManagerInner {
                rules: HashMap::new(),
                groups: HashMap::new(),
                by_event_topic: HashMap::new(),
                by_fact_pattern: HashMap::new(),
                by_timer_name: HashMap::new(),
                temporal_rules: Vec::new(),
                by_fact_action: HashMap::new(),
                by_event_action: HashMap::new(),
            }),
            patterns: Arc::new(PatternCache::new()),
        }
    }

    /// Register a rule; fails with `Conflict` on a duplicate id.
    pub fn register(&self, input: RuleInput) -> Result<Rule> {
        self.register_with(input, false)
    }

    /// Register a rule, optionally replacing an existing one with the same
    /// id. A replacement keeps `created_at` and bumps `version`.
    pub fn register_with(&self, input: RuleInput, upsert: bool) -> Result<Rule> {
        input.validate()?;
        let now = Utc::now();
        let mut inner = self.inner.write();

        let existing = inner.rules.get(&input.id).cloned();
        let rule = match existing {
            Some(existing) => {
                if !upsert {
                    return Err(RuleError::conflict(format!(
                        "rule {} is already registered",
                        input.id
                    )));
                }
                inner.unindex(&existing);
                let mut replacement = Rule::from_input(input, existing.version + 1, now);
                replacement.created_at = existing.created_at;
                replacement
            }
            None => Rule::from_input(input, 1, now),
        };

        inner.index(&rule);
        inner.rules.insert(rule.id.clone(), rule.clone());
        info!("Registered rule {} (version {})", rule.id, rule.version);
        Ok(rule)
    }

    /// Insert a persisted rule record verbatim, keeping its version and
    /// timestamps. Replaces any rule with the same id.
    pub fn restore_rule(&self, rule: Rule) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.rules.remove(&rule.id) {
            inner.unindex(&existing);
        }
        inner.index(&rule);
        inner.rules.insert(rule.id.clone(), rule);
    }

    /// Insert a persisted group record verbatim.
    pub fn restore_group(&self, group: Group) {
        self.inner.write().groups.insert(group.id.clone(), group);
    }

    /// Remove a rule from the table and every index.
    pub fn unregister(&self, id: &RuleId) -> bool {
        let mut inner = self.inner.write();
        match inner.rules.remove(id) {
            Some(rule) => {
                inner.unindex(&rule);
                info!("Unregistered rule {}", id);
                true
            }
            None => false,
        }
    }

    /// Get a rule by id.
    pub fn get(&self, id: &RuleId) -> Option<Rule> {
        self.inner.read().rules.get(id).cloned()
    }

    /// All registered rules, in deterministic candidate order.
    pub fn get_all(&self) -> Vec<Rule> {
        let inner = self.inner.read();
        let mut rules: Vec<Rule> = inner.rules.values().cloned().collect();
        sort_candidates(&mut rules);
        rules
    }

    /// Active rules carrying a tag, in deterministic candidate order.
    pub fn get_by_tag(&self, tag: &str) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids: Vec<RuleId> = inner
            .rules
            .values()
            .filter(|rule| rule.has_tag(tag))
            .map(|rule| rule.id.clone())
            .collect();
        inner.collect_sorted(ids)
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.inner.read().rules.len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.read().rules.is_empty()
    }

    /// Whether a rule may run: its own flag and, when it names an existing
    /// group, that group's flag.
    pub fn is_rule_active(&self, rule: &Rule) -> bool {
        self.inner.read().is_active(rule)
    }

    /// Active rules triggered by an event topic, in candidate order.
    pub fn candidates_for_event(&self, topic: &str) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids: Vec<RuleId> = inner
            .by_event_topic
            .iter()
            .filter(|(trigger_pattern, _)| {
                self.patterns.matches(topic, trigger_pattern, TOPIC_SEPARATOR)
            })
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        inner.collect_sorted(ids)
    }

    /// Active rules triggered by a fact key change, in candidate order.
    pub fn candidates_for_fact(&self, key: &str) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids: Vec<RuleId> = inner
            .by_fact_pattern
            .iter()
            .filter(|(trigger_pattern, _)| {
                self.patterns.matches(key, trigger_pattern, FACT_SEPARATOR)
            })
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        inner.collect_sorted(ids)
    }

    /// Active rules triggered by a timer name, in candidate order.
    pub fn candidates_for_timer(&self, name: &str) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids: Vec<RuleId> = inner
            .by_timer_name
            .iter()
            .filter(|(trigger_pattern, _)| {
                self.patterns.matches(name, trigger_pattern, FACT_SEPARATOR)
            })
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        inner.collect_sorted(ids)
    }

    /// Active temporal rules, in candidate order.
    pub fn temporal_rules(&self) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids = inner.temporal_rules.clone();
        inner.collect_sorted(ids)
    }

    /// Active rules with a fact action that could produce the given key.
    ///
    /// Wildcards and `${...}` placeholders in the action key match any
    /// concrete segment. Used only by backward chaining.
    pub fn rules_producing_fact(&self, key: &str) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids: Vec<RuleId> = inner
            .by_fact_action
            .iter()
            .filter(|(action_key, _)| {
                self.patterns
                    .matches(key, &action_pattern(action_key), FACT_SEPARATOR)
            })
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        inner.collect_sorted(ids)
    }

    /// Active rules with an emit action that could produce the given topic.
    pub fn rules_emitting_topic(&self, topic: &str) -> Vec<Rule> {
        let inner = self.inner.read();
        let ids: Vec<RuleId> = inner
            .by_event_action
            .iter()
            .filter(|(action_topic, _)| {
                self.patterns
                    .matches(topic, &action_pattern(action_topic), TOPIC_SEPARATOR)
            })
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect();
        inner.collect_sorted(ids)
    }

    /// Create a group; fails with `Conflict` on a duplicate id.
    pub fn create_group(&self, input: GroupInput) -> Result<Group> {
        input.validate()?;
        let mut inner = self.inner.write();
        if inner.groups.contains_key(&input.id) {
            return Err(RuleError::conflict(format!(
                "group {} already exists",
                input.id
            )));
        }
        let group = input.into_group(Utc::now());
        inner.groups.insert(group.id.clone(), group.clone());
        info!("Created group {}", group.id);
        Ok(group)
    }

    /// Replace a group's definition, keeping `created_at`.
    pub fn update_group(&self, input: GroupInput) -> Result<Group> {
        input.validate()?;
        let mut inner = self.inner.write();
        let existing = inner
            .groups
            .get(&input.id)
            .ok_or_else(|| RuleError::not_found(format!("group {}", input.id)))?;
        let created_at = existing.created_at;

        let mut group = input.into_group(Utc::now());
        group.created_at = created_at;
        inner.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    /// Delete a group. Member rules fall back to ungated.
    pub fn delete_group(&self, id: &GroupId) -> bool {
        let removed = self.inner.write().groups.remove(id).is_some();
        if removed {
            info!("Deleted group {}", id);
        }
        removed
    }

    /// Enable or disable a group.
    pub fn set_group_enabled(&self, id: &GroupId, enabled: bool) -> Result<Group> {
        let mut inner = self.inner.write();
        let group = inner
            .groups
            .get_mut(id)
            .ok_or_else(|| RuleError::not_found(format!("group {id}")))?;
        group.enabled = enabled;
        group.updated_at = Utc::now();
        debug!("Group {} enabled={}", id, enabled);
        Ok(group.clone())
    }

    /// Get a group by id.
    pub fn get_group(&self, id: &GroupId) -> Option<Group> {
        self.inner.read().groups.get(id).cloned()
    }

    /// All groups.
    pub fn get_groups(&self) -> Vec<Group> {
        self.inner.read().groups.values().cloned().collect()
    }

    /// Number of groups.
    pub fn group_count(&self) -> usize {
        self.inner.read().groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_rule(id: &str, topic: &str, priority: i64) -> RuleInput {
        serde_json::from_value(json!({
            "id": id,
            "name": format!("Rule {id}"),
            "priority": priority,
            "trigger": {"type": "event", "topic": topic},
            "actions": [
                {"type": "set_fact", "key": format!("fired:{id}"), "value": true}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_register_and_conflict() {
        let manager = RuleManager::new();
        let rule = manager.register(event_rule("r1", "order.*", 0)).unwrap();
        assert_eq!(rule.version, 1);

        let err = manager.register(event_rule("r1", "order.*", 0)).unwrap_err();
        assert!(matches!(err, RuleError::Conflict(_)));
    }

    #[test]
    fn test_upsert_bumps_version_and_keeps_created_at() {
        let manager = RuleManager::new();
        let first = manager.register(event_rule("r1", "order.*", 0)).unwrap();
        let second = manager
            .register_with(event_rule("r1", "order.**", 5), true)
            .unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.candidates_for_event("order.a.b").len(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent_and_cleans_indexes() {
        let manager = RuleManager::new();
        manager.register(event_rule("r1", "order.*", 0)).unwrap();

        assert!(manager.unregister(&RuleId::new("r1")));
        assert!(!manager.unregister(&RuleId::new("r1")));
        assert!(manager.get(&RuleId::new("r1")).is_none());
        assert!(manager.candidates_for_event("order.created").is_empty());
    }

    #[test]
    fn test_candidate_order_is_deterministic() {
        let manager = RuleManager::new();
        manager.register(event_rule("b-low", "order.*", 1)).unwrap();
        manager.register(event_rule("a-high", "order.*", 10)).unwrap();
        manager.register(event_rule("c-low", "order.*", 1)).unwrap();

        let candidates = manager.candidates_for_event("order.created");
        let ids: Vec<&str> = candidates.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a-high", "b-low", "c-low"]);
    }

    #[test]
    fn test_candidates_filter_inactive_rules() {
        let manager = RuleManager::new();
        let mut input = event_rule("r1", "order.*", 0);
        input.enabled = false;
        manager.register(input).unwrap();

        assert!(manager.candidates_for_event("order.created").is_empty());
        assert_eq!(manager.get_all().len(), 1);
    }

    #[test]
    fn test_group_gating() {
        let manager = RuleManager::new();
        manager
            .create_group(GroupInput {
                id: GroupId::new("billing"),
                name: "Billing".into(),
                description: None,
                enabled: true,
            })
            .unwrap();

        let mut input = event_rule("r1", "order.*", 0);
        input.group = Some(GroupId::new("billing"));
        manager.register(input).unwrap();

        assert_eq!(manager.candidates_for_event("order.placed").len(), 1);

        manager
            .set_group_enabled(&GroupId::new("billing"), false)
            .unwrap();
        assert!(manager.candidates_for_event("order.placed").is_empty());

        manager
            .set_group_enabled(&GroupId::new("billing"), true)
            .unwrap();
        assert_eq!(manager.candidates_for_event("order.placed").len(), 1);
    }

    #[test]
    fn test_dangling_group_reference_gates_nothing() {
        let manager = RuleManager::new();
        let mut input = event_rule("r1", "order.*", 0);
        input.group = Some(GroupId::new("ghost"));
        manager.register(input).unwrap();

        assert_eq!(manager.candidates_for_event("order.placed").len(), 1);
    }

    #[test]
    fn test_reverse_fact_index_with_placeholders() {
        let manager = RuleManager::new();
        let input: RuleInput = serde_json::from_value(json!({
            "id": "tier",
            "name": "Tier setter",
            "trigger": {"type": "event", "topic": "order.placed"},
            "actions": [
                {"type": "set_fact", "key": "customer:${event.id}:tier", "value": "vip"}
            ]
        }))
        .unwrap();
        manager.register(input).unwrap();

        assert_eq!(manager.rules_producing_fact("customer:42:tier").len(), 1);
        assert!(manager.rules_producing_fact("customer:42:region").is_empty());
    }

    #[test]
    fn test_get_by_tag_filters_active() {
        let manager = RuleManager::new();
        let mut tagged = event_rule("r1", "order.*", 0);
        tagged.tags = vec!["loyalty".into()];
        manager.register(tagged).unwrap();

        let mut disabled = event_rule("r2", "order.*", 0);
        disabled.tags = vec!["loyalty".into()];
        disabled.enabled = false;
        manager.register(disabled).unwrap();

        assert_eq!(manager.get_by_tag("loyalty").len(), 1);
    }
}
